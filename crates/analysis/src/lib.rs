//! Structural analysis of Python subject sources.
//!
//! Two jobs: find the source lines where a diagnostic statement can be
//! inserted without breaking the program, and pull the free identifiers out
//! of an illegal-state expression so a probe can report their bindings.

mod expr;

pub use expr::extract_identifiers;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("no safe insertion points in source")]
    NoInsertionPoints,
    #[error("invalid expression `{expr}`: {reason}")]
    InvalidExpression { expr: String, reason: String },
}

/// Scope that offered an insertion point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Module,
    Function,
    Class,
}

/// A line offset where a new statement may be inserted, plus the leading
/// whitespace the inserted statement must carry to stay syntactically valid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertionPoint {
    pub line: usize,
    pub indent: String,
    pub scope: ScopeKind,
}

/// Scans Python source and returns every offset where a statement can be
/// inserted ahead of an existing statement.
///
/// Points are offered before the direct children of the module body and of
/// `def` / `async def` / `class` bodies. Other suites (`if`, `for`, `try`,
/// `with`, ...) are opaque: inserting into them is legal Python but reorders
/// control flow too easily, so they are skipped. Also skipped are import
/// statements, bare constant expressions (docstrings included), and
/// statements that are solely a dict or list literal. A decorator is fused
/// with the statement it decorates, so a point lands before the first
/// decorator and never between decorator and `def`.
pub fn insertion_points(source: &str) -> Result<Vec<InsertionPoint>, AnalysisError> {
    let mut points = Vec::new();
    let mut scopes = vec![Scope {
        body: ScopeBody::Probe(ScopeKind::Module),
        header_indent: 0,
        body_indent: None,
    }];
    let mut pending_decorator: Option<(usize, String)> = None;

    for statement in logical_statements(source) {
        loop {
            let at_module = scopes.len() == 1;
            let (body_indent, header_indent) = match scopes.last() {
                Some(scope) => (scope.body_indent, scope.header_indent),
                None => break,
            };
            match body_indent {
                Some(indent) if statement.indent < indent && !at_module => {
                    scopes.pop();
                }
                Some(_) => break,
                None => {
                    if at_module || statement.indent > header_indent {
                        if let Some(scope) = scopes.last_mut() {
                            scope.body_indent = Some(statement.indent);
                        }
                        break;
                    }
                    // header without a body, e.g. a def at end of input
                    scopes.pop();
                }
            }
        }

        if statement.text.starts_with('@') {
            // remember where the decorator stack starts; the decorated
            // statement decides whether a point is offered
            if pending_decorator.is_none() {
                pending_decorator = Some((statement.line, statement.indent_text.clone()));
            }
            continue;
        }
        let decorator = pending_decorator.take();

        if let Some(scope) = scopes.last() {
            if let (ScopeBody::Probe(kind), Some(indent)) = (scope.body, scope.body_indent) {
                if indent == statement.indent && !skip_statement(&statement.text) {
                    let (line, indent_text) = match decorator {
                        Some((line, text)) => (line, text),
                        None => (statement.line, statement.indent_text.clone()),
                    };
                    points.push(InsertionPoint {
                        line,
                        indent: indent_text,
                        scope: kind,
                    });
                }
            }
        }

        if let Some(body) = scope_opener(&statement.text) {
            scopes.push(Scope {
                body,
                header_indent: statement.indent,
                body_indent: None,
            });
        }
    }

    if points.is_empty() {
        return Err(AnalysisError::NoInsertionPoints);
    }
    Ok(points)
}

#[derive(Debug, Clone, Copy)]
enum ScopeBody {
    /// Module, function, or class body: children are insertion points.
    Probe(ScopeKind),
    /// Any other suite: children are never insertion points.
    Opaque,
}

struct Scope {
    body: ScopeBody,
    header_indent: usize,
    body_indent: Option<usize>,
}

/// One logical statement, possibly assembled from several physical lines.
struct Statement {
    /// Physical line of the first piece, zero-based.
    line: usize,
    indent: usize,
    indent_text: String,
    text: String,
}

/// Joins physical lines into logical statements, honoring bracket nesting,
/// triple-quoted strings, and backslash continuation. Blank lines and
/// comment-only lines are not statements.
fn logical_statements(source: &str) -> Vec<Statement> {
    let mut statements = Vec::new();
    let mut current: Option<Statement> = None;
    let mut depth = 0usize;
    let mut triple: Option<u8> = None;

    for (number, raw) in source.lines().enumerate() {
        if current.is_none() {
            let stripped = raw.trim();
            if stripped.is_empty() || stripped.starts_with('#') {
                continue;
            }
            let indent_text = &raw[..raw.len() - raw.trim_start().len()];
            current = Some(Statement {
                line: number,
                indent: indent_text.chars().count(),
                indent_text: indent_text.to_string(),
                text: String::new(),
            });
        }

        let scan = scan_physical_line(raw, &mut depth, &mut triple);
        if let Some(statement) = current.as_mut() {
            let mut piece = raw[..scan.code_end].trim();
            if scan.backslash {
                piece = piece[..piece.len() - 1].trim_end();
            }
            if !piece.is_empty() {
                if !statement.text.is_empty() {
                    statement.text.push(' ');
                }
                statement.text.push_str(piece);
            }
        }

        if depth == 0 && triple.is_none() && !scan.backslash {
            if let Some(statement) = current.take() {
                statements.push(statement);
            }
        }
    }
    if let Some(statement) = current.take() {
        statements.push(statement);
    }
    statements
}

struct LineScan {
    /// Byte offset where a trailing comment begins, or the line length.
    code_end: usize,
    /// Line ends with a continuation backslash outside any string.
    backslash: bool,
}

fn scan_physical_line(line: &str, depth: &mut usize, triple: &mut Option<u8>) -> LineScan {
    let bytes = line.as_bytes();
    let mut single: Option<u8> = None;
    let mut code_end = bytes.len();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if let Some(quote) = *triple {
            if b == quote && bytes.get(i + 1) == Some(&quote) && bytes.get(i + 2) == Some(&quote) {
                *triple = None;
                i += 3;
            } else {
                i += 1;
            }
            continue;
        }
        if let Some(quote) = single {
            if b == b'\\' {
                i += 2;
            } else {
                if b == quote {
                    single = None;
                }
                i += 1;
            }
            continue;
        }
        match b {
            b'#' => {
                code_end = i;
                break;
            }
            b'\'' | b'"' => {
                if bytes.get(i + 1) == Some(&b) && bytes.get(i + 2) == Some(&b) {
                    *triple = Some(b);
                    i += 3;
                } else {
                    single = Some(b);
                    i += 1;
                }
                continue;
            }
            b'(' | b'[' | b'{' => *depth += 1,
            b')' | b']' | b'}' => *depth = depth.saturating_sub(1),
            _ => {}
        }
        i += 1;
    }

    let backslash = single.is_none()
        && triple.is_none()
        && code_end == bytes.len()
        && line.trim_end().ends_with('\\');
    LineScan { code_end, backslash }
}

fn scope_opener(text: &str) -> Option<ScopeBody> {
    let text = text.trim_end();
    if !text.ends_with(':') {
        // one-liner suites like `def f(): return 0` keep their body inline
        return None;
    }
    if text.starts_with("def ") || text.starts_with("async def ") {
        return Some(ScopeBody::Probe(ScopeKind::Function));
    }
    if text.starts_with("class ") {
        return Some(ScopeBody::Probe(ScopeKind::Class));
    }
    Some(ScopeBody::Opaque)
}

fn skip_statement(text: &str) -> bool {
    is_import(text)
        || is_constant_expression(text)
        || is_container_literal(text)
        || is_suite_continuation(text)
}

/// `else`/`elif`/`except`/`finally` sit at the probe scope's indent after a
/// dedent, but inserting between them and their suite head breaks the
/// construct.
fn is_suite_continuation(text: &str) -> bool {
    ["else", "elif", "except", "finally"].iter().any(|keyword| {
        text.strip_prefix(keyword)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with([' ', ':', '(']))
    })
}

fn is_import(text: &str) -> bool {
    text.starts_with("import ") || text.starts_with("from ")
}

fn is_container_literal(text: &str) -> bool {
    text.starts_with('{') || text.starts_with('[')
}

fn is_constant_expression(text: &str) -> bool {
    if matches!(text, "True" | "False" | "None" | "...") {
        return true;
    }
    if text.parse::<f64>().is_ok() {
        return true;
    }
    let stripped = text.trim_start_matches(|c: char| "rbfuRBFU".contains(c));
    stripped.len() >= 2
        && (stripped.starts_with('"') || stripped.starts_with('\''))
        && stripped.ends_with(stripped.as_bytes()[0] as char)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(points: &[InsertionPoint]) -> Vec<usize> {
        points.iter().map(|p| p.line).collect()
    }

    #[test]
    fn module_statements_are_insertion_points() {
        let source = "\
x = 1
y = x + 1
print(y)
";
        let points = insertion_points(source).unwrap();
        assert_eq!(lines(&points), vec![0, 1, 2]);
        assert!(points.iter().all(|p| p.scope == ScopeKind::Module));
        assert!(points.iter().all(|p| p.indent.is_empty()));
    }

    #[test]
    fn docstrings_imports_and_comments_are_skipped() {
        let source = r#"#!/usr/bin/env python3
"""A test input."""

import random
from os import path

random.seed(0)
"#;
        let points = insertion_points(source).unwrap();
        assert_eq!(lines(&points), vec![6]);
    }

    #[test]
    fn source_without_real_statements_has_no_points() {
        let source = r#""""Docstring only."""
import sys
"#;
        assert_eq!(
            insertion_points(source),
            Err(AnalysisError::NoInsertionPoints)
        );
    }

    #[test]
    fn multi_line_literal_is_one_statement() {
        let source = "\
quotes = {
    \"a\": 1,
    \"b\": 2,
}
done = True
";
        let points = insertion_points(source).unwrap();
        // the dict assignment is a single point at its head line; its
        // interior lines must never be offered
        assert_eq!(lines(&points), vec![0, 4]);
    }

    #[test]
    fn bare_dict_and_list_literals_are_skipped() {
        let source = "\
{1: 2}
[1, 2]
x = [1, 2]
";
        let points = insertion_points(source).unwrap();
        assert_eq!(lines(&points), vec![2]);
    }

    #[test]
    fn function_bodies_offer_points_with_indent() {
        let source = "\
def scale(v):
    \"\"\"Doubles v.\"\"\"
    result = v * 2
    return result
";
        let points = insertion_points(source).unwrap();
        assert_eq!(lines(&points), vec![0, 2, 3]);
        assert_eq!(points[0].scope, ScopeKind::Module);
        assert_eq!(points[1].scope, ScopeKind::Function);
        assert_eq!(points[1].indent, "    ");
    }

    #[test]
    fn conditional_suites_are_opaque() {
        let source = "\
flag = True
if flag:
    hidden = 1
    def nested():
        visible = 2
";
        let points = insertion_points(source).unwrap();
        // `hidden` and the nested def are children of the if-suite, but the
        // nested function's own body is probeable again
        assert_eq!(lines(&points), vec![0, 1, 4]);
        assert_eq!(points[2].scope, ScopeKind::Function);
        assert_eq!(points[2].indent, "        ");
    }

    #[test]
    fn suite_continuations_are_never_insertion_points() {
        let source = "\
def f(a):
    if a:
        b = 1
    else:
        b = 2
    try:
        c = b
    except ValueError:
        c = 0
    finally:
        d = c
    return d
";
        let points = insertion_points(source).unwrap();
        // inserting between an if-suite and its else (or try/except/finally)
        // would break the construct
        assert_eq!(lines(&points), vec![0, 1, 5, 11]);
    }

    #[test]
    fn class_bodies_offer_points() {
        let source = "\
class Greeter:
    name = \"world\"
    def greet(self):
        print(self.name)
";
        let points = insertion_points(source).unwrap();
        assert_eq!(lines(&points), vec![0, 1, 2, 3]);
        assert_eq!(points[1].scope, ScopeKind::Class);
        assert_eq!(points[3].scope, ScopeKind::Function);
    }

    #[test]
    fn decorators_fuse_with_their_statement() {
        let source = "\
import functools
@functools.cache
@other
def f():
    return 1
g = f()
";
        let points = insertion_points(source).unwrap();
        // the def's point lands before the first decorator
        assert_eq!(lines(&points), vec![1, 4, 5]);
    }

    #[test]
    fn backslash_continuation_joins_lines() {
        let source = "\
total = 1 + \\
    2 + \\
    3
print(total)
";
        let points = insertion_points(source).unwrap();
        assert_eq!(lines(&points), vec![0, 3]);
    }

    #[test]
    fn hash_inside_string_is_not_a_comment() {
        let source = "\
tag = \"#anchor\"  # trailing note
print(tag)
";
        let points = insertion_points(source).unwrap();
        assert_eq!(lines(&points), vec![0, 1]);
    }

    #[test]
    fn triple_quoted_string_spans_lines() {
        let source = "\
banner = \"\"\"
line ( one
line } two
\"\"\"
print(banner)
";
        let points = insertion_points(source).unwrap();
        assert_eq!(lines(&points), vec![0, 4]);
    }

    #[test]
    fn quoter_shaped_module() {
        let source = r#"#!/usr/bin/env python3
"""Test input."""

import random

random.seed(0)

quotes = {
    "a": "A",
    "b": "B",
}

quote, attribution = random.choice(list(quotes.items()))

quote_to_check = "a"
assert quote_to_check in quotes, f"missing {quote_to_check}"

print("Today's inspirational quote:")
print(f'"{quote}" - {attribution}')
"#;
        let points = insertion_points(source).unwrap();
        assert_eq!(lines(&points), vec![5, 7, 12, 14, 15, 17, 18]);
    }
}
