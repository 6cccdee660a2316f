//! Identifier extraction from illegal-state expressions.

use std::collections::BTreeSet;

use crate::AnalysisError;

const KEYWORD_OPERATORS: &[&str] = &[
    "and", "or", "not", "in", "is", "if", "else", "lambda", "for", "await",
];
const KEYWORD_CONSTANTS: &[&str] = &["True", "False", "None"];

const UNARY_OPERATORS: &[&str] = &["+", "-", "~", "not", "await", "lambda"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    /// Literal or keyword constant.
    Atom,
    Operator(String),
    Open(char),
    Close(char),
    Comma,
    Colon,
    Dot,
}

/// Returns the free identifiers of a Python expression, sorted.
///
/// Call targets (`foo` in `foo(x)`) and attribute names (`b` in `a.b`) are
/// excluded; call arguments are traversed. The expression is first checked
/// for plausibility as a standalone expression so that an obviously broken
/// predicate fails here instead of producing probes that crash the subject.
pub fn extract_identifiers(expr: &str) -> Result<BTreeSet<String>, AnalysisError> {
    let tokens = tokenize(expr)?;
    validate(expr, &tokens)?;

    let mut identifiers = BTreeSet::new();
    for (index, token) in tokens.iter().enumerate() {
        if let Token::Ident(name) = token {
            let attribute = index > 0 && tokens[index - 1] == Token::Dot;
            let call_target = tokens.get(index + 1) == Some(&Token::Open('('));
            let keyword_argument =
                matches!(tokens.get(index + 1), Some(Token::Operator(op)) if op == "=");
            if !attribute && !call_target && !keyword_argument {
                identifiers.insert(name.clone());
            }
        }
    }
    Ok(identifiers)
}

fn invalid(expr: &str, reason: impl Into<String>) -> AnalysisError {
    AnalysisError::InvalidExpression {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

fn tokenize(expr: &str) -> Result<Vec<Token>, AnalysisError> {
    let mut tokens = Vec::new();
    let bytes = expr.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        match b {
            b' ' | b'\t' => i += 1,
            b'(' | b'[' | b'{' => {
                tokens.push(Token::Open(b as char));
                i += 1;
            }
            b')' | b']' | b'}' => {
                tokens.push(Token::Close(b as char));
                i += 1;
            }
            b',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            b':' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    return Err(invalid(expr, "assignment is not an expression"));
                }
                tokens.push(Token::Colon);
                i += 1;
            }
            b'.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            b'\'' | b'"' => {
                i = scan_string(expr, bytes, i)?;
                tokens.push(Token::Atom);
            }
            b'0'..=b'9' => {
                while i < bytes.len()
                    && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.')
                {
                    i += 1;
                }
                tokens.push(Token::Atom);
            }
            _ if b.is_ascii_alphabetic() || b == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                let word = &expr[start..i];
                let string_prefix = word.chars().all(|c| "rbfuRBFU".contains(c))
                    && matches!(bytes.get(i), Some(b'\'') | Some(b'"'));
                if string_prefix {
                    i = scan_string(expr, bytes, i)?;
                    tokens.push(Token::Atom);
                } else if KEYWORD_OPERATORS.contains(&word) {
                    tokens.push(Token::Operator(word.to_string()));
                } else if KEYWORD_CONSTANTS.contains(&word) {
                    tokens.push(Token::Atom);
                } else {
                    tokens.push(Token::Ident(word.to_string()));
                }
            }
            b'+' | b'-' | b'*' | b'/' | b'%' | b'<' | b'>' | b'=' | b'!' | b'&' | b'|' | b'^'
            | b'~' | b'@' => {
                // longest-prefix match, so `x ==-1` scans as `==` then
                // unary `-`
                let (op, width) = match (b, bytes.get(i + 1).copied()) {
                    (b'*', Some(b'*')) => ("**", 2),
                    (b'/', Some(b'/')) => ("//", 2),
                    (b'<', Some(b'<')) => ("<<", 2),
                    (b'>', Some(b'>')) => (">>", 2),
                    (b'<', Some(b'=')) => ("<=", 2),
                    (b'>', Some(b'=')) => (">=", 2),
                    (b'=', Some(b'=')) => ("==", 2),
                    (b'!', Some(b'=')) => ("!=", 2),
                    (b'!', _) => return Err(invalid(expr, "unrecognized operator `!`")),
                    (b'+', _) => ("+", 1),
                    (b'-', _) => ("-", 1),
                    (b'*', _) => ("*", 1),
                    (b'/', _) => ("/", 1),
                    (b'%', _) => ("%", 1),
                    (b'<', _) => ("<", 1),
                    (b'>', _) => (">", 1),
                    (b'&', _) => ("&", 1),
                    (b'|', _) => ("|", 1),
                    (b'^', _) => ("^", 1),
                    (b'~', _) => ("~", 1),
                    (b'@', _) => ("@", 1),
                    _ => ("=", 1),
                };
                tokens.push(Token::Operator(op.to_string()));
                i += width;
            }
            b';' => return Err(invalid(expr, "statement separator `;` in expression")),
            _ => {
                let offending = expr[i..].chars().next().unwrap_or('?');
                return Err(invalid(expr, format!("unexpected character `{offending}`")));
            }
        }
    }
    Ok(tokens)
}

/// Consumes a quoted string starting at `start` and returns the offset past
/// its closing quote.
fn scan_string(expr: &str, bytes: &[u8], start: usize) -> Result<usize, AnalysisError> {
    let quote = bytes[start];
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return Ok(i + 1),
            _ => i += 1,
        }
    }
    Err(invalid(expr, "unterminated string literal"))
}

fn validate(expr: &str, tokens: &[Token]) -> Result<(), AnalysisError> {
    if tokens.is_empty() {
        return Err(invalid(expr, "empty expression"));
    }

    let mut delimiters = Vec::new();
    let mut lambda_seen = false;
    for (index, token) in tokens.iter().enumerate() {
        let previous = if index > 0 { tokens.get(index - 1) } else { None };
        match token {
            Token::Open(open) => delimiters.push(*open),
            Token::Close(close) => {
                let expected = match close {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                if delimiters.pop() != Some(expected) {
                    return Err(invalid(expr, "unbalanced delimiters"));
                }
                if matches!(previous, Some(Token::Operator(_)) | Some(Token::Dot)) {
                    return Err(invalid(expr, "dangling operator"));
                }
            }
            Token::Operator(op) if op == "=" => {
                // `=` is only a keyword argument inside a call, never
                // assignment
                let keyword_argument =
                    delimiters.last() == Some(&'(') && matches!(previous, Some(Token::Ident(_)));
                if !keyword_argument {
                    return Err(invalid(expr, "assignment is not an expression"));
                }
            }
            Token::Operator(op) => {
                let value_before = matches!(
                    previous,
                    Some(Token::Ident(_)) | Some(Token::Atom) | Some(Token::Close(_))
                );
                if !value_before && !UNARY_OPERATORS.contains(&op.as_str()) {
                    return Err(invalid(expr, format!("misplaced operator `{op}`")));
                }
                if op == "lambda" {
                    lambda_seen = true;
                }
            }
            Token::Colon => {
                if delimiters.is_empty() && !lambda_seen {
                    return Err(invalid(expr, "statement syntax in expression"));
                }
            }
            Token::Ident(_) | Token::Atom => {
                if matches!(previous, Some(Token::Ident(_)) | Some(Token::Atom)) {
                    return Err(invalid(expr, "expected operator between values"));
                }
            }
            Token::Comma => {
                if index == 0 {
                    return Err(invalid(expr, "misplaced comma"));
                }
            }
            Token::Dot => {
                if !matches!(
                    previous,
                    Some(Token::Ident(_)) | Some(Token::Close(_)) | Some(Token::Atom)
                ) {
                    return Err(invalid(expr, "misplaced attribute access"));
                }
            }
        }
    }
    if !delimiters.is_empty() {
        return Err(invalid(expr, "unbalanced delimiters"));
    }
    match tokens.last() {
        Some(Token::Operator(_)) | Some(Token::Dot) | Some(Token::Comma) | Some(Token::Colon) => {
            Err(invalid(expr, "dangling operator"))
        }
        _ => Ok(()),
    }
}
