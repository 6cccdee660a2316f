//! Probe synthesis: picks where to place diagnostic print statements and
//! renders their text.
//!
//! Placement count follows a Zipf distribution (most steps add one probe,
//! a long tail adds up to five), locations are drawn uniformly without
//! replacement from the safe insertion points of the current source window.

use std::collections::BTreeSet;

use rand::{RngCore, SeedableRng};
use rand_distr::{Distribution, Zipf};
use rand_xoshiro::Xoshiro256PlusPlus;
use thiserror::Error;
use tracing::debug;

use analysis::{extract_identifiers, insertion_points, AnalysisError, InsertionPoint};

/// Upper bound on probes placed in a single generation call.
pub const MAX_PROBES_PER_STEP: u64 = 5;

/// Skew of the probe-count distribution.
pub const ZIPF_SKEW: f64 = 1.5;

/// Prefix every probe prints, so probe output can be told apart from the
/// subject's own output.
pub const PROBE_MARKER: &str = "[probe] ";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

/// A statement to insert into a source window.
///
/// Offsets of one `generate` batch are strictly increasing and already
/// rank-adjusted: inserting the probes in order, each at its own offset,
/// lands every probe at its intended final line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    pub offset: usize,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct ProbeGenerator {
    rng: Xoshiro256PlusPlus,
}

impl ProbeGenerator {
    /// Generator seeded from the operating system.
    pub fn new() -> Self {
        let mut seed = <Xoshiro256PlusPlus as SeedableRng>::Seed::default();
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self {
            rng: Xoshiro256PlusPlus::from_seed(seed),
        }
    }

    /// Deterministic generator for reproducible runs.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    /// Picks probe locations in `window` and renders probe text for `expr`.
    ///
    /// The window itself is not modified. The first window line is never a
    /// probe location, so a shebang stays first.
    pub fn generate(&mut self, window: &[String], expr: &str) -> Result<Vec<Probe>, ProbeError> {
        let identifiers = extract_identifiers(expr)?;
        let source = window.join("\n");
        let points: Vec<InsertionPoint> = insertion_points(&source)?
            .into_iter()
            .filter(|point| point.line >= 1)
            .collect();
        if points.is_empty() {
            return Err(AnalysisError::NoInsertionPoints.into());
        }

        let zipf = Zipf::new(MAX_PROBES_PER_STEP, ZIPF_SKEW).expect("static Zipf parameters");
        let sampled = zipf.sample(&mut self.rng) as usize;
        let count = sampled.min(points.len());
        debug!(sampled, count, support = points.len(), "placing probes");

        let mut chosen = rand::seq::index::sample(&mut self.rng, points.len(), count).into_vec();
        chosen.sort_unstable();

        let statement = probe_statement(expr, &identifiers);
        let probes = chosen
            .into_iter()
            .enumerate()
            .map(|(rank, index)| {
                let point = &points[index];
                Probe {
                    offset: point.line + rank,
                    text: format!("{}{}", point.indent, statement),
                }
            })
            .collect();
        Ok(probes)
    }
}

impl Default for ProbeGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders the probe statement: a print of the predicate's value and a
/// `name="value"` binding for each of its free identifiers.
///
/// Rendered with `%`-formatting rather than an f-string: the predicate text
/// appears once escaped inside a string literal and once verbatim as an
/// ordinary expression in the argument tuple, so quotes and backslashes in
/// the predicate stay valid Python.
fn probe_statement(expr: &str, identifiers: &BTreeSet<String>) -> String {
    let label = python_string_escaped(expr);
    let mut template = format!("{PROBE_MARKER}illegal state: {label} = %s");
    let mut arguments = vec![format!("({expr})")];
    if !identifiers.is_empty() {
        let bindings = identifiers
            .iter()
            .map(|name| format!("{name}=\\\"%s\\\""))
            .collect::<Vec<_>>()
            .join(", ");
        template.push_str("; bindings: ");
        template.push_str(&bindings);
        arguments.extend(identifiers.iter().cloned());
    }
    format!("print(\"{template}\" % ({},))", arguments.join(", "))
}

/// Escapes text for inclusion in a double-quoted Python `%`-format string.
fn python_string_escaped(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '%' => escaped.push_str("%%"),
            _ => escaped.push(c),
        }
    }
    escaped
}
