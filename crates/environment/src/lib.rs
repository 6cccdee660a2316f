//! Execution environment for a Python subject under probe instrumentation.
//!
//! The environment exclusively owns the subject's on-disk state, a line
//! window over its source, and the baseline output set collected during
//! burn-in. Each step re-executes
//! the subject and compares the observation against the baseline; output the
//! baseline has never seen means the probes changed program semantics and the
//! episode is aborted.

mod exec;

pub use exec::{run_subject, Observation};

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use probegen::PROBE_MARKER;

pub const DEFAULT_MAX_STEPS: u32 = 10;
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum EnvError {
    #[error("invalid subject `{path}`: {reason}", path = .path.display())]
    InvalidSubject { path: PathBuf, reason: String },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to execute subject `{path}`: {reason}", path = .path.display())]
    SubjectExecution { path: PathBuf, reason: String },
    #[error("instrumentation changed subject semantics; unseen output:\n{observation}")]
    SemanticDrift { observation: String },
    #[error(transparent)]
    Expression(#[from] analysis::AnalysisError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// What the policy asks the environment to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Continue,
    EpisodeComplete,
}

#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub subject: PathBuf,
    pub illegal_state_expr: String,
    /// Input that reproduces the bug. Recorded with the run; forwarding it
    /// to the subject is future work.
    pub bug_triggering_input: Option<String>,
    /// Line number at which the bug was observed.
    pub bug_trap: usize,
    /// Fraction of the step budget spent collecting baseline outputs before
    /// drift checking starts. Must lie in `[0, 1)`.
    pub burnin: f64,
    pub max_steps: u32,
    /// File collecting the probe diagnostic lines drained from observations.
    pub probe_output: Option<PathBuf>,
    pub exec_timeout: Duration,
}

impl EnvConfig {
    pub fn new(subject: impl Into<PathBuf>, illegal_state_expr: impl Into<String>, bug_trap: usize) -> Self {
        Self {
            subject: subject.into(),
            illegal_state_expr: illegal_state_expr.into(),
            bug_triggering_input: None,
            bug_trap,
            burnin: 0.0,
            max_steps: DEFAULT_MAX_STEPS,
            probe_output: None,
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
        }
    }
}

/// The mutable view of the subject a policy works on: the source window,
/// the predicate under investigation, and the trap line.
#[derive(Debug)]
pub struct SourceState {
    path: PathBuf,
    pub window: Vec<String>,
    pub illegal_state_expr: String,
    pub bug_trap: usize,
}

impl SourceState {
    /// Loads the subject's lines. No handle is kept: the kernel refuses to
    /// execute a file anyone holds open for writing (ETXTBSY), so reads and
    /// writes are open-do-close and the path stays free between them.
    pub fn open(path: &Path, illegal_state_expr: &str, bug_trap: usize) -> Result<Self, EnvError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            window: contents.lines().map(str::to_string).collect(),
            illegal_state_expr: illegal_state_expr.to_string(),
            bug_trap,
        })
    }

    /// Rewrites the subject file from the window. `fs::write` truncates and
    /// leaves the existing permissions, so the subject stays executable.
    pub fn persist(&mut self) -> Result<(), EnvError> {
        let mut contents = self.window.join("\n");
        contents.push('\n');
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}

#[derive(Debug)]
pub struct Environment {
    subject: PathBuf,
    state: SourceState,
    baseline: BTreeSet<String>,
    steps: u32,
    max_steps: u32,
    max_burnin: u32,
    exec_timeout: Duration,
    probe_output: Option<File>,
    last_status: Option<i32>,
    bug_triggering_input: Option<String>,
}

impl Environment {
    /// Validates the configuration and subject, loads the source window, and
    /// seeds the baseline with one uninstrumented execution. Any failure
    /// here is fatal.
    pub fn new(config: EnvConfig) -> Result<Self, EnvError> {
        if !(0.0..1.0).contains(&config.burnin) {
            return Err(EnvError::InvalidConfig(format!(
                "burn-in fraction {} outside [0, 1)",
                config.burnin
            )));
        }
        if config.max_steps == 0 {
            return Err(EnvError::InvalidConfig("step budget is zero".to_string()));
        }
        analysis::extract_identifiers(&config.illegal_state_expr)?;
        validate_subject(&config.subject)?;

        let state = SourceState::open(&config.subject, &config.illegal_state_expr, config.bug_trap)?;
        let probe_output = match &config.probe_output {
            Some(path) => Some(OpenOptions::new().create(true).append(true).open(path)?),
            None => None,
        };
        let max_burnin = (config.burnin * f64::from(config.max_steps)).ceil() as u32;

        let mut env = Self {
            subject: config.subject,
            state,
            baseline: BTreeSet::new(),
            steps: 0,
            max_steps: config.max_steps,
            max_burnin,
            exec_timeout: config.exec_timeout,
            probe_output,
            last_status: None,
            bug_triggering_input: config.bug_triggering_input,
        };
        let key = env.execute_subject()?;
        info!(
            subject = %env.subject.display(),
            max_burnin,
            baseline_bytes = key.len(),
            "environment ready"
        );
        Ok(env)
    }

    pub fn state(&self) -> &SourceState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut SourceState {
        &mut self.state
    }

    pub fn steps(&self) -> u32 {
        self.steps
    }

    pub fn distinct_outputs(&self) -> usize {
        self.baseline.len()
    }

    pub fn last_status(&self) -> Option<i32> {
        self.last_status
    }

    pub fn bug_triggering_input(&self) -> Option<&str> {
        self.bug_triggering_input.as_deref()
    }

    /// Runs the subject once and folds the observation into the baseline.
    ///
    /// Probe diagnostic lines are drained from the observation before
    /// comparison, so a well-behaved probe can never fail the drift check;
    /// drained lines go to the probe-output file when one is configured.
    /// After burn-in, an unseen comparison key aborts with `SemanticDrift`.
    pub fn execute_subject(&mut self) -> Result<String, EnvError> {
        let observation = run_subject(&self.subject, self.exec_timeout)?;
        self.last_status = observation.status;

        let (key, probe_lines) = split_probe_lines(&observation.combined());
        if let Some(out) = self.probe_output.as_mut() {
            for line in &probe_lines {
                writeln!(out, "{line}")?;
            }
        }
        debug!(
            step = self.steps,
            status = ?observation.status,
            probe_lines = probe_lines.len(),
            seen = self.baseline.contains(&key),
            "subject executed"
        );

        if self.steps > self.max_burnin && !self.baseline.contains(&key) {
            return Err(EnvError::SemanticDrift { observation: key });
        }
        self.baseline.insert(key.clone());
        Ok(key)
    }

    /// Advances one step: counts it, then re-executes the subject so the
    /// probes the policy just inserted take effect.
    pub fn update(&mut self, action: Action) -> Result<(), EnvError> {
        // the action vocabulary is the seam for richer policies; today both
        // values step the same way
        let _ = action;
        self.steps += 1;
        self.execute_subject()?;
        Ok(())
    }

    /// Constant reward baseline.
    pub fn reward(&self) -> f64 {
        1.0
    }

    /// True once the step budget is spent. Pure; calling it never advances
    /// the episode.
    pub fn terminate(&self) -> bool {
        self.steps >= self.max_steps
    }
}

/// Splits an observation into the subject's own output (the drift-comparison
/// key) and the probe diagnostic lines.
fn split_probe_lines(combined: &str) -> (String, Vec<String>) {
    let mut kept = Vec::new();
    let mut probes = Vec::new();
    for line in combined.lines() {
        if line.starts_with(PROBE_MARKER.trim_end()) {
            probes.push(line.to_string());
        } else {
            kept.push(line);
        }
    }
    let mut key = kept.join("\n");
    if !key.is_empty() && combined.ends_with('\n') {
        key.push('\n');
    }
    (key, probes)
}

/// The subject must be a regular file that looks like Python and that the
/// host can execute directly.
fn validate_subject(path: &Path) -> Result<(), EnvError> {
    let invalid = |reason: &str| EnvError::InvalidSubject {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let metadata = std::fs::metadata(path).map_err(|_| invalid("file not found"))?;
    if !metadata.is_file() {
        return Err(invalid("not a regular file"));
    }
    if !looks_like_python(path)? {
        return Err(invalid("not a Python script"));
    }
    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(invalid("not executable"));
    }
    Ok(())
}

fn looks_like_python(path: &Path) -> Result<bool, EnvError> {
    if path.extension().is_some_and(|ext| ext == "py") {
        return Ok(true);
    }
    let contents = std::fs::read_to_string(path)?;
    let first = contents.lines().next().unwrap_or("");
    Ok(first.starts_with("#!") && first.contains("python"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_keeps_subject_output_and_drains_probes() {
        let combined = "hello\n[probe] illegal state: x == 0 = {False}\nworld\n";
        let (key, probes) = split_probe_lines(combined);
        assert_eq!(key, "hello\nworld\n");
        assert_eq!(probes.len(), 1);
        assert!(probes[0].starts_with("[probe] "));
    }

    #[test]
    fn split_of_probe_only_output_yields_empty_key() {
        let (key, probes) = split_probe_lines("[probe] a\n[probe] b\n");
        assert_eq!(key, "");
        assert_eq!(probes.len(), 2);
    }

    #[test]
    fn split_without_probes_is_identity() {
        let (key, probes) = split_probe_lines("only\noutput\n");
        assert_eq!(key, "only\noutput\n");
        assert!(probes.is_empty());
    }

    #[test]
    fn probe_free_and_probed_runs_share_a_key() {
        let clean = "Today's quote\n";
        let probed = "[probe] illegal state: 1 == 1 = True\nToday's quote\n";
        assert_eq!(split_probe_lines(clean).0, split_probe_lines(probed).0);
    }
}
