//! Full localization runs against on-disk subjects.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::Duration;

use tempfile::TempDir;

use agent::Placement;
use driver::{localize, RunConfig};
use environment::EnvConfig;

const QUOTER: &str = r#"#!/usr/bin/env python3
"""Deterministic test subject."""

import random

random.seed(0)

quotes = {
    "It does not matter how slowly you go.": "Confucius",
    "Believe you can and you're halfway there.": "Theodore Roosevelt",
}

quote, attribution = random.choice(list(quotes.items()))

quote_to_check = "Believe you can and you're halfway there."
assert quote_to_check in quotes, f"missing {quote_to_check}"

print("Today's inspirational quote:")
print(f'"{quote}" - {attribution}')
"#;

fn write_subject(dir: &TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, body).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn run_config(subject: PathBuf, expr: &str, seed: u64) -> RunConfig {
    let mut env = EnvConfig::new(subject, expr, 17);
    env.exec_timeout = Duration::from_secs(20);
    RunConfig {
        env,
        placement: Placement::Random,
        seed: Some(seed),
    }
}

#[test]
fn single_step_with_identifier_free_predicate_completes() {
    // zero burn-in: drift is checked from the very first step, and the
    // probe's own output must not count as drift
    let dir = TempDir::new().unwrap();
    let subject = write_subject(&dir, "quoter.py", QUOTER);
    let mut config = run_config(subject, "1 == 1", 5);
    config.env.max_steps = 1;

    let report = localize(config).unwrap();
    assert_eq!(report.steps, 1);
    assert!(report.probes_inserted >= 1);
    assert_eq!(report.distinct_outputs, 1);
    assert_eq!(report.last_status, Some(0));
    assert_eq!(report.total_reward, 1.0);
}

#[test]
fn full_budget_run_accumulates_probes_and_reward() {
    let dir = TempDir::new().unwrap();
    let subject = write_subject(&dir, "quoter.py", QUOTER);
    let config = run_config(subject.clone(), "1 == 1", 42);

    let report = localize(config).unwrap();
    assert_eq!(report.steps, 10);
    assert_eq!(report.total_reward, 10.0);
    assert!(report.probes_inserted >= 10);
    assert_eq!(report.distinct_outputs, 1);

    // every step's batch is still in the subject
    let instrumented = fs::read_to_string(&subject).unwrap();
    let probe_lines = instrumented
        .lines()
        .filter(|line| line.contains("[probe] "))
        .count();
    assert_eq!(probe_lines, report.probes_inserted);
}

#[test]
fn binding_predicate_reports_variables_during_burnin() {
    let dir = TempDir::new().unwrap();
    let subject = write_subject(&dir, "quoter.py", QUOTER);
    let probe_output = dir.path().join("probes.dmp");
    // a probe can land before `quote` is bound, which kills that run with a
    // NameError whose traceback shifts as probes accumulate; a burn-in
    // covering the whole budget absorbs all of those outputs
    let mut config = run_config(subject, "quote != attribution", 42);
    config.env.burnin = 0.95;
    config.env.probe_output = Some(probe_output.clone());

    let report = localize(config).unwrap();
    assert_eq!(report.steps, 10);
    let dumped = fs::read_to_string(&probe_output).unwrap_or_default();
    for line in dumped.lines() {
        assert!(line.starts_with("[probe] illegal state: quote != attribution"));
    }
}

#[test]
fn subject_without_insertion_points_fails_the_run() {
    let dir = TempDir::new().unwrap();
    let subject = write_subject(
        &dir,
        "empty.py",
        "#!/usr/bin/env python3\n\"\"\"Nothing to probe.\"\"\"\nimport sys\n",
    );
    let config = run_config(subject, "1 == 1", 0);
    let err = localize(config).unwrap_err();
    assert!(err.to_string().contains("no safe insertion points"));
}

#[test]
fn seeded_runs_place_identical_probes() {
    let dir = TempDir::new().unwrap();
    let first = write_subject(&dir, "first.py", QUOTER);
    let second = write_subject(&dir, "second.py", QUOTER);

    localize(run_config(first.clone(), "1 == 1", 9)).unwrap();
    localize(run_config(second.clone(), "1 == 1", 9)).unwrap();

    let a = fs::read_to_string(&first).unwrap();
    let b = fs::read_to_string(&second).unwrap();
    assert_eq!(a, b);
}
