use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use agent::Placement;
use driver::{localize, render, Format, RunConfig};
use environment::EnvConfig;

/// Localizes a fault in a buggy Python program by probing it with
/// diagnostic print statements and watching for output drift.
#[derive(Parser)]
#[command(name = "pinpoint", version)]
struct Cli {
    /// Path to the buggy Python program
    #[arg(short = 'p', long)]
    subject: PathBuf,

    /// Python expression over subject variables that captures the illegal
    /// state
    #[arg(short = 'i', long)]
    illegal_state_expr: String,

    /// Line number at which the bug was observed
    #[arg(short = 't', long)]
    bug_trap: usize,

    /// Input that triggers the bug (recorded with the run)
    #[arg(short = 'b', long)]
    bug: Option<String>,

    /// Fraction of the step budget spent collecting baseline outputs, in
    /// [0, 1)
    #[arg(short = 'n', long, default_value_t = 0.0)]
    burnin: f64,

    /// Maximum number of simulation steps
    #[arg(short = 'm', long, default_value_t = 10)]
    max_steps: u32,

    /// File collecting probe output lines
    #[arg(short = 'o', long)]
    probe_output: Option<PathBuf>,

    /// Per-execution wall-clock timeout for the subject, in seconds
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    /// Seed for reproducible probe placement
    #[arg(long)]
    seed: Option<u64>,

    /// Probe placement strategy
    #[arg(long, default_value = "random")]
    placement: String,

    /// Keep the instrumented copy of the subject after the run
    #[arg(long)]
    keep_instrumented: bool,

    /// Emit the run report as JSON
    #[arg(long)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let placement = match cli.placement.as_str() {
        "random" => Placement::Random,
        "reachability" => Placement::Reachability,
        other => bail!("unknown placement strategy `{other}`"),
    };

    // the run mutates its subject, so it works on a sibling copy
    let instrumented = instrumented_copy(&cli.subject)?;

    let mut env = EnvConfig::new(&instrumented, cli.illegal_state_expr.as_str(), cli.bug_trap);
    env.bug_triggering_input = cli.bug;
    env.burnin = cli.burnin;
    env.max_steps = cli.max_steps;
    env.probe_output = cli.probe_output;
    env.exec_timeout = Duration::from_secs(cli.timeout_secs);

    let result = localize(RunConfig {
        env,
        placement,
        seed: cli.seed,
    });

    // on failure the copy is left behind for inspection
    if result.is_ok() && !cli.keep_instrumented {
        if let Err(err) = fs::remove_file(&instrumented) {
            warn!(path = %instrumented.display(), %err, "could not remove instrumented copy");
        }
    }

    let report = result?;
    let format = if cli.json { Format::Json } else { Format::Text };
    println!("{}", render(&report, format));
    Ok(())
}

/// Copies the subject to `<stem>.instrumented.py` beside it. `fs::copy`
/// preserves permissions, so the copy stays executable.
fn instrumented_copy(subject: &Path) -> Result<PathBuf> {
    let stem = subject
        .file_stem()
        .and_then(|stem| stem.to_str())
        .with_context(|| format!("subject path `{}` has no file name", subject.display()))?;
    let copy = subject.with_file_name(format!("{stem}.instrumented.py"));
    fs::copy(subject, &copy).with_context(|| {
        format!(
            "failed to copy `{}` to `{}`",
            subject.display(),
            copy.display()
        )
    })?;
    Ok(copy)
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
