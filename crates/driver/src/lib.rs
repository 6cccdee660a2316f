//! The localization control loop: policy proposes, environment disposes.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use agent::{Agent, Localiser, Placement};
use environment::{EnvConfig, Environment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub env: EnvConfig,
    pub placement: Placement,
    pub seed: Option<u64>,
}

/// Summary of a completed localization run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub subject: String,
    pub steps: u32,
    pub total_reward: f64,
    pub probes_inserted: usize,
    pub distinct_outputs: usize,
    pub last_status: Option<i32>,
}

/// Runs the step loop to budget exhaustion: each step the localiser
/// instruments the subject, then the environment re-executes it and checks
/// the observation against the baseline. Semantic drift or a failed
/// execution aborts the run with an error.
pub fn localize(config: RunConfig) -> Result<RunReport> {
    let subject = config.env.subject.display().to_string();
    let mut env = Environment::new(config.env).context("environment construction failed")?;
    let mut localiser = match config.seed {
        Some(seed) => Localiser::seeded(config.placement, seed),
        None => Localiser::new(config.placement),
    }?;

    while !env.terminate() {
        let reward = env.reward();
        let action = localiser.pick_action(env.state_mut(), reward)?;
        env.update(action)?;
    }
    info!(steps = env.steps(), "step budget exhausted");

    Ok(RunReport {
        subject,
        steps: env.steps(),
        total_reward: localiser.total_reward(),
        probes_inserted: localiser.probes_inserted(),
        distinct_outputs: env.distinct_outputs(),
        last_status: env.last_status(),
    })
}

pub fn render(report: &RunReport, format: Format) -> String {
    match format {
        Format::Text => format!(
            "subject={} steps={} total_reward={} probes_inserted={} distinct_outputs={} last_status={}",
            report.subject,
            report.steps,
            report.total_reward,
            report.probes_inserted,
            report.distinct_outputs,
            report
                .last_status
                .map(|code| code.to_string())
                .unwrap_or_else(|| "none".to_string()),
        ),
        Format::Json => serde_json::json!(report).to_string(),
    }
}
