//! Localization policies: how probes get chosen and placed each step.

use thiserror::Error;
use tracing::debug;

use environment::{Action, EnvError, SourceState};
use probegen::{Probe, ProbeError, ProbeGenerator};

/// Probe placement strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Zipf-count, uniform-location placement.
    Random,
    /// Placement guided by reachability of the bug trap. Named but not yet
    /// implemented; selecting it fails at construction.
    Reachability,
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("placement strategy {0:?} is not implemented")]
    UnsupportedPlacement(Placement),
    #[error(transparent)]
    Probe(#[from] ProbeError),
    #[error(transparent)]
    Env(#[from] EnvError),
}

/// Pure probe application: returns a new window with every probe inserted at
/// its offset, leaving the input untouched. Offsets must be the
/// rank-adjusted, ascending offsets of one generation batch.
pub fn apply_probes(window: &[String], probes: &[Probe]) -> Vec<String> {
    let mut next = window.to_vec();
    for probe in probes {
        let at = probe.offset.min(next.len());
        next.insert(at, probe.text.clone());
    }
    next
}

pub trait Agent {
    /// One policy step over the current source state. The returned action is
    /// handed to the environment.
    fn pick_action(&mut self, state: &mut SourceState, reward: f64) -> Result<Action, PolicyError>;

    /// Applies probes to the state's window and persists the result to the
    /// subject file.
    fn add_probes(&mut self, state: &mut SourceState, probes: &[Probe]) -> Result<(), PolicyError> {
        state.window = apply_probes(&state.window, probes);
        state.persist()?;
        Ok(())
    }
}

/// The random-placement localiser: every step it generates a fresh probe
/// batch for the illegal-state predicate, instruments the subject, and banks
/// the environment's reward.
#[derive(Debug)]
pub struct Localiser {
    generator: ProbeGenerator,
    total_reward: f64,
    probes_inserted: usize,
}

impl Localiser {
    pub fn new(placement: Placement) -> Result<Self, PolicyError> {
        Self::with_generator(placement, ProbeGenerator::new())
    }

    pub fn seeded(placement: Placement, seed: u64) -> Result<Self, PolicyError> {
        Self::with_generator(placement, ProbeGenerator::seeded(seed))
    }

    fn with_generator(placement: Placement, generator: ProbeGenerator) -> Result<Self, PolicyError> {
        match placement {
            Placement::Random => Ok(Self {
                generator,
                total_reward: 0.0,
                probes_inserted: 0,
            }),
            Placement::Reachability => Err(PolicyError::UnsupportedPlacement(placement)),
        }
    }

    pub fn total_reward(&self) -> f64 {
        self.total_reward
    }

    pub fn probes_inserted(&self) -> usize {
        self.probes_inserted
    }
}

impl Agent for Localiser {
    fn pick_action(&mut self, state: &mut SourceState, reward: f64) -> Result<Action, PolicyError> {
        let probes = self
            .generator
            .generate(&state.window, &state.illegal_state_expr)?;
        debug!(count = probes.len(), "instrumenting subject");
        self.probes_inserted += probes.len();
        self.add_probes(state, &probes)?;
        self.total_reward += reward;
        Ok(Action::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use tempfile::TempDir;

    fn probe(offset: usize, text: &str) -> Probe {
        Probe {
            offset,
            text: text.to_string(),
        }
    }

    #[test]
    fn apply_probes_leaves_the_input_window_untouched() {
        let window: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let next = apply_probes(&window, &[probe(1, "p1")]);
        assert_eq!(window, ["a", "b", "c"]);
        assert_eq!(next, ["a", "p1", "b", "c"]);
    }

    #[test]
    fn apply_probes_lands_rank_adjusted_offsets() {
        let window: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        // offsets 1 and 3 are ranks 0 and 1 over original lines 1 and 2
        let next = apply_probes(&window, &[probe(1, "p1"), probe(3, "p2")]);
        assert_eq!(next, ["a", "p1", "b", "p2", "c", "d"]);
    }

    #[test]
    fn apply_probes_clamps_past_the_end() {
        let window: Vec<String> = ["a"].iter().map(|s| s.to_string()).collect();
        let next = apply_probes(&window, &[probe(9, "p")]);
        assert_eq!(next, ["a", "p"]);
    }

    #[test]
    fn reachability_placement_is_rejected_at_construction() {
        let err = Localiser::seeded(Placement::Reachability, 0).unwrap_err();
        assert!(matches!(err, PolicyError::UnsupportedPlacement(Placement::Reachability)));
    }

    #[test]
    fn localiser_instruments_and_banks_reward() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("subject.py");
        fs::write(&path, "x = 1\ny = x + 1\nprint(y)\n").unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();

        let mut state = SourceState::open(&path, "x == 0", 2).unwrap();
        let mut localiser = Localiser::seeded(Placement::Random, 11).unwrap();

        let before = state.window.len();
        let action = localiser.pick_action(&mut state, 1.0).unwrap();
        assert_eq!(action, Action::Continue);
        assert!(localiser.probes_inserted() >= 1);
        assert_eq!(state.window.len(), before + localiser.probes_inserted());
        assert_eq!(localiser.total_reward(), 1.0);

        // the instrumented window was persisted to disk
        let on_disk = fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk, state.window.join("\n") + "\n");
        assert!(on_disk.contains("[probe] "));

        localiser.pick_action(&mut state, 1.0).unwrap();
        assert_eq!(localiser.total_reward(), 2.0);
    }
}
