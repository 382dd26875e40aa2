//! Round state and the warmup/steady-state phase machine
//!
//! The round driver owns exactly one `RoundState` at a time and threads a new
//! value out of every completed round. Nothing here is global.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::selection::SelectionMask;

/// Training phase
///
/// `Warmup` trusts no model output: every instance is trained on, with the
/// bag label substituted where the image has no weak label. The only allowed
/// transition is `Warmup -> SteadyState`, and it is irreversible for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Warmup,
    SteadyState,
}

impl Phase {
    /// Whether this is the warmup phase
    pub fn is_warmup(self) -> bool {
        matches!(self, Phase::Warmup)
    }

    /// Phase for the round following `round`
    ///
    /// Once steady state is reached it is never left, whatever the round.
    pub fn after_round(self, round: usize, warmup_rounds: usize) -> Phase {
        match self {
            Phase::SteadyState => Phase::SteadyState,
            Phase::Warmup if round + 1 >= warmup_rounds => Phase::SteadyState,
            Phase::Warmup => Phase::Warmup,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Warmup => write!(f, "warmup"),
            Phase::SteadyState => write!(f, "steady-state"),
        }
    }
}

/// Everything needed to resume the self-training loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundState {
    /// Index of the next round to run
    pub round: usize,
    /// Current phase
    pub phase: Phase,
    /// Best instance-level (contrastive) validation loss so far
    pub best_instance_loss: Option<f64>,
    /// Best bag-level (aggregator) validation loss so far
    pub best_bag_loss: Option<f64>,
    /// Mask produced by the most recent aggregation pass
    pub selection_mask: SelectionMask,
}

impl RoundState {
    /// State before round zero
    pub fn initial(warmup_rounds: usize) -> Self {
        let phase = if warmup_rounds == 0 {
            Phase::SteadyState
        } else {
            Phase::Warmup
        };

        Self {
            round: 0,
            phase,
            best_instance_loss: None,
            best_bag_loss: None,
            selection_mask: SelectionMask::default(),
        }
    }

    /// Whether `loss` beats the best instance loss so far
    pub fn improves_instance(&self, loss: f64) -> bool {
        improves(self.best_instance_loss, loss)
    }

    /// Whether `loss` beats the best bag loss so far
    pub fn improves_bag(&self, loss: f64) -> bool {
        improves(self.best_bag_loss, loss)
    }
}

fn improves(best: Option<f64>, loss: f64) -> bool {
    if !loss.is_finite() {
        return false;
    }
    best.map_or(true, |b| loss < b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_transition_is_one_way() {
        assert_eq!(Phase::Warmup.after_round(0, 3), Phase::Warmup);
        assert_eq!(Phase::Warmup.after_round(1, 3), Phase::Warmup);
        assert_eq!(Phase::Warmup.after_round(2, 3), Phase::SteadyState);
        assert_eq!(Phase::SteadyState.after_round(0, 3), Phase::SteadyState);
    }

    #[test]
    fn test_initial_state_without_warmup() {
        assert_eq!(RoundState::initial(0).phase, Phase::SteadyState);
        assert_eq!(RoundState::initial(2).phase, Phase::Warmup);
    }

    #[test]
    fn test_improvement_tracking() {
        let mut state = RoundState::initial(1);
        assert!(state.improves_instance(5.0));
        state.best_instance_loss = Some(1.0);
        assert!(state.improves_instance(0.5));
        assert!(!state.improves_instance(1.0));
        assert!(!state.improves_instance(f64::NAN));
        assert!(state.improves_bag(3.0));
    }

    #[test]
    fn test_state_json_roundtrip_with_no_best_losses() {
        let state = RoundState::initial(4);
        let json = serde_json::to_string(&state).unwrap();
        let back: RoundState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
        assert!(json.contains("\"warmup\""));
    }
}
