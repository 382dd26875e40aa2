//! Selection Ratio Scheduler
//!
//! Maps training progress to the fraction of all instances whose
//! model-derived pseudo-labels are trusted this round. The ratio is held at
//! its initial value through warmup and then ramps toward the final value.
//!
//! Every function here is pure: the same round always yields the same ratio,
//! which is what makes a resumed round reproduce the original one.

use serde::{Deserialize, Serialize};

use crate::utils::error::{MilError, Result};

/// Shape of the post-warmup ramp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatioCurve {
    /// Straight line from initial to final ratio
    #[default]
    Linear,
    /// Half-cosine ease-in/ease-out: slow start, slow finish
    Cosine,
}

impl RatioCurve {
    /// Map linear progress in `[0, 1]` onto the curve (monotone, endpoints fixed)
    fn shape(self, progress: f64) -> f64 {
        match self {
            RatioCurve::Linear => progress,
            RatioCurve::Cosine => (1.0 - (std::f64::consts::PI * progress).cos()) / 2.0,
        }
    }
}

/// Linear selection ratio for `round`
///
/// * `round < warmup_rounds` returns `initial_ratio`
/// * afterwards interpolates toward `final_ratio`, reaching it at `total_rounds`
/// * `total_rounds <= warmup_rounds` returns `final_ratio` as soon as warmup ends
pub fn ratio(
    round: usize,
    total_rounds: usize,
    warmup_rounds: usize,
    initial_ratio: f64,
    final_ratio: f64,
) -> f64 {
    ratio_with_curve(
        RatioCurve::Linear,
        round,
        total_rounds,
        warmup_rounds,
        initial_ratio,
        final_ratio,
    )
}

/// Selection ratio for `round` along an arbitrary ramp shape
pub fn ratio_with_curve(
    curve: RatioCurve,
    round: usize,
    total_rounds: usize,
    warmup_rounds: usize,
    initial_ratio: f64,
    final_ratio: f64,
) -> f64 {
    if round < warmup_rounds {
        return initial_ratio;
    }

    if total_rounds <= warmup_rounds {
        return final_ratio;
    }

    let ramp_rounds = (total_rounds - warmup_rounds) as f64;
    let progress = ((round - warmup_rounds) as f64 / ramp_rounds).clamp(0.0, 1.0);

    let value = initial_ratio + curve.shape(progress) * (final_ratio - initial_ratio);
    value.clamp(initial_ratio.min(final_ratio), initial_ratio.max(final_ratio))
}

/// Validated ratio schedule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatioScheduler {
    /// Total number of self-training rounds
    pub total_rounds: usize,
    /// Rounds spent in warmup
    pub warmup_rounds: usize,
    /// Ratio during warmup (usually 0: nothing the model says is trusted yet)
    pub initial_ratio: f64,
    /// Ratio reached at the last round
    pub final_ratio: f64,
    /// Ramp shape after warmup
    #[serde(default)]
    pub curve: RatioCurve,
}

impl Default for RatioScheduler {
    fn default() -> Self {
        Self {
            total_rounds: 500,
            warmup_rounds: 10,
            initial_ratio: 0.0,
            final_ratio: 0.25,
            curve: RatioCurve::Linear,
        }
    }
}

impl RatioScheduler {
    /// Create and validate a linear schedule
    pub fn new(
        total_rounds: usize,
        warmup_rounds: usize,
        initial_ratio: f64,
        final_ratio: f64,
    ) -> Result<Self> {
        let scheduler = Self {
            total_rounds,
            warmup_rounds,
            initial_ratio,
            final_ratio,
            curve: RatioCurve::Linear,
        };
        scheduler.validate()?;
        Ok(scheduler)
    }

    /// Use a different ramp shape
    pub fn with_curve(mut self, curve: RatioCurve) -> Self {
        self.curve = curve;
        self
    }

    /// Reject schedules that cannot be honored
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("initial_ratio", self.initial_ratio), ("final_ratio", self.final_ratio)] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(MilError::Config(format!(
                    "{} must be within [0, 1], got {}",
                    name, value
                )));
            }
        }

        if self.warmup_rounds > self.total_rounds {
            return Err(MilError::Config(format!(
                "warmup_rounds ({}) exceeds total_rounds ({})",
                self.warmup_rounds, self.total_rounds
            )));
        }

        Ok(())
    }

    /// Ratio for the given round
    pub fn ratio(&self, round: usize) -> f64 {
        ratio_with_curve(
            self.curve,
            round,
            self.total_rounds,
            self.warmup_rounds,
            self.initial_ratio,
            self.final_ratio,
        )
    }

    /// Whether `round` falls inside warmup
    pub fn in_warmup(&self, round: usize) -> bool {
        round < self.warmup_rounds
    }

    /// Get a description of the schedule
    pub fn description(&self) -> String {
        format!(
            "{:?} ratio ramp: {:.2} -> {:.2} after {} warmup rounds ({} total)",
            self.curve, self.initial_ratio, self.final_ratio, self.warmup_rounds, self.total_rounds
        )
    }
}
