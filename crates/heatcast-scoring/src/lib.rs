//! Scoring stages for one heat: baseline, before-race information,
//! integration, confidence and pattern multipliers.
//!
//! Every function here is pure. Flags and tables are passed in by
//! reference so a single call observes one consistent configuration.

#![forbid(unsafe_code)]

pub mod baseline;
pub mod before_info;
pub mod confidence;
pub mod integration;
pub mod patterns;

use heatcast_domain::Channel;

pub use baseline::score_baseline;
pub use before_info::{BeforeInfoScorer, BeforeInfoStage, HeatContext, StageInput, StageOutcome};
pub use confidence::{classify, confidence_value, tier_for_value};
pub use integration::{integrate, is_contested, select_mode};
pub use patterns::{apply_patterns, PatternContext, PatternOutcome};

/// Logistic function on `x`.
#[must_use]
pub fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Clamps `value` into `[min, max]`, mapping NaN to the nearer-to-zero bound.
#[must_use]
pub fn clamp_into(value: f64, min: f64, max: f64) -> f64 {
    if value.is_nan() {
        return 0.0_f64.clamp(min, max);
    }
    value.clamp(min, max)
}

/// Clamps a sub-score into its channel interval.
#[must_use]
pub fn clamp_channel(channel: Channel, value: f64) -> f64 {
    let (min, max) = channel.bounds();
    clamp_into(value, min, max)
}

/// Ranks values descending (1 = highest); ties go to the earlier position
/// in `values`, which callers keep in lane order.
#[must_use]
pub fn rank_descending(values: &[f64]) -> Vec<u8> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|lhs, rhs| values[*rhs].total_cmp(&values[*lhs]).then(lhs.cmp(rhs)));

    let mut ranks = vec![0_u8; values.len()];
    for (position, index) in order.iter().enumerate() {
        ranks[*index] = u8::try_from(position + 1).unwrap_or(u8::MAX);
    }
    ranks
}
