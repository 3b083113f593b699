use heatcast_domain::ConfidenceTier;

use crate::sigmoid;

const CENTER: f64 = 45.0;
const SCALE: f64 = 12.0;

/// Lower bound of each tier, best first; anything below the last is `E`.
pub const TIER_THRESHOLDS: [(ConfidenceTier, f64); 4] = [
    (ConfidenceTier::A, 0.80),
    (ConfidenceTier::B, 0.65),
    (ConfidenceTier::C, 0.50),
    (ConfidenceTier::D, 0.35),
];

#[must_use]
pub fn confidence_value(integrated_total: f64, completeness: f64) -> f64 {
    if !integrated_total.is_finite() || !completeness.is_finite() {
        return 0.0;
    }
    sigmoid((integrated_total - CENTER) / SCALE) * completeness.clamp(0.0, 1.0)
}

#[must_use]
pub fn tier_for_value(value: f64) -> ConfidenceTier {
    TIER_THRESHOLDS
        .iter()
        .find(|(_, threshold)| value >= *threshold)
        .map_or(ConfidenceTier::E, |(tier, _)| *tier)
}

/// Tier for an integrated total at the given completeness.
#[must_use]
pub fn classify(integrated_total: f64, completeness: f64) -> ConfidenceTier {
    tier_for_value(confidence_value(integrated_total, completeness))
}
