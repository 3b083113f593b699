//! Blending of the baseline and before-info composites.

use heatcast_domain::{FeatureFlags, Flag, IntegrationMode};

pub const LEGACY_BASELINE_WEIGHT: f64 = 0.6;
pub const LEGACY_BEFORE_INFO_WEIGHT: f64 = 0.4;

const DYNAMIC_START: f64 = 0.4;
const DYNAMIC_MIN: f64 = 0.20;
const DYNAMIC_MAX: f64 = 0.65;
const HIGH_CONFIDENCE: f64 = 0.70;
const HIGH_CONFIDENCE_BOOST: f64 = 0.15;
const MID_CONFIDENCE: f64 = 0.40;
const MID_CONFIDENCE_BOOST: f64 = 0.05;
const LOW_CONFIDENCE: f64 = 0.20;
const LOW_CONFIDENCE_CUT: f64 = -0.10;
const CONTESTED_BOOST: f64 = 0.10;
/// Top-two baseline totals closer than this make a heat contested.
pub const CONTESTED_GAP: f64 = 5.0;

/// A heat is contested when its two best baseline totals are within
/// [`CONTESTED_GAP`] of each other.
#[must_use]
pub fn is_contested(baseline_totals: &[f64]) -> bool {
    let mut sorted: Vec<f64> = baseline_totals
        .iter()
        .copied()
        .filter(|total| total.is_finite())
        .collect();
    sorted.sort_by(|lhs, rhs| rhs.total_cmp(lhs));
    match sorted.as_slice() {
        [first, second, ..] => first - second < CONTESTED_GAP,
        _ => false,
    }
}

/// Before-info weight for the dynamic policy.
#[must_use]
pub fn dynamic_before_info_weight(before_info_confidence: f64, contested: bool) -> f64 {
    let confidence_shift = if before_info_confidence >= HIGH_CONFIDENCE {
        HIGH_CONFIDENCE_BOOST
    } else if before_info_confidence >= MID_CONFIDENCE {
        MID_CONFIDENCE_BOOST
    } else if before_info_confidence < LOW_CONFIDENCE {
        LOW_CONFIDENCE_CUT
    } else {
        0.0
    };
    let contested_shift = if contested { CONTESTED_BOOST } else { 0.0 };
    (DYNAMIC_START + confidence_shift + contested_shift).clamp(DYNAMIC_MIN, DYNAMIC_MAX)
}

/// Picks the blend for one entrant.
///
/// Without before-info data the policy is [`IntegrationMode::BaselineOnly`]
/// whatever the flags say.
#[must_use]
pub fn select_mode(
    flags: &FeatureFlags,
    has_before_info: bool,
    before_info_confidence: f64,
    contested: bool,
) -> IntegrationMode {
    if !has_before_info {
        return IntegrationMode::BaselineOnly;
    }
    if flags.get(Flag::DynamicIntegration) {
        let before_info_weight = dynamic_before_info_weight(before_info_confidence, contested);
        IntegrationMode::Dynamic {
            baseline_weight: 1.0 - before_info_weight,
            before_info_weight,
            contested,
            before_info_confidence,
        }
    } else {
        IntegrationMode::Legacy {
            baseline_weight: LEGACY_BASELINE_WEIGHT,
            before_info_weight: LEGACY_BEFORE_INFO_WEIGHT,
        }
    }
}

#[must_use]
pub fn integrate(mode: &IntegrationMode, baseline_total: f64, before_info_total: f64) -> f64 {
    let (baseline_weight, before_info_weight) = mode.weights();
    baseline_weight * baseline_total + before_info_weight * before_info_total
}
