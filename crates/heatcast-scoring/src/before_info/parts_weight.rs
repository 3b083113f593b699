use heatcast_domain::{Channel, PartReplacement};

use super::{BeforeInfoStage, StageInput, StageOutcome};

const BALLAST_PER_KG: f64 = -0.5;
const BALLAST_FLOOR: f64 = -3.0;

#[must_use]
pub fn part_penalty(part: PartReplacement) -> f64 {
    match part {
        PartReplacement::Piston | PartReplacement::Cylinder | PartReplacement::Crankshaft => -3.0,
        PartReplacement::PistonRing | PartReplacement::Carburetor => -2.0,
        PartReplacement::GearCase | PartReplacement::Other => -1.0,
    }
}

#[must_use]
pub fn ballast_penalty(added_kg: f64) -> f64 {
    if !added_kg.is_finite() || added_kg <= 0.0 {
        return 0.0;
    }
    (BALLAST_PER_KG * added_kg).max(BALLAST_FLOOR)
}

/// Inner courses feel a weakened motor the most.
#[must_use]
pub fn course_factor(course: u8) -> f64 {
    match course {
        1 | 2 => 1.0,
        3 | 4 => 0.9,
        _ => 0.8,
    }
}

/// Penalty for last-minute part swaps and added ballast.
pub struct PartsWeightStage;

impl BeforeInfoStage for PartsWeightStage {
    fn channel(&self) -> Channel {
        Channel::PartsWeight
    }

    fn evaluate(&self, input: &StageInput<'_>) -> StageOutcome {
        let Some(entry) = input.entry else {
            return StageOutcome::unavailable();
        };
        if entry.parts_replaced.is_none() && entry.added_weight.is_none() {
            return StageOutcome::unavailable();
        }
        let parts: f64 = entry
            .parts_replaced
            .iter()
            .flatten()
            .copied()
            .map(part_penalty)
            .sum();
        let ballast = entry.added_weight.map_or(0.0, ballast_penalty);
        StageOutcome::scored((parts + ballast) * course_factor(input.course()))
    }
}
