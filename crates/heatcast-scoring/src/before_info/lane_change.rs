use heatcast_domain::{Channel, MAX_LANE, MIN_LANE};

use super::{BeforeInfoStage, StageInput, StageOutcome};

const TAKE_INSIDE: f64 = 10.0;
const PER_LANE: f64 = 3.0;
const MOVE_CAP: f64 = 8.0;
const PUSHED_FROM_INSIDE: f64 = -10.0;

/// Score for starting from `actual` when `assigned` was drawn.
#[must_use]
pub fn lane_change_points(assigned: u8, actual: u8) -> f64 {
    if actual == assigned {
        return 0.0;
    }
    if actual == 1 {
        return TAKE_INSIDE;
    }
    let moved = f64::from(assigned.abs_diff(actual));
    if actual < assigned {
        (PER_LANE * moved).min(MOVE_CAP)
    } else if assigned <= 2 {
        PUSHED_FROM_INSIDE
    } else {
        (-PER_LANE * moved).max(-MOVE_CAP)
    }
}

/// Course taken at the start versus the drawn lane.
pub struct LaneChangeStage;

impl BeforeInfoStage for LaneChangeStage {
    fn channel(&self) -> Channel {
        Channel::LaneChange
    }

    fn evaluate(&self, input: &StageInput<'_>) -> StageOutcome {
        match input
            .entry
            .and_then(|entry| entry.actual_lane)
            .filter(|lane| (MIN_LANE..=MAX_LANE).contains(lane))
        {
            Some(actual) => StageOutcome::scored(lane_change_points(input.entrant.lane, actual)),
            None => StageOutcome::unavailable(),
        }
    }
}
