use heatcast_domain::Channel;

use super::{BeforeInfoStage, StageInput, StageOutcome};

/// Bucketed points for a lane win-rate deviation in percentage points.
#[must_use]
pub fn affinity_points(deviation: f64) -> f64 {
    if deviation >= 15.0 {
        4.0
    } else if deviation >= 8.0 {
        2.5
    } else if deviation >= 3.0 {
        1.0
    } else if deviation > -3.0 {
        0.0
    } else if deviation > -8.0 {
        -1.0
    } else if deviation > -15.0 {
        -2.5
    } else {
        -4.0
    }
}

/// How this competitor historically fares from this course.
pub struct LaneAffinityStage;

impl BeforeInfoStage for LaneAffinityStage {
    fn channel(&self) -> Channel {
        Channel::LaneAffinity
    }

    fn evaluate(&self, input: &StageInput<'_>) -> StageOutcome {
        input
            .tables
            .lane_affinity(input.entrant.competitor_id, input.course())
            .filter(|row| row.deviation.is_finite())
            .map_or_else(StageOutcome::unavailable, |row| {
                StageOutcome::scored(affinity_points(row.deviation))
            })
    }
}
