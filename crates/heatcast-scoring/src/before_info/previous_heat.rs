use heatcast_domain::{Channel, PreviousHeat};

use super::{BeforeInfoStage, StageInput, StageOutcome};

const SLOW_START: f64 = 0.20;

#[must_use]
pub fn previous_heat_points(previous: &PreviousHeat) -> f64 {
    let finish = match previous.rank {
        Some(1) => 8.0,
        Some(2) => 5.0,
        Some(3) => 2.0,
        _ => 0.0,
    };
    let start = match previous.timing.filter(|timing| timing.is_finite()) {
        Some(timing) if timing < 0.0 => -5.0,
        Some(timing) if timing > SLOW_START => -3.0,
        _ => 0.0,
    };
    finish + start
}

/// Form carried over from the entrant's earlier heat the same day.
pub struct PreviousHeatStage;

impl BeforeInfoStage for PreviousHeatStage {
    fn channel(&self) -> Channel {
        Channel::PreviousHeat
    }

    fn evaluate(&self, input: &StageInput<'_>) -> StageOutcome {
        match input
            .entry
            .and_then(|entry| entry.previous_heat.as_ref())
            .filter(|previous| previous.rank.is_some() || previous.timing.is_some())
        {
            Some(previous) => StageOutcome::scored(previous_heat_points(previous)),
            None => StageOutcome::unavailable(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heat(rank: Option<u8>, timing: Option<f64>) -> PreviousHeat {
        PreviousHeat {
            lane: Some(1),
            timing,
            rank,
        }
    }

    #[test]
    fn podium_finishes_score() {
        assert_eq!(previous_heat_points(&heat(Some(1), Some(0.12))), 8.0);
        assert_eq!(previous_heat_points(&heat(Some(3), None)), 2.0);
        assert_eq!(previous_heat_points(&heat(Some(5), None)), 0.0);
    }

    #[test]
    fn start_faults_and_slow_starts_subtract() {
        assert_eq!(previous_heat_points(&heat(None, Some(-0.02))), -5.0);
        assert_eq!(previous_heat_points(&heat(Some(2), Some(0.24))), 2.0);
    }
}
