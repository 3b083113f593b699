use heatcast_domain::Channel;

use super::{BeforeInfoStage, StageInput, StageOutcome};

/// Points by trial-run rank, fastest first.
pub const TRIAL_RANK_LADDER: [f64; 6] = [25.0, 18.0, 12.0, 7.0, 3.0, 0.0];

#[must_use]
pub fn trial_rank_points(rank: u8) -> f64 {
    usize::from(rank)
        .checked_sub(1)
        .and_then(|index| TRIAL_RANK_LADDER.get(index))
        .copied()
        .unwrap_or(0.0)
}

/// Rewards a fast exhibition lap relative to the rest of the heat.
pub struct TrialTimeStage;

impl BeforeInfoStage for TrialTimeStage {
    fn channel(&self) -> Channel {
        Channel::TrialTime
    }

    fn evaluate(&self, input: &StageInput<'_>) -> StageOutcome {
        match input.heat.trial_rank(input.entrant.lane) {
            Some(rank) => StageOutcome::scored(trial_rank_points(rank)),
            None => StageOutcome::unavailable(),
        }
    }
}
