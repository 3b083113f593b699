use heatcast_domain::Channel;

use super::{BeforeInfoStage, StageInput, StageOutcome};

/// Start-reaction multiplier by course; outer courses depend more on the start.
pub const COURSE_MULTIPLIER: [f64; 6] = [0.80, 0.90, 1.00, 1.10, 1.20, 1.25];

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ReactionBand {
    Fault,
    Sharp,
    Good,
    Average,
    Slow,
    Late,
}

impl ReactionBand {
    #[must_use]
    pub fn from_timing(timing: f64) -> Self {
        if timing < 0.0 {
            Self::Fault
        } else if timing <= 0.10 {
            Self::Sharp
        } else if timing <= 0.15 {
            Self::Good
        } else if timing <= 0.20 {
            Self::Average
        } else if timing <= 0.25 {
            Self::Slow
        } else {
            Self::Late
        }
    }

    #[must_use]
    pub fn points(self) -> f64 {
        match self {
            Self::Fault => -12.0,
            Self::Sharp => 12.0,
            Self::Good => 8.0,
            Self::Average => 4.0,
            Self::Slow => 0.0,
            Self::Late => -4.0,
        }
    }
}

#[must_use]
pub fn course_multiplier(course: u8) -> f64 {
    usize::from(course)
        .checked_sub(1)
        .and_then(|index| COURSE_MULTIPLIER.get(index))
        .copied()
        .unwrap_or(1.0)
}

/// Start timing shown in the exhibition start, weighted by course.
pub struct ReactionTimingStage;

impl BeforeInfoStage for ReactionTimingStage {
    fn channel(&self) -> Channel {
        Channel::ReactionTiming
    }

    fn evaluate(&self, input: &StageInput<'_>) -> StageOutcome {
        let Some(timing) = input
            .entry
            .and_then(|entry| entry.reaction_timing)
            .filter(|timing| timing.is_finite())
        else {
            return StageOutcome::unavailable();
        };
        let band = ReactionBand::from_timing(timing);
        StageOutcome::scored(band.points() * course_multiplier(input.course()))
    }
}
