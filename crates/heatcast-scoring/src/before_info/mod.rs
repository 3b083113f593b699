//! Before-race information scoring.
//!
//! Each channel is an independent [`BeforeInfoStage`]. The scorer runs every
//! stage so that completeness reflects the data actually published, then
//! keeps only the scores whose flag is enabled. A stage that lacks its input
//! reports itself unavailable and contributes zero.

use std::collections::BTreeMap;

use heatcast_domain::{
    BeforeInfoScores, BeforeInfoSnapshot, Channel, Entrant, EntrantBeforeInfo, FeatureFlags,
    Weather, MAX_LANE, MIN_LANE,
};
use heatcast_tables::TableProvider;

use crate::{clamp_channel, clamp_into, sigmoid};

mod equipment_form;
mod lane_affinity;
mod lane_change;
mod parts_weight;
mod previous_heat;
mod reaction;
mod tilt_wind;
mod trial_time;
mod weather;

pub use equipment_form::EquipmentFormStage;
pub use lane_affinity::LaneAffinityStage;
pub use lane_change::LaneChangeStage;
pub use parts_weight::PartsWeightStage;
pub use previous_heat::PreviousHeatStage;
pub use reaction::{ReactionBand, ReactionTimingStage};
pub use tilt_wind::TiltWindStage;
pub use trial_time::TrialTimeStage;
pub use weather::WeatherStage;

/// Composite bounds: the sum of every channel's interval.
pub const BEFORE_INFO_MIN: f64 = -57.0;
pub const BEFORE_INFO_MAX: f64 = 77.0;

const CONFIDENCE_CENTER: f64 = 20.0;
const CONFIDENCE_SCALE: f64 = 10.0;

/// Heat-wide facts shared by every entrant's stages.
#[derive(Debug, Clone)]
pub struct HeatContext<'a> {
    pub venue: u8,
    pub snapshot: &'a BeforeInfoSnapshot,
    trial_ranks: BTreeMap<u8, u8>,
    fastest_trial: Option<f64>,
}

impl<'a> HeatContext<'a> {
    #[must_use]
    pub fn new(venue: u8, snapshot: &'a BeforeInfoSnapshot) -> Self {
        let mut timed: Vec<(u8, f64)> = snapshot
            .entries
            .iter()
            .filter_map(|entry| {
                entry
                    .trial_time
                    .filter(|time| time.is_finite() && *time > 0.0)
                    .map(|time| (entry.lane, time))
            })
            .collect();
        timed.sort_by(|lhs, rhs| lhs.1.total_cmp(&rhs.1).then(lhs.0.cmp(&rhs.0)));

        let mut trial_ranks = BTreeMap::new();
        let mut previous: Option<(f64, u8)> = None;
        for (position, (lane, time)) in timed.iter().enumerate() {
            let position_rank = u8::try_from(position + 1).unwrap_or(u8::MAX);
            let rank = match previous {
                Some((previous_time, previous_rank)) if previous_time.total_cmp(time).is_eq() => {
                    previous_rank
                }
                _ => position_rank,
            };
            trial_ranks.insert(*lane, rank);
            previous = Some((*time, rank));
        }

        Self {
            venue,
            snapshot,
            trial_ranks,
            fastest_trial: timed.first().map(|(_, time)| *time),
        }
    }

    /// 1 = fastest; tied times share the better rank.
    #[must_use]
    pub fn trial_rank(&self, lane: u8) -> Option<u8> {
        self.trial_ranks.get(&lane).copied()
    }

    /// Seconds behind the fastest trial time in the heat.
    #[must_use]
    pub fn trial_gap(&self, lane: u8) -> Option<f64> {
        let fastest = self.fastest_trial?;
        let own = self.entry(lane)?.trial_time?;
        if self.trial_ranks.contains_key(&lane) {
            Some((own - fastest).max(0.0))
        } else {
            None
        }
    }

    #[must_use]
    pub fn entry(&self, lane: u8) -> Option<&'a EntrantBeforeInfo> {
        self.snapshot.entry_for(lane)
    }

    #[must_use]
    pub fn weather(&self) -> Option<&'a Weather> {
        self.snapshot.weather.as_ref()
    }
}

/// Everything a stage may read for one entrant.
pub struct StageInput<'a> {
    pub entrant: &'a Entrant,
    pub entry: Option<&'a EntrantBeforeInfo>,
    pub heat: &'a HeatContext<'a>,
    pub tables: &'a dyn TableProvider,
}

impl StageInput<'_> {
    /// Lane actually taken at the start, falling back to the assigned lane.
    #[must_use]
    pub fn course(&self) -> u8 {
        self.entry
            .and_then(|entry| entry.actual_lane)
            .filter(|lane| (MIN_LANE..=MAX_LANE).contains(lane))
            .unwrap_or(self.entrant.lane)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageOutcome {
    pub score: f64,
    pub available: bool,
}

impl StageOutcome {
    #[must_use]
    pub fn scored(score: f64) -> Self {
        Self {
            score,
            available: true,
        }
    }

    #[must_use]
    pub fn unavailable() -> Self {
        Self {
            score: 0.0,
            available: false,
        }
    }
}

pub trait BeforeInfoStage: Send + Sync {
    fn channel(&self) -> Channel;

    fn evaluate(&self, input: &StageInput<'_>) -> StageOutcome;
}

/// The nine channel stages in pipeline order.
#[must_use]
pub fn default_stages() -> Vec<Box<dyn BeforeInfoStage>> {
    vec![
        Box::new(TrialTimeStage),
        Box::new(ReactionTimingStage),
        Box::new(LaneChangeStage),
        Box::new(PreviousHeatStage),
        Box::new(TiltWindStage),
        Box::new(PartsWeightStage),
        Box::new(WeatherStage),
        Box::new(EquipmentFormStage),
        Box::new(LaneAffinityStage),
    ]
}

pub struct BeforeInfoScorer {
    stages: Vec<Box<dyn BeforeInfoStage>>,
}

impl Default for BeforeInfoScorer {
    fn default() -> Self {
        Self::new(default_stages())
    }
}

impl BeforeInfoScorer {
    #[must_use]
    pub fn new(stages: Vec<Box<dyn BeforeInfoStage>>) -> Self {
        Self { stages }
    }

    #[must_use]
    pub fn channels(&self) -> Vec<Channel> {
        self.stages.iter().map(|stage| stage.channel()).collect()
    }

    /// Scores one entrant. `heat` is `None` when the race has no snapshot,
    /// which yields an all-unset breakdown with zero completeness.
    #[must_use]
    pub fn score(
        &self,
        entrant: &Entrant,
        heat: Option<&HeatContext<'_>>,
        flags: &FeatureFlags,
        tables: &dyn TableProvider,
    ) -> BeforeInfoScores {
        let Some(heat) = heat else {
            return BeforeInfoScores::default();
        };

        let input = StageInput {
            entrant,
            entry: heat.entry(entrant.lane),
            heat,
            tables,
        };

        let mut scores = BeforeInfoScores::default();
        let mut total = 0.0;
        let mut available = 0_u32;
        for stage in &self.stages {
            let channel = stage.channel();
            let outcome = stage.evaluate(&input);
            if outcome.available {
                available += 1;
            }
            if !flags.get(channel.flag()) {
                continue;
            }
            let value = if outcome.available {
                clamp_channel(channel, outcome.score)
            } else {
                0.0
            };
            scores = scores.with_channel(channel, Some(value));
            total += value;
        }

        let channel_count = u32::try_from(Channel::ALL.len()).unwrap_or(u32::MAX);
        let completeness = f64::from(available.min(channel_count)) / f64::from(channel_count);
        let total = clamp_into(total, BEFORE_INFO_MIN, BEFORE_INFO_MAX);

        BeforeInfoScores {
            total,
            completeness,
            confidence: before_info_confidence(total, completeness),
            ..scores
        }
    }
}

/// `sigmoid((total - 20) / 10) * completeness`.
#[must_use]
pub fn before_info_confidence(total: f64, completeness: f64) -> f64 {
    sigmoid((total - CONFIDENCE_CENTER) / CONFIDENCE_SCALE) * completeness.clamp(0.0, 1.0)
}
