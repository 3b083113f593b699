#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{Date, OffsetDateTime, UtcOffset};
use ulid::Ulid;

mod flags;

pub use flags::{
    parse_flag_override, FeatureFlags, FeatureFlagsBuilder, Flag, FlagRiskProfile, RiskLevel,
};

pub const FIELD_SIZE: usize = 6;
pub const MIN_LANE: u8 = 1;
pub const MAX_LANE: u8 = 6;
pub const PREDICTION_CONTRACT_VERSION: &str = "prediction.v1";

const DATE_FORMAT: &[time::format_description::FormatItem<'static>] =
    time::macros::format_description!("[year]-[month]-[day]");

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DomainError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RaceId(pub String);

impl RaceId {
    /// Builds the canonical `YYYYMMDD-VV-HH` identity for a heat.
    #[must_use]
    pub fn compose(race_date: Date, venue: u8, heat_number: u8) -> Self {
        Self(format!(
            "{:04}{:02}{:02}-{venue:02}-{heat_number:02}",
            race_date.year(),
            u8::from(race_date.month()),
            race_date.day()
        ))
    }

    /// Parses a race identity supplied by a caller.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] for empty or whitespace-bearing ids.
    pub fn parse(raw: &str) -> Result<Self, DomainError> {
        if raw.trim().is_empty() {
            return Err(DomainError::Validation(
                "race_id MUST be provided".to_string(),
            ));
        }
        if raw.chars().any(char::is_whitespace) {
            return Err(DomainError::Validation(format!(
                "race_id MUST NOT contain whitespace: {raw:?}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RaceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BatchRunId(pub Ulid);

impl BatchRunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for BatchRunId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for BatchRunId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Race {
    pub race_id: RaceId,
    pub venue: u8,
    #[serde(with = "date_format")]
    pub race_date: Date,
    pub heat_number: u8,
}

impl Race {
    /// # Errors
    /// Returns [`DomainError::Validation`] when venue or heat number are out of range.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.venue == 0 {
            return Err(DomainError::Validation("venue MUST be >= 1".to_string()));
        }
        if !(1..=12).contains(&self.heat_number) {
            return Err(DomainError::Validation(
                "heat_number MUST be in [1, 12]".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ClassRank {
    #[serde(rename = "A1")]
    Top,
    #[serde(rename = "A2")]
    UpperMid,
    #[serde(rename = "B1")]
    LowerMid,
    #[serde(rename = "B2")]
    Bottom,
}

impl ClassRank {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Top => "A1",
            Self::UpperMid => "A2",
            Self::LowerMid => "B1",
            Self::Bottom => "B2",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "A1" | "top" => Some(Self::Top),
            "A2" | "upper_mid" => Some(Self::UpperMid),
            "B1" | "lower_mid" => Some(Self::LowerMid),
            "B2" | "bottom" => Some(Self::Bottom),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Entrant {
    pub race_id: RaceId,
    pub lane: u8,
    pub competitor_id: u32,
    pub class_rank: Option<ClassRank>,
    /// Global win rate on the 0-10 points scale.
    pub win_rate: Option<f64>,
    pub local_win_rate: Option<f64>,
    /// Global second-place rate, percent.
    pub place_rate: Option<f64>,
    pub equipment_id: Option<u32>,
    /// Equipment (motor) second-place rate, percent.
    pub equipment_second_rate: Option<f64>,
    pub average_reaction_time: Option<f64>,
    #[serde(default)]
    pub flying_count: u32,
    #[serde(default)]
    pub late_count: u32,
}

impl Entrant {
    /// # Errors
    /// Returns [`DomainError::Validation`] for out-of-range lanes or rates.
    pub fn validate(&self) -> Result<(), DomainError> {
        if !(MIN_LANE..=MAX_LANE).contains(&self.lane) {
            return Err(DomainError::Validation(format!(
                "lane MUST be in [{MIN_LANE}, {MAX_LANE}], got {}",
                self.lane
            )));
        }

        for (name, value, max) in [
            ("win_rate", self.win_rate, 10.0),
            ("local_win_rate", self.local_win_rate, 10.0),
            ("place_rate", self.place_rate, 100.0),
            ("equipment_second_rate", self.equipment_second_rate, 100.0),
        ] {
            if let Some(value) = value {
                if !value.is_finite() || !(0.0..=max).contains(&value) {
                    return Err(DomainError::Validation(format!(
                        "{name} MUST be in [0, {max}]"
                    )));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PartReplacement {
    Piston,
    PistonRing,
    Cylinder,
    Crankshaft,
    Carburetor,
    GearCase,
    Other,
}

impl PartReplacement {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Piston => "piston",
            Self::PistonRing => "piston_ring",
            Self::Cylinder => "cylinder",
            Self::Crankshaft => "crankshaft",
            Self::Carburetor => "carburetor",
            Self::GearCase => "gear_case",
            Self::Other => "other",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "piston" => Some(Self::Piston),
            "piston_ring" => Some(Self::PistonRing),
            "cylinder" => Some(Self::Cylinder),
            "crankshaft" => Some(Self::Crankshaft),
            "carburetor" => Some(Self::Carburetor),
            "gear_case" => Some(Self::GearCase),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

/// Wind direction relative to the course heading.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WindDirection {
    Calm,
    Headwind,
    Tailwind,
    Crosswind,
}

impl WindDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Calm => "calm",
            Self::Headwind => "headwind",
            Self::Tailwind => "tailwind",
            Self::Crosswind => "crosswind",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "calm" => Some(Self::Calm),
            "headwind" => Some(Self::Headwind),
            "tailwind" => Some(Self::Tailwind),
            "crosswind" => Some(Self::Crosswind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WeatherCondition {
    Clear,
    Cloudy,
    Rain,
    Snow,
    Fog,
}

impl WeatherCondition {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clear => "clear",
            Self::Cloudy => "cloudy",
            Self::Rain => "rain",
            Self::Snow => "snow",
            Self::Fog => "fog",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "clear" => Some(Self::Clear),
            "cloudy" => Some(Self::Cloudy),
            "rain" => Some(Self::Rain),
            "snow" => Some(Self::Snow),
            "fog" => Some(Self::Fog),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PreviousHeat {
    pub lane: Option<u8>,
    pub timing: Option<f64>,
    pub rank: Option<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EntrantBeforeInfo {
    pub lane: u8,
    pub trial_time: Option<f64>,
    pub reaction_timing: Option<f64>,
    pub actual_lane: Option<u8>,
    pub tilt_angle: Option<f64>,
    /// `None` means the parts report was not published; an empty list means nothing was replaced.
    pub parts_replaced: Option<Vec<PartReplacement>>,
    pub added_weight: Option<f64>,
    pub previous_heat: Option<PreviousHeat>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Weather {
    pub temperature: Option<f64>,
    pub water_temperature: Option<f64>,
    /// Metres per second.
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<WindDirection>,
    /// Centimetres.
    pub wave_height: Option<f64>,
    pub condition: Option<WeatherCondition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BeforeInfoSnapshot {
    pub weather: Option<Weather>,
    #[serde(default)]
    pub entries: Vec<EntrantBeforeInfo>,
}

impl BeforeInfoSnapshot {
    #[must_use]
    pub fn entry_for(&self, lane: u8) -> Option<&EntrantBeforeInfo> {
        self.entries.iter().find(|entry| entry.lane == lane)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.weather.is_none() && self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RaceResult {
    pub lane: u8,
    pub finish_rank: Option<u8>,
}

/// Everything the engine needs for one heat, loaded up front.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RaceBundle {
    pub race: Race,
    pub entrants: Vec<Entrant>,
    #[serde(default)]
    pub before_info: Option<BeforeInfoSnapshot>,
    #[serde(default)]
    pub results: Vec<RaceResult>,
}

fn ensure_unique_lanes(kind: &str, lanes: impl Iterator<Item = u8>) -> Result<(), DomainError> {
    let mut seen = BTreeSet::new();
    for lane in lanes {
        if !seen.insert(lane) {
            return Err(DomainError::Validation(format!(
                "duplicate {kind} lane {lane} in race bundle"
            )));
        }
    }
    Ok(())
}

impl RaceBundle {
    /// Validates record shapes for import. Entrant count is not checked here;
    /// short fields are a prediction outcome, not an import error.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] when a record is malformed or
    /// belongs to another race.
    pub fn validate(&self) -> Result<(), DomainError> {
        self.race.validate()?;
        for entrant in &self.entrants {
            if entrant.race_id != self.race.race_id {
                return Err(DomainError::Validation(format!(
                    "entrant lane {} belongs to {} not {}",
                    entrant.lane, entrant.race_id, self.race.race_id
                )));
            }
            entrant.validate()?;
        }
        ensure_unique_lanes("entrant", self.entrants.iter().map(|entrant| entrant.lane))?;
        if let Some(snapshot) = &self.before_info {
            for entry in &snapshot.entries {
                if !(MIN_LANE..=MAX_LANE).contains(&entry.lane) {
                    return Err(DomainError::Validation(format!(
                        "before-info lane MUST be in [{MIN_LANE}, {MAX_LANE}], got {}",
                        entry.lane
                    )));
                }
            }
            ensure_unique_lanes("before-info", snapshot.entries.iter().map(|entry| entry.lane))?;
        }
        ensure_unique_lanes("result", self.results.iter().map(|result| result.lane))?;
        Ok(())
    }

    /// Decodes and validates a bundle from JSON.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] when decoding or validation fails.
    pub fn from_json(value: &Value) -> Result<Self, DomainError> {
        let bundle: Self = serde_json::from_value(value.clone())
            .map_err(|err| DomainError::Validation(format!("invalid race bundle JSON: {err}")))?;
        bundle.validate()?;
        Ok(bundle)
    }
}

/// Ordinal confidence label, `A` best.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum ConfidenceTier {
    A,
    B,
    C,
    D,
    E,
}

impl ConfidenceTier {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
            Self::C => "C",
            Self::D => "D",
            Self::E => "E",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            "C" => Some(Self::C),
            "D" => Some(Self::D),
            "E" => Some(Self::E),
            _ => None,
        }
    }

    /// Higher is more confident: `A` = 5 down to `E` = 1.
    #[must_use]
    pub fn strength(self) -> u8 {
        match self {
            Self::A => 5,
            Self::B => 4,
            Self::C => 3,
            Self::D => 2,
            Self::E => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IntegrationMode {
    Legacy {
        baseline_weight: f64,
        before_info_weight: f64,
    },
    Dynamic {
        baseline_weight: f64,
        before_info_weight: f64,
        contested: bool,
        before_info_confidence: f64,
    },
    BaselineOnly,
}

impl IntegrationMode {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy { .. } => "legacy",
            Self::Dynamic { .. } => "dynamic",
            Self::BaselineOnly => "baseline_only",
        }
    }

    /// Returns `(baseline_weight, before_info_weight)`.
    #[must_use]
    pub fn weights(&self) -> (f64, f64) {
        match *self {
            Self::Legacy {
                baseline_weight,
                before_info_weight,
            }
            | Self::Dynamic {
                baseline_weight,
                before_info_weight,
                ..
            } => (baseline_weight, before_info_weight),
            Self::BaselineOnly => (1.0, 0.0),
        }
    }
}

/// The nine before-race information channels, in pipeline order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    TrialTime,
    ReactionTiming,
    LaneChange,
    PreviousHeat,
    TiltWind,
    PartsWeight,
    Weather,
    EquipmentForm,
    LaneAffinity,
}

impl Channel {
    pub const ALL: [Channel; 9] = [
        Channel::TrialTime,
        Channel::ReactionTiming,
        Channel::LaneChange,
        Channel::PreviousHeat,
        Channel::TiltWind,
        Channel::PartsWeight,
        Channel::Weather,
        Channel::EquipmentForm,
        Channel::LaneAffinity,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TrialTime => "trial_time",
            Self::ReactionTiming => "reaction_timing",
            Self::LaneChange => "lane_change",
            Self::PreviousHeat => "previous_heat",
            Self::TiltWind => "tilt_wind",
            Self::PartsWeight => "parts_weight",
            Self::Weather => "weather",
            Self::EquipmentForm => "equipment_form",
            Self::LaneAffinity => "lane_affinity",
        }
    }

    /// Closed interval every score on this channel must fall in.
    #[must_use]
    pub fn bounds(self) -> (f64, f64) {
        match self {
            Self::TrialTime => (0.0, 25.0),
            Self::ReactionTiming => (-15.0, 15.0),
            Self::LaneChange => (-10.0, 10.0),
            Self::PreviousHeat => (-5.0, 8.0),
            Self::TiltWind => (-5.0, 5.0),
            Self::PartsWeight => (-8.0, 0.0),
            Self::Weather => (-6.0, 6.0),
            Self::EquipmentForm | Self::LaneAffinity => (-4.0, 4.0),
        }
    }

    /// Flag that gates this channel's stage.
    #[must_use]
    pub fn flag(self) -> Flag {
        match self {
            Self::TrialTime => Flag::TrialTime,
            Self::ReactionTiming => Flag::ReactionTiming,
            Self::LaneChange => Flag::LaneChange,
            Self::PreviousHeat => Flag::PreviousHeat,
            Self::TiltWind => Flag::TiltWind,
            Self::PartsWeight => Flag::PartsWeight,
            Self::Weather => Flag::Weather,
            Self::EquipmentForm => Flag::EquipmentForm,
            Self::LaneAffinity => Flag::LaneAffinity,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BaselineScores {
    pub lane: f64,
    pub competitor: f64,
    pub equipment: f64,
    pub class: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct BeforeInfoScores {
    pub trial_time: Option<f64>,
    pub reaction_timing: Option<f64>,
    pub lane_change: Option<f64>,
    pub previous_heat: Option<f64>,
    pub tilt_wind: Option<f64>,
    pub parts_weight: Option<f64>,
    pub weather: Option<f64>,
    pub equipment_form: Option<f64>,
    pub lane_affinity: Option<f64>,
    pub total: f64,
    pub completeness: f64,
    pub confidence: f64,
}

impl BeforeInfoScores {
    #[must_use]
    pub fn get(&self, channel: Channel) -> Option<f64> {
        match channel {
            Channel::TrialTime => self.trial_time,
            Channel::ReactionTiming => self.reaction_timing,
            Channel::LaneChange => self.lane_change,
            Channel::PreviousHeat => self.previous_heat,
            Channel::TiltWind => self.tilt_wind,
            Channel::PartsWeight => self.parts_weight,
            Channel::Weather => self.weather,
            Channel::EquipmentForm => self.equipment_form,
            Channel::LaneAffinity => self.lane_affinity,
        }
    }

    /// Returns a copy with one channel replaced; the total is left to the caller.
    #[must_use]
    pub fn with_channel(mut self, channel: Channel, value: Option<f64>) -> Self {
        let slot = match channel {
            Channel::TrialTime => &mut self.trial_time,
            Channel::ReactionTiming => &mut self.reaction_timing,
            Channel::LaneChange => &mut self.lane_change,
            Channel::PreviousHeat => &mut self.previous_heat,
            Channel::TiltWind => &mut self.tilt_wind,
            Channel::PartsWeight => &mut self.parts_weight,
            Channel::Weather => &mut self.weather,
            Channel::EquipmentForm => &mut self.equipment_form,
            Channel::LaneAffinity => &mut self.lane_affinity,
        };
        *slot = value;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreBreakdown {
    pub baseline: BaselineScores,
    pub before_info: BeforeInfoScores,
    pub integration_mode: IntegrationMode,
    pub integrated_total: f64,
    pub confidence_tier: ConfidenceTier,
    pub completeness: f64,
    pub pattern_multiplier: f64,
    #[serde(default)]
    pub matched_patterns: Vec<String>,
    pub final_score: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TrialGapBand {
    Leader,
    Close,
    Mid,
    Far,
    Unknown,
}

impl TrialGapBand {
    /// Buckets the gap (seconds) behind the fastest trial time.
    #[must_use]
    pub fn from_gap(gap: Option<f64>) -> Self {
        match gap {
            None => Self::Unknown,
            Some(value) if !value.is_finite() || value < 0.0 => Self::Unknown,
            Some(value) if value <= f64::EPSILON => Self::Leader,
            Some(value) if value < 0.05 => Self::Close,
            Some(value) if value < 0.10 => Self::Mid,
            Some(_) => Self::Far,
        }
    }
}

/// Wildcard-capable key; `None` matches any value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PatternKey {
    #[serde(default)]
    pub baseline_rank: Option<u8>,
    #[serde(default)]
    pub before_info_rank: Option<u8>,
    #[serde(default)]
    pub class: Option<ClassRank>,
    #[serde(default)]
    pub trial_gap: Option<TrialGapBand>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pattern {
    pub pattern_id: String,
    #[serde(default)]
    pub description: String,
    pub key: PatternKey,
    pub multiplier: f64,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub venue: Option<u8>,
}

impl Pattern {
    #[must_use]
    pub fn is_penalty(&self) -> bool {
        self.multiplier < 1.0
    }

    /// # Errors
    /// Returns [`DomainError::Configuration`] for empty ids or implausible multipliers.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.pattern_id.trim().is_empty() {
            return Err(DomainError::Configuration(
                "pattern_id MUST be provided".to_string(),
            ));
        }
        if !self.multiplier.is_finite() || !(0.5..=1.5).contains(&self.multiplier) {
            return Err(DomainError::Configuration(format!(
                "pattern {} multiplier MUST be in [0.5, 1.5]",
                self.pattern_id
            )));
        }
        for (name, rank) in [
            ("baseline_rank", self.key.baseline_rank),
            ("before_info_rank", self.key.before_info_rank),
        ] {
            if let Some(rank) = rank {
                if !(1..=6).contains(&rank) {
                    return Err(DomainError::Configuration(format!(
                        "pattern {} {name} MUST be in [1, 6]",
                        self.pattern_id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PredictionStatus {
    Ranked,
    InsufficientEntrants { found: usize },
    InvalidEntrants { reason: String },
}

impl PredictionStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ranked => "ranked",
            Self::InsufficientEntrants { .. } => "insufficient_entrants",
            Self::InvalidEntrants { .. } => "invalid_entrants",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredictionRecord {
    pub race_id: RaceId,
    pub lane: u8,
    pub competitor_id: u32,
    pub predicted_rank: u8,
    pub final_score: f64,
    pub confidence_tier: ConfidenceTier,
    pub integration_mode: IntegrationMode,
    pub breakdown: ScoreBreakdown,
    pub generated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RacePrediction {
    pub contract_version: String,
    pub race_id: RaceId,
    #[serde(flatten)]
    pub status: PredictionStatus,
    pub tables_version: String,
    pub flags_digest: String,
    pub generated_at: String,
    pub records: Vec<PredictionRecord>,
}

impl RacePrediction {
    #[must_use]
    pub fn is_ranked(&self) -> bool {
        matches!(self.status, PredictionStatus::Ranked)
    }
}

/// Read access to stored heats.
pub trait RaceRepository {
    #[allow(clippy::missing_errors_doc)]
    fn load_race_bundle(&self, race_id: &RaceId) -> anyhow::Result<Option<RaceBundle>>;

    #[allow(clippy::missing_errors_doc)]
    fn list_race_ids(&self, race_date: Option<Date>) -> anyhow::Result<Vec<RaceId>>;
}

/// Write side for finished predictions.
pub trait PredictionSink {
    #[allow(clippy::missing_errors_doc)]
    fn write_prediction(&mut self, prediction: &RacePrediction) -> anyhow::Result<()>;
}

/// Parses a `YYYY-MM-DD` calendar date.
///
/// # Errors
/// Returns [`DomainError::Validation`] when the value is not a valid date.
pub fn parse_date(value: &str) -> Result<Date, DomainError> {
    Date::parse(value, DATE_FORMAT)
        .map_err(|err| DomainError::Validation(format!("invalid date {value:?}: {err}")))
}

/// # Errors
/// Returns [`DomainError::Validation`] when formatting fails.
pub fn format_date(value: Date) -> Result<String, DomainError> {
    value
        .format(DATE_FORMAT)
        .map_err(|err| DomainError::Validation(format!("failed to format date: {err}")))
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`DomainError::Validation`] when parsing fails or an input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, DomainError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| DomainError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(DomainError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`DomainError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, DomainError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| DomainError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

mod date_format {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    pub fn serialize<S: Serializer>(value: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        let formatted = super::format_date(*value).map_err(serde::ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_date(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_race() -> Race {
        let race_date = must_ok(parse_date("2026-02-07"));
        Race {
            race_id: RaceId::compose(race_date, 24, 12),
            venue: 24,
            race_date,
            heat_number: 12,
        }
    }

    fn fixture_entrant(race_id: &RaceId, lane: u8) -> Entrant {
        Entrant {
            race_id: race_id.clone(),
            lane,
            competitor_id: 4000 + u32::from(lane),
            class_rank: Some(ClassRank::UpperMid),
            win_rate: Some(6.2),
            local_win_rate: Some(5.8),
            place_rate: Some(40.0),
            equipment_id: Some(10 + u32::from(lane)),
            equipment_second_rate: Some(37.5),
            average_reaction_time: Some(0.15),
            flying_count: 0,
            late_count: 0,
        }
    }

    #[test]
    fn race_id_compose_is_zero_padded() {
        let race = fixture_race();
        assert_eq!(race.race_id.as_str(), "20260207-24-12");
    }

    #[test]
    fn race_id_rejects_whitespace() {
        assert!(RaceId::parse("2026 02").is_err());
        assert!(RaceId::parse("   ").is_err());
        assert!(RaceId::parse("20260207-24-12").is_ok());
    }

    #[test]
    fn entrant_validation_rejects_out_of_range_lane() {
        let race = fixture_race();
        let mut entrant = fixture_entrant(&race.race_id, 1);
        entrant.lane = 7;
        assert!(entrant.validate().is_err());
    }

    #[test]
    fn entrant_validation_rejects_rate_above_scale() {
        let race = fixture_race();
        let mut entrant = fixture_entrant(&race.race_id, 2);
        entrant.win_rate = Some(11.0);
        assert!(entrant.validate().is_err());
    }

    #[test]
    fn bundle_rejects_entrant_from_other_race() {
        let race = fixture_race();
        let stranger = RaceId::parse("20260207-01-01").unwrap_or_else(|err| panic!("{err}"));
        let bundle = RaceBundle {
            race,
            entrants: vec![fixture_entrant(&stranger, 1)],
            before_info: None,
            results: Vec::new(),
        };
        assert!(bundle.validate().is_err());
    }

    #[test]
    fn bundle_rejects_duplicate_entrant_lanes() {
        let race = fixture_race();
        let mut twin = fixture_entrant(&race.race_id, 1);
        twin.competitor_id = 4006;
        let entrants = vec![fixture_entrant(&race.race_id, 1), twin];
        let bundle = RaceBundle {
            race,
            entrants,
            before_info: None,
            results: Vec::new(),
        };
        let Err(err) = bundle.validate() else {
            panic!("duplicate entrant lanes must be rejected");
        };
        assert!(err.to_string().contains("duplicate entrant lane 1"));
    }

    #[test]
    fn bundle_rejects_duplicate_before_info_and_result_lanes() {
        let race = fixture_race();
        let entrants = (1..=6).map(|lane| fixture_entrant(&race.race_id, lane)).collect();
        let mut bundle = RaceBundle {
            race,
            entrants,
            before_info: Some(BeforeInfoSnapshot {
                weather: None,
                entries: vec![
                    EntrantBeforeInfo {
                        lane: 3,
                        trial_time: Some(6.71),
                        ..EntrantBeforeInfo::default()
                    },
                    EntrantBeforeInfo {
                        lane: 3,
                        ..EntrantBeforeInfo::default()
                    },
                ],
            }),
            results: Vec::new(),
        };
        assert!(bundle.validate().is_err());

        bundle.before_info = None;
        bundle.results = vec![
            RaceResult {
                lane: 2,
                finish_rank: Some(1),
            },
            RaceResult {
                lane: 2,
                finish_rank: Some(4),
            },
        ];
        assert!(bundle.validate().is_err());

        bundle.results.truncate(1);
        assert!(bundle.validate().is_ok());
    }

    #[test]
    fn bundle_json_round_trip_keeps_date_format() {
        let race = fixture_race();
        let bundle = RaceBundle {
            entrants: (1..=6).map(|lane| fixture_entrant(&race.race_id, lane)).collect(),
            race,
            before_info: None,
            results: Vec::new(),
        };
        let value = must_ok(serde_json::to_value(&bundle));
        assert_eq!(value["race"]["race_date"], json!("2026-02-07"));
        assert_eq!(value["entrants"][0]["class_rank"], json!("A2"));

        let decoded = must_ok(RaceBundle::from_json(&value));
        assert_eq!(decoded, bundle);
    }

    #[test]
    fn class_rank_parse_accepts_wire_and_named_forms() {
        assert_eq!(ClassRank::parse("A1"), Some(ClassRank::Top));
        assert_eq!(ClassRank::parse("bottom"), Some(ClassRank::Bottom));
        assert_eq!(ClassRank::parse("C3"), None);
    }

    #[test]
    fn integration_mode_serializes_as_tagged_union() {
        let mode = IntegrationMode::Legacy {
            baseline_weight: 0.6,
            before_info_weight: 0.4,
        };
        let value = must_ok(serde_json::to_value(mode));
        assert_eq!(value["mode"], json!("legacy"));
        assert_eq!(IntegrationMode::BaselineOnly.weights(), (1.0, 0.0));
    }

    #[test]
    fn trial_gap_bands_bucket_by_seconds() {
        assert_eq!(TrialGapBand::from_gap(Some(0.0)), TrialGapBand::Leader);
        assert_eq!(TrialGapBand::from_gap(Some(0.03)), TrialGapBand::Close);
        assert_eq!(TrialGapBand::from_gap(Some(0.07)), TrialGapBand::Mid);
        assert_eq!(TrialGapBand::from_gap(Some(0.20)), TrialGapBand::Far);
        assert_eq!(TrialGapBand::from_gap(None), TrialGapBand::Unknown);
    }

    #[test]
    fn pattern_validation_rejects_wild_multipliers() {
        let pattern = Pattern {
            pattern_id: "P900".to_string(),
            description: String::new(),
            key: PatternKey::default(),
            multiplier: 3.0,
            priority: 1,
            venue: None,
        };
        assert!(pattern.validate().is_err());
    }

    #[test]
    fn with_channel_replaces_only_that_channel() {
        let scores = BeforeInfoScores::default().with_channel(Channel::Weather, Some(1.5));
        assert_eq!(scores.get(Channel::Weather), Some(1.5));
        assert_eq!(scores.get(Channel::TrialTime), None);
    }

    #[test]
    fn confidence_tier_strength_orders_best_first() {
        assert!(ConfidenceTier::A.strength() > ConfidenceTier::B.strength());
        assert!(ConfidenceTier::D.strength() > ConfidenceTier::E.strength());
    }

    #[test]
    fn rfc3339_requires_utc() {
        assert!(parse_rfc3339_utc("2026-02-07T12:00:00+02:00").is_err());
        let parsed = must_ok(parse_rfc3339_utc("2026-02-07T12:00:00Z"));
        assert_eq!(must_ok(format_rfc3339(parsed)), "2026-02-07T12:00:00Z");
    }
}
