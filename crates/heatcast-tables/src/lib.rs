//! Static lookup tables used by the empirical sub-scorers and the pattern engine.
//!
//! Tables are loaded once at start-up and handed to the scoring stages as a
//! [`TableProvider`] trait object. A missing table or key is never an error
//! at scoring time; callers fall back to a neutral contribution.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use heatcast_domain::{
    ClassRank, DomainError, Pattern, PatternKey, TrialGapBand, WindDirection, MAX_LANE, MIN_LANE,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const BUILTIN_TABLES_VERSION: &str = "tables.v1";
/// Wind speed (m/s) at which wind-driven adjustments start to apply.
pub const WIND_ACTIVATION_MS: f64 = 3.0;
/// Venue code used for rows that apply to every venue without its own row.
pub const ANY_VENUE: u8 = 0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WindBand {
    Moderate,
    Strong,
    Gale,
}

impl WindBand {
    /// `None` below the activation threshold.
    #[must_use]
    pub fn from_speed(speed: f64) -> Option<Self> {
        if !speed.is_finite() || speed < WIND_ACTIVATION_MS {
            None
        } else if speed < 5.0 {
            Some(Self::Moderate)
        } else if speed < 7.0 {
            Some(Self::Strong)
        } else {
            Some(Self::Gale)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindAdjustmentRow {
    pub venue: u8,
    pub lane: u8,
    pub direction: WindDirection,
    pub band: WindBand,
    pub adjustment: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaveAdjustmentRow {
    pub lane: u8,
    pub min_height_cm: f64,
    pub adjustment: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MotorFormBand {
    pub min_second_rate: f64,
    pub points: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct LaneAffinity {
    pub competitor_id: u32,
    pub lane: u8,
    /// Lane win rate minus the competitor's overall win rate, percentage points.
    pub deviation: f64,
    pub samples: u32,
}

/// Serialized form of a full table set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TablesDocument {
    pub version: String,
    #[serde(default)]
    pub wind: Vec<WindAdjustmentRow>,
    #[serde(default)]
    pub wave: Vec<WaveAdjustmentRow>,
    #[serde(default)]
    pub motor_form: Vec<MotorFormBand>,
    #[serde(default)]
    pub lane_affinity: Vec<LaneAffinity>,
    #[serde(default = "default_min_affinity_samples")]
    pub min_affinity_samples: u32,
    #[serde(default)]
    pub patterns: Vec<Pattern>,
}

fn default_min_affinity_samples() -> u32 {
    10
}

/// Read-only access to the lookup tables.
pub trait TableProvider: Send + Sync {
    fn version(&self) -> &str;

    fn wind_adjustment(
        &self,
        venue: u8,
        lane: u8,
        direction: WindDirection,
        band: WindBand,
    ) -> Option<f64>;

    fn wave_adjustment(&self, lane: u8, wave_height_cm: f64) -> Option<f64>;

    fn motor_form_points(&self, second_rate: f64) -> Option<f64>;

    fn lane_affinity(&self, competitor_id: u32, lane: u8) -> Option<LaneAffinity>;

    fn patterns(&self) -> Option<&[Pattern]>;
}

/// Provider with no tables at all; every lookup is unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyTables;

impl TableProvider for EmptyTables {
    fn version(&self) -> &str {
        "none"
    }

    fn wind_adjustment(&self, _: u8, _: u8, _: WindDirection, _: WindBand) -> Option<f64> {
        None
    }

    fn wave_adjustment(&self, _: u8, _: f64) -> Option<f64> {
        None
    }

    fn motor_form_points(&self, _: f64) -> Option<f64> {
        None
    }

    fn lane_affinity(&self, _: u32, _: u8) -> Option<LaneAffinity> {
        None
    }

    fn patterns(&self) -> Option<&[Pattern]> {
        None
    }
}

/// In-memory table set indexed for key lookups.
#[derive(Debug, Clone)]
pub struct StaticTables {
    document: TablesDocument,
    wind: BTreeMap<(u8, u8, WindDirection, WindBand), f64>,
    wave: BTreeMap<u8, Vec<(f64, f64)>>,
    motor_form: Vec<(f64, f64)>,
    lane_affinity: BTreeMap<(u32, u8), LaneAffinity>,
}

impl StaticTables {
    /// Validates and indexes a table document.
    ///
    /// # Errors
    /// Returns [`DomainError::Configuration`] for out-of-range lanes,
    /// non-finite values, invalid or duplicate patterns.
    pub fn from_document(document: TablesDocument) -> Result<Self, DomainError> {
        validate_document(&document)?;
        Ok(Self::index(document))
    }

    /// # Errors
    /// Returns [`DomainError::Configuration`] when decoding or validation fails.
    pub fn from_json(value: &Value) -> Result<Self, DomainError> {
        let document: TablesDocument = serde_json::from_value(value.clone())
            .map_err(|err| DomainError::Configuration(format!("invalid tables JSON: {err}")))?;
        Self::from_document(document)
    }

    /// # Errors
    /// Returns [`DomainError::Configuration`] when decoding or validation fails.
    pub fn from_yaml_str(raw: &str) -> Result<Self, DomainError> {
        let document: TablesDocument = serde_yaml::from_str(raw)
            .map_err(|err| DomainError::Configuration(format!("invalid tables YAML: {err}")))?;
        Self::from_document(document)
    }

    /// Loads a JSON or YAML (`.yaml`/`.yml`) table file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, decoded, or validated.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read tables file {}", path.display()))?;
        let is_yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml" | "yml")
        );
        if is_yaml {
            Self::from_yaml_str(&raw).map_err(|err| anyhow!("{}: {err}", path.display()))
        } else {
            let value: Value = serde_json::from_str(&raw)
                .with_context(|| format!("tables file is not valid JSON: {}", path.display()))?;
            Self::from_json(&value).map_err(|err| anyhow!("{}: {err}", path.display()))
        }
    }

    #[must_use]
    pub fn document(&self) -> &TablesDocument {
        &self.document
    }

    /// Tables shipped with the engine.
    #[must_use]
    pub fn builtin_v1() -> Self {
        Self::index(builtin_document())
    }

    fn index(document: TablesDocument) -> Self {
        let wind = document
            .wind
            .iter()
            .map(|row| ((row.venue, row.lane, row.direction, row.band), row.adjustment))
            .collect();

        let mut wave: BTreeMap<u8, Vec<(f64, f64)>> = BTreeMap::new();
        for row in &document.wave {
            wave.entry(row.lane)
                .or_default()
                .push((row.min_height_cm, row.adjustment));
        }
        for rows in wave.values_mut() {
            rows.sort_by(|lhs, rhs| lhs.0.total_cmp(&rhs.0));
        }

        let mut motor_form: Vec<(f64, f64)> = document
            .motor_form
            .iter()
            .map(|band| (band.min_second_rate, band.points))
            .collect();
        motor_form.sort_by(|lhs, rhs| lhs.0.total_cmp(&rhs.0));

        let lane_affinity = document
            .lane_affinity
            .iter()
            .filter(|row| row.samples >= document.min_affinity_samples)
            .map(|row| ((row.competitor_id, row.lane), *row))
            .collect();

        Self {
            document,
            wind,
            wave,
            motor_form,
            lane_affinity,
        }
    }
}

impl TableProvider for StaticTables {
    fn version(&self) -> &str {
        &self.document.version
    }

    fn wind_adjustment(
        &self,
        venue: u8,
        lane: u8,
        direction: WindDirection,
        band: WindBand,
    ) -> Option<f64> {
        self.wind
            .get(&(venue, lane, direction, band))
            .or_else(|| self.wind.get(&(ANY_VENUE, lane, direction, band)))
            .copied()
    }

    fn wave_adjustment(&self, lane: u8, wave_height_cm: f64) -> Option<f64> {
        if !wave_height_cm.is_finite() {
            return None;
        }
        let rows = self.wave.get(&lane)?;
        Some(
            rows.iter()
                .rev()
                .find(|(min_height, _)| wave_height_cm >= *min_height)
                .map_or(0.0, |(_, adjustment)| *adjustment),
        )
    }

    fn motor_form_points(&self, second_rate: f64) -> Option<f64> {
        if !second_rate.is_finite() || self.motor_form.is_empty() {
            return None;
        }
        Some(
            self.motor_form
                .iter()
                .rev()
                .find(|(min_rate, _)| second_rate >= *min_rate)
                .map_or(0.0, |(_, points)| *points),
        )
    }

    fn lane_affinity(&self, competitor_id: u32, lane: u8) -> Option<LaneAffinity> {
        self.lane_affinity.get(&(competitor_id, lane)).copied()
    }

    fn patterns(&self) -> Option<&[Pattern]> {
        if self.document.patterns.is_empty() {
            None
        } else {
            Some(&self.document.patterns)
        }
    }
}

fn validate_document(document: &TablesDocument) -> Result<(), DomainError> {
    if document.version.trim().is_empty() {
        return Err(DomainError::Configuration(
            "tables version MUST be provided".to_string(),
        ));
    }

    let lane_ok = |lane: u8| (MIN_LANE..=MAX_LANE).contains(&lane);

    for row in &document.wind {
        if !lane_ok(row.lane) || !row.adjustment.is_finite() {
            return Err(DomainError::Configuration(format!(
                "invalid wind row venue={} lane={}",
                row.venue, row.lane
            )));
        }
    }
    for row in &document.wave {
        if !lane_ok(row.lane) || !row.adjustment.is_finite() || !row.min_height_cm.is_finite() {
            return Err(DomainError::Configuration(format!(
                "invalid wave row lane={}",
                row.lane
            )));
        }
    }
    for band in &document.motor_form {
        if !band.points.is_finite() || !(0.0..=100.0).contains(&band.min_second_rate) {
            return Err(DomainError::Configuration(format!(
                "invalid motor form band min_second_rate={}",
                band.min_second_rate
            )));
        }
    }
    for row in &document.lane_affinity {
        if !lane_ok(row.lane) || !row.deviation.is_finite() {
            return Err(DomainError::Configuration(format!(
                "invalid lane affinity row competitor={} lane={}",
                row.competitor_id, row.lane
            )));
        }
    }

    let mut seen = BTreeSet::new();
    for pattern in &document.patterns {
        pattern.validate()?;
        if !seen.insert(pattern.pattern_id.as_str()) {
            return Err(DomainError::Configuration(format!(
                "duplicate pattern_id: {}",
                pattern.pattern_id
            )));
        }
    }

    Ok(())
}

// Lane order 1..=6 per row.
const DEFAULT_WIND: [(WindDirection, WindBand, [f64; 6]); 9] = [
    (WindDirection::Headwind, WindBand::Moderate, [-1.0, -0.5, 0.5, 1.0, 1.0, 0.5]),
    (WindDirection::Headwind, WindBand::Strong, [-2.5, -1.0, 1.0, 2.0, 1.5, 1.0]),
    (WindDirection::Headwind, WindBand::Gale, [-4.0, -1.5, 1.5, 2.5, 2.0, 1.5]),
    (WindDirection::Tailwind, WindBand::Moderate, [1.0, 0.5, 0.0, -0.5, -0.5, -0.5]),
    (WindDirection::Tailwind, WindBand::Strong, [0.5, 1.5, 0.5, -1.0, -1.0, -1.0]),
    (WindDirection::Tailwind, WindBand::Gale, [-1.0, 2.0, 1.0, -1.0, -1.5, -1.5]),
    (WindDirection::Crosswind, WindBand::Moderate, [-0.5, 0.0, 0.0, 0.5, 0.0, 0.0]),
    (WindDirection::Crosswind, WindBand::Strong, [-1.0, 0.0, 0.5, 0.5, 0.5, 0.0]),
    (WindDirection::Crosswind, WindBand::Gale, [-1.5, -0.5, 0.5, 1.0, 0.5, 0.5]),
];

// Venue-specific rows where the default profile is known to be off.
const VENUE_WIND: [(u8, WindDirection, WindBand, [f64; 6]); 3] = [
    // Narrow tidal course: strong headwind punishes lane 1 harder.
    (4, WindDirection::Headwind, WindBand::Strong, [-3.5, -1.0, 1.5, 2.5, 1.5, 1.0]),
    // Sheltered bay: lane 1 holds up under moderate headwind.
    (24, WindDirection::Headwind, WindBand::Moderate, [-0.5, -0.5, 0.5, 0.5, 0.5, 0.0]),
    (24, WindDirection::Headwind, WindBand::Strong, [-1.5, -1.0, 1.0, 1.5, 1.0, 0.5]),
];

fn builtin_document() -> TablesDocument {
    let mut wind = Vec::new();
    for (direction, band, by_lane) in DEFAULT_WIND {
        push_wind_rows(&mut wind, ANY_VENUE, direction, band, by_lane);
    }
    for (venue, direction, band, by_lane) in VENUE_WIND {
        push_wind_rows(&mut wind, venue, direction, band, by_lane);
    }

    let wave = vec![
        WaveAdjustmentRow {
            lane: 1,
            min_height_cm: 5.0,
            adjustment: -1.0,
        },
        WaveAdjustmentRow {
            lane: 1,
            min_height_cm: 10.0,
            adjustment: -2.5,
        },
        WaveAdjustmentRow {
            lane: 2,
            min_height_cm: 5.0,
            adjustment: -0.5,
        },
        WaveAdjustmentRow {
            lane: 2,
            min_height_cm: 10.0,
            adjustment: -1.5,
        },
    ];

    let motor_form = [(0.0, -3.0), (25.0, -1.5), (30.0, 0.0), (38.0, 1.5), (45.0, 3.0)]
        .into_iter()
        .map(|(min_second_rate, points)| MotorFormBand {
            min_second_rate,
            points,
        })
        .collect();

    TablesDocument {
        version: BUILTIN_TABLES_VERSION.to_string(),
        wind,
        wave,
        motor_form,
        lane_affinity: Vec::new(),
        min_affinity_samples: default_min_affinity_samples(),
        patterns: builtin_patterns(),
    }
}

fn push_wind_rows(
    rows: &mut Vec<WindAdjustmentRow>,
    venue: u8,
    direction: WindDirection,
    band: WindBand,
    by_lane: [f64; 6],
) {
    for (lane, adjustment) in (MIN_LANE..=MAX_LANE).zip(by_lane) {
        rows.push(WindAdjustmentRow {
            venue,
            lane,
            direction,
            band,
            adjustment,
        });
    }
}

fn pattern(
    pattern_id: &str,
    description: &str,
    key: PatternKey,
    multiplier: f64,
    priority: u32,
    venue: Option<u8>,
) -> Pattern {
    Pattern {
        pattern_id: pattern_id.to_string(),
        description: description.to_string(),
        key,
        multiplier,
        priority,
        venue,
    }
}

fn builtin_patterns() -> Vec<Pattern> {
    vec![
        pattern(
            "P001",
            "baseline and before-info favourite in top class",
            PatternKey {
                baseline_rank: Some(1),
                before_info_rank: Some(1),
                class: Some(ClassRank::Top),
                trial_gap: None,
            },
            1.08,
            100,
            None,
        ),
        pattern(
            "P002",
            "baseline and before-info favourite",
            PatternKey {
                baseline_rank: Some(1),
                before_info_rank: Some(1),
                ..PatternKey::default()
            },
            1.05,
            90,
            None,
        ),
        pattern(
            "P003",
            "second baseline pick leads before-info",
            PatternKey {
                baseline_rank: Some(2),
                before_info_rank: Some(1),
                ..PatternKey::default()
            },
            1.05,
            80,
            None,
        ),
        pattern(
            "P004",
            "third baseline pick leads before-info with fastest trial",
            PatternKey {
                baseline_rank: Some(3),
                before_info_rank: Some(1),
                trial_gap: Some(TrialGapBand::Leader),
                ..PatternKey::default()
            },
            1.06,
            85,
            None,
        ),
        pattern(
            "P005",
            "baseline favourite with fastest trial",
            PatternKey {
                baseline_rank: Some(1),
                trial_gap: Some(TrialGapBand::Leader),
                ..PatternKey::default()
            },
            1.04,
            70,
            None,
        ),
        pattern(
            "P006",
            "top class second on before-info close on trial",
            PatternKey {
                before_info_rank: Some(2),
                class: Some(ClassRank::Top),
                trial_gap: Some(TrialGapBand::Close),
                ..PatternKey::default()
            },
            1.03,
            50,
            None,
        ),
        pattern(
            "V024",
            "inner favourite holds at sheltered venue",
            PatternKey {
                baseline_rank: Some(1),
                before_info_rank: Some(1),
                ..PatternKey::default()
            },
            1.03,
            110,
            Some(24),
        ),
        pattern(
            "N001",
            "baseline favourite collapses on before-info",
            PatternKey {
                baseline_rank: Some(1),
                before_info_rank: Some(6),
                ..PatternKey::default()
            },
            0.92,
            95,
            None,
        ),
        pattern(
            "N002",
            "baseline favourite far off trial pace",
            PatternKey {
                baseline_rank: Some(1),
                trial_gap: Some(TrialGapBand::Far),
                ..PatternKey::default()
            },
            0.94,
            60,
            None,
        ),
        pattern(
            "N003",
            "bottom class far off trial pace",
            PatternKey {
                class: Some(ClassRank::Bottom),
                trial_gap: Some(TrialGapBand::Far),
                ..PatternKey::default()
            },
            0.95,
            40,
            None,
        ),
    ]
}
