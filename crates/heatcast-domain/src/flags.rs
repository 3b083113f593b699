use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::DomainError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Flag {
    DynamicIntegration,
    PatternMultiplier,
    CompoundPatterns,
    NegativePatterns,
    PatternTierD,
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

impl Flag {
    pub const ALL: [Flag; 14] = [
        Flag::DynamicIntegration,
        Flag::PatternMultiplier,
        Flag::CompoundPatterns,
        Flag::NegativePatterns,
        Flag::PatternTierD,
        Flag::TrialTime,
        Flag::ReactionTiming,
        Flag::LaneChange,
        Flag::PreviousHeat,
        Flag::TiltWind,
        Flag::PartsWeight,
        Flag::Weather,
        Flag::EquipmentForm,
        Flag::LaneAffinity,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DynamicIntegration => "dynamic_integration",
            Self::PatternMultiplier => "pattern_multiplier",
            Self::CompoundPatterns => "compound_patterns",
            Self::NegativePatterns => "negative_patterns",
            Self::PatternTierD => "pattern_tier_d",
            Self::TrialTime => "before_info.trial_time",
            Self::ReactionTiming => "before_info.reaction_timing",
            Self::LaneChange => "before_info.lane_change",
            Self::PreviousHeat => "before_info.previous_heat",
            Self::TiltWind => "before_info.tilt_wind",
            Self::PartsWeight => "before_info.parts_weight",
            Self::Weather => "before_info.weather",
            Self::EquipmentForm => "before_info.equipment_form",
            Self::LaneAffinity => "before_info.lane_affinity",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|flag| flag.as_str() == value)
    }

    #[must_use]
    pub fn default_enabled(self) -> bool {
        match self {
            Self::DynamicIntegration
            | Self::CompoundPatterns
            | Self::NegativePatterns
            | Self::PatternTierD
            | Self::LaneAffinity => false,
            Self::PatternMultiplier
            | Self::TrialTime
            | Self::ReactionTiming
            | Self::LaneChange
            | Self::PreviousHeat
            | Self::TiltWind
            | Self::PartsWeight
            | Self::Weather
            | Self::EquipmentForm => true,
        }
    }

    /// Operational notes for rollout decisions. Never read by scoring.
    #[must_use]
    pub fn risk_profile(self) -> FlagRiskProfile {
        match self {
            Self::DynamicIntegration => FlagRiskProfile {
                level: RiskLevel::High,
                failure_modes: &[
                    "over-weights sparse before-info in contested heats",
                    "shifts every integrated total, so tiers move too",
                ],
                mitigation: "compare tier distribution against legacy on a backtest window first",
            },
            Self::PatternMultiplier => FlagRiskProfile {
                level: RiskLevel::Medium,
                failure_modes: &["stale pattern table rewards patterns that stopped paying"],
                mitigation: "pin tables_version and review matched_patterns in stored predictions",
            },
            Self::CompoundPatterns => FlagRiskProfile {
                level: RiskLevel::High,
                failure_modes: &["stacked bonuses reorder favourites in B/C heats"],
                mitigation: "keep off unless single-match results are already validated",
            },
            Self::NegativePatterns => FlagRiskProfile {
                level: RiskLevel::Medium,
                failure_modes: &["penalties demote true favourites on noisy trial times"],
                mitigation: "enable per venue window and watch rank-1 hit rate",
            },
            Self::PatternTierD => FlagRiskProfile {
                level: RiskLevel::Medium,
                failure_modes: &["patterns fitted on B/C heats misfire on low-confidence heats"],
                mitigation: "leave off until D-tier backtest shows lift",
            },
            Self::TrialTime
            | Self::ReactionTiming
            | Self::LaneChange
            | Self::PreviousHeat
            | Self::PartsWeight => FlagRiskProfile {
                level: RiskLevel::Low,
                failure_modes: &["late publication leaves the channel empty"],
                mitigation: "completeness discounts confidence automatically",
            },
            Self::TiltWind | Self::Weather => FlagRiskProfile {
                level: RiskLevel::Medium,
                failure_modes: &["wind direction mapping differs by venue orientation"],
                mitigation: "verify venue rows in the wind table before enabling new venues",
            },
            Self::EquipmentForm => FlagRiskProfile {
                level: RiskLevel::Low,
                failure_modes: &["motor bands double count the baseline equipment score"],
                mitigation: "keep band magnitudes small relative to baseline equipment score",
            },
            Self::LaneAffinity => FlagRiskProfile {
                level: RiskLevel::High,
                failure_modes: &[
                    "thin per-lane samples produce large spurious deviations",
                    "table refresh lag after competitor class changes",
                ],
                mitigation: "require minimum sample counts in the affinity table",
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FlagRiskProfile {
    pub level: RiskLevel,
    pub failure_modes: &'static [&'static str],
    pub mitigation: &'static str,
}

/// Immutable flag set handed to every stage call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureFlags {
    values: BTreeMap<Flag, bool>,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self::defaults()
    }
}

impl FeatureFlags {
    #[must_use]
    pub fn defaults() -> Self {
        Self {
            values: Flag::ALL
                .into_iter()
                .map(|flag| (flag, flag.default_enabled()))
                .collect(),
        }
    }

    #[must_use]
    pub fn builder() -> FeatureFlagsBuilder {
        FeatureFlagsBuilder {
            values: Self::defaults().values,
        }
    }

    #[must_use]
    pub fn to_builder(&self) -> FeatureFlagsBuilder {
        FeatureFlagsBuilder {
            values: self.values.clone(),
        }
    }

    #[must_use]
    pub fn get(&self, flag: Flag) -> bool {
        self.values
            .get(&flag)
            .copied()
            .unwrap_or_else(|| flag.default_enabled())
    }

    /// Returns a new set with one flag changed.
    #[must_use]
    pub fn with(&self, flag: Flag, enabled: bool) -> Self {
        self.to_builder().set(flag, enabled).build()
    }

    /// Builds a set from defaults overlaid with a flat name-to-boolean map.
    ///
    /// # Errors
    /// Returns [`DomainError::Configuration`] for unknown flag names.
    pub fn from_map(overrides: &BTreeMap<String, bool>) -> Result<Self, DomainError> {
        let mut builder = Self::builder();
        for (name, enabled) in overrides {
            builder = builder.set_named(name, *enabled)?;
        }
        Ok(builder.build())
    }

    /// # Errors
    /// Returns [`DomainError::Configuration`] when the payload is not a
    /// name-to-boolean object or names an unknown flag.
    pub fn from_json(value: &Value) -> Result<Self, DomainError> {
        let map: BTreeMap<String, bool> = serde_json::from_value(value.clone()).map_err(|err| {
            DomainError::Configuration(format!("invalid feature flag JSON payload: {err}"))
        })?;
        Self::from_map(&map)
    }

    /// # Errors
    /// Returns [`DomainError::Configuration`] when the document is not a
    /// name-to-boolean mapping or names an unknown flag.
    pub fn from_yaml_str(raw: &str) -> Result<Self, DomainError> {
        let map: BTreeMap<String, bool> = serde_yaml::from_str(raw).map_err(|err| {
            DomainError::Configuration(format!("invalid feature flag YAML payload: {err}"))
        })?;
        Self::from_map(&map)
    }

    #[must_use]
    pub fn to_map(&self) -> BTreeMap<String, bool> {
        Flag::ALL
            .into_iter()
            .map(|flag| (flag.as_str().to_string(), self.get(flag)))
            .collect()
    }

    /// Stable SHA-256 over every flag value, recorded with each prediction.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for flag in Flag::ALL {
            hasher.update(flag.as_str().as_bytes());
            hasher.update(if self.get(flag) { b"=1;" } else { b"=0;" });
        }
        hex::encode(hasher.finalize())
    }
}

#[derive(Debug, Clone)]
pub struct FeatureFlagsBuilder {
    values: BTreeMap<Flag, bool>,
}

impl FeatureFlagsBuilder {
    #[must_use]
    pub fn enable(self, flag: Flag) -> Self {
        self.set(flag, true)
    }

    #[must_use]
    pub fn disable(self, flag: Flag) -> Self {
        self.set(flag, false)
    }

    #[must_use]
    pub fn set(mut self, flag: Flag, enabled: bool) -> Self {
        self.values.insert(flag, enabled);
        self
    }

    /// # Errors
    /// Returns [`DomainError::Configuration`] for unknown flag names.
    pub fn set_named(self, name: &str, enabled: bool) -> Result<Self, DomainError> {
        let flag = Flag::parse(name)
            .ok_or_else(|| DomainError::Configuration(format!("unknown feature flag: {name}")))?;
        Ok(self.set(flag, enabled))
    }

    #[must_use]
    pub fn build(self) -> FeatureFlags {
        FeatureFlags {
            values: self.values,
        }
    }
}

/// Parses a `name=bool` override such as `dynamic_integration=true`.
///
/// # Errors
/// Returns [`DomainError::Configuration`] when the shape, name or value is invalid.
pub fn parse_flag_override(raw: &str) -> Result<(Flag, bool), DomainError> {
    let (name, value) = raw.split_once('=').ok_or_else(|| {
        DomainError::Configuration(format!("flag override must be <name>=<bool>: {raw}"))
    })?;
    let flag = Flag::parse(name.trim())
        .ok_or_else(|| DomainError::Configuration(format!("unknown feature flag: {name}")))?;
    let enabled = match value.trim() {
        "true" | "on" | "1" => true,
        "false" | "off" | "0" => false,
        other => {
            return Err(DomainError::Configuration(format!(
                "flag value must be true/false: {other}"
            )))
        }
    };
    Ok((flag, enabled))
}
