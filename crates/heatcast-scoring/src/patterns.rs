//! Pattern bonus and penalty layer.
//!
//! A pattern matches when every fixed field of its key equals the entrant's
//! channel value and its venue scope, if any, equals the heat venue. By
//! default only the strongest match applies; with `compound_patterns` every
//! match contributes with halving weight in priority order.

use std::cmp::Ordering;

use heatcast_domain::{ClassRank, ConfidenceTier, FeatureFlags, Flag, Pattern, TrialGapBand};
use heatcast_tables::TableProvider;
use serde::Serialize;

const COMPOUND_DECAY: f64 = 0.5;
pub const MULTIPLIER_MIN: f64 = 0.5;
pub const MULTIPLIER_MAX: f64 = 1.5;

/// Discretized channel values for one entrant within its heat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternContext {
    pub baseline_rank: u8,
    pub before_info_rank: Option<u8>,
    pub class: Option<ClassRank>,
    pub trial_gap: TrialGapBand,
    pub venue: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PatternOutcome {
    pub multiplier: f64,
    pub matched: Vec<String>,
}

impl PatternOutcome {
    #[must_use]
    pub fn neutral() -> Self {
        Self {
            multiplier: 1.0,
            matched: Vec::new(),
        }
    }
}

/// An unset key slot matches any value.
fn slot_matches<T: PartialEq>(slot: Option<T>, actual: T) -> bool {
    match slot {
        Some(expected) => expected == actual,
        None => true,
    }
}

#[must_use]
pub fn matches(pattern: &Pattern, context: &PatternContext) -> bool {
    let key = &pattern.key;
    slot_matches(pattern.venue, context.venue)
        && slot_matches(key.baseline_rank, context.baseline_rank)
        && slot_matches(key.before_info_rank.map(Some), context.before_info_rank)
        && slot_matches(key.class.map(Some), context.class)
        && slot_matches(key.trial_gap, context.trial_gap)
}

/// Whether patterns apply at this tier: never at `A` or `E`, always at `B`
/// and `C`, at `D` only when `pattern_tier_d` is on.
#[must_use]
pub fn tier_allows(tier: ConfidenceTier, flags: &FeatureFlags) -> bool {
    match tier {
        ConfidenceTier::A | ConfidenceTier::E => false,
        ConfidenceTier::B | ConfidenceTier::C => true,
        ConfidenceTier::D => flags.get(Flag::PatternTierD),
    }
}

fn by_precedence(lhs: &Pattern, rhs: &Pattern) -> Ordering {
    rhs.priority
        .cmp(&lhs.priority)
        .then_with(|| {
            (rhs.multiplier - 1.0)
                .abs()
                .total_cmp(&(lhs.multiplier - 1.0).abs())
        })
        .then_with(|| lhs.pattern_id.cmp(&rhs.pattern_id))
}

/// Combines already-ordered matches into one multiplier.
#[must_use]
pub fn combine(ordered: &[&Pattern], compound: bool) -> f64 {
    let raw = if compound {
        ordered
            .iter()
            .zip(std::iter::successors(Some(1.0_f64), |weight| {
                Some(weight * COMPOUND_DECAY)
            }))
            .map(|(pattern, weight)| 1.0 + (pattern.multiplier - 1.0) * weight)
            .product::<f64>()
    } else {
        ordered.first().map_or(1.0, |pattern| pattern.multiplier)
    };
    raw.clamp(MULTIPLIER_MIN, MULTIPLIER_MAX)
}

/// Multiplier for one entrant, `1.0` whenever the engine is off, the tier
/// is gated, the tables carry no patterns or nothing matches.
#[must_use]
pub fn apply_patterns(
    context: &PatternContext,
    tier: ConfidenceTier,
    flags: &FeatureFlags,
    tables: &dyn TableProvider,
) -> PatternOutcome {
    if !flags.get(Flag::PatternMultiplier) || !tier_allows(tier, flags) {
        return PatternOutcome::neutral();
    }
    let Some(patterns) = tables.patterns() else {
        return PatternOutcome::neutral();
    };

    let allow_penalties = flags.get(Flag::NegativePatterns);
    let mut hits: Vec<&Pattern> = patterns
        .iter()
        .filter(|pattern| allow_penalties || !pattern.is_penalty())
        .filter(|pattern| matches(pattern, context))
        .collect();
    if hits.is_empty() {
        return PatternOutcome::neutral();
    }
    hits.sort_by(|lhs, rhs| by_precedence(lhs, rhs));

    let compound = flags.get(Flag::CompoundPatterns);
    let applied: &[&Pattern] = if compound { &hits } else { &hits[..1] };
    PatternOutcome {
        multiplier: combine(applied, compound),
        matched: applied
            .iter()
            .map(|pattern| pattern.pattern_id.clone())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heatcast_domain::PatternKey;
    use heatcast_tables::{EmptyTables, StaticTables};
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn favourite(venue: u8) -> PatternContext {
        PatternContext {
            baseline_rank: 1,
            before_info_rank: Some(1),
            class: Some(ClassRank::Top),
            trial_gap: TrialGapBand::Leader,
            venue,
        }
    }

    fn tables() -> StaticTables {
        must_ok(StaticTables::from_json(&json!({
            "version": "test.patterns",
            "patterns": [
                {"pattern_id": "HI", "key": {"baseline_rank": 1}, "multiplier": 1.10, "priority": 50},
                {"pattern_id": "LO", "key": {"class": "A1"}, "multiplier": 1.04, "priority": 10},
                {"pattern_id": "NEG", "key": {"before_info_rank": 1}, "multiplier": 0.90, "priority": 90},
                {"pattern_id": "VEN", "key": {}, "multiplier": 1.20, "priority": 99, "venue": 7}
            ]
        })))
    }

    #[test]
    fn no_match_is_neutral() {
        let context = PatternContext {
            baseline_rank: 5,
            before_info_rank: Some(5),
            class: Some(ClassRank::Bottom),
            trial_gap: TrialGapBand::Mid,
            venue: 1,
        };
        let outcome = apply_patterns(&context, ConfidenceTier::B, &FeatureFlags::defaults(), &tables());
        assert_eq!(outcome, PatternOutcome::neutral());
    }

    #[test]
    fn empty_tables_are_neutral() {
        let outcome = apply_patterns(
            &favourite(1),
            ConfidenceTier::B,
            &FeatureFlags::defaults(),
            &EmptyTables,
        );
        assert_eq!(outcome.multiplier, 1.0);
    }

    #[test]
    fn highest_priority_positive_match_wins_by_default() {
        let outcome = apply_patterns(&favourite(1), ConfidenceTier::C, &FeatureFlags::defaults(), &tables());
        assert_eq!(outcome.matched, vec!["HI".to_string()]);
        assert!((outcome.multiplier - 1.10).abs() < 1e-12);
    }

    #[test]
    fn unset_slots_are_wildcards_but_set_slots_need_a_value() {
        let open = Pattern {
            pattern_id: "ANY".to_string(),
            description: String::new(),
            key: PatternKey::default(),
            multiplier: 1.05,
            priority: 1,
            venue: None,
        };
        assert!(matches(&open, &favourite(3)));

        let needs_snapshot = Pattern {
            key: PatternKey {
                before_info_rank: Some(1),
                ..PatternKey::default()
            },
            ..open.clone()
        };
        let mut no_snapshot = favourite(3);
        no_snapshot.before_info_rank = None;
        assert!(matches(&needs_snapshot, &favourite(3)));
        assert!(!matches(&needs_snapshot, &no_snapshot));

        let scoped = Pattern {
            venue: Some(7),
            ..open
        };
        assert!(!matches(&scoped, &favourite(3)));
        assert!(matches(&scoped, &favourite(7)));
    }

    #[test]
    fn venue_scope_restricts_matches() {
        let outcome = apply_patterns(&favourite(7), ConfidenceTier::C, &FeatureFlags::defaults(), &tables());
        assert_eq!(outcome.matched, vec!["VEN".to_string()]);
    }

    #[test]
    fn penalties_need_their_flag() {
        let flags = FeatureFlags::defaults().with(Flag::NegativePatterns, true);
        let outcome = apply_patterns(&favourite(1), ConfidenceTier::C, &flags, &tables());
        assert_eq!(outcome.matched, vec!["NEG".to_string()]);
        assert!((outcome.multiplier - 0.90).abs() < 1e-12);
    }

    #[test]
    fn compound_mode_halves_each_later_match() {
        let flags = FeatureFlags::defaults().with(Flag::CompoundPatterns, true);
        let outcome = apply_patterns(&favourite(1), ConfidenceTier::B, &flags, &tables());
        assert_eq!(outcome.matched, vec!["HI".to_string(), "LO".to_string()]);
        let expected = 1.10 * (1.0 + 0.04 * 0.5);
        assert!((outcome.multiplier - expected).abs() < 1e-12);
    }

    #[test]
    fn tiers_gate_the_engine() {
        let flags = FeatureFlags::defaults();
        assert!(!tier_allows(ConfidenceTier::A, &flags));
        assert!(!tier_allows(ConfidenceTier::E, &flags));
        assert!(tier_allows(ConfidenceTier::B, &flags));
        assert!(!tier_allows(ConfidenceTier::D, &flags));
        assert!(tier_allows(ConfidenceTier::D, &flags.with(Flag::PatternTierD, true)));

        let outcome = apply_patterns(&favourite(1), ConfidenceTier::A, &flags, &tables());
        assert_eq!(outcome, PatternOutcome::neutral());
    }

    #[test]
    fn engine_flag_disables_everything() {
        let flags = FeatureFlags::defaults().with(Flag::PatternMultiplier, false);
        let outcome = apply_patterns(&favourite(1), ConfidenceTier::B, &flags, &tables());
        assert_eq!(outcome, PatternOutcome::neutral());
    }

    #[test]
    fn equal_priority_prefers_larger_deviation_then_id() {
        let make = |id: &str, multiplier: f64| Pattern {
            pattern_id: id.to_string(),
            description: String::new(),
            key: PatternKey::default(),
            multiplier,
            priority: 5,
            venue: None,
        };
        let mut patterns = [make("B", 1.02), make("A", 1.02), make("C", 1.08)];
        patterns.sort_by(by_precedence);
        let ids: Vec<&str> = patterns.iter().map(|p| p.pattern_id.as_str()).collect();
        assert_eq!(ids, vec!["C", "A", "B"]);
    }

    #[test]
    fn builtin_favourite_pattern_applies() {
        let outcome = apply_patterns(
            &favourite(1),
            ConfidenceTier::B,
            &FeatureFlags::defaults(),
            &StaticTables::builtin_v1(),
        );
        assert_eq!(outcome.matched, vec!["P001".to_string()]);
    }
}
