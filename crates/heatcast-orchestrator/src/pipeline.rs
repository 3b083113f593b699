use std::cmp::Ordering;
use std::collections::BTreeSet;

use anyhow::{anyhow, Context, Result};
use heatcast_domain::{
    format_rfc3339, now_utc, BaselineScores, BeforeInfoScores, DomainError, Entrant,
    FeatureFlags, PredictionRecord, PredictionSink, PredictionStatus, RaceBundle, RaceId,
    RacePrediction, RaceRepository, ScoreBreakdown, TrialGapBand, FIELD_SIZE, MAX_LANE, MIN_LANE,
    PREDICTION_CONTRACT_VERSION,
};
use heatcast_scoring::{
    apply_patterns, classify, integrate, is_contested, rank_descending, score_baseline,
    select_mode, BeforeInfoScorer, HeatContext, PatternContext,
};
use heatcast_tables::TableProvider;
use tracing::{debug, info};

/// Per-race scoring pipeline: baseline, before-info, integration,
/// confidence, patterns, ranking.
#[derive(Default)]
pub struct Pipeline {
    before_info: BeforeInfoScorer,
}

struct Scored<'a> {
    entrant: &'a Entrant,
    breakdown: ScoreBreakdown,
}

impl Pipeline {
    #[must_use]
    pub fn new(before_info: BeforeInfoScorer) -> Self {
        Self { before_info }
    }

    /// Predicts one heat, stamped with the current UTC time.
    ///
    /// # Errors
    /// Returns [`DomainError::Validation`] only when the timestamp cannot be formatted.
    pub fn predict_race(
        &self,
        bundle: &RaceBundle,
        flags: &FeatureFlags,
        tables: &dyn TableProvider,
    ) -> Result<RacePrediction, DomainError> {
        let generated_at = format_rfc3339(now_utc())?;
        Ok(self.predict_race_at(bundle, flags, tables, &generated_at))
    }

    /// Deterministic form of [`Pipeline::predict_race`] with a caller-supplied timestamp.
    #[must_use]
    pub fn predict_race_at(
        &self,
        bundle: &RaceBundle,
        flags: &FeatureFlags,
        tables: &dyn TableProvider,
        generated_at: &str,
    ) -> RacePrediction {
        let race_id = bundle.race.race_id.clone();
        let mut prediction = RacePrediction {
            contract_version: PREDICTION_CONTRACT_VERSION.to_string(),
            race_id: race_id.clone(),
            status: PredictionStatus::Ranked,
            tables_version: tables.version().to_string(),
            flags_digest: flags.digest(),
            generated_at: generated_at.to_string(),
            records: Vec::new(),
        };

        if let Err(status) = check_field(bundle) {
            debug!(race_id = %race_id, status = status.as_str(), "race not ranked");
            prediction.status = status;
            return prediction;
        }

        let mut scored = self.score_field(bundle, flags, tables);
        scored.sort_by(|lhs, rhs| {
            finishing_order(
                (lhs.breakdown.final_score, lhs.entrant.lane),
                (rhs.breakdown.final_score, rhs.entrant.lane),
            )
        });

        prediction.records = scored
            .into_iter()
            .zip(1_u8..)
            .map(|(item, predicted_rank)| PredictionRecord {
                race_id: race_id.clone(),
                lane: item.entrant.lane,
                competitor_id: item.entrant.competitor_id,
                predicted_rank,
                final_score: item.breakdown.final_score,
                confidence_tier: item.breakdown.confidence_tier,
                integration_mode: item.breakdown.integration_mode,
                breakdown: item.breakdown,
                generated_at: generated_at.to_string(),
            })
            .collect();

        debug!(
            race_id = %race_id,
            winner_lane = prediction.records.first().map(|record| record.lane),
            "race ranked"
        );
        prediction
    }

    /// Entrants must already be validated; output order is lane order.
    fn score_field<'a>(
        &self,
        bundle: &'a RaceBundle,
        flags: &FeatureFlags,
        tables: &dyn TableProvider,
    ) -> Vec<Scored<'a>> {
        let mut entrants: Vec<&Entrant> = bundle.entrants.iter().collect();
        entrants.sort_by_key(|entrant| entrant.lane);

        let snapshot = bundle
            .before_info
            .as_ref()
            .filter(|snapshot| !snapshot.is_empty());
        let heat = snapshot.map(|snapshot| HeatContext::new(bundle.race.venue, snapshot));

        let baselines: Vec<BaselineScores> =
            entrants.iter().map(|entrant| score_baseline(entrant)).collect();
        let before_infos: Vec<BeforeInfoScores> = entrants
            .iter()
            .map(|entrant| self.before_info.score(entrant, heat.as_ref(), flags, tables))
            .collect();

        let baseline_totals: Vec<f64> = baselines.iter().map(|scores| scores.total).collect();
        let contested = is_contested(&baseline_totals);
        let baseline_ranks = rank_descending(&baseline_totals);
        let before_info_ranks = heat.as_ref().map(|_| {
            let totals: Vec<f64> = before_infos.iter().map(|scores| scores.total).collect();
            rank_descending(&totals)
        });

        entrants
            .into_iter()
            .enumerate()
            .map(|(index, entrant)| {
                let baseline = baselines[index];
                let before_info = before_infos[index];
                let integration_mode =
                    select_mode(flags, heat.is_some(), before_info.confidence, contested);
                let integrated_total =
                    integrate(&integration_mode, baseline.total, before_info.total);
                let confidence_tier = classify(integrated_total, before_info.completeness);

                let context = PatternContext {
                    baseline_rank: baseline_ranks[index],
                    before_info_rank: before_info_ranks.as_ref().map(|ranks| ranks[index]),
                    class: entrant.class_rank,
                    trial_gap: TrialGapBand::from_gap(
                        heat.as_ref().and_then(|heat| heat.trial_gap(entrant.lane)),
                    ),
                    venue: bundle.race.venue,
                };
                let patterns = apply_patterns(&context, confidence_tier, flags, tables);

                Scored {
                    entrant,
                    breakdown: ScoreBreakdown {
                        baseline,
                        before_info,
                        integration_mode,
                        integrated_total,
                        confidence_tier,
                        completeness: before_info.completeness,
                        pattern_multiplier: patterns.multiplier,
                        matched_patterns: patterns.matched,
                        final_score: integrated_total * patterns.multiplier,
                    },
                }
            })
            .collect()
    }

    /// Loads a race, predicts it and, when ranked, writes it to `sink`.
    ///
    /// # Errors
    /// Returns an error when the race is unknown, loading fails or the
    /// write fails.
    pub fn predict_and_persist<R, S>(
        &self,
        repository: &R,
        sink: &mut S,
        race_id: &RaceId,
        flags: &FeatureFlags,
        tables: &dyn TableProvider,
    ) -> Result<RacePrediction>
    where
        R: RaceRepository + ?Sized,
        S: PredictionSink + ?Sized,
    {
        let bundle = repository
            .load_race_bundle(race_id)
            .with_context(|| format!("failed to load race {race_id}"))?
            .ok_or_else(|| anyhow!("race not found: {race_id}"))?;
        let prediction = self.predict_race(&bundle, flags, tables)?;
        if prediction.is_ranked() {
            sink.write_prediction(&prediction)
                .with_context(|| format!("failed to persist prediction for {race_id}"))?;
            info!(race_id = %race_id, "prediction persisted");
        }
        Ok(prediction)
    }
}

/// Higher final score first, then the lower lane.
fn finishing_order(lhs: (f64, u8), rhs: (f64, u8)) -> Ordering {
    rhs.0.total_cmp(&lhs.0).then(lhs.1.cmp(&rhs.1))
}

/// Fails closed on short or malformed fields.
fn check_field(bundle: &RaceBundle) -> Result<(), PredictionStatus> {
    if bundle.entrants.len() < FIELD_SIZE {
        return Err(PredictionStatus::InsufficientEntrants {
            found: bundle.entrants.len(),
        });
    }
    let mut lanes = BTreeSet::new();
    for entrant in &bundle.entrants {
        if !(MIN_LANE..=MAX_LANE).contains(&entrant.lane) {
            return Err(PredictionStatus::InvalidEntrants {
                reason: format!("lane {} out of range", entrant.lane),
            });
        }
        if !lanes.insert(entrant.lane) {
            return Err(PredictionStatus::InvalidEntrants {
                reason: format!("duplicate lane {}", entrant.lane),
            });
        }
        if entrant.race_id != bundle.race.race_id {
            return Err(PredictionStatus::InvalidEntrants {
                reason: format!("lane {} belongs to {}", entrant.lane, entrant.race_id),
            });
        }
    }
    Ok(())
}
