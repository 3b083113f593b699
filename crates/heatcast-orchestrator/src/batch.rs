use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::mpsc;
use std::thread;

use anyhow::{Context, Result};
use heatcast_domain::{
    format_date, format_rfc3339, now_utc, BatchRunId, FeatureFlags, PredictionSink,
    PredictionStatus, RaceBundle, RaceId, RacePrediction, RaceRepository,
};
use heatcast_tables::TableProvider;
use serde::{Deserialize, Serialize};
use time::Date;
use tracing::{info, warn};

use crate::Pipeline;

pub const BATCH_REPORT_CONTRACT_VERSION: &str = "batch_report.v1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub workers: usize,
    /// Only races on this date; every stored race when `None`.
    pub race_date: Option<Date>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, NonZeroUsize::get),
            race_date: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotFound,
    LoadFailed,
    InsufficientEntrants,
    InvalidEntrants,
    PersistFailed,
}

impl SkipReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::LoadFailed => "load_failed",
            Self::InsufficientEntrants => "insufficient_entrants",
            Self::InvalidEntrants => "invalid_entrants",
            Self::PersistFailed => "persist_failed",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchFailure {
    pub race_id: RaceId,
    pub reason: SkipReason,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BatchReport {
    pub contract_version: String,
    pub run_id: BatchRunId,
    pub race_date: Option<String>,
    pub tables_version: String,
    pub flags_digest: String,
    pub started_at: String,
    pub finished_at: String,
    pub attempted: usize,
    pub predicted: usize,
    pub skipped: usize,
    pub skip_counts: BTreeMap<SkipReason, usize>,
    pub failures: Vec<BatchFailure>,
}

impl BatchReport {
    fn skip(&mut self, race_id: RaceId, reason: SkipReason, detail: String) {
        warn!(race_id = %race_id, reason = reason.as_str(), detail = %detail, "race skipped");
        self.skipped += 1;
        *self.skip_counts.entry(reason).or_insert(0) += 1;
        self.failures.push(BatchFailure {
            race_id,
            reason,
            detail,
        });
    }

    fn absorb<S: PredictionSink + ?Sized>(&mut self, prediction: RacePrediction, sink: &mut S) {
        match &prediction.status {
            PredictionStatus::Ranked => match sink.write_prediction(&prediction) {
                Ok(()) => self.predicted += 1,
                Err(err) => self.skip(prediction.race_id, SkipReason::PersistFailed, format!("{err:#}")),
            },
            PredictionStatus::InsufficientEntrants { found } => {
                let detail = format!("found {found} entrants");
                self.skip(prediction.race_id, SkipReason::InsufficientEntrants, detail);
            }
            PredictionStatus::InvalidEntrants { reason } => {
                let detail = reason.clone();
                self.skip(prediction.race_id, SkipReason::InvalidEntrants, detail);
            }
        }
    }
}

/// Predicts every stored race (optionally one date) and persists the ranked ones.
///
/// Bundles are loaded up front, scored on `config.workers` scoped threads and
/// written from the calling thread. A race that fails to load, rank or
/// persist is skipped and counted; only listing the races is fatal.
///
/// # Errors
/// Returns an error when races cannot be listed or timestamps cannot be formatted.
pub fn run_batch<R, S>(
    repository: &R,
    sink: &mut S,
    pipeline: &Pipeline,
    flags: &FeatureFlags,
    tables: &dyn TableProvider,
    config: &BatchConfig,
) -> Result<BatchReport>
where
    R: RaceRepository + ?Sized,
    S: PredictionSink + ?Sized,
{
    let run_id = BatchRunId::new();
    let started_at = format_rfc3339(now_utc())?;
    let race_ids = repository
        .list_race_ids(config.race_date)
        .context("failed to list races for batch")?;

    let mut report = BatchReport {
        contract_version: BATCH_REPORT_CONTRACT_VERSION.to_string(),
        run_id,
        race_date: config.race_date.map(format_date).transpose()?,
        tables_version: tables.version().to_string(),
        flags_digest: flags.digest(),
        started_at: started_at.clone(),
        finished_at: String::new(),
        attempted: race_ids.len(),
        predicted: 0,
        skipped: 0,
        skip_counts: BTreeMap::new(),
        failures: Vec::new(),
    };

    let mut bundles: Vec<RaceBundle> = Vec::with_capacity(race_ids.len());
    for race_id in race_ids {
        match repository.load_race_bundle(&race_id) {
            Ok(Some(bundle)) => bundles.push(bundle),
            Ok(None) => report.skip(race_id, SkipReason::NotFound, "race not found".to_string()),
            Err(err) => report.skip(race_id, SkipReason::LoadFailed, format!("{err:#}")),
        }
    }

    let workers = config.workers.clamp(1, bundles.len().max(1));
    let chunk_size = bundles.len().div_ceil(workers).max(1);
    info!(
        run_id = %run_id,
        races = report.attempted,
        loaded = bundles.len(),
        workers,
        "batch started"
    );

    let generated_at = started_at.as_str();
    thread::scope(|scope| {
        let (sender, receiver) = mpsc::channel::<RacePrediction>();
        for chunk in bundles.chunks(chunk_size) {
            let sender = sender.clone();
            scope.spawn(move || {
                for bundle in chunk {
                    let prediction = pipeline.predict_race_at(bundle, flags, tables, generated_at);
                    if sender.send(prediction).is_err() {
                        break;
                    }
                }
            });
        }
        drop(sender);

        for prediction in receiver {
            report.absorb(prediction, sink);
        }
    });

    report
        .failures
        .sort_by(|lhs, rhs| lhs.race_id.cmp(&rhs.race_id));
    report.finished_at = format_rfc3339(now_utc())?;
    info!(
        run_id = %run_id,
        predicted = report.predicted,
        skipped = report.skipped,
        "batch finished"
    );
    Ok(report)
}
