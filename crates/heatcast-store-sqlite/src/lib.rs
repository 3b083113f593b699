#![forbid(unsafe_code)]
#![allow(clippy::missing_errors_doc)]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use heatcast_domain::{
    format_date, format_rfc3339, now_utc, parse_date, BeforeInfoSnapshot, ClassRank, Entrant,
    EntrantBeforeInfo, PartReplacement, PredictionRecord, PredictionSink, PreviousHeat, Race,
    RaceBundle, RaceId, RacePrediction, RaceRepository, RaceResult, Weather, WeatherCondition,
    WindDirection,
};
use heatcast_tables::{StaticTables, TablesDocument};
use rusqlite::{params, Connection, OptionalExtension};
use time::Date;
use tracing::{debug, info};

const RACE_MIGRATION_VERSION: i64 = 1;

const SCHEMA_RACES_V1: &str = r"
CREATE TABLE IF NOT EXISTS races (
  race_id TEXT PRIMARY KEY,
  venue INTEGER NOT NULL CHECK (venue >= 1),
  race_date TEXT NOT NULL,
  heat_number INTEGER NOT NULL CHECK (heat_number BETWEEN 1 AND 12),
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_races_date ON races(race_date, venue, heat_number);

CREATE TABLE IF NOT EXISTS entrants (
  race_id TEXT NOT NULL,
  lane INTEGER NOT NULL CHECK (lane BETWEEN 1 AND 6),
  competitor_id INTEGER NOT NULL,
  class_rank TEXT CHECK (class_rank IN ('A1','A2','B1','B2') OR class_rank IS NULL),
  win_rate REAL,
  local_win_rate REAL,
  place_rate REAL,
  equipment_id INTEGER,
  equipment_second_rate REAL,
  average_reaction_time REAL,
  flying_count INTEGER NOT NULL DEFAULT 0,
  late_count INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (race_id, lane),
  FOREIGN KEY (race_id) REFERENCES races(race_id)
);

CREATE TABLE IF NOT EXISTS before_info (
  race_id TEXT NOT NULL,
  lane INTEGER NOT NULL CHECK (lane BETWEEN 1 AND 6),
  trial_time REAL,
  reaction_timing REAL,
  actual_lane INTEGER,
  tilt_angle REAL,
  parts_replaced_json TEXT,
  added_weight REAL,
  previous_lane INTEGER,
  previous_timing REAL,
  previous_rank INTEGER,
  has_previous INTEGER NOT NULL DEFAULT 0 CHECK (has_previous IN (0, 1)),
  PRIMARY KEY (race_id, lane),
  FOREIGN KEY (race_id) REFERENCES races(race_id)
);

CREATE TABLE IF NOT EXISTS race_weather (
  race_id TEXT PRIMARY KEY,
  temperature REAL,
  water_temperature REAL,
  wind_speed REAL,
  wind_direction TEXT CHECK (
    wind_direction IN ('calm','headwind','tailwind','crosswind') OR wind_direction IS NULL
  ),
  wave_height REAL,
  condition TEXT CHECK (
    condition IN ('clear','cloudy','rain','snow','fog') OR condition IS NULL
  ),
  FOREIGN KEY (race_id) REFERENCES races(race_id)
);

CREATE TABLE IF NOT EXISTS race_results (
  race_id TEXT NOT NULL,
  lane INTEGER NOT NULL CHECK (lane BETWEEN 1 AND 6),
  finish_rank INTEGER CHECK (finish_rank BETWEEN 1 AND 6 OR finish_rank IS NULL),
  PRIMARY KEY (race_id, lane),
  FOREIGN KEY (race_id) REFERENCES races(race_id)
);

CREATE TABLE IF NOT EXISTS predictions (
  race_id TEXT PRIMARY KEY,
  contract_version TEXT NOT NULL,
  status TEXT NOT NULL,
  tables_version TEXT NOT NULL,
  flags_digest TEXT NOT NULL,
  generated_at TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  FOREIGN KEY (race_id) REFERENCES races(race_id)
);

CREATE TABLE IF NOT EXISTS prediction_records (
  race_id TEXT NOT NULL,
  lane INTEGER NOT NULL CHECK (lane BETWEEN 1 AND 6),
  competitor_id INTEGER NOT NULL,
  predicted_rank INTEGER NOT NULL CHECK (predicted_rank BETWEEN 1 AND 6),
  final_score REAL NOT NULL,
  confidence_tier TEXT NOT NULL CHECK (confidence_tier IN ('A','B','C','D','E')),
  integration_mode TEXT NOT NULL,
  breakdown_json TEXT NOT NULL,
  generated_at TEXT NOT NULL,
  PRIMARY KEY (race_id, lane),
  FOREIGN KEY (race_id) REFERENCES predictions(race_id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_prediction_records_rank
  ON prediction_records(race_id, predicted_rank);

CREATE TABLE IF NOT EXISTS lookup_tables (
  version TEXT PRIMARY KEY,
  document_json TEXT NOT NULL,
  stored_at TEXT NOT NULL
);
";

pub struct SqliteRaceStore {
    conn: Connection,
}

impl SqliteRaceStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Creates the schema when missing. Safe to run repeatedly.
    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_RACES_V1)
            .context("failed to apply race schema")?;

        let now = timestamp()?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![RACE_MIGRATION_VERSION, now],
            )
            .context("failed to register race schema migration")?;
        if inserted > 0 {
            info!(version = RACE_MIGRATION_VERSION, "schema migration applied");
        }

        Ok(())
    }

    pub fn schema_version(&self) -> Result<Option<i64>> {
        self.conn
            .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
            .context("failed to read schema version")
    }

    /// Inserts a race; an existing race must carry identical facts.
    pub fn upsert_race(&self, race: &Race) -> Result<()> {
        upsert_race_row(&self.conn, race)
    }

    pub fn upsert_entrant(&self, entrant: &Entrant) -> Result<()> {
        upsert_entrant_row(&self.conn, entrant)
    }

    pub fn upsert_before_info(&self, race_id: &RaceId, entry: &EntrantBeforeInfo) -> Result<()> {
        upsert_before_info_row(&self.conn, race_id, entry)
    }

    pub fn upsert_weather(&self, race_id: &RaceId, weather: &Weather) -> Result<()> {
        upsert_weather_row(&self.conn, race_id, weather)
    }

    pub fn record_result(&self, race_id: &RaceId, result: &RaceResult) -> Result<()> {
        record_result_row(&self.conn, race_id, result)
    }

    /// Validates and stores a full bundle in one transaction. A re-import
    /// replaces the race's entrants, before-info, weather and results, so
    /// rows absent from the new bundle do not survive.
    pub fn import_bundle(&mut self, bundle: &RaceBundle) -> Result<()> {
        bundle
            .validate()
            .map_err(|err| anyhow!("race bundle validation failed: {err}"))?;

        let race_id = &bundle.race.race_id;
        let tx = self
            .conn
            .transaction()
            .context("failed to start import transaction")?;

        upsert_race_row(&tx, &bundle.race)?;
        clear_race_facts(&tx, race_id)?;
        for entrant in &bundle.entrants {
            upsert_entrant_row(&tx, entrant)?;
        }
        if let Some(snapshot) = &bundle.before_info {
            if let Some(weather) = &snapshot.weather {
                upsert_weather_row(&tx, race_id, weather)?;
            }
            for entry in &snapshot.entries {
                upsert_before_info_row(&tx, race_id, entry)?;
            }
        }
        for result in &bundle.results {
            record_result_row(&tx, race_id, result)?;
        }

        tx.commit().context("failed to commit import transaction")?;
        info!(
            race_id = %race_id,
            entrants = bundle.entrants.len(),
            has_before_info = bundle.before_info.is_some(),
            "race bundle imported"
        );
        Ok(())
    }

    pub fn load_race(&self, race_id: &RaceId) -> Result<Option<Race>> {
        let row = self
            .conn
            .query_row(
                "SELECT race_id, venue, race_date, heat_number FROM races WHERE race_id = ?1",
                params![race_id.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
            .with_context(|| format!("failed to query race {race_id}"))?;

        let Some((id, venue, race_date, heat_number)) = row else {
            return Ok(None);
        };
        Ok(Some(Race {
            race_id: RaceId(id),
            venue: u8_column("venue", venue)?,
            race_date: parse_date(&race_date)
                .map_err(|err| anyhow!("invalid stored race_date for {race_id}: {err}"))?,
            heat_number: u8_column("heat_number", heat_number)?,
        }))
    }

    pub fn load_entrants(&self, race_id: &RaceId) -> Result<Vec<Entrant>> {
        let mut stmt = self.conn.prepare(
            "SELECT lane, competitor_id, class_rank, win_rate, local_win_rate, place_rate,
                    equipment_id, equipment_second_rate, average_reaction_time,
                    flying_count, late_count
             FROM entrants WHERE race_id = ?1 ORDER BY lane ASC",
        )?;
        let rows = stmt.query_map(params![race_id.as_str()], |row| {
            let class_rank: Option<String> = row.get(2)?;
            Ok(Entrant {
                race_id: race_id.clone(),
                lane: sql_u8(row.get(0)?)?,
                competitor_id: sql_u32(row.get(1)?)?,
                class_rank: class_rank
                    .map(|raw| ClassRank::parse(&raw).ok_or_else(|| invalid_text("class_rank", &raw)))
                    .transpose()?,
                win_rate: row.get(3)?,
                local_win_rate: row.get(4)?,
                place_rate: row.get(5)?,
                equipment_id: row.get::<_, Option<i64>>(6)?.map(sql_u32).transpose()?,
                equipment_second_rate: row.get(7)?,
                average_reaction_time: row.get(8)?,
                flying_count: sql_u32(row.get(9)?)?,
                late_count: sql_u32(row.get(10)?)?,
            })
        })?;
        collect_rows(rows).with_context(|| format!("failed to load entrants for {race_id}"))
    }

    pub fn load_before_info(&self, race_id: &RaceId) -> Result<Option<BeforeInfoSnapshot>> {
        let weather = self
            .conn
            .query_row(
                "SELECT temperature, water_temperature, wind_speed, wind_direction,
                        wave_height, condition
                 FROM race_weather WHERE race_id = ?1",
                params![race_id.as_str()],
                |row| {
                    let direction: Option<String> = row.get(3)?;
                    let condition: Option<String> = row.get(5)?;
                    Ok(Weather {
                        temperature: row.get(0)?,
                        water_temperature: row.get(1)?,
                        wind_speed: row.get(2)?,
                        wind_direction: direction
                            .map(|raw| {
                                WindDirection::parse(&raw)
                                    .ok_or_else(|| invalid_text("wind_direction", &raw))
                            })
                            .transpose()?,
                        wave_height: row.get(4)?,
                        condition: condition
                            .map(|raw| {
                                WeatherCondition::parse(&raw)
                                    .ok_or_else(|| invalid_text("condition", &raw))
                            })
                            .transpose()?,
                    })
                },
            )
            .optional()
            .with_context(|| format!("failed to load weather for {race_id}"))?;

        let mut stmt = self.conn.prepare(
            "SELECT lane, trial_time, reaction_timing, actual_lane, tilt_angle,
                    parts_replaced_json, added_weight,
                    previous_lane, previous_timing, previous_rank, has_previous
             FROM before_info WHERE race_id = ?1 ORDER BY lane ASC",
        )?;
        let rows = stmt.query_map(params![race_id.as_str()], |row| {
            let parts_json: Option<String> = row.get(5)?;
            let has_previous: i64 = row.get(10)?;
            let previous_heat = if has_previous == 1 {
                Some(PreviousHeat {
                    lane: row.get::<_, Option<i64>>(7)?.map(sql_u8).transpose()?,
                    timing: row.get(8)?,
                    rank: row.get::<_, Option<i64>>(9)?.map(sql_u8).transpose()?,
                })
            } else {
                None
            };
            Ok(EntrantBeforeInfo {
                lane: sql_u8(row.get(0)?)?,
                trial_time: row.get(1)?,
                reaction_timing: row.get(2)?,
                actual_lane: row.get::<_, Option<i64>>(3)?.map(sql_u8).transpose()?,
                tilt_angle: row.get(4)?,
                parts_replaced: parts_json.map(|raw| decode_parts(&raw)).transpose()?,
                added_weight: row.get(6)?,
                previous_heat,
            })
        })?;
        let entries = collect_rows(rows)
            .with_context(|| format!("failed to load before-info for {race_id}"))?;

        if weather.is_none() && entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(BeforeInfoSnapshot { weather, entries }))
    }

    pub fn load_results(&self, race_id: &RaceId) -> Result<Vec<RaceResult>> {
        let mut stmt = self.conn.prepare(
            "SELECT lane, finish_rank FROM race_results WHERE race_id = ?1 ORDER BY lane ASC",
        )?;
        let rows = stmt.query_map(params![race_id.as_str()], |row| {
            Ok(RaceResult {
                lane: sql_u8(row.get(0)?)?,
                finish_rank: row.get::<_, Option<i64>>(1)?.map(sql_u8).transpose()?,
            })
        })?;
        collect_rows(rows).with_context(|| format!("failed to load results for {race_id}"))
    }

    pub fn load_race_bundle(&self, race_id: &RaceId) -> Result<Option<RaceBundle>> {
        let Some(race) = self.load_race(race_id)? else {
            return Ok(None);
        };
        Ok(Some(RaceBundle {
            entrants: self.load_entrants(race_id)?,
            before_info: self.load_before_info(race_id)?,
            results: self.load_results(race_id)?,
            race,
        }))
    }

    pub fn list_race_ids(&self, race_date: Option<Date>) -> Result<Vec<RaceId>> {
        let ids = match race_date {
            Some(date) => {
                let date = format_date(date).map_err(|err| anyhow!(err.to_string()))?;
                let mut stmt = self.conn.prepare(
                    "SELECT race_id FROM races WHERE race_date = ?1
                     ORDER BY venue ASC, heat_number ASC",
                )?;
                let rows = stmt.query_map(params![date], |row| row.get::<_, String>(0))?;
                collect_rows(rows)?
            }
            None => {
                let mut stmt = self.conn.prepare(
                    "SELECT race_id FROM races ORDER BY race_date ASC, venue ASC, heat_number ASC",
                )?;
                let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
                collect_rows(rows)?
            }
        };
        Ok(ids.into_iter().map(RaceId).collect())
    }

    /// Replaces any earlier prediction for the race in one transaction.
    pub fn write_prediction(&mut self, prediction: &RacePrediction) -> Result<()> {
        let race_id = prediction.race_id.as_str();
        let payload =
            serde_json::to_string(prediction).context("failed to serialize prediction")?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start prediction transaction")?;

        tx.execute(
            "DELETE FROM prediction_records WHERE race_id = ?1",
            params![race_id],
        )
        .context("failed to clear previous prediction records")?;
        tx.execute("DELETE FROM predictions WHERE race_id = ?1", params![race_id])
            .context("failed to clear previous prediction")?;

        tx.execute(
            "INSERT INTO predictions(
                race_id, contract_version, status, tables_version, flags_digest,
                generated_at, payload_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                race_id,
                prediction.contract_version,
                prediction.status.as_str(),
                prediction.tables_version,
                prediction.flags_digest,
                prediction.generated_at,
                payload,
            ],
        )
        .with_context(|| format!("failed to insert prediction for {race_id}"))?;

        for record in &prediction.records {
            let breakdown = serde_json::to_string(&record.breakdown)
                .context("failed to serialize score breakdown")?;
            tx.execute(
                "INSERT INTO prediction_records(
                    race_id, lane, competitor_id, predicted_rank, final_score,
                    confidence_tier, integration_mode, breakdown_json, generated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    race_id,
                    i64::from(record.lane),
                    i64::from(record.competitor_id),
                    i64::from(record.predicted_rank),
                    record.final_score,
                    record.confidence_tier.as_str(),
                    record.integration_mode.as_str(),
                    breakdown,
                    record.generated_at,
                ],
            )
            .with_context(|| format!("failed to insert prediction record lane {}", record.lane))?;
        }

        tx.commit().context("failed to commit prediction transaction")?;
        debug!(race_id, records = prediction.records.len(), "prediction stored");
        Ok(())
    }

    /// Latest stored prediction for the race, as written.
    pub fn load_prediction(&self, race_id: &RaceId) -> Result<Option<RacePrediction>> {
        let payload = self
            .conn
            .query_row(
                "SELECT payload_json FROM predictions WHERE race_id = ?1",
                params![race_id.as_str()],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to query prediction for {race_id}"))?;
        payload
            .map(|raw| serde_json::from_str(&raw).context("invalid stored prediction JSON"))
            .transpose()
    }

    /// Stored per-entrant records ordered by predicted rank.
    pub fn list_predictions(&self, race_id: &RaceId) -> Result<Vec<PredictionRecord>> {
        let Some(prediction) = self.load_prediction(race_id)? else {
            return Ok(Vec::new());
        };
        let mut stmt = self.conn.prepare(
            "SELECT lane FROM prediction_records WHERE race_id = ?1 ORDER BY predicted_rank ASC",
        )?;
        let rows = stmt.query_map(params![race_id.as_str()], |row| sql_u8(row.get(0)?))?;
        let lanes = collect_rows(rows)?;

        lanes
            .into_iter()
            .map(|lane| {
                prediction
                    .records
                    .iter()
                    .find(|record| record.lane == lane)
                    .cloned()
                    .ok_or_else(|| anyhow!("prediction payload for {race_id} lacks lane {lane}"))
            })
            .collect()
    }

    /// Stores a tables version. Versions are immutable: storing the same
    /// document again is a no-op, a different document under a stored
    /// version is an error.
    pub fn store_tables(&self, tables: &StaticTables) -> Result<()> {
        let document = tables.document();
        let payload =
            serde_json::to_string(document).context("failed to serialize lookup tables")?;

        let existing = self
            .conn
            .query_row(
                "SELECT document_json FROM lookup_tables WHERE version = ?1",
                params![document.version],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to query lookup tables {}", document.version))?;
        match existing {
            Some(stored) if stored == payload => {
                debug!(version = %document.version, "lookup tables already stored");
                return Ok(());
            }
            Some(_) => {
                return Err(anyhow!(
                    "lookup tables {} already stored with a different document",
                    document.version
                ));
            }
            None => {}
        }

        self.conn
            .execute(
                "INSERT INTO lookup_tables(version, document_json, stored_at)
                 VALUES (?1, ?2, ?3)",
                params![document.version, payload, timestamp()?],
            )
            .context("failed to store lookup tables")?;
        info!(version = %document.version, "lookup tables stored");
        Ok(())
    }

    pub fn load_tables(&self, version: &str) -> Result<Option<StaticTables>> {
        let payload = self
            .conn
            .query_row(
                "SELECT document_json FROM lookup_tables WHERE version = ?1",
                params![version],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .with_context(|| format!("failed to query lookup tables {version}"))?;
        let Some(raw) = payload else {
            return Ok(None);
        };
        let document: TablesDocument =
            serde_json::from_str(&raw).context("invalid stored lookup tables JSON")?;
        StaticTables::from_document(document)
            .map(Some)
            .map_err(|err| anyhow!("stored lookup tables {version} are invalid: {err}"))
    }

    pub fn list_table_versions(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT version FROM lookup_tables ORDER BY version ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        collect_rows(rows)
    }
}

impl RaceRepository for SqliteRaceStore {
    fn load_race_bundle(&self, race_id: &RaceId) -> Result<Option<RaceBundle>> {
        SqliteRaceStore::load_race_bundle(self, race_id)
    }

    fn list_race_ids(&self, race_date: Option<Date>) -> Result<Vec<RaceId>> {
        SqliteRaceStore::list_race_ids(self, race_date)
    }
}

impl PredictionSink for SqliteRaceStore {
    fn write_prediction(&mut self, prediction: &RacePrediction) -> Result<()> {
        SqliteRaceStore::write_prediction(self, prediction)
    }
}

fn upsert_race_row(conn: &Connection, race: &Race) -> Result<()> {
    race.validate()
        .map_err(|err| anyhow!("race validation failed: {err}"))?;
    let race_date = format_date(race.race_date).map_err(|err| anyhow!(err.to_string()))?;
    conn.execute(
        "INSERT INTO races(race_id, venue, race_date, heat_number, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(race_id) DO NOTHING",
        params![
            race.race_id.as_str(),
            i64::from(race.venue),
            race_date,
            i64::from(race.heat_number),
            timestamp()?,
        ],
    )
    .with_context(|| format!("failed to insert race {}", race.race_id))?;

    let stored: (i64, String, i64) = conn
        .query_row(
            "SELECT venue, race_date, heat_number FROM races WHERE race_id = ?1",
            params![race.race_id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .with_context(|| format!("failed to read back race {}", race.race_id))?;
    if stored != (i64::from(race.venue), race_date, i64::from(race.heat_number)) {
        return Err(anyhow!(
            "race {} already exists with different venue, date or heat",
            race.race_id
        ));
    }
    Ok(())
}

fn clear_race_facts(conn: &Connection, race_id: &RaceId) -> Result<()> {
    for table in ["entrants", "before_info", "race_weather", "race_results"] {
        conn.execute(
            &format!("DELETE FROM {table} WHERE race_id = ?1"),
            params![race_id.as_str()],
        )
        .with_context(|| format!("failed to clear {table} for {race_id}"))?;
    }
    Ok(())
}

fn upsert_entrant_row(conn: &Connection, entrant: &Entrant) -> Result<()> {
    entrant
        .validate()
        .map_err(|err| anyhow!("entrant validation failed: {err}"))?;
    conn.execute(
        "INSERT INTO entrants(
            race_id, lane, competitor_id, class_rank, win_rate, local_win_rate, place_rate,
            equipment_id, equipment_second_rate, average_reaction_time, flying_count, late_count
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(race_id, lane) DO UPDATE SET
           competitor_id = excluded.competitor_id,
           class_rank = excluded.class_rank,
           win_rate = excluded.win_rate,
           local_win_rate = excluded.local_win_rate,
           place_rate = excluded.place_rate,
           equipment_id = excluded.equipment_id,
           equipment_second_rate = excluded.equipment_second_rate,
           average_reaction_time = excluded.average_reaction_time,
           flying_count = excluded.flying_count,
           late_count = excluded.late_count",
        params![
            entrant.race_id.as_str(),
            i64::from(entrant.lane),
            i64::from(entrant.competitor_id),
            entrant.class_rank.map(ClassRank::as_str),
            entrant.win_rate,
            entrant.local_win_rate,
            entrant.place_rate,
            entrant.equipment_id.map(i64::from),
            entrant.equipment_second_rate,
            entrant.average_reaction_time,
            i64::from(entrant.flying_count),
            i64::from(entrant.late_count),
        ],
    )
    .with_context(|| {
        format!(
            "failed to upsert entrant {} lane {}",
            entrant.race_id, entrant.lane
        )
    })?;
    Ok(())
}

fn upsert_before_info_row(
    conn: &Connection,
    race_id: &RaceId,
    entry: &EntrantBeforeInfo,
) -> Result<()> {
    let parts = entry
        .parts_replaced
        .as_ref()
        .map(|parts| {
            let names: Vec<&str> = parts.iter().map(|part| part.as_str()).collect();
            serde_json::to_string(&names)
        })
        .transpose()
        .context("failed to serialize replaced parts")?;
    let previous = entry.previous_heat.as_ref();
    conn.execute(
        "INSERT INTO before_info(
            race_id, lane, trial_time, reaction_timing, actual_lane, tilt_angle,
            parts_replaced_json, added_weight, previous_lane, previous_timing, previous_rank,
            has_previous
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(race_id, lane) DO UPDATE SET
           trial_time = excluded.trial_time,
           reaction_timing = excluded.reaction_timing,
           actual_lane = excluded.actual_lane,
           tilt_angle = excluded.tilt_angle,
           parts_replaced_json = excluded.parts_replaced_json,
           added_weight = excluded.added_weight,
           previous_lane = excluded.previous_lane,
           previous_timing = excluded.previous_timing,
           previous_rank = excluded.previous_rank,
           has_previous = excluded.has_previous",
        params![
            race_id.as_str(),
            i64::from(entry.lane),
            entry.trial_time,
            entry.reaction_timing,
            entry.actual_lane.map(i64::from),
            entry.tilt_angle,
            parts,
            entry.added_weight,
            previous.and_then(|heat| heat.lane).map(i64::from),
            previous.and_then(|heat| heat.timing),
            previous.and_then(|heat| heat.rank).map(i64::from),
            i64::from(previous.is_some()),
        ],
    )
    .with_context(|| format!("failed to upsert before-info {race_id} lane {}", entry.lane))?;
    Ok(())
}

fn upsert_weather_row(conn: &Connection, race_id: &RaceId, weather: &Weather) -> Result<()> {
    conn.execute(
        "INSERT INTO race_weather(
            race_id, temperature, water_temperature, wind_speed, wind_direction,
            wave_height, condition
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(race_id) DO UPDATE SET
           temperature = excluded.temperature,
           water_temperature = excluded.water_temperature,
           wind_speed = excluded.wind_speed,
           wind_direction = excluded.wind_direction,
           wave_height = excluded.wave_height,
           condition = excluded.condition",
        params![
            race_id.as_str(),
            weather.temperature,
            weather.water_temperature,
            weather.wind_speed,
            weather.wind_direction.map(WindDirection::as_str),
            weather.wave_height,
            weather.condition.map(WeatherCondition::as_str),
        ],
    )
    .with_context(|| format!("failed to upsert weather for {race_id}"))?;
    Ok(())
}

fn record_result_row(conn: &Connection, race_id: &RaceId, result: &RaceResult) -> Result<()> {
    conn.execute(
        "INSERT INTO race_results(race_id, lane, finish_rank) VALUES (?1, ?2, ?3)
         ON CONFLICT(race_id, lane) DO UPDATE SET finish_rank = excluded.finish_rank",
        params![
            race_id.as_str(),
            i64::from(result.lane),
            result.finish_rank.map(i64::from),
        ],
    )
    .with_context(|| format!("failed to record result {race_id} lane {}", result.lane))?;
    Ok(())
}

fn timestamp() -> Result<String> {
    format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))
}

fn u8_column(column: &str, value: i64) -> Result<u8> {
    u8::try_from(value).with_context(|| format!("invalid stored {column}: {value}"))
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Integer,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn sql_u8(value: i64) -> rusqlite::Result<u8> {
    u8::try_from(value).map_err(|_| conversion_error(format!("value {value} out of range for u8")))
}

fn sql_u32(value: i64) -> rusqlite::Result<u32> {
    u32::try_from(value).map_err(|_| conversion_error(format!("value {value} out of range for u32")))
}

fn invalid_text(column: &str, raw: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid {column}: {raw}"),
        )),
    )
}

fn decode_parts(raw: &str) -> rusqlite::Result<Vec<PartReplacement>> {
    let names: Vec<String> =
        serde_json::from_str(raw).map_err(|err| invalid_text("parts_replaced_json", &err.to_string()))?;
    names
        .iter()
        .map(|name| PartReplacement::parse(name).ok_or_else(|| invalid_text("part", name)))
        .collect()
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use heatcast_domain::{
        ConfidenceTier, IntegrationMode, PredictionStatus, ScoreBreakdown,
        PREDICTION_CONTRACT_VERSION,
    };
    use heatcast_tables::TableProvider;
    use proptest::prelude::*;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn fixture_store() -> SqliteRaceStore {
        let store = must(SqliteRaceStore::open(Path::new(":memory:")));
        must(store.migrate());
        store
    }

    fn fixture_bundle(heat: u8) -> RaceBundle {
        let race_date = must(parse_date("2026-02-07").map_err(|err| anyhow!(err)));
        let race_id = RaceId::compose(race_date, 24, heat);
        RaceBundle {
            race: Race {
                race_id: race_id.clone(),
                venue: 24,
                race_date,
                heat_number: heat,
            },
            entrants: (1..=6_u8)
                .map(|lane| Entrant {
                    race_id: race_id.clone(),
                    lane,
                    competitor_id: 4300 + u32::from(lane),
                    class_rank: if lane == 3 { None } else { Some(ClassRank::UpperMid) },
                    win_rate: Some(6.25),
                    local_win_rate: None,
                    place_rate: Some(41.5),
                    equipment_id: Some(70 + u32::from(lane)),
                    equipment_second_rate: Some(38.0),
                    average_reaction_time: Some(0.16),
                    flying_count: u32::from(lane == 6),
                    late_count: 0,
                })
                .collect(),
            before_info: Some(BeforeInfoSnapshot {
                weather: Some(Weather {
                    temperature: Some(11.5),
                    water_temperature: None,
                    wind_speed: Some(4.0),
                    wind_direction: Some(WindDirection::Tailwind),
                    wave_height: Some(3.0),
                    condition: Some(WeatherCondition::Rain),
                }),
                entries: vec![
                    EntrantBeforeInfo {
                        lane: 1,
                        trial_time: Some(6.74),
                        reaction_timing: Some(0.11),
                        actual_lane: Some(1),
                        tilt_angle: Some(-0.5),
                        parts_replaced: Some(vec![PartReplacement::PistonRing]),
                        added_weight: Some(1.0),
                        previous_heat: Some(PreviousHeat {
                            lane: Some(4),
                            timing: Some(0.13),
                            rank: Some(2),
                        }),
                    },
                    EntrantBeforeInfo {
                        lane: 2,
                        trial_time: Some(6.80),
                        parts_replaced: Some(Vec::new()),
                        ..EntrantBeforeInfo::default()
                    },
                ],
            }),
            results: vec![RaceResult {
                lane: 1,
                finish_rank: Some(1),
            }],
        }
    }

    fn fixture_prediction(bundle: &RaceBundle, generated_at: &str) -> RacePrediction {
        let records = bundle
            .entrants
            .iter()
            .rev()
            .zip(1_u8..)
            .map(|(entrant, predicted_rank)| PredictionRecord {
                race_id: bundle.race.race_id.clone(),
                lane: entrant.lane,
                competitor_id: entrant.competitor_id,
                predicted_rank,
                final_score: 90.0 - f64::from(predicted_rank),
                confidence_tier: ConfidenceTier::C,
                integration_mode: IntegrationMode::BaselineOnly,
                breakdown: ScoreBreakdown {
                    baseline: heatcast_domain::BaselineScores {
                        lane: 10.0,
                        competitor: 20.0,
                        equipment: 5.0,
                        class: 4.0,
                        total: 39.0,
                    },
                    before_info: heatcast_domain::BeforeInfoScores::default(),
                    integration_mode: IntegrationMode::BaselineOnly,
                    integrated_total: 39.0,
                    confidence_tier: ConfidenceTier::C,
                    completeness: 0.0,
                    pattern_multiplier: 1.0,
                    matched_patterns: Vec::new(),
                    final_score: 90.0 - f64::from(predicted_rank),
                },
                generated_at: generated_at.to_string(),
            })
            .collect();
        RacePrediction {
            contract_version: PREDICTION_CONTRACT_VERSION.to_string(),
            race_id: bundle.race.race_id.clone(),
            status: PredictionStatus::Ranked,
            tables_version: "tables.v1".to_string(),
            flags_digest: "abc".to_string(),
            generated_at: generated_at.to_string(),
            records,
        }
    }

    #[test]
    fn migrate_is_idempotent() {
        let store = fixture_store();
        must(store.migrate());
        must(store.migrate());
        assert_eq!(must(store.schema_version()), Some(RACE_MIGRATION_VERSION));
    }

    #[test]
    fn imported_bundle_loads_back_identically() {
        let mut store = fixture_store();
        let bundle = fixture_bundle(1);
        must(store.import_bundle(&bundle));

        let loaded = must(store.load_race_bundle(&bundle.race.race_id));
        assert_eq!(loaded, Some(bundle));
    }

    #[test]
    fn unknown_race_loads_as_none() {
        let store = fixture_store();
        let missing = RaceId("20260207-01-01".to_string());
        assert_eq!(must(store.load_race_bundle(&missing)), None);
    }

    #[test]
    fn race_facts_are_immutable() {
        let mut store = fixture_store();
        let bundle = fixture_bundle(2);
        must(store.import_bundle(&bundle));

        let mut altered = bundle.race.clone();
        altered.venue = 3;
        assert!(store.upsert_race(&altered).is_err());
        assert!(store.upsert_race(&bundle.race).is_ok());
    }

    #[test]
    fn invalid_bundle_writes_nothing() {
        let mut store = fixture_store();
        let mut bundle = fixture_bundle(3);
        bundle.entrants[4].win_rate = Some(42.0);
        assert!(store.import_bundle(&bundle).is_err());
        assert_eq!(must(store.load_race(&bundle.race.race_id)), None);
    }

    #[test]
    fn list_race_ids_filters_by_date() {
        let mut store = fixture_store();
        must(store.import_bundle(&fixture_bundle(2)));
        must(store.import_bundle(&fixture_bundle(1)));

        let mut other_day = fixture_bundle(1);
        other_day.race.race_date = must(parse_date("2026-02-08").map_err(|err| anyhow!(err)));
        let race_id = RaceId::compose(other_day.race.race_date, 24, 1);
        other_day.race.race_id = race_id.clone();
        for entrant in &mut other_day.entrants {
            entrant.race_id = race_id.clone();
        }
        must(store.import_bundle(&other_day));

        let day = must(parse_date("2026-02-07").map_err(|err| anyhow!(err)));
        let ids: Vec<String> = must(store.list_race_ids(Some(day)))
            .into_iter()
            .map(|id| id.0)
            .collect();
        assert_eq!(ids, vec!["20260207-24-01", "20260207-24-02"]);
        assert_eq!(must(store.list_race_ids(None)).len(), 3);
    }

    #[test]
    fn write_prediction_replaces_previous_run() {
        let mut store = fixture_store();
        let bundle = fixture_bundle(1);
        must(store.import_bundle(&bundle));

        must(store.write_prediction(&fixture_prediction(&bundle, "2026-02-07T09:00:00Z")));
        let second = fixture_prediction(&bundle, "2026-02-07T09:30:00Z");
        must(store.write_prediction(&second));

        let loaded = must(store.load_prediction(&bundle.race.race_id));
        assert_eq!(loaded, Some(second.clone()));

        let records = must(store.list_predictions(&bundle.race.race_id));
        assert_eq!(records.len(), 6);
        assert_eq!(records[0].predicted_rank, 1);
        assert_eq!(records[0].lane, 6);
        assert!(records
            .iter()
            .all(|record| record.generated_at == "2026-02-07T09:30:00Z"));

        let row_count: i64 = match store.connection().query_row(
            "SELECT COUNT(*) FROM prediction_records",
            [],
            |row| row.get(0),
        ) {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        };
        assert_eq!(row_count, 6);
    }

    #[test]
    fn prediction_for_unknown_race_is_rejected() {
        let mut store = fixture_store();
        let bundle = fixture_bundle(5);
        assert!(store
            .write_prediction(&fixture_prediction(&bundle, "2026-02-07T09:00:00Z"))
            .is_err());
    }

    #[test]
    fn tables_round_trip_through_store() {
        let store = fixture_store();
        let builtin = StaticTables::builtin_v1();
        must(store.store_tables(&builtin));
        must(store.store_tables(&builtin));

        let loaded = must(store.load_tables(heatcast_tables::BUILTIN_TABLES_VERSION));
        let Some(loaded) = loaded else {
            panic!("stored tables missing");
        };
        assert_eq!(loaded.version(), builtin.version());
        assert_eq!(
            loaded.document().patterns.len(),
            builtin.document().patterns.len()
        );
        assert_eq!(loaded.document().wind.len(), builtin.document().wind.len());
        assert_eq!(
            must(store.list_table_versions()),
            vec![heatcast_tables::BUILTIN_TABLES_VERSION.to_string()]
        );
        assert!(must(store.load_tables("tables.v9")).is_none());
    }

    #[test]
    fn stored_tables_version_cannot_be_replaced() {
        let store = fixture_store();
        let document = |pattern_id: &str, multiplier: f64| {
            let value = serde_json::json!({
                "version": "tables.local",
                "patterns": [
                    {"pattern_id": pattern_id, "key": {"baseline_rank": 1}, "multiplier": multiplier}
                ]
            });
            must(StaticTables::from_json(&value).map_err(anyhow::Error::from))
        };
        must(store.store_tables(&document("A", 1.10)));
        must(store.store_tables(&document("A", 1.10)));

        let Err(err) = store.store_tables(&document("B", 0.60)) else {
            panic!("a different document must not replace a stored version");
        };
        assert!(err.to_string().contains("already stored with a different document"));

        let Some(loaded) = must(store.load_tables("tables.local")) else {
            panic!("stored tables missing");
        };
        let ids: Vec<&str> = loaded
            .document()
            .patterns
            .iter()
            .map(|pattern| pattern.pattern_id.as_str())
            .collect();
        assert_eq!(ids, vec!["A"]);
    }

    #[test]
    fn reimport_replaces_stale_race_facts() {
        let mut store = fixture_store();
        let full = fixture_bundle(5);
        must(store.import_bundle(&full));
        must(store.record_result(
            &full.race.race_id,
            &RaceResult {
                lane: 6,
                finish_rank: Some(2),
            },
        ));

        let mut corrected = full.clone();
        corrected.entrants.retain(|entrant| entrant.lane != 6);
        corrected.before_info = None;
        corrected.results = Vec::new();
        must(store.import_bundle(&corrected));

        let Some(loaded) = must(store.load_race_bundle(&full.race.race_id)) else {
            panic!("re-imported race missing");
        };
        assert_eq!(loaded.entrants.len(), 5);
        assert!(loaded.entrants.iter().all(|entrant| entrant.lane != 6));
        assert!(loaded.before_info.is_none());
        assert!(loaded.results.is_empty());
    }

    #[test]
    fn duplicate_entrant_lane_is_rejected_without_writing() {
        let mut store = fixture_store();
        let mut bundle = fixture_bundle(6);
        bundle.entrants[5].lane = 1;
        let Err(err) = store.import_bundle(&bundle) else {
            panic!("duplicate lanes must be rejected");
        };
        assert!(err.to_string().contains("duplicate entrant lane 1"));
        assert_eq!(must(store.load_race(&bundle.race.race_id)), None);
    }

    #[test]
    fn repository_traits_delegate_to_store() {
        let mut store = fixture_store();
        let bundle = fixture_bundle(4);
        must(store.import_bundle(&bundle));

        let repository: &dyn RaceRepository = &store;
        assert_eq!(must(repository.list_race_ids(None)).len(), 1);

        let sink: &mut dyn PredictionSink = &mut store;
        must(sink.write_prediction(&fixture_prediction(&bundle, "2026-02-07T10:00:00Z")));
        assert_eq!(must(store.list_predictions(&bundle.race.race_id)).len(), 6);
    }

    proptest! {
        #[test]
        fn entrant_rates_survive_storage(
            win in proptest::option::of(0.0_f64..10.0),
            local in proptest::option::of(0.0_f64..10.0),
            equipment in proptest::option::of(0.0_f64..100.0),
            reaction in proptest::option::of(0.05_f64..0.40),
        ) {
            let mut store = fixture_store();
            let mut bundle = fixture_bundle(6);
            bundle.entrants[0].win_rate = win;
            bundle.entrants[0].local_win_rate = local;
            bundle.entrants[0].equipment_second_rate = equipment;
            bundle.entrants[0].average_reaction_time = reaction;
            must(store.import_bundle(&bundle));

            let loaded = must(store.load_entrants(&bundle.race.race_id));
            prop_assert_eq!(&loaded[0], &bundle.entrants[0]);
        }
    }
}
