//! Command surface for the `heatcast` binary.
//!
//! Hosts embed the same behavior through [`run_cli`] for a parsed command
//! line, or [`run_with_store`] against an already open store.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use heatcast_domain::{
    parse_date, parse_flag_override, FeatureFlags, Flag, FlagRiskProfile,
    PredictionRecord, RaceBundle, RaceId, RacePrediction,
};
use heatcast_orchestrator::{run_batch, BatchConfig, BatchReport, Pipeline};
use heatcast_store_sqlite::SqliteRaceStore;
use heatcast_tables::{StaticTables, TableProvider};
use serde::Serialize;
use time::Date;
use tracing::debug;

pub const FLAGS_CONTRACT_VERSION: &str = "flags.v1";

#[derive(Debug, Parser)]
#[command(name = "heatcast")]
#[command(about = "Boat race finishing-order predictor")]
pub struct Cli {
    #[arg(long, default_value = "./heatcast.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Race {
        #[command(subcommand)]
        command: RaceCommand,
    },
    Predict(PredictArgs),
    Batch(BatchArgs),
    Flags {
        #[command(subcommand)]
        command: FlagsCommand,
    },
    Tables {
        #[command(subcommand)]
        command: TablesCommand,
    },
    Predictions {
        #[command(subcommand)]
        command: PredictionsCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    Migrate,
}

#[derive(Debug, Subcommand)]
pub enum RaceCommand {
    Import(FileArgs),
    Show(RaceIdArgs),
}

#[derive(Debug, Args)]
pub struct FileArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct RaceIdArgs {
    #[arg(long)]
    race_id: String,
}

/// Flag layering: defaults, then `--flags` file, then each `--set`.
#[derive(Debug, Args, Default)]
pub struct FlagArgs {
    #[arg(long = "flags")]
    flags_file: Option<PathBuf>,
    #[arg(long = "set", value_name = "NAME=BOOL")]
    overrides: Vec<String>,
}

#[derive(Debug, Args, Default)]
pub struct TableArgs {
    #[arg(long = "tables", conflicts_with = "tables_version")]
    tables_file: Option<PathBuf>,
    #[arg(long)]
    tables_version: Option<String>,
}

#[derive(Debug, Args)]
pub struct PredictArgs {
    #[arg(long)]
    race_id: String,
    #[arg(long)]
    persist: bool,
    #[arg(long)]
    json: bool,
    #[command(flatten)]
    flags: FlagArgs,
    #[command(flatten)]
    tables: TableArgs,
}

#[derive(Debug, Args)]
pub struct BatchArgs {
    #[arg(long)]
    date: Option<String>,
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    json: bool,
    #[command(flatten)]
    flags: FlagArgs,
    #[command(flatten)]
    tables: TableArgs,
}

#[derive(Debug, Subcommand)]
pub enum FlagsCommand {
    List(FlagsListArgs),
}

#[derive(Debug, Args)]
pub struct FlagsListArgs {
    #[arg(long)]
    json: bool,
    #[command(flatten)]
    flags: FlagArgs,
}

#[derive(Debug, Subcommand)]
pub enum TablesCommand {
    Import(FileArgs),
    Show(TablesShowArgs),
    List,
}

#[derive(Debug, Args)]
pub struct TablesShowArgs {
    #[arg(long)]
    version: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum PredictionsCommand {
    List(PredictionsListArgs),
}

#[derive(Debug, Args)]
pub struct PredictionsListArgs {
    #[arg(long)]
    race_id: String,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
pub struct FlagEntry {
    name: &'static str,
    enabled: bool,
    default_enabled: bool,
    risk: FlagRiskProfile,
}

#[derive(Debug, Serialize)]
pub struct FlagsJsonPayload {
    contract_version: &'static str,
    digest: String,
    flags: Vec<FlagEntry>,
}

/// Executes the parsed command line.
///
/// # Errors
/// Returns an error when configuration, store access or the command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Flags { command } => run_flags(command),
        command => {
            let mut store = SqliteRaceStore::open(&cli.db)?;
            store.migrate()?;
            run_with_store(command, &mut store, &cli.db)
        }
    }
}

/// Executes a command against an open, migrated store.
///
/// `db_path` is reopened as a second connection by commands that read and
/// write in the same run.
///
/// # Errors
/// Returns an error when the command fails.
pub fn run_with_store(
    command: Command,
    store: &mut SqliteRaceStore,
    db_path: &Path,
) -> Result<()> {
    match command {
        Command::Db { command } => match command {
            DbCommand::Migrate => {
                let version = store.schema_version()?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&serde_json::json!({
                        "schema_version": version,
                    }))?
                );
                Ok(())
            }
        },
        Command::Race { command } => run_race(command, store),
        Command::Predict(args) => run_predict(args, store, db_path),
        Command::Batch(args) => run_batch_command(args, store, db_path),
        Command::Flags { command } => run_flags(command),
        Command::Tables { command } => run_tables(command, store),
        Command::Predictions { command } => run_predictions(command, store),
    }
}

fn run_race(command: RaceCommand, store: &mut SqliteRaceStore) -> Result<()> {
    match command {
        RaceCommand::Import(args) => {
            let bundle = read_bundle(&args.file)?;
            store.import_bundle(&bundle)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "race_id": bundle.race.race_id,
                    "entrants": bundle.entrants.len(),
                    "before_info": bundle.before_info.is_some(),
                    "results": bundle.results.len(),
                }))?
            );
            Ok(())
        }
        RaceCommand::Show(args) => {
            let race_id = parse_race_id(&args.race_id)?;
            let Some(bundle) = store.load_race_bundle(&race_id)? else {
                return Err(anyhow!("race not found: {race_id}"));
            };
            println!("{}", serde_json::to_string_pretty(&bundle)?);
            Ok(())
        }
    }
}

fn run_predict(args: PredictArgs, store: &SqliteRaceStore, db_path: &Path) -> Result<()> {
    let race_id = parse_race_id(&args.race_id)?;
    let flags = resolve_flags(&args.flags)?;
    let tables = resolve_tables(&args.tables, store)?;
    let pipeline = Pipeline::default();

    let prediction = if args.persist {
        let mut writer = SqliteRaceStore::open(db_path)?;
        pipeline.predict_and_persist(store, &mut writer, &race_id, &flags, &tables)?
    } else {
        let Some(bundle) = store.load_race_bundle(&race_id)? else {
            return Err(anyhow!("race not found: {race_id}"));
        };
        pipeline
            .predict_race(&bundle, &flags, &tables)
            .map_err(|err| anyhow!(err.to_string()))?
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&prediction)?);
    } else {
        print_prediction(&prediction);
    }

    if !prediction.is_ranked() {
        return Err(anyhow!(
            "race {race_id} was not ranked: {}",
            prediction.status.as_str()
        ));
    }
    Ok(())
}

fn run_batch_command(args: BatchArgs, store: &SqliteRaceStore, db_path: &Path) -> Result<()> {
    let flags = resolve_flags(&args.flags)?;
    let tables = resolve_tables(&args.tables, store)?;
    let mut config = BatchConfig {
        race_date: parse_optional_date(args.date.as_deref())?,
        ..BatchConfig::default()
    };
    if let Some(workers) = args.workers {
        if workers == 0 {
            return Err(anyhow!("--workers must be at least 1"));
        }
        config.workers = workers;
    }

    let mut writer = SqliteRaceStore::open(db_path)?;
    let report = run_batch(
        store,
        &mut writer,
        &Pipeline::default(),
        &flags,
        &tables,
        &config,
    )?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_batch_report(&report);
    }
    Ok(())
}

fn run_flags(command: FlagsCommand) -> Result<()> {
    match command {
        FlagsCommand::List(args) => {
            let flags = resolve_flags(&args.flags)?;
            let payload = build_flags_payload(&flags);
            if args.json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_flags(&payload);
            }
            Ok(())
        }
    }
}

fn run_tables(command: TablesCommand, store: &SqliteRaceStore) -> Result<()> {
    match command {
        TablesCommand::Import(args) => {
            let tables = StaticTables::load_from_path(&args.file)?;
            store.store_tables(&tables)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "version": tables.version(),
                    "patterns": tables.document().patterns.len(),
                }))?
            );
            Ok(())
        }
        TablesCommand::Show(args) => {
            let tables = match args.version {
                Some(version) => store
                    .load_tables(&version)?
                    .ok_or_else(|| anyhow!("lookup tables not found: {version}"))?,
                None => StaticTables::builtin_v1(),
            };
            println!("{}", serde_json::to_string_pretty(tables.document())?);
            Ok(())
        }
        TablesCommand::List => {
            let versions = store.list_table_versions()?;
            println!("{}", serde_json::to_string_pretty(&versions)?);
            Ok(())
        }
    }
}

fn run_predictions(command: PredictionsCommand, store: &SqliteRaceStore) -> Result<()> {
    match command {
        PredictionsCommand::List(args) => {
            let race_id = parse_race_id(&args.race_id)?;
            let records = store.list_predictions(&race_id)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                print_records(&records);
            }
            Ok(())
        }
    }
}

fn read_bundle(path: &Path) -> Result<RaceBundle> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read race file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("race file is not valid JSON: {}", path.display()))?;
    RaceBundle::from_json(&value).map_err(|err| anyhow!("{}: {err}", path.display()))
}

fn parse_race_id(raw: &str) -> Result<RaceId> {
    RaceId::parse(raw).map_err(|err| anyhow!("invalid --race-id: {err}"))
}

fn parse_optional_date(raw: Option<&str>) -> Result<Option<Date>> {
    raw.map(|value| parse_date(value).map_err(|err| anyhow!("invalid --date: {err}")))
        .transpose()
}

fn resolve_flags(args: &FlagArgs) -> Result<FeatureFlags> {
    let mut flags = match &args.flags_file {
        Some(path) => load_flags_file(path)?,
        None => FeatureFlags::defaults(),
    };
    for raw in &args.overrides {
        let (flag, enabled) =
            parse_flag_override(raw).map_err(|err| anyhow!("invalid --set: {err}"))?;
        flags = flags.with(flag, enabled);
    }
    debug!(digest = %flags.digest(), "feature flags resolved");
    Ok(flags)
}

fn load_flags_file(path: &Path) -> Result<FeatureFlags> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read flags file {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml" | "yml")
    );
    let parsed = if is_yaml {
        FeatureFlags::from_yaml_str(&raw)
    } else {
        let value: serde_json::Value = serde_json::from_str(&raw)
            .with_context(|| format!("flags file is not valid JSON: {}", path.display()))?;
        FeatureFlags::from_json(&value)
    };
    parsed.map_err(|err| anyhow!("{}: {err}", path.display()))
}

fn resolve_tables(args: &TableArgs, store: &SqliteRaceStore) -> Result<StaticTables> {
    if let Some(path) = &args.tables_file {
        return StaticTables::load_from_path(path);
    }
    if let Some(version) = &args.tables_version {
        return store
            .load_tables(version)?
            .ok_or_else(|| anyhow!("lookup tables not found: {version}"));
    }
    Ok(StaticTables::builtin_v1())
}

fn build_flags_payload(flags: &FeatureFlags) -> FlagsJsonPayload {
    FlagsJsonPayload {
        contract_version: FLAGS_CONTRACT_VERSION,
        digest: flags.digest(),
        flags: Flag::ALL
            .into_iter()
            .map(|flag| FlagEntry {
                name: flag.as_str(),
                enabled: flags.get(flag),
                default_enabled: flag.default_enabled(),
                risk: flag.risk_profile(),
            })
            .collect(),
    }
}

fn print_prediction(prediction: &RacePrediction) {
    println!(
        "contract={} race={} status={} tables={} generated_at={}",
        prediction.contract_version,
        prediction.race_id,
        prediction.status.as_str(),
        prediction.tables_version,
        prediction.generated_at
    );
    print_records(&prediction.records);
}

fn print_records(records: &[PredictionRecord]) {
    println!(
        "{:<5} {:<5} {:<10} {:<9} {:<5} {:<14} patterns",
        "rank", "lane", "competitor", "score", "tier", "mode"
    );
    println!("{}", "-".repeat(70));
    for record in records {
        println!(
            "{:<5} {:<5} {:<10} {:<9.3} {:<5} {:<14} {}",
            record.predicted_rank,
            record.lane,
            record.competitor_id,
            record.final_score,
            record.confidence_tier.as_str(),
            record.integration_mode.as_str(),
            record.breakdown.matched_patterns.join(",")
        );
    }
}

fn print_batch_report(report: &BatchReport) {
    println!(
        "contract={} run_id={} date={} attempted={} predicted={} skipped={}",
        report.contract_version,
        report.run_id,
        report.race_date.as_deref().unwrap_or("all"),
        report.attempted,
        report.predicted,
        report.skipped
    );
    for failure in &report.failures {
        println!(
            "skip race={} reason={} detail={}",
            failure.race_id,
            failure.reason.as_str(),
            failure.detail
        );
    }
}

fn print_flags(payload: &FlagsJsonPayload) {
    println!("contract={} digest={}", payload.contract_version, payload.digest);
    println!("{:<30} {:<8} {:<8} risk", "flag", "enabled", "default");
    println!("{}", "-".repeat(60));
    for entry in &payload.flags {
        println!(
            "{:<30} {:<8} {:<8} {:?}",
            entry.name,
            if entry.enabled { "yes" } else { "no" },
            if entry.default_enabled { "yes" } else { "no" },
            entry.risk.level
        );
    }
}
