//! Command surface for latest-unlock strategy selection and benchmarking.
//!
//! Hosts embed it through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteUnlockStore`].

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use latest_unlock_core::{
    choose_strategy, compute_statistics, format_rfc3339, latest_unlocks, now_utc,
    resolve_eligible_targets, run_benchmark, BenchmarkResult, DatasetStatistics, EngineConfig,
    LatestRowStrategy, ScopeId, StrategyDecision, StrategyTiming, TargetId, UnlockRecord,
};
use latest_unlock_store_sqlite::{SeedPlan, SqliteUnlockStore};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "lu")]
#[command(about = "Latest unlock strategy CLI")]
pub struct Cli {
    #[arg(long, default_value = "./latest_unlock.sqlite3")]
    db: PathBuf,

    /// Engine config JSON; v1 defaults when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Unlocks {
        #[command(subcommand)]
        command: Box<UnlocksCommand>,
    },
    Strategy {
        #[command(subcommand)]
        command: Box<StrategyCommand>,
    },
    Benchmark {
        #[command(subcommand)]
        command: Box<BenchmarkCommand>,
    },
    Dataset {
        #[command(subcommand)]
        command: Box<DatasetCommand>,
    },
    Config {
        #[command(subcommand)]
        command: Box<ConfigCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum UnlocksCommand {
    Latest(LatestArgs),
    Stats(ScopeArgs),
    Eligible(ScopeArgs),
}

#[derive(Debug, Args)]
pub struct LatestArgs {
    #[arg(long)]
    scope_id: i64,
    #[arg(long, value_enum, default_value_t = StrategyArg::Auto)]
    strategy: StrategyArg,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct ScopeArgs {
    #[arg(long)]
    scope_id: i64,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum StrategyCommand {
    Select(ScopeArgs),
}

#[derive(Debug, Subcommand)]
pub enum BenchmarkCommand {
    Run(BenchmarkRunArgs),
}

#[derive(Debug, Args)]
pub struct BenchmarkRunArgs {
    #[arg(long)]
    scope_id: i64,
    /// Overrides `benchmark.join_timeout_ms` from the config.
    #[arg(long)]
    join_timeout_ms: Option<u64>,
    #[arg(long)]
    output: Option<PathBuf>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum DatasetCommand {
    Seed(SeedArgs),
}

#[derive(Debug, Args)]
pub struct SeedArgs {
    #[arg(long)]
    scope_id: i64,
    #[arg(long, default_value_t = 50)]
    actors: u32,
    #[arg(long, default_value_t = 40)]
    targets: u32,
    #[arg(long, default_value_t = 5)]
    attempts_per_group: u32,
    #[arg(long)]
    delete_every: Option<u32>,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum StrategyArg {
    Auto,
    GroupedMaxJoin,
    PartitionedRank,
}

impl StrategyArg {
    fn forced(self) -> Option<LatestRowStrategy> {
        match self {
            Self::Auto => None,
            Self::GroupedMaxJoin => Some(LatestRowStrategy::GroupedMaxJoin),
            Self::PartitionedRank => Some(LatestRowStrategy::PartitionedRank),
        }
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when config loading, store open/migrate, or command
/// execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    run_with_db(&cli.db, &config, cli.command)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command fails.
pub fn run_with_db(db_path: &Path, config: &EngineConfig, command: Command) -> Result<()> {
    match command {
        Command::Config { command } => run_config(*command, config),
        command => {
            let mut store = SqliteUnlockStore::open(db_path)?;
            store.migrate()?;
            run_command(command, &mut store, config)
        }
    }
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when probing, strategy execution, benchmarking, seeding,
/// or output fails.
pub fn run_command(
    command: Command,
    store: &mut SqliteUnlockStore,
    config: &EngineConfig,
) -> Result<()> {
    match command {
        Command::Unlocks { command } => run_unlocks(*command, store, config),
        Command::Strategy { command } => run_strategy(*command, store, config),
        Command::Benchmark { command } => run_benchmark_command(*command, store, config),
        Command::Dataset { command } => run_dataset(*command, store),
        Command::Config { command } => run_config(*command, config),
    }
}

/// Reads and validates an engine config file, or returns the v1 defaults.
///
/// # Errors
/// Returns an error when the file cannot be read, is not JSON, or fails
/// validation.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::v1());
    };

    let body = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_str(&body)
        .with_context(|| format!("config file {} must be valid JSON", path.display()))?;
    let config = EngineConfig::from_json(&value)
        .with_context(|| format!("invalid config file {}", path.display()))?;

    info!(path = %path.display(), "loaded engine config");
    Ok(config)
}

fn run_unlocks(
    command: UnlocksCommand,
    store: &SqliteUnlockStore,
    config: &EngineConfig,
) -> Result<()> {
    match command {
        UnlocksCommand::Latest(args) => {
            let scope_id = ScopeId(args.scope_id);
            let payload = match args.strategy.forced() {
                Some(strategy) => {
                    let records = strategy.fetch_latest(store, scope_id)?;
                    build_latest_payload(scope_id, strategy, None, records)
                }
                None => {
                    let latest = latest_unlocks(store, scope_id, config)?;
                    build_latest_payload(
                        scope_id,
                        latest.decision.strategy,
                        Some(latest.decision),
                        latest.records,
                    )
                }
            };

            if args.json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_latest_table(&payload);
            }
            Ok(())
        }
        UnlocksCommand::Stats(args) => {
            let statistics = compute_statistics(store, ScopeId(args.scope_id))?;
            if args.json {
                let payload = StatisticsJsonPayload {
                    contract_version: "dataset_statistics.v1".to_string(),
                    statistics,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_statistics(&statistics);
            }
            Ok(())
        }
        UnlocksCommand::Eligible(args) => {
            let scope_id = ScopeId(args.scope_id);
            let eligible = resolve_eligible_targets(store, scope_id)?;
            let payload = EligibleTargetsJsonPayload {
                contract_version: "eligible_targets.v1".to_string(),
                scope_id,
                target_ids: eligible.into_iter().collect(),
            };
            if args.json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                println!(
                    "scope={} eligible_targets={}",
                    payload.scope_id,
                    payload.target_ids.len()
                );
                for target_id in &payload.target_ids {
                    println!("{target_id}");
                }
            }
            Ok(())
        }
    }
}

fn run_strategy(
    command: StrategyCommand,
    store: &SqliteUnlockStore,
    config: &EngineConfig,
) -> Result<()> {
    match command {
        StrategyCommand::Select(args) => {
            let scope_id = ScopeId(args.scope_id);
            let decision = choose_strategy(store, scope_id, &config.selector)?;
            if args.json {
                let payload = StrategyDecisionJsonPayload {
                    contract_version: "strategy_decision.v1".to_string(),
                    scope_id,
                    decision,
                };
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_decision(&decision);
            }
            Ok(())
        }
    }
}

fn run_benchmark_command(
    command: BenchmarkCommand,
    store: &SqliteUnlockStore,
    config: &EngineConfig,
) -> Result<()> {
    match command {
        BenchmarkCommand::Run(args) => {
            let mut settings = config.benchmark.clone();
            if let Some(join_timeout_ms) = args.join_timeout_ms {
                settings.join_timeout_ms = join_timeout_ms;
            }

            let scope_id = ScopeId(args.scope_id);
            let result = run_benchmark(store, scope_id, &settings)?;
            let payload = build_benchmark_payload(
                scope_id,
                settings.join_timeout_ms,
                now_utc(),
                result,
            )?;

            if let Some(path) = args.output {
                let serialized = serde_json::to_string_pretty(&payload)?;
                std::fs::write(&path, serialized).with_context(|| {
                    format!("failed writing benchmark report to {}", path.display())
                })?;
            }

            if args.json {
                println!("{}", serde_json::to_string_pretty(&payload)?);
            } else {
                print_benchmark_report(&payload);
            }
            Ok(())
        }
    }
}

fn run_dataset(command: DatasetCommand, store: &mut SqliteUnlockStore) -> Result<()> {
    match command {
        DatasetCommand::Seed(args) => {
            let plan = SeedPlan {
                scope_id: ScopeId(args.scope_id),
                actors: args.actors,
                targets: args.targets,
                attempts_per_group: args.attempts_per_group,
                delete_every: args.delete_every,
            };
            let report = store.seed_dataset(&plan)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn run_config(command: ConfigCommand, config: &EngineConfig) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            println!("{}", serde_json::to_string_pretty(config)?);
            Ok(())
        }
    }
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct LatestUnlocksJsonPayload {
    contract_version: String,
    scope_id: ScopeId,
    strategy: LatestRowStrategy,
    forced: bool,
    decision: Option<StrategyDecision>,
    row_count: usize,
    records: Vec<UnlockRecord>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct StatisticsJsonPayload {
    contract_version: String,
    #[serde(flatten)]
    statistics: DatasetStatistics,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EligibleTargetsJsonPayload {
    contract_version: String,
    scope_id: ScopeId,
    target_ids: Vec<TargetId>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct StrategyDecisionJsonPayload {
    contract_version: String,
    scope_id: ScopeId,
    decision: StrategyDecision,
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct BenchmarkRunJsonPayload {
    contract_version: String,
    scope_id: ScopeId,
    generated_at: String,
    join_timeout_ms: u64,
    #[serde(flatten)]
    result: BenchmarkResult,
}

fn build_latest_payload(
    scope_id: ScopeId,
    strategy: LatestRowStrategy,
    decision: Option<StrategyDecision>,
    records: Vec<UnlockRecord>,
) -> LatestUnlocksJsonPayload {
    LatestUnlocksJsonPayload {
        contract_version: "latest_unlocks.v1".to_string(),
        scope_id,
        strategy,
        forced: decision.is_none(),
        decision,
        row_count: records.len(),
        records,
    }
}

fn build_benchmark_payload(
    scope_id: ScopeId,
    join_timeout_ms: u64,
    generated_at: time::OffsetDateTime,
    result: BenchmarkResult,
) -> Result<BenchmarkRunJsonPayload> {
    Ok(BenchmarkRunJsonPayload {
        contract_version: "benchmark_run.v1".to_string(),
        scope_id,
        generated_at: format_rfc3339(generated_at).map_err(|err| anyhow!(err.to_string()))?,
        join_timeout_ms,
        result,
    })
}

fn print_latest_table(payload: &LatestUnlocksJsonPayload) {
    match &payload.decision {
        Some(decision) => println!(
            "scope={} strategy={} confidence={:?} reason={} rows={}",
            payload.scope_id,
            payload.strategy,
            decision.confidence,
            decision.reason_code,
            payload.row_count
        ),
        None => println!(
            "scope={} strategy={} (forced) rows={}",
            payload.scope_id, payload.strategy, payload.row_count
        ),
    }
    println!(
        "{:<12} {:<12} {:<12} {:<9} created_at",
        "id", "actor_id", "target_id", "progress"
    );
    println!("{}", "-".repeat(72));
    for record in &payload.records {
        println!(
            "{:<12} {:<12} {:<12} {:<9} {}",
            record.id.0,
            record.actor_id.0,
            record.target_id.0,
            record.progress,
            format_rfc3339(record.created_at).unwrap_or_else(|_| "-".to_string())
        );
    }
}

fn print_statistics(statistics: &DatasetStatistics) {
    println!(
        "scope={} total_active={} unique_groups={} avg_duplication={:.2} max_duplication={}",
        statistics.scope_id,
        statistics.total_active,
        statistics.unique_groups,
        statistics.avg_duplication,
        statistics.max_duplication
    );
}

fn print_decision(decision: &StrategyDecision) {
    println!(
        "strategy={} confidence={:?} reason={}",
        decision.strategy, decision.confidence, decision.reason_code
    );
    print_statistics(&decision.statistics);
}

fn print_benchmark_report(payload: &BenchmarkRunJsonPayload) {
    println!(
        "contract={} generated_at={} scope={} join_timeout_ms={}",
        payload.contract_version, payload.generated_at, payload.scope_id, payload.join_timeout_ms
    );
    println!(
        "{:<8} {:<18} {:<10} {:<14} note",
        "role", "strategy", "rows", "seconds"
    );
    println!("{}", "-".repeat(72));
    print_timing_row("winner", &payload.result.winner);
    print_timing_row("loser", &payload.result.loser);
    match payload.result.speedup_factor {
        Some(factor) => println!("speedup={factor:.2}x"),
        None => println!("speedup=n/a"),
    }
}

fn print_timing_row(role: &str, timing: &StrategyTiming) {
    let note = if timing.timed_out { "timed out" } else { "" };
    println!(
        "{:<8} {:<18} {:<10} {:<14.6} {}",
        role,
        timing.kind.as_str(),
        timing.row_count,
        timing.elapsed_seconds,
        note
    );
}
