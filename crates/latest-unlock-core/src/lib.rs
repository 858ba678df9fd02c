//! Strategy selection and benchmarking for "latest unlock per group" reads.
//!
//! Storage engines plug in through [`UnlockBackend`]; everything in this crate
//! is dialect-free. Entry points:
//! - [`compute_statistics`] and [`resolve_eligible_targets`] for the probes.
//! - [`LatestRowStrategy::fetch_latest`] to execute one strategy.
//! - [`select_strategy`] / [`choose_strategy`] for the decision policy.
//! - [`latest_unlocks`] for selection plus execution.
//! - [`run_benchmark`] for the timed winner/loser comparison.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};
use tracing::{debug, info, warn};

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LatestUnlockError {
    #[error("storage unavailable: {operation} failed for scope {scope_id}: {message}")]
    StorageUnavailable {
        scope_id: ScopeId,
        operation: &'static str,
        message: String,
    },
    #[error("query timeout: {operation} exceeded {timeout_ms}ms for scope {scope_id}")]
    QueryTimeout {
        scope_id: ScopeId,
        operation: &'static str,
        timeout_ms: u64,
    },
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl LatestUnlockError {
    #[must_use]
    pub fn storage(scope_id: ScopeId, operation: &'static str, err: &anyhow::Error) -> Self {
        Self::StorageUnavailable {
            scope_id,
            operation,
            message: format!("{err:#}"),
        }
    }

    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::StorageUnavailable { .. } => "storage_unavailable",
            Self::QueryTimeout { .. } => "query_timeout",
            Self::Validation(_) => "validation",
            Self::Configuration(_) => "configuration",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct UnlockId(pub i64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ActorId(pub i64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct TargetId(pub i64);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ScopeId(pub i64);

impl Display for UnlockId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for ActorId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for TargetId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Display for ScopeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Partition key that decides which rows compete for "latest".
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct GroupKey {
    pub actor_id: ActorId,
    pub target_id: TargetId,
}

impl Display for GroupKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.actor_id, self.target_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnlockRecord {
    pub id: UnlockId,
    pub actor_id: ActorId,
    pub target_id: TargetId,
    pub scope_id: ScopeId,
    pub progress: u8,
    #[serde(with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl UnlockRecord {
    #[must_use]
    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            actor_id: self.actor_id,
            target_id: self.target_id,
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnlockInput {
    pub actor_id: ActorId,
    pub target_id: TargetId,
    pub scope_id: ScopeId,
    pub progress: u8,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl UnlockInput {
    /// Validates an attempt before it is recorded.
    ///
    /// # Errors
    /// Returns [`LatestUnlockError::Validation`] when progress is outside
    /// `0..=100` or the timestamp is not UTC.
    pub fn validate(&self) -> Result<(), LatestUnlockError> {
        if self.progress > 100 {
            return Err(LatestUnlockError::Validation(
                "progress MUST be in [0, 100]".to_string(),
            ));
        }

        if self.created_at.offset() != UtcOffset::UTC {
            return Err(LatestUnlockError::Validation(
                "created_at MUST be UTC (offset Z)".to_string(),
            ));
        }

        Ok(())
    }
}

/// Raw per-scope aggregates as reported by a storage backend.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct GroupSizeSummary {
    pub total_active: u64,
    pub unique_groups: u64,
    pub max_group_size: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DatasetStatistics {
    pub scope_id: ScopeId,
    pub total_active: u64,
    pub unique_groups: u64,
    pub avg_duplication: f64,
    pub max_duplication: u64,
}

impl DatasetStatistics {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_summary(scope_id: ScopeId, summary: GroupSizeSummary) -> Self {
        let avg_duplication = if summary.unique_groups == 0 {
            0.0
        } else {
            summary.total_active as f64 / summary.unique_groups as f64
        };

        Self {
            scope_id,
            total_active: summary.total_active,
            unique_groups: summary.unique_groups,
            avg_duplication,
            max_duplication: summary.max_group_size,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.unique_groups == 0
    }
}

/// Read-only storage primitives the engine needs.
///
/// Implementations own their dialect: grouped `MAX`, equality joins, ranked
/// partitions and identifier-list predicates. Every query MUST bind scope and
/// target identifiers as parameters.
pub trait UnlockBackend {
    #[allow(clippy::missing_errors_doc)]
    fn group_size_summary(&self, scope_id: ScopeId) -> anyhow::Result<GroupSizeSummary>;

    /// May contain duplicates; callers deduplicate.
    #[allow(clippy::missing_errors_doc)]
    fn eligible_target_ids(&self, scope_id: ScopeId) -> anyhow::Result<Vec<TargetId>>;

    #[allow(clippy::missing_errors_doc)]
    fn latest_by_grouped_max_join(&self, scope_id: ScopeId) -> anyhow::Result<Vec<UnlockRecord>>;

    #[allow(clippy::missing_errors_doc)]
    fn latest_by_partitioned_rank(
        &self,
        scope_id: ScopeId,
        eligible: &BTreeSet<TargetId>,
    ) -> anyhow::Result<Vec<UnlockRecord>>;

    /// Handle that aborts whatever statement is running on this backend.
    fn query_canceller(&self) -> Box<dyn QueryCanceller>;
}

pub trait QueryCanceller: Send {
    fn cancel(&self);
}

/// Probes active-row aggregates for a scope.
///
/// # Errors
/// Returns [`LatestUnlockError::StorageUnavailable`] when the backend query
/// fails.
pub fn compute_statistics<B: UnlockBackend + ?Sized>(
    backend: &B,
    scope_id: ScopeId,
) -> Result<DatasetStatistics, LatestUnlockError> {
    let summary = backend
        .group_size_summary(scope_id)
        .map_err(|err| LatestUnlockError::storage(scope_id, "compute_statistics", &err))?;

    let statistics = DatasetStatistics::from_summary(scope_id, summary);
    debug!(
        scope_id = scope_id.0,
        total_active = statistics.total_active,
        unique_groups = statistics.unique_groups,
        avg_duplication = statistics.avg_duplication,
        "computed dataset statistics"
    );
    Ok(statistics)
}

/// Resolves the distinct target ids reachable from a scope.
///
/// An empty set is a valid outcome.
///
/// # Errors
/// Returns [`LatestUnlockError::StorageUnavailable`] when the backend query
/// fails.
pub fn resolve_eligible_targets<B: UnlockBackend + ?Sized>(
    backend: &B,
    scope_id: ScopeId,
) -> Result<BTreeSet<TargetId>, LatestUnlockError> {
    let targets = backend
        .eligible_target_ids(scope_id)
        .map_err(|err| LatestUnlockError::storage(scope_id, "resolve_eligible_targets", &err))?;

    Ok(targets.into_iter().collect())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LatestRowStrategy {
    GroupedMaxJoin,
    PartitionedRank,
}

impl LatestRowStrategy {
    pub const ALL: [Self; 2] = [Self::GroupedMaxJoin, Self::PartitionedRank];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GroupedMaxJoin => "grouped_max_join",
            Self::PartitionedRank => "partitioned_rank",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "grouped_max_join" => Some(Self::GroupedMaxJoin),
            "partitioned_rank" => Some(Self::PartitionedRank),
            _ => None,
        }
    }

    /// Returns the latest active row of every group in the scope.
    ///
    /// The ranked plan resolves eligibility first and short-circuits to an
    /// empty result when no target is eligible.
    ///
    /// # Errors
    /// Returns [`LatestUnlockError::StorageUnavailable`] when a backend query
    /// fails.
    pub fn fetch_latest<B: UnlockBackend + ?Sized>(
        self,
        backend: &B,
        scope_id: ScopeId,
    ) -> Result<Vec<UnlockRecord>, LatestUnlockError> {
        let records = match self {
            Self::GroupedMaxJoin => backend
                .latest_by_grouped_max_join(scope_id)
                .map_err(|err| LatestUnlockError::storage(scope_id, self.as_str(), &err))?,
            Self::PartitionedRank => {
                let eligible = resolve_eligible_targets(backend, scope_id)?;
                if eligible.is_empty() {
                    debug!(
                        scope_id = scope_id.0,
                        "no eligible targets; skipping ranked scan"
                    );
                    return Ok(Vec::new());
                }
                backend
                    .latest_by_partitioned_rank(scope_id, &eligible)
                    .map_err(|err| LatestUnlockError::storage(scope_id, self.as_str(), &err))?
            }
        };

        debug!(
            scope_id = scope_id.0,
            strategy = self.as_str(),
            rows = records.len(),
            "fetched latest unlocks"
        );
        Ok(records)
    }
}

impl Display for LatestRowStrategy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Low,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SelectorThresholds {
    pub huge_table_rows: u64,
    pub high_duplication: f64,
    pub large_table_rows: u64,
    pub large_table_duplication: f64,
    pub small_table_rows: u64,
    pub low_duplication: f64,
}

impl SelectorThresholds {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            huge_table_rows: 1_000_000,
            high_duplication: 5.0,
            large_table_rows: 100_000,
            large_table_duplication: 5.0,
            small_table_rows: 10_000,
            low_duplication: 3.0,
        }
    }

    /// Validates threshold ordering and numeric bounds.
    ///
    /// # Errors
    /// Returns [`LatestUnlockError::Configuration`] when a ratio is negative or
    /// not finite, or the row cutoffs are not ordered small <= large <= huge.
    pub fn validate(&self) -> Result<(), LatestUnlockError> {
        for (name, value) in [
            ("high_duplication", self.high_duplication),
            ("large_table_duplication", self.large_table_duplication),
            ("low_duplication", self.low_duplication),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(LatestUnlockError::Configuration(format!(
                    "{name} MUST be a finite value >= 0.0"
                )));
            }
        }

        if self.small_table_rows > self.large_table_rows
            || self.large_table_rows > self.huge_table_rows
        {
            return Err(LatestUnlockError::Configuration(
                "row cutoffs MUST satisfy small_table_rows <= large_table_rows <= huge_table_rows"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for SelectorThresholds {
    fn default() -> Self {
        Self::v1()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BenchmarkSettings {
    pub join_timeout_ms: u64,
}

impl BenchmarkSettings {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            join_timeout_ms: 10_000,
        }
    }

    #[must_use]
    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// # Errors
    /// Returns [`LatestUnlockError::Configuration`] when the timeout is zero.
    pub fn validate(&self) -> Result<(), LatestUnlockError> {
        if self.join_timeout_ms == 0 {
            return Err(LatestUnlockError::Configuration(
                "join_timeout_ms MUST be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self::v1()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub config_version: u32,
    pub selector: SelectorThresholds,
    pub benchmark: BenchmarkSettings,
}

impl EngineConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            config_version: CONFIG_VERSION,
            selector: SelectorThresholds::v1(),
            benchmark: BenchmarkSettings::v1(),
        }
    }

    /// # Errors
    /// Returns [`LatestUnlockError::Configuration`] for an unsupported version
    /// or invalid sections.
    pub fn validate(&self) -> Result<(), LatestUnlockError> {
        if self.config_version != CONFIG_VERSION {
            return Err(LatestUnlockError::Configuration(format!(
                "unsupported config_version {} (expected {CONFIG_VERSION})",
                self.config_version
            )));
        }
        self.selector.validate()?;
        self.benchmark.validate()
    }

    /// Decodes and validates a config from JSON. Missing sections fall back to
    /// the v1 defaults.
    ///
    /// # Errors
    /// Returns [`LatestUnlockError::Configuration`] when JSON decoding fails
    /// or decoded values are invalid.
    pub fn from_json(value: &Value) -> Result<Self, LatestUnlockError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            LatestUnlockError::Configuration(format!("invalid config JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::v1()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyDecision {
    pub strategy: LatestRowStrategy,
    pub confidence: Confidence,
    pub reason_code: String,
    pub statistics: DatasetStatistics,
}

/// Applies the ordered decision rules; first match wins.
///
/// Rule 3 can never fire ahead of rule 2 with the default thresholds. It is
/// kept so that retuned thresholds keep the documented rule set.
#[must_use]
pub fn select_strategy(
    statistics: &DatasetStatistics,
    thresholds: &SelectorThresholds,
) -> StrategyDecision {
    let (strategy, confidence, reason_code) = if statistics.is_empty() {
        (
            LatestRowStrategy::GroupedMaxJoin,
            Confidence::High,
            "join.empty_dataset",
        )
    } else if statistics.total_active > thresholds.huge_table_rows {
        (
            LatestRowStrategy::PartitionedRank,
            Confidence::High,
            "rank.total_active_above_huge_threshold",
        )
    } else if statistics.avg_duplication > thresholds.high_duplication {
        (
            LatestRowStrategy::PartitionedRank,
            Confidence::High,
            "rank.high_duplication",
        )
    } else if statistics.total_active > thresholds.large_table_rows
        && statistics.avg_duplication > thresholds.large_table_duplication
    {
        (
            LatestRowStrategy::PartitionedRank,
            Confidence::High,
            "rank.large_table_high_duplication",
        )
    } else if statistics.total_active < thresholds.small_table_rows
        && statistics.avg_duplication <= thresholds.low_duplication
    {
        (
            LatestRowStrategy::GroupedMaxJoin,
            Confidence::High,
            "join.small_table_low_duplication",
        )
    } else {
        (
            LatestRowStrategy::GroupedMaxJoin,
            Confidence::Low,
            "join.requires_testing",
        )
    };

    StrategyDecision {
        strategy,
        confidence,
        reason_code: reason_code.to_string(),
        statistics: *statistics,
    }
}

/// Probes the scope and applies [`select_strategy`].
///
/// # Errors
/// Returns [`LatestUnlockError::StorageUnavailable`] when the probe fails.
pub fn choose_strategy<B: UnlockBackend + ?Sized>(
    backend: &B,
    scope_id: ScopeId,
    thresholds: &SelectorThresholds,
) -> Result<StrategyDecision, LatestUnlockError> {
    let statistics = compute_statistics(backend, scope_id)?;
    let decision = select_strategy(&statistics, thresholds);

    if decision.confidence == Confidence::Low {
        warn!(
            scope_id = scope_id.0,
            strategy = decision.strategy.as_str(),
            reason = %decision.reason_code,
            "low-confidence strategy decision; benchmark this scope"
        );
    } else {
        info!(
            scope_id = scope_id.0,
            strategy = decision.strategy.as_str(),
            reason = %decision.reason_code,
            "selected latest-row strategy"
        );
    }

    Ok(decision)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LatestUnlocks {
    pub scope_id: ScopeId,
    pub decision: StrategyDecision,
    pub records: Vec<UnlockRecord>,
}

/// Selects a strategy for the scope and executes it.
///
/// # Errors
/// Returns [`LatestUnlockError::StorageUnavailable`] when probing or the
/// selected strategy fails.
pub fn latest_unlocks<B: UnlockBackend + ?Sized>(
    backend: &B,
    scope_id: ScopeId,
    config: &EngineConfig,
) -> Result<LatestUnlocks, LatestUnlockError> {
    let decision = choose_strategy(backend, scope_id, &config.selector)?;
    let records = decision.strategy.fetch_latest(backend, scope_id)?;

    Ok(LatestUnlocks {
        scope_id,
        decision,
        records,
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrategyTiming {
    #[serde(rename = "type")]
    pub kind: LatestRowStrategy,
    #[serde(rename = "count")]
    pub row_count: usize,
    #[serde(rename = "execution_time")]
    pub elapsed_seconds: f64,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StrategyTiming {
    #[must_use]
    pub fn completed(kind: LatestRowStrategy, row_count: usize, elapsed: Duration) -> Self {
        Self {
            kind,
            row_count,
            elapsed_seconds: elapsed.as_secs_f64(),
            timed_out: false,
            error: None,
        }
    }

    #[must_use]
    pub fn timed_out(kind: LatestRowStrategy, ceiling: Duration, err: &LatestUnlockError) -> Self {
        Self {
            kind,
            row_count: 0,
            elapsed_seconds: ceiling.as_secs_f64(),
            timed_out: true,
            error: Some(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkResult {
    pub winner: StrategyTiming,
    pub loser: StrategyTiming,
    #[serde(
        rename = "speedup",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub speedup_factor: Option<f64>,
}

impl BenchmarkResult {
    /// Orders two timings into winner and loser.
    ///
    /// A timed-out side always loses. Equal times go to `first`.
    ///
    /// When the timed-out side's ceiling is below the winner's elapsed time,
    /// `speedup_factor` is the 1.0 floor, not a measured ratio.
    #[must_use]
    pub fn from_timings(first: StrategyTiming, second: StrategyTiming) -> Self {
        let first_wins = match (first.timed_out, second.timed_out) {
            (false, true) => true,
            (true, false) => false,
            _ => first.elapsed_seconds <= second.elapsed_seconds,
        };

        let (winner, loser) = if first_wins {
            (first, second)
        } else {
            (second, first)
        };

        let speedup_factor = speedup(winner.elapsed_seconds, loser.elapsed_seconds);
        Self {
            winner,
            loser,
            speedup_factor,
        }
    }

    #[must_use]
    pub fn timed_out_side(&self) -> Option<&StrategyTiming> {
        [&self.winner, &self.loser]
            .into_iter()
            .find(|timing| timing.timed_out)
    }
}

/// Runs both strategies sequentially under wall-clock timing.
///
/// The grouped join runs first and is bounded by `settings.join_timeout_ms`;
/// on expiry its running query is cancelled through the backend and the side
/// is recorded at the timeout ceiling. The ranked plan is not bounded.
///
/// # Errors
/// Returns [`LatestUnlockError::StorageUnavailable`] when either strategy
/// fails for a reason other than the join timeout, and
/// [`LatestUnlockError::Configuration`] for invalid settings.
pub fn run_benchmark<B: UnlockBackend + ?Sized>(
    backend: &B,
    scope_id: ScopeId,
    settings: &BenchmarkSettings,
) -> Result<BenchmarkResult, LatestUnlockError> {
    settings.validate()?;

    let join = time_bounded(
        backend,
        scope_id,
        LatestRowStrategy::GroupedMaxJoin,
        settings.join_timeout(),
    )?;
    let rank = time_unbounded(backend, scope_id, LatestRowStrategy::PartitionedRank)?;

    let result = BenchmarkResult::from_timings(join, rank);
    info!(
        scope_id = scope_id.0,
        winner = result.winner.kind.as_str(),
        winner_seconds = result.winner.elapsed_seconds,
        loser_seconds = result.loser.elapsed_seconds,
        speedup = result.speedup_factor,
        "benchmark complete"
    );
    Ok(result)
}

fn time_unbounded<B: UnlockBackend + ?Sized>(
    backend: &B,
    scope_id: ScopeId,
    strategy: LatestRowStrategy,
) -> Result<StrategyTiming, LatestUnlockError> {
    let started = Instant::now();
    let records = strategy.fetch_latest(backend, scope_id)?;
    Ok(StrategyTiming::completed(
        strategy,
        records.len(),
        started.elapsed(),
    ))
}

fn time_bounded<B: UnlockBackend + ?Sized>(
    backend: &B,
    scope_id: ScopeId,
    strategy: LatestRowStrategy,
    timeout: Duration,
) -> Result<StrategyTiming, LatestUnlockError> {
    let canceller = backend.query_canceller();
    let fired = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let watchdog_fired = Arc::clone(&fired);
    let watchdog = thread::spawn(move || {
        if matches!(done_rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout)) {
            watchdog_fired.store(true, Ordering::SeqCst);
            canceller.cancel();
        }
    });

    let started = Instant::now();
    let outcome = strategy.fetch_latest(backend, scope_id);
    let elapsed = started.elapsed();

    // Disconnecting the channel releases the watchdog without cancelling.
    drop(done_tx);
    if watchdog.join().is_err() {
        warn!(scope_id = scope_id.0, "query watchdog thread panicked");
    }

    if fired.load(Ordering::SeqCst) {
        let err = LatestUnlockError::QueryTimeout {
            scope_id,
            operation: strategy.as_str(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        };
        warn!(
            scope_id = scope_id.0,
            strategy = strategy.as_str(),
            elapsed_seconds = elapsed.as_secs_f64(),
            "strategy exceeded its time budget; query cancelled"
        );
        return Ok(StrategyTiming::timed_out(strategy, timeout, &err));
    }

    let records = outcome?;
    Ok(StrategyTiming::completed(strategy, records.len(), elapsed))
}

fn speedup(winner_seconds: f64, loser_seconds: f64) -> Option<f64> {
    if winner_seconds <= 0.0 {
        return None;
    }
    Some(round2((loser_seconds / winner_seconds).max(1.0)))
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LatestUnlockError::Validation`] when parsing fails or the
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LatestUnlockError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LatestUnlockError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LatestUnlockError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LatestUnlockError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LatestUnlockError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            LatestUnlockError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
