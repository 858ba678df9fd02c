#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use latest_unlock_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, ActorId, GroupSizeSummary, LatestUnlockError,
    QueryCanceller, ScopeId, TargetId, UnlockBackend, UnlockId, UnlockInput, UnlockRecord,
};
use rusqlite::{params, Connection, InterruptHandle, OptionalExtension};
use time::OffsetDateTime;
use tracing::{debug, info};

const UNLOCK_MIGRATION_VERSION: i64 = 1;

const SCHEMA_UNLOCKS_V1: &str = r"
CREATE TABLE IF NOT EXISTS scopes (
  scope_id INTEGER PRIMARY KEY,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS categories (
  category_id INTEGER PRIMARY KEY,
  scope_id INTEGER NOT NULL,
  FOREIGN KEY (scope_id) REFERENCES scopes(scope_id)
);

CREATE TABLE IF NOT EXISTS groupings (
  grouping_id INTEGER PRIMARY KEY,
  category_id INTEGER NOT NULL,
  FOREIGN KEY (category_id) REFERENCES categories(category_id)
);

CREATE TABLE IF NOT EXISTS target_groupings (
  target_id INTEGER NOT NULL,
  grouping_id INTEGER NOT NULL,
  PRIMARY KEY (target_id, grouping_id),
  FOREIGN KEY (grouping_id) REFERENCES groupings(grouping_id)
);

CREATE TABLE IF NOT EXISTS unlock_records (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  actor_id INTEGER NOT NULL,
  target_id INTEGER NOT NULL,
  scope_id INTEGER NOT NULL,
  progress INTEGER NOT NULL CHECK (progress BETWEEN 0 AND 100),
  deleted_at TEXT,
  created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_unlock_records_soft_delete_only
BEFORE UPDATE OF id, actor_id, target_id, scope_id, progress, created_at ON unlock_records
BEGIN
  SELECT RAISE(FAIL, 'unlock_records only allows soft deletes');
END;

CREATE TRIGGER IF NOT EXISTS trg_unlock_records_no_undelete
BEFORE UPDATE OF deleted_at ON unlock_records
WHEN OLD.deleted_at IS NOT NULL
BEGIN
  SELECT RAISE(FAIL, 'unlock_records soft delete is permanent');
END;

CREATE TRIGGER IF NOT EXISTS trg_unlock_records_no_delete
BEFORE DELETE ON unlock_records
BEGIN
  SELECT RAISE(FAIL, 'unlock_records only allows soft deletes');
END;

CREATE INDEX IF NOT EXISTS idx_unlock_records_active_group
  ON unlock_records(scope_id, actor_id, target_id, id)
  WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_unlock_records_active_target
  ON unlock_records(scope_id, target_id)
  WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_categories_scope
  ON categories(scope_id);
CREATE INDEX IF NOT EXISTS idx_groupings_category
  ON groupings(category_id);
CREATE INDEX IF NOT EXISTS idx_target_groupings_grouping
  ON target_groupings(grouping_id);
";

const GROUP_SIZE_SUMMARY_SQL: &str = "SELECT
        COALESCE(SUM(group_size), 0),
        COUNT(*),
        COALESCE(MAX(group_size), 0)
     FROM (
        SELECT COUNT(*) AS group_size
        FROM unlock_records
        WHERE scope_id = ?1 AND deleted_at IS NULL
        GROUP BY actor_id, target_id
     )";

const ELIGIBLE_TARGETS_SQL: &str = "SELECT DISTINCT tg.target_id
     FROM target_groupings tg
     INNER JOIN groupings g ON g.grouping_id = tg.grouping_id
     INNER JOIN categories c ON c.category_id = g.category_id
     WHERE c.scope_id = ?1
     ORDER BY tg.target_id ASC";

// CROSS JOIN pins the aggregate as the outer loop so each latest id is a
// rowid seek. The outer WHERE repeats the subquery predicate; the unary `+`
// keeps it from steering `u` onto a scope index.
const GROUPED_MAX_JOIN_SQL: &str = "SELECT
        u.id, u.actor_id, u.target_id, u.scope_id, u.progress, u.deleted_at, u.created_at
     FROM (
        SELECT MAX(id) AS max_id
        FROM unlock_records
        WHERE scope_id = ?1 AND deleted_at IS NULL
        GROUP BY actor_id, target_id
     ) latest
     CROSS JOIN unlock_records u ON u.id = latest.max_id
     WHERE +u.scope_id = ?1 AND u.deleted_at IS NULL
     ORDER BY u.actor_id ASC, u.target_id ASC";

// Ties on id cannot happen with an INTEGER PRIMARY KEY; created_at then
// progress still give ROW_NUMBER a total order.
const PARTITIONED_RANK_SQL: &str = "SELECT
        id, actor_id, target_id, scope_id, progress, deleted_at, created_at
     FROM (
        SELECT
            u.id, u.actor_id, u.target_id, u.scope_id, u.progress, u.deleted_at, u.created_at,
            ROW_NUMBER() OVER (
                PARTITION BY u.actor_id, u.target_id
                ORDER BY u.id DESC, u.created_at DESC, u.progress DESC
            ) AS row_rank
        FROM unlock_records u
        WHERE u.scope_id = ?1
          AND u.deleted_at IS NULL
          AND u.target_id IN (SELECT value FROM json_each(?2))
     ) ranked
     WHERE row_rank = 1
     ORDER BY actor_id ASC, target_id ASC";

pub struct SqliteUnlockStore {
    conn: Connection,
}

/// One eligibility path: target -> grouping -> category -> scope.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct TargetLink {
    pub scope_id: ScopeId,
    pub category_id: i64,
    pub grouping_id: i64,
    pub target_id: TargetId,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SeedPlan {
    pub scope_id: ScopeId,
    pub actors: u32,
    pub targets: u32,
    pub attempts_per_group: u32,
    /// Every n-th inserted row is stored already soft-deleted.
    pub delete_every: Option<u32>,
}

impl SeedPlan {
    pub fn validate(&self) -> Result<()> {
        if self.actors == 0 || self.targets == 0 || self.attempts_per_group == 0 {
            return Err(anyhow!(
                "seed plan requires actors, targets and attempts_per_group >= 1"
            ));
        }
        if self.delete_every == Some(0) {
            return Err(anyhow!("delete_every must be >= 1 when provided"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct SeedReport {
    pub contract_version: String,
    pub scope_id: ScopeId,
    pub inserted_rows: u64,
    pub soft_deleted_rows: u64,
    pub groups: u64,
    pub eligible_targets: u64,
}

struct SqliteQueryCanceller(InterruptHandle);

impl QueryCanceller for SqliteQueryCanceller {
    fn cancel(&self) {
        self.0.interrupt();
    }
}

impl SqliteUnlockStore {
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
            .execute_batch(SCHEMA_UNLOCKS_V1)
            .context("failed to apply unlock schema")?;

        let now = format_rfc3339(now_utc())?;
        let inserted = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![UNLOCK_MIGRATION_VERSION, now],
            )
            .context("failed to register unlock schema migration")?;

        if inserted > 0 {
            info!(version = UNLOCK_MIGRATION_VERSION, "applied unlock schema migration");
        } else {
            debug!(version = UNLOCK_MIGRATION_VERSION, "unlock schema already current");
        }

        Ok(())
    }

    pub fn record_unlock(&mut self, input: &UnlockInput) -> Result<UnlockRecord> {
        input
            .validate()
            .map_err(|err| anyhow!("unlock validation failed: {err}"))?;

        self.conn
            .execute(
                "INSERT INTO unlock_records(actor_id, target_id, scope_id, progress, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    input.actor_id.0,
                    input.target_id.0,
                    input.scope_id.0,
                    i64::from(input.progress),
                    format_rfc3339(input.created_at)?,
                ],
            )
            .context("failed to record unlock attempt")?;

        Ok(UnlockRecord {
            id: UnlockId(self.conn.last_insert_rowid()),
            actor_id: input.actor_id,
            target_id: input.target_id,
            scope_id: input.scope_id,
            progress: input.progress,
            deleted_at: None,
            created_at: input.created_at,
        })
    }

    /// Marks a row deleted. Returns `false` when the row is missing or was
    /// already deleted.
    pub fn soft_delete_unlock(&self, id: UnlockId, deleted_at: OffsetDateTime) -> Result<bool> {
        let changed = self
            .conn
            .execute(
                "UPDATE unlock_records SET deleted_at = ?2 WHERE id = ?1 AND deleted_at IS NULL",
                params![id.0, format_rfc3339(deleted_at)?],
            )
            .with_context(|| format!("failed to soft delete unlock {id}"))?;
        Ok(changed == 1)
    }

    pub fn link_target(&self, link: &TargetLink) -> Result<()> {
        let now = format_rfc3339(now_utc())?;
        insert_link(&self.conn, link, &now)
    }

    pub fn get_unlock(&self, id: UnlockId) -> Result<Option<UnlockRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, actor_id, target_id, scope_id, progress, deleted_at, created_at
             FROM unlock_records
             WHERE id = ?1",
        )?;

        let row = stmt.query_row(params![id.0], parse_unlock_row).optional()?;
        Ok(row)
    }

    /// Writes a deterministic synthetic dataset for one scope in a single
    /// transaction. Every target gets two eligibility paths.
    pub fn seed_dataset(&mut self, plan: &SeedPlan) -> Result<SeedReport> {
        plan.validate()?;

        let base = parse_rfc3339_utc("2024-01-01T00:00:00Z")?;
        let now = format_rfc3339(now_utc())?;
        let tx = self
            .conn
            .transaction()
            .context("failed to start seed transaction")?;

        let (primary_grouping, secondary_grouping) =
            create_seed_groupings(&tx, plan.scope_id, &now)?;
        for target in 1..=plan.targets {
            let target_id = TargetId(i64::from(target));
            for grouping_id in [primary_grouping, secondary_grouping] {
                tx.execute(
                    "INSERT OR IGNORE INTO target_groupings(target_id, grouping_id)
                     VALUES (?1, ?2)",
                    params![target_id.0, grouping_id],
                )
                .context("failed to link seeded target")?;
            }
        }

        let mut inserted_rows = 0_u64;
        let mut soft_deleted_rows = 0_u64;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO unlock_records(
                        actor_id, target_id, scope_id, progress, deleted_at, created_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .context("failed to prepare seed insert")?;

            for attempt in 0..plan.attempts_per_group {
                for actor in 1..=plan.actors {
                    for target in 1..=plan.targets {
                        let created_at = base
                            + time::Duration::seconds(
                                i64::try_from(inserted_rows).unwrap_or(i64::MAX),
                            );
                        let created_at_raw = format_rfc3339(created_at)?;
                        let deleted = plan
                            .delete_every
                            .is_some_and(|every| inserted_rows % u64::from(every) == 0);
                        let deleted_at = deleted.then(|| created_at_raw.clone());
                        let progress = seed_progress(attempt, plan.attempts_per_group);

                        stmt.execute(params![
                            i64::from(actor),
                            i64::from(target),
                            plan.scope_id.0,
                            progress,
                            deleted_at,
                            created_at_raw,
                        ])
                        .context("failed to insert seeded unlock")?;

                        inserted_rows += 1;
                        if deleted {
                            soft_deleted_rows += 1;
                        }
                    }
                }
            }
        }

        tx.commit().context("failed to commit seed transaction")?;

        let report = SeedReport {
            contract_version: "seed_report.v1".to_string(),
            scope_id: plan.scope_id,
            inserted_rows,
            soft_deleted_rows,
            groups: u64::from(plan.actors) * u64::from(plan.targets),
            eligible_targets: u64::from(plan.targets),
        };
        info!(
            scope_id = plan.scope_id.0,
            inserted_rows, soft_deleted_rows, "seeded synthetic unlock dataset"
        );
        Ok(report)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl UnlockBackend for SqliteUnlockStore {
    fn group_size_summary(&self, scope_id: ScopeId) -> Result<GroupSizeSummary> {
        let (total_active, unique_groups, max_group_size) = self
            .conn
            .query_row(GROUP_SIZE_SUMMARY_SQL, params![scope_id.0], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .context("failed to summarize active unlock groups")?;

        Ok(GroupSizeSummary {
            total_active: u64::try_from(total_active)
                .with_context(|| format!("invalid active row count: {total_active}"))?,
            unique_groups: u64::try_from(unique_groups)
                .with_context(|| format!("invalid group count: {unique_groups}"))?,
            max_group_size: u64::try_from(max_group_size)
                .with_context(|| format!("invalid max group size: {max_group_size}"))?,
        })
    }

    fn eligible_target_ids(&self, scope_id: ScopeId) -> Result<Vec<TargetId>> {
        let mut stmt = self
            .conn
            .prepare(ELIGIBLE_TARGETS_SQL)
            .context("failed to prepare eligibility lookup")?;
        let rows = stmt.query_map(params![scope_id.0], |row| Ok(TargetId(row.get(0)?)))?;
        collect_rows(rows)
    }

    fn latest_by_grouped_max_join(&self, scope_id: ScopeId) -> Result<Vec<UnlockRecord>> {
        let mut stmt = self
            .conn
            .prepare(GROUPED_MAX_JOIN_SQL)
            .context("failed to prepare grouped max join")?;
        let rows = stmt.query_map(params![scope_id.0], parse_unlock_row)?;
        collect_rows(rows).context("grouped max join failed")
    }

    fn latest_by_partitioned_rank(
        &self,
        scope_id: ScopeId,
        eligible: &BTreeSet<TargetId>,
    ) -> Result<Vec<UnlockRecord>> {
        let eligible_json =
            serde_json::to_string(eligible).context("failed to encode eligible target ids")?;

        let mut stmt = self
            .conn
            .prepare(PARTITIONED_RANK_SQL)
            .context("failed to prepare partitioned rank")?;
        let rows = stmt.query_map(params![scope_id.0, eligible_json], parse_unlock_row)?;
        collect_rows(rows).context("partitioned rank failed")
    }

    fn query_canceller(&self) -> Box<dyn QueryCanceller> {
        Box::new(SqliteQueryCanceller(self.conn.get_interrupt_handle()))
    }
}

fn insert_link(conn: &Connection, link: &TargetLink, now: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO scopes(scope_id, created_at) VALUES (?1, ?2)",
        params![link.scope_id.0, now],
    )
    .context("failed to insert scope")?;

    let owner: Option<i64> = conn
        .query_row(
            "SELECT scope_id FROM categories WHERE category_id = ?1",
            params![link.category_id],
            |row| row.get(0),
        )
        .optional()
        .context("failed to look up category")?;
    match owner {
        Some(scope_id) if scope_id != link.scope_id.0 => {
            return Err(anyhow!(
                "category {} already belongs to scope {}",
                link.category_id,
                scope_id
            ));
        }
        Some(_) => {}
        None => {
            conn.execute(
                "INSERT INTO categories(category_id, scope_id) VALUES (?1, ?2)",
                params![link.category_id, link.scope_id.0],
            )
            .context("failed to insert category")?;
        }
    }

    conn.execute(
        "INSERT OR IGNORE INTO groupings(grouping_id, category_id) VALUES (?1, ?2)",
        params![link.grouping_id, link.category_id],
    )
    .context("failed to insert grouping")?;

    conn.execute(
        "INSERT OR IGNORE INTO target_groupings(target_id, grouping_id) VALUES (?1, ?2)",
        params![link.target_id.0, link.grouping_id],
    )
    .context("failed to link target to grouping")?;

    Ok(())
}

fn create_seed_groupings(conn: &Connection, scope_id: ScopeId, now: &str) -> Result<(i64, i64)> {
    conn.execute(
        "INSERT OR IGNORE INTO scopes(scope_id, created_at) VALUES (?1, ?2)",
        params![scope_id.0, now],
    )
    .context("failed to insert seeded scope")?;
    conn.execute(
        "INSERT INTO categories(scope_id) VALUES (?1)",
        params![scope_id.0],
    )
    .context("failed to insert seeded category")?;
    let category_id = conn.last_insert_rowid();

    let mut groupings = [0_i64; 2];
    for slot in &mut groupings {
        conn.execute(
            "INSERT INTO groupings(category_id) VALUES (?1)",
            params![category_id],
        )
        .context("failed to insert seeded grouping")?;
        *slot = conn.last_insert_rowid();
    }

    Ok((groupings[0], groupings[1]))
}

fn seed_progress(attempt: u32, attempts_per_group: u32) -> i64 {
    if attempt + 1 == attempts_per_group {
        100
    } else {
        i64::from((attempt * 100) / attempts_per_group)
    }
}

fn parse_unlock_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<UnlockRecord> {
    let progress_i64: i64 = row.get(4)?;
    let progress = u8::try_from(progress_i64).map_err(|_| {
        conversion_error(
            4,
            rusqlite::types::Type::Integer,
            format!("invalid progress: {progress_i64}"),
        )
    })?;

    let deleted_at = row
        .get::<_, Option<String>>(5)?
        .as_deref()
        .map(|value| parse_rfc3339_utc(value).map_err(|err| to_sql_error(5, &err)))
        .transpose()?;
    let created_at =
        parse_rfc3339_utc(&row.get::<_, String>(6)?).map_err(|err| to_sql_error(6, &err))?;

    Ok(UnlockRecord {
        id: UnlockId(row.get(0)?),
        actor_id: ActorId(row.get(1)?),
        target_id: TargetId(row.get(2)?),
        scope_id: ScopeId(row.get(3)?),
        progress,
        deleted_at,
        created_at,
    })
}

fn conversion_error(column: usize, ty: rusqlite::types::Type, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn to_sql_error(column: usize, err: &LatestUnlockError) -> rusqlite::Error {
    conversion_error(column, rusqlite::types::Type::Text, err.to_string())
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
