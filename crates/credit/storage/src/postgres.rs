//! PostgreSQL ledger store.
//!
//! Each [`LedgerTx`] wraps one database transaction. Lock keys map to
//! transaction-scoped advisory locks, so they are released on commit or
//! rollback together with every row written under them.

use crate::model::{
    audit_digest, AggregateRow, AggregatedRating, AllocationState, ArchiveRecord, AuditAppend,
    AuditFilter, AuditRecord, DeletedRows, LockKey, RaterMatterTally, RatingRow, SpendRow,
    TargetSnapshot, VoterScopeTally, VoterSnapshot,
};
use crate::traits::{LedgerStore, LedgerTx};
use crate::{StorageError, StorageResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use credit_types::{AllocationKind, ChangeReason, IdentityId, Matter, RatingKey, ScopeId, TargetId};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::collections::BTreeSet;
use uuid::Uuid;

const RATING_COLUMNS: &str = "rater_id, target_id, matter, category, value, last_modified, seq";
const ALLOCATION_COLUMNS: &str =
    "kind, rater_id, target_id, scope_id, current_value, updated_at, seq";
const AGGREGATE_COLUMNS: &str =
    "kind, target_id, scope_id, summed_value, last_increased, decision_time_snapshot_value, created_at";

/// PostgreSQL-backed [`LedgerStore`].
#[derive(Clone)]
pub struct PostgresLedgerStore {
    pool: PgPool,
}

impl PostgresLedgerStore {
    /// Connect to PostgreSQL and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            r#"
            CREATE TABLE IF NOT EXISTS credit_ratings (
                rater_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                matter TEXT NOT NULL,
                category TEXT NOT NULL,
                value BIGINT NOT NULL,
                last_modified TIMESTAMPTZ NOT NULL,
                seq BIGSERIAL NOT NULL,
                PRIMARY KEY (rater_id, target_id, matter, category)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS credit_ratings_rater_matter ON credit_ratings (rater_id, matter)",
            "CREATE INDEX IF NOT EXISTS credit_ratings_target_matter ON credit_ratings (target_id, matter)",
            r#"
            CREATE TABLE IF NOT EXISTS credit_allocations (
                kind TEXT NOT NULL,
                rater_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                current_value BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                seq BIGSERIAL NOT NULL,
                PRIMARY KEY (kind, rater_id, target_id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS credit_allocations_voter_scope ON credit_allocations (kind, rater_id, scope_id)",
            "CREATE INDEX IF NOT EXISTS credit_allocations_target ON credit_allocations (kind, target_id)",
            r#"
            CREATE TABLE IF NOT EXISTS credit_aggregates (
                kind TEXT NOT NULL,
                target_id TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                summed_value BIGINT NOT NULL,
                last_increased TIMESTAMPTZ,
                decision_time_snapshot_value BIGINT,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (kind, target_id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS credit_aggregates_scope ON credit_aggregates (kind, scope_id)",
            r#"
            CREATE TABLE IF NOT EXISTS credit_spend (
                id BIGSERIAL PRIMARY KEY,
                kind TEXT NOT NULL,
                rater_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                amount BIGINT NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS credit_spend_rater_time ON credit_spend (kind, rater_id, timestamp)",
            "CREATE INDEX IF NOT EXISTS credit_spend_target ON credit_spend (kind, target_id)",
            r#"
            CREATE TABLE IF NOT EXISTS credit_target_snapshots (
                id BIGSERIAL PRIMARY KEY,
                kind TEXT NOT NULL,
                target_id TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                value BIGINT NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS credit_target_snapshots_target_time ON credit_target_snapshots (kind, target_id, timestamp)",
            r#"
            CREATE TABLE IF NOT EXISTS credit_voter_snapshots (
                id BIGSERIAL PRIMARY KEY,
                kind TEXT NOT NULL,
                voter_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                scope_id TEXT NOT NULL,
                value BIGINT NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS credit_voter_snapshots_target ON credit_voter_snapshots (kind, target_id)",
            r#"
            CREATE TABLE IF NOT EXISTS credit_audit_events (
                sequence BIGSERIAL PRIMARY KEY,
                event_id TEXT NOT NULL UNIQUE,
                actor TEXT NOT NULL,
                target_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                old_value BIGINT NOT NULL,
                new_value BIGINT NOT NULL,
                reason TEXT NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL,
                payload JSONB NOT NULL,
                digest TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS credit_audit_actor ON credit_audit_events (actor)",
            "CREATE INDEX IF NOT EXISTS credit_audit_target ON credit_audit_events (target_id)",
            r#"
            CREATE TABLE IF NOT EXISTS credit_archives (
                id BIGSERIAL PRIMARY KEY,
                label TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                taken_at TIMESTAMPTZ NOT NULL,
                row_count BIGINT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS credit_archives_label_time ON credit_archives (label, taken_at)",
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PostgresLedgerStore {
    async fn begin(&self) -> StorageResult<Box<dyn LedgerTx>> {
        let tx = self.pool.begin().await.map_err(backend)?;
        Ok(Box::new(PostgresTx {
            tx,
            held: BTreeSet::new(),
        }))
    }

    async fn rating_tallies(&self) -> StorageResult<Vec<RaterMatterTally>> {
        let rows = sqlx::query(
            r#"
            SELECT rater_id, matter, SUM(ABS(value))::BIGINT AS tally
              FROM credit_ratings
             WHERE value <> 0
             GROUP BY rater_id, matter
             ORDER BY rater_id, matter
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter()
            .map(|row| -> StorageResult<RaterMatterTally> {
                Ok(RaterMatterTally {
                    rater: IdentityId(row.try_get("rater_id").map_err(backend)?),
                    matter: parse_matter(&row.try_get::<String, _>("matter").map_err(backend)?)?,
                    tally: row.try_get("tally").map_err(backend)?,
                })
            })
            .collect()
    }

    async fn allocation_tallies(
        &self,
        kind: AllocationKind,
    ) -> StorageResult<Vec<VoterScopeTally>> {
        let rows = sqlx::query(
            r#"
            SELECT rater_id, scope_id, SUM(ABS(current_value))::BIGINT AS tally
              FROM credit_allocations
             WHERE kind = $1 AND current_value <> 0
             GROUP BY rater_id, scope_id
             ORDER BY rater_id, scope_id
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter()
            .map(|row| -> StorageResult<VoterScopeTally> {
                Ok(VoterScopeTally {
                    kind,
                    voter: IdentityId(row.try_get("rater_id").map_err(backend)?),
                    scope: ScopeId(row.try_get("scope_id").map_err(backend)?),
                    tally: row.try_get("tally").map_err(backend)?,
                })
            })
            .collect()
    }

    async fn ratings_for_matter(&self, matter: Matter) -> StorageResult<Vec<RatingRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {RATING_COLUMNS} FROM credit_ratings WHERE matter = $1 ORDER BY seq"
        ))
        .bind(matter.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter().map(rating_row_to_record).collect()
    }

    async fn allocations_of_kind(
        &self,
        kind: AllocationKind,
    ) -> StorageResult<Vec<AllocationState>> {
        let rows = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM credit_allocations WHERE kind = $1 ORDER BY seq"
        ))
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter().map(allocation_row_to_record).collect()
    }

    async fn aggregated_rating(
        &self,
        target: &TargetId,
        matter: Matter,
        category: &str,
    ) -> StorageResult<AggregatedRating> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(value), 0)::BIGINT AS rating, COUNT(*)::BIGINT AS contributors
              FROM credit_ratings
             WHERE target_id = $1 AND matter = $2 AND category = $3 AND value <> 0
            "#,
        )
        .bind(target.as_str())
        .bind(matter.as_str())
        .bind(category)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        Ok(AggregatedRating {
            rating: row.try_get("rating").map_err(backend)?,
            contributor_count: row.try_get::<i64, _>("contributors").map_err(backend)? as u64,
        })
    }

    async fn aggregates_for_scope(
        &self,
        kind: AllocationKind,
        scope: &ScopeId,
    ) -> StorageResult<Vec<AggregateRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {AGGREGATE_COLUMNS} FROM credit_aggregates WHERE kind = $1 AND scope_id = $2 ORDER BY target_id"
        ))
        .bind(kind.as_str())
        .bind(scope.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter().map(aggregate_row_to_record).collect()
    }

    async fn target_snapshots(
        &self,
        kind: AllocationKind,
        target: &TargetId,
        until: Option<DateTime<Utc>>,
    ) -> StorageResult<Vec<TargetSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT kind, target_id, scope_id, value, timestamp
              FROM credit_target_snapshots
             WHERE kind = $1 AND target_id = $2
               AND ($3::TIMESTAMPTZ IS NULL OR timestamp <= $3)
             ORDER BY timestamp, id
            "#,
        )
        .bind(kind.as_str())
        .bind(target.as_str())
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter()
            .map(|row| -> StorageResult<TargetSnapshot> {
                Ok(TargetSnapshot {
                    kind: parse_kind(&row.try_get::<String, _>("kind").map_err(backend)?)?,
                    target: TargetId(row.try_get("target_id").map_err(backend)?),
                    scope: ScopeId(row.try_get("scope_id").map_err(backend)?),
                    value: row.try_get("value").map_err(backend)?,
                    timestamp: row.try_get("timestamp").map_err(backend)?,
                })
            })
            .collect()
    }

    async fn list_audit(&self, filter: AuditFilter) -> StorageResult<Vec<AuditRecord>> {
        let limit = if filter.window.limit == 0 {
            None
        } else {
            Some(to_i64(filter.window.limit)?)
        };
        let rows = sqlx::query(
            r#"
            SELECT sequence, event_id, actor, target_id, event_type, old_value, new_value,
                   reason, timestamp, payload, digest
              FROM credit_audit_events
             WHERE ($1::TEXT IS NULL OR actor = $1)
               AND ($2::TEXT IS NULL OR target_id = $2)
             ORDER BY sequence DESC
             LIMIT $3 OFFSET $4
            "#,
        )
        .bind(filter.actor.as_ref().map(|a| a.as_str().to_string()))
        .bind(filter.target.as_ref().map(|t| t.as_str().to_string()))
        .bind(limit)
        .bind(to_i64(filter.window.offset)?)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.into_iter().map(audit_row_to_record).collect()
    }

    async fn latest_archive(&self, label: &str) -> StorageResult<Option<ArchiveRecord>> {
        let row = sqlx::query(
            r#"
            SELECT label, url, taken_at, row_count
              FROM credit_archives
             WHERE label = $1
             ORDER BY taken_at DESC
             LIMIT 1
            "#,
        )
        .bind(label)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        row.map(|row| -> StorageResult<ArchiveRecord> {
            Ok(ArchiveRecord {
                label: row.try_get("label").map_err(backend)?,
                url: row.try_get("url").map_err(backend)?,
                taken_at: row.try_get("taken_at").map_err(backend)?,
                row_count: row.try_get::<i64, _>("row_count").map_err(backend)? as u64,
            })
        })
        .transpose()
    }
}

struct PostgresTx {
    tx: Transaction<'static, Postgres>,
    held: BTreeSet<String>,
}

#[async_trait]
impl LedgerTx for PostgresTx {
    async fn lock(&mut self, key: LockKey) -> StorageResult<()> {
        let name = key.to_string();
        if self.held.contains(&name) {
            return Ok(());
        }
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(&name)
            .execute(&mut *self.tx)
            .await
            .map_err(backend)?;
        self.held.insert(name);
        Ok(())
    }

    async fn get_rating(&mut self, key: &RatingKey) -> StorageResult<Option<RatingRow>> {
        let row = sqlx::query(&format!(
            "SELECT {RATING_COLUMNS} FROM credit_ratings WHERE rater_id = $1 AND target_id = $2 AND matter = $3 AND category = $4"
        ))
        .bind(key.rater().as_str())
        .bind(key.target().as_str())
        .bind(key.matter().as_str())
        .bind(key.category())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(backend)?;
        row.map(rating_row_to_record).transpose()
    }

    async fn ratings_for_rater_matter(
        &mut self,
        rater: &IdentityId,
        matter: Matter,
    ) -> StorageResult<Vec<RatingRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {RATING_COLUMNS} FROM credit_ratings WHERE rater_id = $1 AND matter = $2 ORDER BY seq"
        ))
        .bind(rater.as_str())
        .bind(matter.as_str())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(backend)?;
        rows.into_iter().map(rating_row_to_record).collect()
    }

    async fn ratings_given_by(&mut self, rater: &IdentityId) -> StorageResult<Vec<RatingRow>> {
        let rows = sqlx::query(&format!(
            "SELECT {RATING_COLUMNS} FROM credit_ratings WHERE rater_id = $1 ORDER BY seq"
        ))
        .bind(rater.as_str())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(backend)?;
        rows.into_iter().map(rating_row_to_record).collect()
    }

    async fn put_rating(
        &mut self,
        key: &RatingKey,
        value: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<RatingRow> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO credit_ratings (rater_id, target_id, matter, category, value, last_modified)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (rater_id, target_id, matter, category)
            DO UPDATE SET value = EXCLUDED.value, last_modified = EXCLUDED.last_modified
            RETURNING {RATING_COLUMNS}
            "#
        ))
        .bind(key.rater().as_str())
        .bind(key.target().as_str())
        .bind(key.matter().as_str())
        .bind(key.category())
        .bind(value)
        .bind(at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(backend)?;
        rating_row_to_record(row)
    }

    async fn get_allocation(
        &mut self,
        kind: AllocationKind,
        rater: &IdentityId,
        target: &TargetId,
    ) -> StorageResult<Option<AllocationState>> {
        let row = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM credit_allocations WHERE kind = $1 AND rater_id = $2 AND target_id = $3"
        ))
        .bind(kind.as_str())
        .bind(rater.as_str())
        .bind(target.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(backend)?;
        row.map(allocation_row_to_record).transpose()
    }

    async fn allocations_for_voter_scope(
        &mut self,
        kind: AllocationKind,
        voter: &IdentityId,
        scope: &ScopeId,
    ) -> StorageResult<Vec<AllocationState>> {
        let rows = sqlx::query(&format!(
            "SELECT {ALLOCATION_COLUMNS} FROM credit_allocations WHERE kind = $1 AND rater_id = $2 AND scope_id = $3 ORDER BY seq"
        ))
        .bind(kind.as_str())
        .bind(voter.as_str())
        .bind(scope.as_str())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(backend)?;
        rows.into_iter().map(allocation_row_to_record).collect()
    }

    async fn put_allocation(
        &mut self,
        kind: AllocationKind,
        rater: &IdentityId,
        target: &TargetId,
        scope: &ScopeId,
        value: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<AllocationState> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO credit_allocations (kind, rater_id, target_id, scope_id, current_value, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (kind, rater_id, target_id)
            DO UPDATE SET current_value = EXCLUDED.current_value,
                          scope_id = EXCLUDED.scope_id,
                          updated_at = EXCLUDED.updated_at
            RETURNING {ALLOCATION_COLUMNS}
            "#
        ))
        .bind(kind.as_str())
        .bind(rater.as_str())
        .bind(target.as_str())
        .bind(scope.as_str())
        .bind(value)
        .bind(at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(backend)?;
        allocation_row_to_record(row)
    }

    async fn get_aggregate(
        &mut self,
        kind: AllocationKind,
        target: &TargetId,
    ) -> StorageResult<Option<AggregateRow>> {
        let row = sqlx::query(&format!(
            "SELECT {AGGREGATE_COLUMNS} FROM credit_aggregates WHERE kind = $1 AND target_id = $2"
        ))
        .bind(kind.as_str())
        .bind(target.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(backend)?;
        row.map(aggregate_row_to_record).transpose()
    }

    async fn apply_aggregate_change(
        &mut self,
        kind: AllocationKind,
        target: &TargetId,
        scope: &ScopeId,
        change: i64,
        at: DateTime<Utc>,
    ) -> StorageResult<AggregateRow> {
        let last_increased = if change > 0 { Some(at) } else { None };
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO credit_aggregates (kind, target_id, scope_id, summed_value, last_increased, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (kind, target_id)
            DO UPDATE SET summed_value = credit_aggregates.summed_value + EXCLUDED.summed_value,
                          last_increased = COALESCE(EXCLUDED.last_increased, credit_aggregates.last_increased)
            RETURNING {AGGREGATE_COLUMNS}
            "#
        ))
        .bind(kind.as_str())
        .bind(target.as_str())
        .bind(scope.as_str())
        .bind(change)
        .bind(last_increased)
        .bind(at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(backend)?;
        aggregate_row_to_record(row)
    }

    async fn set_decision_snapshot(
        &mut self,
        kind: AllocationKind,
        target: &TargetId,
        value: i64,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            "UPDATE credit_aggregates SET decision_time_snapshot_value = $3 WHERE kind = $1 AND target_id = $2",
        )
        .bind(kind.as_str())
        .bind(target.as_str())
        .bind(value)
        .execute(&mut *self.tx)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("aggregate {kind}:{target}")));
        }
        Ok(())
    }

    async fn append_spend(&mut self, row: SpendRow) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO credit_spend (kind, rater_id, target_id, scope_id, amount, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(row.kind.as_str())
        .bind(row.rater.as_str())
        .bind(row.target.as_str())
        .bind(row.scope.as_str())
        .bind(row.amount)
        .bind(row.timestamp)
        .execute(&mut *self.tx)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn spend_since(
        &mut self,
        kind: AllocationKind,
        rater: &IdentityId,
        since: DateTime<Utc>,
    ) -> StorageResult<i64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT AS total
              FROM credit_spend
             WHERE kind = $1 AND rater_id = $2 AND timestamp > $3
            "#,
        )
        .bind(kind.as_str())
        .bind(rater.as_str())
        .bind(since)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(backend)?;
        row.try_get("total").map_err(backend)
    }

    async fn append_target_snapshot(&mut self, snapshot: TargetSnapshot) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO credit_target_snapshots (kind, target_id, scope_id, value, timestamp)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(snapshot.kind.as_str())
        .bind(snapshot.target.as_str())
        .bind(snapshot.scope.as_str())
        .bind(snapshot.value)
        .bind(snapshot.timestamp)
        .execute(&mut *self.tx)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn append_voter_snapshot(&mut self, snapshot: VoterSnapshot) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO credit_voter_snapshots (kind, voter_id, target_id, scope_id, value, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(snapshot.kind.as_str())
        .bind(snapshot.voter.as_str())
        .bind(snapshot.target.as_str())
        .bind(snapshot.scope.as_str())
        .bind(snapshot.value)
        .bind(snapshot.timestamp)
        .execute(&mut *self.tx)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn append_audit(&mut self, event: AuditAppend) -> StorageResult<()> {
        let event_id = format!("audit-{}", Uuid::new_v4());
        let digest = audit_digest(&event, &event_id)?;
        sqlx::query(
            r#"
            INSERT INTO credit_audit_events
                (event_id, actor, target_id, event_type, old_value, new_value, reason, timestamp, payload, digest)
            VALUES
                ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(event_id)
        .bind(event.actor.as_str())
        .bind(event.target.as_str())
        .bind(&event.event_type)
        .bind(event.old_value)
        .bind(event.new_value)
        .bind(event.reason.as_str())
        .bind(event.timestamp)
        .bind(&event.payload)
        .bind(digest)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn record_archive(&mut self, record: ArchiveRecord) -> StorageResult<()> {
        sqlx::query(
            "INSERT INTO credit_archives (label, url, taken_at, row_count) VALUES ($1, $2, $3, $4)",
        )
        .bind(&record.label)
        .bind(&record.url)
        .bind(record.taken_at)
        .bind(i64::try_from(record.row_count).map_err(|_| {
            StorageError::InvalidInput("archive row count too large".to_string())
        })?)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_conflict)?;
        Ok(())
    }

    async fn delete_target(
        &mut self,
        kind: AllocationKind,
        target: &TargetId,
    ) -> StorageResult<DeletedRows> {
        let mut deleted = DeletedRows::default();
        let statements = [
            "DELETE FROM credit_allocations WHERE kind = $1 AND target_id = $2",
            "DELETE FROM credit_spend WHERE kind = $1 AND target_id = $2",
            "DELETE FROM credit_target_snapshots WHERE kind = $1 AND target_id = $2",
            "DELETE FROM credit_voter_snapshots WHERE kind = $1 AND target_id = $2",
            "DELETE FROM credit_aggregates WHERE kind = $1 AND target_id = $2",
        ];
        let mut counts = [0_u64; 5];
        for (stmt, count) in statements.iter().zip(counts.iter_mut()) {
            *count = sqlx::query(stmt)
                .bind(kind.as_str())
                .bind(target.as_str())
                .execute(&mut *self.tx)
                .await
                .map_err(backend)?
                .rows_affected();
        }
        deleted.allocations = counts[0];
        deleted.spend_rows = counts[1];
        deleted.snapshots = counts[2] + counts[3];
        deleted.aggregates = counts[4];
        Ok(deleted)
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        self.tx.commit().await.map_err(backend)
    }
}

fn backend(err: sqlx::Error) -> StorageError {
    StorageError::Backend(err.to_string())
}

fn map_sqlx_conflict(err: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.code().as_deref() == Some("23505") {
            return StorageError::Conflict(db_err.message().to_string());
        }
    }
    StorageError::Backend(err.to_string())
}

fn to_i64(value: usize) -> StorageResult<i64> {
    i64::try_from(value)
        .map_err(|_| StorageError::InvalidInput("window value too large".to_string()))
}

fn parse_matter(raw: &str) -> StorageResult<Matter> {
    raw.parse()
        .map_err(|e| StorageError::Serialization(format!("bad matter column: {e}")))
}

fn parse_kind(raw: &str) -> StorageResult<AllocationKind> {
    match raw {
        "vote" => Ok(AllocationKind::Vote),
        "clap" => Ok(AllocationKind::Clap),
        other => Err(StorageError::Serialization(format!(
            "bad allocation kind column: {other}"
        ))),
    }
}

fn parse_reason(raw: &str) -> StorageResult<ChangeReason> {
    match raw {
        "USER_EDIT" => Ok(ChangeReason::UserEdit),
        "LOST_CREDIT" => Ok(ChangeReason::LostCredit),
        "IDENTITY_MERGE" => Ok(ChangeReason::IdentityMerge),
        "ADMIN_ADJUSTMENT" => Ok(ChangeReason::AdminAdjustment),
        other => Err(StorageError::Serialization(format!(
            "bad change reason column: {other}"
        ))),
    }
}

fn to_seq(raw: i64) -> StorageResult<u64> {
    u64::try_from(raw).map_err(|_| StorageError::Serialization(format!("negative sequence {raw}")))
}

fn rating_row_to_record(row: PgRow) -> StorageResult<RatingRow> {
    let matter = parse_matter(&row.try_get::<String, _>("matter").map_err(backend)?)?;
    let key = RatingKey::new(
        IdentityId(row.try_get("rater_id").map_err(backend)?),
        TargetId(row.try_get("target_id").map_err(backend)?),
        matter,
        row.try_get::<String, _>("category").map_err(backend)?,
    )
    .map_err(|e| StorageError::Serialization(format!("stored rating key rejected: {e}")))?;
    Ok(RatingRow {
        key,
        value: row.try_get("value").map_err(backend)?,
        last_modified: row.try_get("last_modified").map_err(backend)?,
        seq: to_seq(row.try_get("seq").map_err(backend)?)?,
    })
}

fn allocation_row_to_record(row: PgRow) -> StorageResult<AllocationState> {
    Ok(AllocationState {
        kind: parse_kind(&row.try_get::<String, _>("kind").map_err(backend)?)?,
        rater: IdentityId(row.try_get("rater_id").map_err(backend)?),
        target: TargetId(row.try_get("target_id").map_err(backend)?),
        scope: ScopeId(row.try_get("scope_id").map_err(backend)?),
        current_value: row.try_get("current_value").map_err(backend)?,
        updated_at: row.try_get("updated_at").map_err(backend)?,
        seq: to_seq(row.try_get("seq").map_err(backend)?)?,
    })
}

fn aggregate_row_to_record(row: PgRow) -> StorageResult<AggregateRow> {
    Ok(AggregateRow {
        kind: parse_kind(&row.try_get::<String, _>("kind").map_err(backend)?)?,
        target: TargetId(row.try_get("target_id").map_err(backend)?),
        scope: ScopeId(row.try_get("scope_id").map_err(backend)?),
        summed_value: row.try_get("summed_value").map_err(backend)?,
        last_increased: row.try_get("last_increased").map_err(backend)?,
        decision_time_snapshot_value: row
            .try_get("decision_time_snapshot_value")
            .map_err(backend)?,
        created_at: row.try_get("created_at").map_err(backend)?,
    })
}

fn audit_row_to_record(row: PgRow) -> StorageResult<AuditRecord> {
    Ok(AuditRecord {
        event_id: row.try_get("event_id").map_err(backend)?,
        sequence: to_seq(row.try_get("sequence").map_err(backend)?)?,
        actor: IdentityId(row.try_get("actor").map_err(backend)?),
        target: TargetId(row.try_get("target_id").map_err(backend)?),
        event_type: row.try_get("event_type").map_err(backend)?,
        old_value: row.try_get("old_value").map_err(backend)?,
        new_value: row.try_get("new_value").map_err(backend)?,
        reason: parse_reason(&row.try_get::<String, _>("reason").map_err(backend)?)?,
        timestamp: row.try_get("timestamp").map_err(backend)?,
        payload: row.try_get("payload").map_err(backend)?,
        digest: row.try_get("digest").map_err(backend)?,
    })
}
