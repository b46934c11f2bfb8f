use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use uuid::Uuid;

use crate::{
    AggregateId, AggregateRow, EventEnvelope, EventId, FailureOutcome, IdempotencyLedger,
    OutboxRecord, OutboxStats, OutboxStatus, RecordId, Result, RetryPolicy, Sequence, StoreError,
    Version, chrono_duration,
    store::{Maintenance, OutboxStore, Store, UnitOfWork},
};

const RECORD_COLUMNS: &str = "id, event_id, event_type, aggregate_id, aggregate_type, sequence, \
     occurred_at, payload, status, attempts, last_attempt_at, next_eligible_at, last_error, \
     claimed_by, claimed_until, created_at, sent_at";

/// PostgreSQL-backed store.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so any number of relays can poll the
/// same table without handing out a record twice.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    retry_policy: RetryPolicy,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_retry_policy(pool, RetryPolicy::default())
    }

    pub fn with_retry_policy(pool: PgPool, retry_policy: RetryPolicy) -> Self {
        Self { pool, retry_policy }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_record(row: PgRow) -> Result<OutboxRecord> {
        let status: String = row.try_get("status")?;
        let status = OutboxStatus::parse(&status)
            .ok_or_else(|| StoreError::CorruptRow(format!("unknown outbox status '{status}'")))?;
        let attempts: i32 = row.try_get("attempts")?;

        Ok(OutboxRecord {
            id: RecordId::new(row.try_get("id")?),
            event: EventEnvelope {
                event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
                event_type: row.try_get("event_type")?,
                aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
                aggregate_type: row.try_get("aggregate_type")?,
                sequence: Sequence::new(row.try_get("sequence")?),
                occurred_at: row.try_get("occurred_at")?,
                payload: row.try_get("payload")?,
            },
            status,
            attempts: u32::try_from(attempts)
                .map_err(|_| StoreError::CorruptRow(format!("negative attempts {attempts}")))?,
            last_attempt_at: row.try_get("last_attempt_at")?,
            next_eligible_at: row.try_get("next_eligible_at")?,
            last_error: row.try_get("last_error")?,
            claimed_by: row.try_get("claimed_by")?,
            claimed_until: row.try_get("claimed_until")?,
            created_at: row.try_get("created_at")?,
            sent_at: row.try_get("sent_at")?,
        })
    }

    /// Distinguishes a missing record from one whose claim moved on.
    async fn claim_lost(&self, record_id: RecordId) -> StoreError {
        match self.get(record_id).await {
            Ok(Some(_)) => StoreError::ClaimExpired { record_id },
            Ok(None) => StoreError::RecordNotFound(record_id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl Store for PostgresStore {
    type UnitOfWork = PgUnitOfWork;

    async fn begin(&self) -> Result<Self::UnitOfWork> {
        Ok(PgUnitOfWork {
            tx: self.pool.begin().await?,
        })
    }
}

/// Unit of work backed by one database transaction.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl PgUnitOfWork {
    async fn current_version(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Version> {
        let version: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM aggregates WHERE aggregate_type = $1 AND aggregate_id = $2",
        )
        .bind(aggregate_type)
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;
        Ok(version.map(Version::new).unwrap_or(Version::initial()))
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn load_aggregate(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<AggregateRow>> {
        let row: Option<PgRow> = sqlx::query(
            r#"
            SELECT aggregate_id, aggregate_type, version, state, updated_at
            FROM aggregates
            WHERE aggregate_type = $1 AND aggregate_id = $2
            "#,
        )
        .bind(aggregate_type)
        .bind(aggregate_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await?;

        match row {
            Some(row) => Ok(Some(AggregateRow {
                aggregate_id: AggregateId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
                aggregate_type: row.try_get("aggregate_type")?,
                version: Version::new(row.try_get("version")?),
                state: row.try_get("state")?,
                updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
            })),
            None => Ok(None),
        }
    }

    async fn save_aggregate(&mut self, row: AggregateRow, expected: Version) -> Result<()> {
        let affected = if expected == Version::initial() {
            sqlx::query(
                r#"
                INSERT INTO aggregates (aggregate_type, aggregate_id, version, state, updated_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (aggregate_type, aggregate_id) DO NOTHING
                "#,
            )
            .bind(&row.aggregate_type)
            .bind(row.aggregate_id.as_uuid())
            .bind(row.version.as_i64())
            .bind(&row.state)
            .bind(row.updated_at)
            .execute(&mut *self.tx)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                r#"
                UPDATE aggregates
                SET version = $3, state = $4, updated_at = $5
                WHERE aggregate_type = $1 AND aggregate_id = $2 AND version = $6
                "#,
            )
            .bind(&row.aggregate_type)
            .bind(row.aggregate_id.as_uuid())
            .bind(row.version.as_i64())
            .bind(&row.state)
            .bind(row.updated_at)
            .bind(expected.as_i64())
            .execute(&mut *self.tx)
            .await?
            .rows_affected()
        };

        if affected == 0 {
            let actual = self
                .current_version(&row.aggregate_type, row.aggregate_id)
                .await?;
            return Err(StoreError::ConcurrencyConflict {
                aggregate_id: row.aggregate_id,
                expected,
                actual,
            });
        }
        Ok(())
    }

    async fn append(&mut self, events: Vec<EventEnvelope>) -> Result<()> {
        for event in &events {
            sqlx::query(
                r#"
                INSERT INTO outbox (event_id, event_type, aggregate_id, aggregate_type, sequence, occurred_at, payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(&event.event_type)
            .bind(event.aggregate_id.as_uuid())
            .bind(&event.aggregate_type)
            .bind(event.sequence.as_i64())
            .bind(event.occurred_at)
            .bind(&event.payload)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| {
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_outbox_event")
                {
                    return StoreError::DuplicateEvent(event.event_id);
                }
                StoreError::Database(e)
            })?;
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[async_trait]
impl IdempotencyLedger for PgUnitOfWork {
    async fn has_applied(&mut self, consumer: &str, event_id: EventId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM idempotency_ledger WHERE consumer = $1 AND event_id = $2)",
        )
        .bind(consumer)
        .bind(event_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await?;
        Ok(exists)
    }

    async fn record_applied(&mut self, consumer: &str, event_id: EventId) -> Result<()> {
        // A concurrent insert of the same pair blocks here until the other
        // transaction ends, then skips.
        let affected = sqlx::query(
            r#"
            INSERT INTO idempotency_ledger (consumer, event_id)
            VALUES ($1, $2)
            ON CONFLICT (consumer, event_id) DO NOTHING
            "#,
        )
        .bind(consumer)
        .bind(event_id.as_uuid())
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::AlreadyApplied {
                consumer: consumer.to_string(),
                event_id,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresStore {
    #[tracing::instrument(skip(self))]
    async fn fetch_pending(
        &self,
        limit: usize,
        visibility_timeout: Duration,
        claimant: &str,
    ) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            WITH heads AS (
                SELECT o.id
                FROM outbox o
                WHERE o.status IN ('pending', 'failed')
                  AND o.next_eligible_at <= NOW()
                  AND (o.claimed_until IS NULL OR o.claimed_until <= NOW())
                  AND NOT EXISTS (
                      SELECT 1 FROM outbox prior
                      WHERE prior.aggregate_id = o.aggregate_id
                        AND prior.sequence < o.sequence
                        AND prior.status <> 'sent'
                  )
                ORDER BY o.id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox
            SET status = 'pending',
                claimed_by = $2,
                claimed_until = NOW() + make_interval(secs => $3)
            FROM heads
            WHERE outbox.id = heads.id
            RETURNING outbox.*
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(claimant)
        .bind(visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows
            .into_iter()
            .map(Self::row_to_record)
            .collect::<Result<Vec<_>>>()?;
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn mark_sent(&self, record_id: RecordId) -> Result<()> {
        let affected = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'sent',
                sent_at = COALESCE(sent_at, NOW()),
                claimed_by = NULL,
                claimed_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(record_id.as_i64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::RecordNotFound(record_id));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn mark_failed(
        &self,
        record_id: RecordId,
        claimant: &str,
        reason: &str,
    ) -> Result<FailureOutcome> {
        let mut tx = self.pool.begin().await?;

        let row: Option<PgRow> =
            sqlx::query("SELECT status, attempts, claimed_by FROM outbox WHERE id = $1 FOR UPDATE")
                .bind(record_id.as_i64())
                .fetch_optional(&mut *tx)
                .await?;
        let Some(row) = row else {
            return Err(StoreError::RecordNotFound(record_id));
        };

        let status: String = row.try_get("status")?;
        let claimed_by: Option<String> = row.try_get("claimed_by")?;
        let deliverable = OutboxStatus::parse(&status).is_some_and(|s| s.is_deliverable());
        if !deliverable || claimed_by.as_deref() != Some(claimant) {
            return Err(StoreError::ClaimExpired { record_id });
        }

        let attempts = row.try_get::<i32, _>("attempts")?.max(0) as u32 + 1;
        let now = Utc::now();
        let (status, next_eligible_at, outcome) = if self.retry_policy.is_exhausted(attempts) {
            (
                OutboxStatus::Exhausted,
                now,
                FailureOutcome::Exhausted { attempts },
            )
        } else {
            let next_eligible_at = now + chrono_duration(self.retry_policy.delay_for(attempts));
            (
                OutboxStatus::Failed,
                next_eligible_at,
                FailureOutcome::Retrying {
                    attempts,
                    next_eligible_at,
                },
            )
        };

        sqlx::query(
            r#"
            UPDATE outbox
            SET status = $2,
                attempts = $3,
                last_attempt_at = $4,
                next_eligible_at = $5,
                last_error = $6,
                claimed_by = NULL,
                claimed_until = NULL
            WHERE id = $1
            "#,
        )
        .bind(record_id.as_i64())
        .bind(status.as_str())
        .bind(attempts as i32)
        .bind(now)
        .bind(next_eligible_at)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(outcome)
    }

    async fn release(&self, record_id: RecordId, claimant: &str) -> Result<()> {
        let affected = sqlx::query(
            r#"
            UPDATE outbox
            SET claimed_by = NULL, claimed_until = NULL
            WHERE id = $1 AND claimed_by = $2 AND status IN ('pending', 'failed')
            "#,
        )
        .bind(record_id.as_i64())
        .bind(claimant)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(self.claim_lost(record_id).await);
        }
        Ok(())
    }

    async fn requeue(&self, record_id: RecordId) -> Result<()> {
        let affected = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'pending', attempts = 0, next_eligible_at = NOW()
            WHERE id = $1 AND status = 'exhausted'
            "#,
        )
        .bind(record_id.as_i64())
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return match self.get(record_id).await? {
                Some(_) => Err(StoreError::NotExhausted(record_id)),
                None => Err(StoreError::RecordNotFound(record_id)),
            };
        }
        Ok(())
    }

    async fn get(&self, record_id: RecordId) -> Result<Option<OutboxRecord>> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM outbox WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(record_id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_record).transpose()
    }

    async fn list_exhausted(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM outbox WHERE status = 'exhausted' ORDER BY id LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE status = 'sent') AS sent,
                COUNT(*) FILTER (WHERE status = 'exhausted') AS exhausted,
                COUNT(*) FILTER (
                    WHERE status IN ('pending', 'failed') AND claimed_until > NOW()
                ) AS in_flight
            FROM outbox
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let count =
            |column: &str| -> Result<u64> { Ok(row.try_get::<i64, _>(column)?.max(0) as u64) };
        Ok(OutboxStats {
            pending: count("pending")?,
            failed: count("failed")?,
            sent: count("sent")?,
            exhausted: count("exhausted")?,
            in_flight: count("in_flight")?,
        })
    }
}

#[async_trait]
impl Maintenance for PostgresStore {
    async fn purge_sent(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM outbox WHERE status = 'sent' AND sent_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn purge_ledger(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM idempotency_ledger WHERE applied_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
