//! PostgreSQL-backed broker.
//!
//! Messages, consumer-group positions and dead letters live in the
//! `broker_*` tables, so unsettled deliveries survive a restart of the
//! process. Each consumer group holds one delivery row per message; a message
//! is deleted as soon as every group has settled it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};

use crate::{
    Broker, BrokerError, DeadLetter, Delivery, DeliveryTag, Message, Result, Subscription,
};

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Settings of the [`PostgresBroker`].
///
/// Reads from environment variables:
/// - `BROKER_ACK_TIMEOUT_MS` — lifetime of an unsettled delivery (default: `30000`)
/// - `BROKER_POLL_INTERVAL_MS` — idle wait of a subscription (default: `200`)
#[derive(Debug, Clone)]
pub struct PostgresBrokerConfig {
    /// Deliveries not settled within this window are handed out again.
    pub ack_timeout: Duration,
    pub poll_interval: Duration,
}

impl PostgresBrokerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            ack_timeout: env_parse("BROKER_ACK_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.ack_timeout),
            poll_interval: env_parse("BROKER_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
        }
    }
}

impl Default for PostgresBrokerConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(200),
        }
    }
}

impl From<sqlx::Error> for BrokerError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut => BrokerError::Timeout,
            sqlx::Error::PoolClosed => BrokerError::Closed,
            sqlx::Error::Database(db)
                if db.is_check_violation() || db.is_foreign_key_violation() =>
            {
                BrokerError::Rejected(db.to_string())
            }
            other => BrokerError::Unavailable(other.to_string()),
        }
    }
}

/// Serializes publishers (shared) against group creation (exclusive) on one
/// topic, so a new group's backfill never misses a concurrent publish.
async fn lock_topic(
    tx: &mut Transaction<'static, Postgres>,
    topic: &str,
    shared: bool,
) -> Result<()> {
    let sql = if shared {
        "SELECT pg_advisory_xact_lock_shared(hashtext('broker:' || $1)::bigint)"
    } else {
        "SELECT pg_advisory_xact_lock(hashtext('broker:' || $1)::bigint)"
    };
    sqlx::query(sql).bind(topic).execute(&mut **tx).await?;
    Ok(())
}

fn encode_headers(headers: &HashMap<String, String>) -> Result<serde_json::Value> {
    serde_json::to_value(headers).map_err(|e| BrokerError::Rejected(format!("headers: {e}")))
}

fn decode_message(row: &PgRow, topic_column: &str) -> Result<Message> {
    let headers: serde_json::Value = row.try_get("headers")?;
    let headers: HashMap<String, String> = serde_json::from_value(headers)
        .map_err(|e| BrokerError::Rejected(format!("corrupt headers: {e}")))?;
    Ok(Message {
        topic: row.try_get(topic_column)?,
        key: row.try_get("message_key")?,
        payload: row.try_get("payload")?,
        headers,
    })
}

fn tag_param(tag: DeliveryTag) -> Result<i64> {
    i64::try_from(tag.as_u64()).map_err(|_| BrokerError::UnknownDelivery(tag))
}

/// Deletes `message_id` once no consumer group still holds it.
async fn trim(tx: &mut Transaction<'static, Postgres>, message_id: i64) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM broker_messages m
        WHERE m.id = $1
          AND NOT EXISTS (SELECT 1 FROM broker_deliveries d WHERE d.message_id = m.id)
        "#,
    )
    .bind(message_id)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Broker persisting topics and consumer groups in PostgreSQL.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so subscriptions of one group in any
/// number of processes compete for deliveries without handing one out twice.
#[derive(Clone)]
pub struct PostgresBroker {
    pool: PgPool,
    config: PostgresBrokerConfig,
}

impl PostgresBroker {
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, PostgresBrokerConfig::default())
    }

    pub fn with_config(pool: PgPool, config: PostgresBrokerConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BrokerError::Unavailable(format!("migration failed: {e}")))
    }

    /// Messages retained on `topic`, in publish order.
    pub async fn retained(&self, topic: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT topic, message_key, payload, headers
            FROM broker_messages
            WHERE topic = $1
            ORDER BY id
            "#,
        )
        .bind(topic)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| decode_message(row, "topic")).collect()
    }
}

#[async_trait]
impl Broker for PostgresBroker {
    async fn publish(&self, message: Message) -> Result<()> {
        let headers = encode_headers(&message.headers)?;
        let mut tx = self.pool.begin().await?;
        lock_topic(&mut tx, &message.topic, true).await?;

        let message_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO broker_messages (topic, message_key, payload, headers)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&message.topic)
        .bind(&message.key)
        .bind(&message.payload)
        .bind(headers)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO broker_deliveries (topic, group_name, message_id, message_key)
            SELECT topic, group_name, $2, $3
            FROM broker_groups
            WHERE topic = $1
            "#,
        )
        .bind(&message.topic)
        .bind(message_id)
        .bind(&message.key)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        tracing::trace!(
            topic = %message.topic,
            key = %message.key,
            message_id,
            "message published"
        );
        Ok(())
    }

    async fn dead_letter(&self, message: Message, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO broker_dead_letters (source_topic, message_key, payload, headers, reason)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&message.topic)
        .bind(&message.key)
        .bind(&message.payload)
        .bind(encode_headers(&message.headers)?)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT source_topic, message_key, payload, headers, reason, dead_lettered_at
            FROM broker_dead_letters
            ORDER BY dead_lettered_at, id
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(DeadLetter {
                    message: decode_message(row, "source_topic")?,
                    reason: row.try_get("reason")?,
                    dead_lettered_at: row.try_get("dead_lettered_at")?,
                })
            })
            .collect()
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>> {
        let mut tx = self.pool.begin().await?;
        lock_topic(&mut tx, topic, false).await?;

        let created = sqlx::query(
            r#"
            INSERT INTO broker_groups (topic, group_name)
            VALUES ($1, $2)
            ON CONFLICT (topic, group_name) DO NOTHING
            "#,
        )
        .bind(topic)
        .bind(group)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if created > 0 {
            let backfilled = sqlx::query(
                r#"
                INSERT INTO broker_deliveries (topic, group_name, message_id, message_key)
                SELECT topic, $2, id, message_key
                FROM broker_messages
                WHERE topic = $1
                "#,
            )
            .bind(topic)
            .bind(group)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            tracing::info!(topic, group, backfilled, "consumer group created");
        }
        tx.commit().await?;

        Ok(Box::new(PostgresSubscription {
            pool: self.pool.clone(),
            config: self.config.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
        }))
    }
}

struct PostgresSubscription {
    pool: PgPool,
    config: PostgresBrokerConfig,
    topic: String,
    group: String,
}

impl PostgresSubscription {
    /// Claims the oldest deliverable message: not in flight, and nothing
    /// older with the same key still unsettled in this group.
    async fn claim(&self) -> Result<Option<Delivery>> {
        let row = sqlx::query(
            r#"
            WITH head AS (
                SELECT d.message_id
                FROM broker_deliveries d
                WHERE d.topic = $1
                  AND d.group_name = $2
                  AND (d.locked_until IS NULL OR d.locked_until <= NOW())
                  AND NOT EXISTS (
                      SELECT 1 FROM broker_deliveries prior
                      WHERE prior.topic = d.topic
                        AND prior.group_name = d.group_name
                        AND prior.message_key = d.message_key
                        AND prior.message_id < d.message_id
                  )
                ORDER BY d.message_id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE broker_deliveries d
            SET deliveries = d.deliveries + 1,
                delivery_tag = nextval('broker_delivery_tags'),
                locked_until = NOW() + make_interval(secs => $3)
            FROM head, broker_messages m
            WHERE d.topic = $1
              AND d.group_name = $2
              AND d.message_id = head.message_id
              AND m.id = d.message_id
            RETURNING d.delivery_tag, d.deliveries, m.topic, m.message_key, m.payload, m.headers
            "#,
        )
        .bind(&self.topic)
        .bind(&self.group)
        .bind(self.config.ack_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let tag: i64 = row.try_get("delivery_tag")?;
        let deliveries: i32 = row.try_get("deliveries")?;
        Ok(Some(Delivery {
            tag: DeliveryTag::new(tag.unsigned_abs()),
            message: decode_message(&row, "topic")?,
            attempt: u32::try_from(deliveries).unwrap_or(u32::MAX),
        }))
    }

    /// Removes the group's delivery row for `tag` and trims its message.
    async fn settle(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        tag: DeliveryTag,
    ) -> Result<i64> {
        lock_topic(tx, &self.topic, true).await?;
        let message_id: Option<i64> = sqlx::query_scalar(
            r#"
            DELETE FROM broker_deliveries
            WHERE topic = $1 AND group_name = $2 AND delivery_tag = $3
            RETURNING message_id
            "#,
        )
        .bind(&self.topic)
        .bind(&self.group)
        .bind(tag_param(tag)?)
        .fetch_optional(&mut **tx)
        .await?;
        message_id.ok_or(BrokerError::UnknownDelivery(tag))
    }
}

#[async_trait]
impl Subscription for PostgresSubscription {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            if self.pool.is_closed() {
                return None;
            }
            match self.claim().await {
                Ok(Some(delivery)) => return Some(delivery),
                Ok(None) => {}
                Err(BrokerError::Closed) => return None,
                Err(e) => {
                    tracing::warn!(
                        topic = %self.topic,
                        group = %self.group,
                        error = %e,
                        "failed to claim the next delivery"
                    );
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let message_id = self.settle(&mut tx, tag).await?;
        trim(&mut tx, message_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn nack(&mut self, tag: DeliveryTag) -> Result<()> {
        let affected = sqlx::query(
            r#"
            UPDATE broker_deliveries
            SET delivery_tag = NULL,
                locked_until = NULL
            WHERE topic = $1 AND group_name = $2 AND delivery_tag = $3
            "#,
        )
        .bind(&self.topic)
        .bind(&self.group)
        .bind(tag_param(tag)?)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(BrokerError::UnknownDelivery(tag));
        }
        Ok(())
    }

    async fn reject(&mut self, tag: DeliveryTag, reason: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let message_id = self.settle(&mut tx, tag).await?;
        sqlx::query(
            r#"
            INSERT INTO broker_dead_letters (source_topic, message_key, payload, headers, reason)
            SELECT topic, message_key, payload, headers, $2
            FROM broker_messages
            WHERE id = $1
            "#,
        )
        .bind(message_id)
        .bind(reason)
        .execute(&mut *tx)
        .await?;
        trim(&mut tx, message_id).await?;
        tx.commit().await?;
        Ok(())
    }
}
