//! Operator endpoints for outbox delivery and dead letters.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use broker::{HEADER_CONSUMER, HEADER_EVENT_ID, HEADER_EVENT_TYPE};
use outbox::{OutboxRecord, OutboxStats, OutboxStore, RecordId};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::{AppState, Backend};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

#[derive(Deserialize)]
pub struct ListQuery {
    pub limit: Option<usize>,
}

impl ListQuery {
    fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

#[derive(Serialize)]
pub struct OutboxRecordResponse {
    pub id: i64,
    pub event_id: String,
    pub event_type: String,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub sequence: i64,
    pub status: &'static str,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<String>,
    pub created_at: String,
}

impl From<OutboxRecord> for OutboxRecordResponse {
    fn from(record: OutboxRecord) -> Self {
        Self {
            id: record.id.as_i64(),
            event_id: record.event.event_id.to_string(),
            event_type: record.event.event_type,
            aggregate_id: record.event.aggregate_id.to_string(),
            aggregate_type: record.event.aggregate_type,
            sequence: record.event.sequence.as_i64(),
            status: record.status.as_str(),
            attempts: record.attempts,
            last_error: record.last_error,
            last_attempt_at: record.last_attempt_at.map(|at| at.to_rfc3339()),
            created_at: record.created_at.to_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct DeadLetterResponse {
    pub topic: String,
    pub key: String,
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    /// Set when only one consumer failed the event.
    pub consumer: Option<String>,
    pub reason: String,
    pub dead_lettered_at: String,
}

/// GET /outbox/stats — delivery-status counts.
#[tracing::instrument(skip(state))]
pub async fn stats<S: Backend>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<OutboxStats>, ApiError> {
    let stats = state.store.stats().await?;

    metrics::gauge!("outbox_records", "status" => "pending").set(stats.pending as f64);
    metrics::gauge!("outbox_records", "status" => "failed").set(stats.failed as f64);
    metrics::gauge!("outbox_records", "status" => "exhausted").set(stats.exhausted as f64);

    Ok(Json(stats))
}

/// GET /outbox/exhausted?limit=N — records waiting for an operator.
#[tracing::instrument(skip(state, query))]
pub async fn exhausted<S: Backend>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<OutboxRecordResponse>>, ApiError> {
    let records = state.store.list_exhausted(query.limit()).await?;

    Ok(Json(records.into_iter().map(Into::into).collect()))
}

/// POST /outbox/{id}/requeue — give an exhausted record a fresh set of attempts.
#[tracing::instrument(skip(state))]
pub async fn requeue<S: Backend>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<i64>,
) -> Result<Json<OutboxRecordResponse>, ApiError> {
    let record_id = RecordId::new(id);
    state.store.requeue(record_id).await?;

    let record = state
        .store
        .get(record_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Outbox record {id} not found")))?;

    tracing::info!(record_id = id, event_id = %record.event.event_id, "outbox record requeued");
    Ok(Json(record.into()))
}

/// GET /dead-letters?limit=N — messages parked on any dead-letter topic,
/// oldest first.
#[tracing::instrument(skip(state, query))]
pub async fn dead_letters<S: Backend>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<DeadLetterResponse>>, ApiError> {
    let letters = state.broker.list_dead_letters(query.limit()).await?;

    Ok(Json(
        letters
            .into_iter()
            .map(|letter| DeadLetterResponse {
                topic: letter.topic(),
                event_id: letter.message.header(HEADER_EVENT_ID).map(String::from),
                event_type: letter.message.header(HEADER_EVENT_TYPE).map(String::from),
                consumer: letter.message.header(HEADER_CONSUMER).map(String::from),
                key: letter.message.key,
                reason: letter.reason,
                dead_lettered_at: letter.dead_lettered_at.to_rfc3339(),
            })
            .collect(),
    ))
}
