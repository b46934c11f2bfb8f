use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    AggregateId, AggregateRow, EventEnvelope, EventId, FailureOutcome, IdempotencyLedger,
    LedgerEntry, OutboxRecord, OutboxStats, OutboxStatus, RecordId, Result, RetryPolicy,
    StoreError, Version, chrono_duration,
    store::{Maintenance, OutboxStore, Store, UnitOfWork},
};

type AggregateKey = (String, AggregateId);
type LedgerKey = (String, EventId);

#[derive(Default)]
struct Tables {
    aggregates: HashMap<AggregateKey, AggregateRow>,
    outbox: BTreeMap<RecordId, OutboxRecord>,
    event_ids: HashSet<EventId>,
    ledger: HashMap<LedgerKey, LedgerEntry>,
    next_record_id: i64,
}

impl Tables {
    fn current_version(&self, key: &AggregateKey) -> Version {
        self.aggregates
            .get(key)
            .map(|row| row.version)
            .unwrap_or(Version::initial())
    }

    /// Lowest-sequence record per aggregate that has not been sent yet.
    fn aggregate_heads(&self) -> HashMap<AggregateId, RecordId> {
        let mut heads: HashMap<AggregateId, &OutboxRecord> = HashMap::new();
        for record in self.outbox.values() {
            if record.status == OutboxStatus::Sent {
                continue;
            }
            heads
                .entry(record.event.aggregate_id)
                .and_modify(|head| {
                    if record.event.sequence < head.event.sequence {
                        *head = record;
                    }
                })
                .or_insert(record);
        }
        heads.into_iter().map(|(id, r)| (id, r.id)).collect()
    }

    fn claimed_record(&mut self, record_id: RecordId, claimant: &str) -> Result<&mut OutboxRecord> {
        let record = self
            .outbox
            .get_mut(&record_id)
            .ok_or(StoreError::RecordNotFound(record_id))?;
        if record.claimed_by.as_deref() != Some(claimant) || !record.status.is_deliverable() {
            return Err(StoreError::ClaimExpired { record_id });
        }
        Ok(record)
    }
}

struct Shared {
    tables: RwLock<Tables>,
    retry_policy: RetryPolicy,
    fail_next_append: AtomicBool,
    fail_next_commit: AtomicBool,
}

/// In-memory store for tests and local development.
///
/// Units of work stage their writes privately and apply them under one write
/// lock on commit, so a failed or dropped unit leaves no trace.
#[derive(Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_retry_policy(RetryPolicy::default())
    }

    pub fn with_retry_policy(retry_policy: RetryPolicy) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(Tables::default()),
                retry_policy,
                fail_next_append: AtomicBool::new(false),
                fail_next_commit: AtomicBool::new(false),
            }),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.shared.retry_policy
    }

    /// Makes the next `UnitOfWork::append` fail.
    pub fn fail_next_append(&self) {
        self.shared.fail_next_append.store(true, Ordering::SeqCst);
    }

    /// Makes the next `UnitOfWork::commit` fail.
    pub fn fail_next_commit(&self) {
        self.shared.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// All outbox records in append order.
    pub async fn records(&self) -> Vec<OutboxRecord> {
        self.shared.tables.read().await.outbox.values().cloned().collect()
    }

    pub async fn aggregate_count(&self) -> usize {
        self.shared.tables.read().await.aggregates.len()
    }

    pub async fn ledger_len(&self) -> usize {
        self.shared.tables.read().await.ledger.len()
    }

    /// Pretends `consumer` applied `event_id` at `applied_at`.
    pub async fn seed_ledger(&self, consumer: &str, event_id: EventId, applied_at: DateTime<Utc>) {
        self.shared.tables.write().await.ledger.insert(
            (consumer.to_string(), event_id),
            LedgerEntry {
                consumer: consumer.to_string(),
                event_id,
                applied_at,
            },
        );
    }
}

#[async_trait]
impl Store for InMemoryStore {
    type UnitOfWork = InMemoryUnitOfWork;

    async fn begin(&self) -> Result<Self::UnitOfWork> {
        Ok(InMemoryUnitOfWork {
            shared: Arc::clone(&self.shared),
            aggregates: HashMap::new(),
            events: Vec::new(),
            applied: HashSet::new(),
        })
    }
}

/// Unit of work over an [`InMemoryStore`].
pub struct InMemoryUnitOfWork {
    shared: Arc<Shared>,
    /// Staged rows with the version each save expected.
    aggregates: HashMap<AggregateKey, (AggregateRow, Version)>,
    events: Vec<EventEnvelope>,
    applied: HashSet<LedgerKey>,
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn load_aggregate(
        &mut self,
        aggregate_type: &str,
        aggregate_id: AggregateId,
    ) -> Result<Option<AggregateRow>> {
        let key = (aggregate_type.to_string(), aggregate_id);
        if let Some((row, _)) = self.aggregates.get(&key) {
            return Ok(Some(row.clone()));
        }
        let tables = self.shared.tables.read().await;
        Ok(tables.aggregates.get(&key).cloned())
    }

    async fn save_aggregate(&mut self, row: AggregateRow, expected: Version) -> Result<()> {
        let key = (row.aggregate_type.clone(), row.aggregate_id);
        let actual = match self.aggregates.get(&key) {
            Some((staged, _)) => staged.version,
            None => self.shared.tables.read().await.current_version(&key),
        };
        if actual != expected {
            return Err(StoreError::ConcurrencyConflict {
                aggregate_id: row.aggregate_id,
                expected,
                actual,
            });
        }
        // Commit validates against the version first loaded, not an
        // intermediate staged one.
        let base = self
            .aggregates
            .get(&key)
            .map(|(_, base)| *base)
            .unwrap_or(expected);
        self.aggregates.insert(key, (row, base));
        Ok(())
    }

    async fn append(&mut self, events: Vec<EventEnvelope>) -> Result<()> {
        if self.shared.fail_next_append.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected append failure".into()));
        }
        {
            let tables = self.shared.tables.read().await;
            for event in &events {
                if tables.event_ids.contains(&event.event_id)
                    || self.events.iter().any(|e| e.event_id == event.event_id)
                {
                    return Err(StoreError::DuplicateEvent(event.event_id));
                }
            }
        }
        self.events.extend(events);
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        if self.shared.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected commit failure".into()));
        }

        let mut tables = self.shared.tables.write().await;

        for (key, (row, base)) in &self.aggregates {
            let actual = tables.current_version(key);
            if actual != *base {
                return Err(StoreError::ConcurrencyConflict {
                    aggregate_id: row.aggregate_id,
                    expected: *base,
                    actual,
                });
            }
        }
        for event in &self.events {
            if tables.event_ids.contains(&event.event_id) {
                return Err(StoreError::DuplicateEvent(event.event_id));
            }
        }
        for (consumer, event_id) in &self.applied {
            if tables.ledger.contains_key(&(consumer.clone(), *event_id)) {
                return Err(StoreError::AlreadyApplied {
                    consumer: consumer.clone(),
                    event_id: *event_id,
                });
            }
        }

        let now = Utc::now();
        for (key, (row, _)) in self.aggregates {
            tables.aggregates.insert(key, row);
        }
        for event in self.events {
            tables.next_record_id += 1;
            let id = RecordId::new(tables.next_record_id);
            tables.event_ids.insert(event.event_id);
            tables.outbox.insert(id, OutboxRecord::pending(id, event, now));
        }
        for (consumer, event_id) in self.applied {
            let entry = LedgerEntry {
                consumer: consumer.clone(),
                event_id,
                applied_at: now,
            };
            tables.ledger.insert((consumer, event_id), entry);
        }
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl IdempotencyLedger for InMemoryUnitOfWork {
    async fn has_applied(&mut self, consumer: &str, event_id: EventId) -> Result<bool> {
        let key = (consumer.to_string(), event_id);
        if self.applied.contains(&key) {
            return Ok(true);
        }
        Ok(self.shared.tables.read().await.ledger.contains_key(&key))
    }

    async fn record_applied(&mut self, consumer: &str, event_id: EventId) -> Result<()> {
        if self.has_applied(consumer, event_id).await? {
            return Err(StoreError::AlreadyApplied {
                consumer: consumer.to_string(),
                event_id,
            });
        }
        self.applied.insert((consumer.to_string(), event_id));
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn fetch_pending(
        &self,
        limit: usize,
        visibility_timeout: Duration,
        claimant: &str,
    ) -> Result<Vec<OutboxRecord>> {
        let mut tables = self.shared.tables.write().await;
        let now = Utc::now();
        let claimed_until = now + chrono_duration(visibility_timeout);

        let mut candidates: Vec<RecordId> = tables
            .aggregate_heads()
            .into_values()
            .filter(|id| tables.outbox[id].is_claimable(now))
            .collect();
        candidates.sort();
        candidates.truncate(limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(record) = tables.outbox.get_mut(&id) {
                record.status = OutboxStatus::Pending;
                record.claimed_by = Some(claimant.to_string());
                record.claimed_until = Some(claimed_until);
                claimed.push(record.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_sent(&self, record_id: RecordId) -> Result<()> {
        let mut tables = self.shared.tables.write().await;
        let record = tables
            .outbox
            .get_mut(&record_id)
            .ok_or(StoreError::RecordNotFound(record_id))?;
        if record.status != OutboxStatus::Sent {
            record.status = OutboxStatus::Sent;
            record.sent_at = Some(Utc::now());
        }
        record.claimed_by = None;
        record.claimed_until = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        record_id: RecordId,
        claimant: &str,
        reason: &str,
    ) -> Result<FailureOutcome> {
        let policy = self.shared.retry_policy.clone();
        let mut tables = self.shared.tables.write().await;
        let record = tables.claimed_record(record_id, claimant)?;
        let now = Utc::now();

        record.attempts += 1;
        record.last_attempt_at = Some(now);
        record.last_error = Some(reason.to_string());
        record.claimed_by = None;
        record.claimed_until = None;

        if policy.is_exhausted(record.attempts) {
            record.status = OutboxStatus::Exhausted;
            return Ok(FailureOutcome::Exhausted {
                attempts: record.attempts,
            });
        }
        record.status = OutboxStatus::Failed;
        record.next_eligible_at = now + chrono_duration(policy.delay_for(record.attempts));
        Ok(FailureOutcome::Retrying {
            attempts: record.attempts,
            next_eligible_at: record.next_eligible_at,
        })
    }

    async fn release(&self, record_id: RecordId, claimant: &str) -> Result<()> {
        let mut tables = self.shared.tables.write().await;
        let record = tables.claimed_record(record_id, claimant)?;
        record.claimed_by = None;
        record.claimed_until = None;
        Ok(())
    }

    async fn requeue(&self, record_id: RecordId) -> Result<()> {
        let mut tables = self.shared.tables.write().await;
        let record = tables
            .outbox
            .get_mut(&record_id)
            .ok_or(StoreError::RecordNotFound(record_id))?;
        if record.status != OutboxStatus::Exhausted {
            return Err(StoreError::NotExhausted(record_id));
        }
        record.status = OutboxStatus::Pending;
        record.attempts = 0;
        record.next_eligible_at = Utc::now();
        Ok(())
    }

    async fn get(&self, record_id: RecordId) -> Result<Option<OutboxRecord>> {
        Ok(self.shared.tables.read().await.outbox.get(&record_id).cloned())
    }

    async fn list_exhausted(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let tables = self.shared.tables.read().await;
        Ok(tables
            .outbox
            .values()
            .filter(|r| r.status == OutboxStatus::Exhausted)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let tables = self.shared.tables.read().await;
        let now = Utc::now();
        let mut stats = OutboxStats::default();
        for record in tables.outbox.values() {
            match record.status {
                OutboxStatus::Pending => stats.pending += 1,
                OutboxStatus::Failed => stats.failed += 1,
                OutboxStatus::Sent => stats.sent += 1,
                OutboxStatus::Exhausted => stats.exhausted += 1,
            }
            if record.status.is_deliverable() && record.is_claimed(now) {
                stats.in_flight += 1;
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl Maintenance for InMemoryStore {
    async fn purge_sent(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.shared.tables.write().await;
        let expired: Vec<(RecordId, EventId)> = tables
            .outbox
            .values()
            .filter(|r| r.status == OutboxStatus::Sent && r.sent_at.is_some_and(|at| at < cutoff))
            .map(|r| (r.id, r.event.event_id))
            .collect();
        for (id, event_id) in &expired {
            tables.outbox.remove(id);
            tables.event_ids.remove(event_id);
        }
        Ok(expired.len() as u64)
    }

    async fn purge_ledger(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.shared.tables.write().await;
        let before = tables.ledger.len();
        tables.ledger.retain(|_, entry| entry.applied_at >= cutoff);
        Ok((before - tables.ledger.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Sequence;

    fn event(aggregate_id: AggregateId, sequence: i64, event_type: &str) -> EventEnvelope {
        EventEnvelope::builder()
            .aggregate_id(aggregate_id)
            .aggregate_type("Order")
            .event_type(event_type)
            .sequence(Sequence::new(sequence))
            .payload_raw(serde_json::json!({"test": true}))
            .build()
    }

    fn row(aggregate_id: AggregateId, version: i64) -> AggregateRow {
        AggregateRow::from_state(
            aggregate_id,
            "Order",
            Version::new(version),
            &serde_json::json!({"status": "created"}),
        )
        .unwrap()
    }

    async fn append_committed(store: &InMemoryStore, events: Vec<EventEnvelope>) {
        let mut uow = store.begin().await.unwrap();
        uow.append(events).await.unwrap();
        uow.commit().await.unwrap();
    }

    #[tokio::test]
    async fn commit_makes_state_and_outbox_visible_together() {
        let store = InMemoryStore::new();
        let id = AggregateId::new();

        let mut uow = store.begin().await.unwrap();
        uow.save_aggregate(row(id, 1), Version::initial()).await.unwrap();
        uow.append(vec![event(id, 0, "OrderCreated")]).await.unwrap();
        assert_eq!(store.aggregate_count().await, 0);
        assert!(store.records().await.is_empty());

        uow.commit().await.unwrap();
        assert_eq!(store.aggregate_count().await, 1);
        assert_eq!(store.records().await.len(), 1);
    }

    #[tokio::test]
    async fn dropped_unit_of_work_leaves_nothing() {
        let store = InMemoryStore::new();
        let id = AggregateId::new();
        {
            let mut uow = store.begin().await.unwrap();
            uow.save_aggregate(row(id, 1), Version::initial()).await.unwrap();
            uow.append(vec![event(id, 0, "OrderCreated")]).await.unwrap();
        }
        assert_eq!(store.aggregate_count().await, 0);
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn injected_commit_failure_discards_everything() {
        let store = InMemoryStore::new();
        let id = AggregateId::new();
        store.fail_next_commit();

        let mut uow = store.begin().await.unwrap();
        uow.save_aggregate(row(id, 1), Version::initial()).await.unwrap();
        uow.append(vec![event(id, 0, "OrderCreated")]).await.unwrap();
        assert!(matches!(uow.commit().await, Err(StoreError::Unavailable(_))));

        assert_eq!(store.aggregate_count().await, 0);
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn stale_version_conflicts_at_commit() {
        let store = InMemoryStore::new();
        let id = AggregateId::new();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.save_aggregate(row(id, 1), Version::initial()).await.unwrap();
        second.save_aggregate(row(id, 1), Version::initial()).await.unwrap();

        first.commit().await.unwrap();
        assert!(matches!(
            second.commit().await,
            Err(StoreError::ConcurrencyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_event_id_is_rejected() {
        let store = InMemoryStore::new();
        let e = event(AggregateId::new(), 0, "OrderCreated");
        append_committed(&store, vec![e.clone()]).await;

        let mut uow = store.begin().await.unwrap();
        assert!(matches!(
            uow.append(vec![e]).await,
            Err(StoreError::DuplicateEvent(_))
        ));
    }

    #[tokio::test]
    async fn fetch_pending_claims_only_the_head_of_each_aggregate() {
        let store = InMemoryStore::new();
        let a = AggregateId::new();
        let b = AggregateId::new();
        append_committed(
            &store,
            vec![event(a, 0, "OrderCreated"), event(a, 1, "OrderPaid")],
        )
        .await;
        append_committed(&store, vec![event(b, 0, "OrderCreated")]).await;

        let batch = store
            .fetch_pending(10, Duration::from_secs(30), "relay-1")
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert!(batch.iter().all(|r| r.event.sequence == Sequence::first()));

        // Heads are claimed; the follower of `a` waits until its head is sent.
        let second = store
            .fetch_pending(10, Duration::from_secs(30), "relay-2")
            .await
            .unwrap();
        assert!(second.is_empty());

        let head_a = batch.iter().find(|r| r.event.aggregate_id == a).unwrap();
        store.mark_sent(head_a.id).await.unwrap();
        let third = store
            .fetch_pending(10, Duration::from_secs(30), "relay-2")
            .await
            .unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].event.event_type, "OrderPaid");
    }

    #[tokio::test]
    async fn concurrent_claims_never_overlap() {
        let store = InMemoryStore::new();
        for _ in 0..50 {
            append_committed(&store, vec![event(AggregateId::new(), 0, "OrderCreated")]).await;
        }

        let mut tasks = Vec::new();
        for n in 0..5 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .fetch_pending(20, Duration::from_secs(30), &format!("relay-{n}"))
                    .await
                    .unwrap()
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for task in tasks {
            for record in task.await.unwrap() {
                total += 1;
                assert!(seen.insert(record.id), "record {} claimed twice", record.id);
            }
        }
        assert_eq!(total, 50);
    }

    #[tokio::test]
    async fn expired_claim_returns_to_the_pool() {
        let store = InMemoryStore::new();
        append_committed(&store, vec![event(AggregateId::new(), 0, "OrderCreated")]).await;

        let first = store.fetch_pending(10, Duration::ZERO, "crashed").await.unwrap();
        assert_eq!(first.len(), 1);

        let again = store
            .fetch_pending(10, Duration::from_secs(30), "survivor")
            .await
            .unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].id, first[0].id);
        assert_eq!(again[0].claimed_by.as_deref(), Some("survivor"));

        // The crashed relay lost its claim.
        assert!(matches!(
            store.mark_failed(first[0].id, "crashed", "late").await,
            Err(StoreError::ClaimExpired { .. })
        ));
    }

    #[tokio::test]
    async fn mark_failed_schedules_backoff() {
        let store = InMemoryStore::with_retry_policy(RetryPolicy {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(600),
            max_attempts: 2,
            jitter: false,
        });
        append_committed(&store, vec![event(AggregateId::new(), 0, "OrderCreated")]).await;

        let record = &store.fetch_pending(1, Duration::ZERO, "r").await.unwrap()[0];
        let outcome = store.mark_failed(record.id, "r", "broker down").await.unwrap();
        let FailureOutcome::Retrying {
            attempts,
            next_eligible_at,
        } = outcome
        else {
            panic!("expected retry, got {outcome:?}");
        };
        assert_eq!(attempts, 1);
        assert!(next_eligible_at > Utc::now() + chrono::Duration::seconds(50));

        // Backoff gate hides it.
        assert!(store.fetch_pending(1, Duration::ZERO, "r").await.unwrap().is_empty());
        let stored = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OutboxStatus::Failed);
        assert_eq!(stored.last_error.as_deref(), Some("broker down"));
    }

    #[tokio::test]
    async fn exhausted_record_waits_for_requeue() {
        let store = InMemoryStore::with_retry_policy(RetryPolicy::immediate(2));
        append_committed(&store, vec![event(AggregateId::new(), 0, "OrderCreated")]).await;

        for expected in 1..=2u32 {
            let record = &store.fetch_pending(1, Duration::ZERO, "r").await.unwrap()[0];
            let outcome = store.mark_failed(record.id, "r", "rejected").await.unwrap();
            if expected == 2 {
                assert_eq!(outcome, FailureOutcome::Exhausted { attempts: 2 });
            }
        }
        assert!(store.fetch_pending(1, Duration::ZERO, "r").await.unwrap().is_empty());
        let exhausted = store.list_exhausted(10).await.unwrap();
        assert_eq!(exhausted.len(), 1);

        store.requeue(exhausted[0].id).await.unwrap();
        let record = store.get(exhausted[0].id).await.unwrap().unwrap();
        assert_eq!(record.status, OutboxStatus::Pending);
        assert_eq!(record.attempts, 0);
        assert_eq!(store.fetch_pending(1, Duration::ZERO, "r").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn requeue_rejects_live_records() {
        let store = InMemoryStore::new();
        append_committed(&store, vec![event(AggregateId::new(), 0, "OrderCreated")]).await;
        let id = store.records().await[0].id;
        assert!(matches!(
            store.requeue(id).await,
            Err(StoreError::NotExhausted(_))
        ));
    }

    #[tokio::test]
    async fn release_does_not_count_an_attempt() {
        let store = InMemoryStore::new();
        append_committed(&store, vec![event(AggregateId::new(), 0, "OrderCreated")]).await;
        let record = &store
            .fetch_pending(1, Duration::from_secs(30), "r")
            .await
            .unwrap()[0];

        store.release(record.id, "r").await.unwrap();
        let reclaimed = store.fetch_pending(1, Duration::from_secs(30), "r2").await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].attempts, 0);
    }

    #[tokio::test]
    async fn ledger_entries_commit_with_the_unit_of_work() {
        let store = InMemoryStore::new();
        let event_id = EventId::new();

        let mut uow = store.begin().await.unwrap();
        assert!(!uow.has_applied("mailer", event_id).await.unwrap());
        uow.record_applied("mailer", event_id).await.unwrap();
        assert!(uow.has_applied("mailer", event_id).await.unwrap());
        uow.rollback().await.unwrap();
        assert_eq!(store.ledger_len().await, 0);

        let mut uow = store.begin().await.unwrap();
        uow.record_applied("mailer", event_id).await.unwrap();
        uow.commit().await.unwrap();

        let mut uow = store.begin().await.unwrap();
        assert!(uow.has_applied("mailer", event_id).await.unwrap());
        assert!(!uow.has_applied("auditor", event_id).await.unwrap());
        assert!(matches!(
            uow.record_applied("mailer", event_id).await,
            Err(StoreError::AlreadyApplied { .. })
        ));
    }

    #[tokio::test]
    async fn racing_ledger_writes_conflict_at_commit() {
        let store = InMemoryStore::new();
        let event_id = EventId::new();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        first.record_applied("mailer", event_id).await.unwrap();
        second.record_applied("mailer", event_id).await.unwrap();

        first.commit().await.unwrap();
        assert!(matches!(
            second.commit().await,
            Err(StoreError::AlreadyApplied { .. })
        ));
    }

    #[tokio::test]
    async fn stats_count_each_status() {
        let store = InMemoryStore::with_retry_policy(RetryPolicy::immediate(1));
        for _ in 0..3 {
            append_committed(&store, vec![event(AggregateId::new(), 0, "OrderCreated")]).await;
        }
        let batch = store.fetch_pending(3, Duration::from_secs(30), "r").await.unwrap();
        store.mark_sent(batch[0].id).await.unwrap();
        store.mark_failed(batch[1].id, "r", "bad").await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.exhausted, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_flight, 1);
    }

    #[tokio::test]
    async fn purge_removes_only_old_sent_records() {
        let store = InMemoryStore::new();
        let a = AggregateId::new();
        append_committed(&store, vec![event(a, 0, "OrderCreated")]).await;
        append_committed(&store, vec![event(AggregateId::new(), 0, "OrderCreated")]).await;

        let batch = store.fetch_pending(2, Duration::from_secs(30), "r").await.unwrap();
        let sent = batch.iter().find(|r| r.event.aggregate_id == a).unwrap();
        store.mark_sent(sent.id).await.unwrap();

        let purged = store
            .purge_sent(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.records().await.len(), 1);
    }

    #[tokio::test]
    async fn purge_ledger_respects_cutoff() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store
            .seed_ledger("mailer", EventId::new(), now - chrono::Duration::days(30))
            .await;
        store.seed_ledger("mailer", EventId::new(), now).await;

        let purged = store
            .purge_ledger(now - chrono::Duration::days(14))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.ledger_len().await, 1);
    }
}
