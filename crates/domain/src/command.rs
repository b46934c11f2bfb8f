//! Command handling: load an aggregate, run a business method, persist the
//! state row and the raised events in one unit of work.

use std::marker::PhantomData;

use common::AggregateId;
use outbox::{AggregateRow, EventEnvelope, Store, UnitOfWork, Version};

use crate::aggregate::Aggregate;
use crate::error::DomainError;

/// A command addressed to one aggregate.
pub trait Command: Send + Sync {
    type Aggregate: Aggregate;

    fn aggregate_id(&self) -> AggregateId;
}

/// Result of command execution.
#[derive(Debug)]
pub struct CommandResult<A: Aggregate> {
    /// The aggregate after the command.
    pub aggregate: A,

    /// The envelopes appended to the outbox, in sequence order.
    pub events: Vec<EventEnvelope>,

    /// Version of the state row after the command.
    pub new_version: Version,
}

enum Expect {
    New,
    Existing,
}

/// Runs commands against one aggregate type.
pub struct CommandHandler<S, A>
where
    S: Store,
    A: Aggregate,
{
    store: S,
    _phantom: PhantomData<A>,
}

impl<S, A> Clone for CommandHandler<S, A>
where
    S: Store,
    A: Aggregate,
{
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<S, A> CommandHandler<S, A>
where
    S: Store,
    A: Aggregate,
    DomainError: From<A::Error>,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            _phantom: PhantomData,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Loads an aggregate, returning None if it was never created.
    pub async fn load(&self, aggregate_id: AggregateId) -> Result<Option<A>, DomainError> {
        let mut uow = self.store.begin().await?;
        let loaded = self.load_in(&mut uow, aggregate_id).await;
        uow.rollback().await?;
        loaded
    }

    /// Loads an aggregate inside an open unit of work.
    pub async fn load_in(
        &self,
        uow: &mut S::UnitOfWork,
        aggregate_id: AggregateId,
    ) -> Result<Option<A>, DomainError> {
        let Some(row) = uow.load_aggregate(A::aggregate_type(), aggregate_id).await? else {
            return Ok(None);
        };
        let version = row.version;
        let mut aggregate: A = row.into_state()?;
        aggregate.set_version(version);
        Ok(Some(aggregate))
    }

    /// Creates a new aggregate in its own unit of work.
    pub async fn create<F>(
        &self,
        aggregate_id: AggregateId,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: FnOnce(&mut A) -> Result<(), A::Error> + Send,
    {
        self.in_own_unit(aggregate_id, Expect::New, command_fn).await
    }

    /// Runs a command against an existing aggregate in its own unit of work.
    pub async fn execute<F>(
        &self,
        aggregate_id: AggregateId,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: FnOnce(&mut A) -> Result<(), A::Error> + Send,
    {
        self.in_own_unit(aggregate_id, Expect::Existing, command_fn)
            .await
    }

    /// Creates a new aggregate inside the caller's unit of work.
    pub async fn create_in<F>(
        &self,
        uow: &mut S::UnitOfWork,
        aggregate_id: AggregateId,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: FnOnce(&mut A) -> Result<(), A::Error> + Send,
    {
        self.run_in(uow, aggregate_id, Expect::New, command_fn)
            .await
    }

    /// Runs a command against an existing aggregate inside the caller's unit
    /// of work. Nothing is visible to others until the caller commits.
    pub async fn execute_in<F>(
        &self,
        uow: &mut S::UnitOfWork,
        aggregate_id: AggregateId,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: FnOnce(&mut A) -> Result<(), A::Error> + Send,
    {
        self.run_in(uow, aggregate_id, Expect::Existing, command_fn)
            .await
    }

    async fn in_own_unit<F>(
        &self,
        aggregate_id: AggregateId,
        expect: Expect,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: FnOnce(&mut A) -> Result<(), A::Error> + Send,
    {
        let mut uow = self.store.begin().await?;
        match self.run_in(&mut uow, aggregate_id, expect, command_fn).await {
            Ok(result) => {
                uow.commit().await?;
                metrics::counter!("domain_commands_committed", "aggregate" => A::aggregate_type())
                    .increment(1);
                Ok(result)
            }
            Err(e) => {
                if let Err(rollback) = uow.rollback().await {
                    tracing::warn!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    async fn run_in<F>(
        &self,
        uow: &mut S::UnitOfWork,
        aggregate_id: AggregateId,
        expect: Expect,
        command_fn: F,
    ) -> Result<CommandResult<A>, DomainError>
    where
        F: FnOnce(&mut A) -> Result<(), A::Error> + Send,
    {
        let loaded = self.load_in(uow, aggregate_id).await?;
        let mut aggregate = match (expect, loaded) {
            (Expect::New, None) => A::default(),
            (Expect::Existing, Some(aggregate)) => aggregate,
            (Expect::New, Some(_)) => {
                return Err(DomainError::AggregateExists {
                    aggregate_type: A::aggregate_type(),
                    aggregate_id: aggregate_id.to_string(),
                });
            }
            (Expect::Existing, None) => {
                return Err(DomainError::AggregateNotFound {
                    aggregate_type: A::aggregate_type(),
                    aggregate_id: aggregate_id.to_string(),
                });
            }
        };
        let current_version = aggregate.version();

        command_fn(&mut aggregate)?;

        let raised = aggregate.take_pending();
        if raised.is_empty() {
            return Ok(CommandResult {
                aggregate,
                events: vec![],
                new_version: current_version,
            });
        }

        let envelopes = raised
            .iter()
            .map(|r| r.to_envelope(aggregate_id, A::aggregate_type()))
            .collect::<Result<Vec<_>, _>>()?;

        let new_version = current_version.next();
        let row = AggregateRow::from_state(
            aggregate_id,
            A::aggregate_type(),
            new_version,
            &aggregate,
        )?;
        uow.save_aggregate(row, current_version).await?;
        uow.append(envelopes.clone()).await?;
        aggregate.set_version(new_version);

        tracing::debug!(
            %aggregate_id,
            events = envelopes.len(),
            version = %new_version,
            "aggregate staged with outbox records"
        );

        Ok(CommandResult {
            aggregate,
            events: envelopes,
            new_version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{DomainEvent, EventBuffer};
    use outbox::{InMemoryStore, Sequence, StoreError};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    enum TestEvent {
        Created { id: AggregateId, name: String },
        Updated { value: i32 },
    }

    impl DomainEvent for TestEvent {
        fn event_type(&self) -> &'static str {
            match self {
                TestEvent::Created { .. } => "TestCreated",
                TestEvent::Updated { .. } => "TestUpdated",
            }
        }
    }

    #[derive(Debug, Default, Serialize, Deserialize)]
    struct TestAggregate {
        id: Option<AggregateId>,
        name: String,
        value: i32,
        #[serde(skip)]
        version: Version,
        events: EventBuffer<TestEvent>,
    }

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("invalid value: {0}")]
        InvalidValue(i32),
    }

    impl From<TestError> for DomainError {
        fn from(e: TestError) -> Self {
            DomainError::AggregateNotFound {
                aggregate_type: "TestAggregate",
                aggregate_id: e.to_string(),
            }
        }
    }

    impl Aggregate for TestAggregate {
        type Event = TestEvent;
        type Error = TestError;

        fn aggregate_type() -> &'static str {
            "TestAggregate"
        }

        fn id(&self) -> Option<AggregateId> {
            self.id
        }

        fn version(&self) -> Version {
            self.version
        }

        fn set_version(&mut self, version: Version) {
            self.version = version;
        }

        fn apply(&mut self, event: Self::Event) {
            match event {
                TestEvent::Created { id, name } => {
                    self.id = Some(id);
                    self.name = name;
                }
                TestEvent::Updated { value } => self.value = value,
            }
        }

        fn buffer(&self) -> &EventBuffer<TestEvent> {
            &self.events
        }

        fn buffer_mut(&mut self) -> &mut EventBuffer<TestEvent> {
            &mut self.events
        }
    }

    fn create(id: AggregateId) -> impl FnOnce(&mut TestAggregate) -> Result<(), TestError> {
        move |agg| {
            agg.raise(TestEvent::Created {
                id,
                name: "Test".to_string(),
            });
            Ok(())
        }
    }

    #[tokio::test]
    async fn create_persists_state_and_outbox_record() {
        let store = InMemoryStore::new();
        let handler: CommandHandler<_, TestAggregate> = CommandHandler::new(store.clone());
        let id = AggregateId::new();

        let result = handler.create(id, create(id)).await.unwrap();
        assert_eq!(result.new_version, Version::new(1));
        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].sequence, Sequence::first());

        let loaded = handler.load(id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Test");
        assert_eq!(loaded.version(), Version::new(1));
        assert_eq!(store.records().await.len(), 1);
    }

    #[tokio::test]
    async fn execute_continues_the_sequence() {
        let store = InMemoryStore::new();
        let handler: CommandHandler<_, TestAggregate> = CommandHandler::new(store.clone());
        let id = AggregateId::new();
        handler.create(id, create(id)).await.unwrap();

        let result = handler
            .execute(id, |agg| {
                agg.raise(TestEvent::Updated { value: 42 });
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(result.new_version, Version::new(2));
        assert_eq!(result.aggregate.value, 42);
        assert_eq!(result.events[0].sequence, Sequence::new(1));
    }

    #[tokio::test]
    async fn rejected_command_persists_nothing() {
        let store = InMemoryStore::new();
        let handler: CommandHandler<_, TestAggregate> = CommandHandler::new(store.clone());
        let id = AggregateId::new();
        handler.create(id, create(id)).await.unwrap();

        let result = handler
            .execute(id, |agg| {
                agg.raise(TestEvent::Updated { value: 7 });
                Err(TestError::InvalidValue(-1))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(store.records().await.len(), 1);
        assert_eq!(handler.load(id).await.unwrap().unwrap().value, 0);
    }

    #[tokio::test]
    async fn failed_append_rolls_back_the_state_write() {
        let store = InMemoryStore::new();
        let handler: CommandHandler<_, TestAggregate> = CommandHandler::new(store.clone());
        let id = AggregateId::new();

        store.fail_next_append();
        let result = handler.create(id, create(id)).await;
        assert!(matches!(
            result,
            Err(DomainError::Store(StoreError::Unavailable(_)))
        ));

        assert!(handler.load(id).await.unwrap().is_none());
        assert!(store.records().await.is_empty());
    }

    #[tokio::test]
    async fn execute_on_missing_aggregate_is_not_found() {
        let handler: CommandHandler<_, TestAggregate> = CommandHandler::new(InMemoryStore::new());
        let result = handler.execute(AggregateId::new(), |_| Ok(())).await;
        assert!(matches!(result, Err(DomainError::AggregateNotFound { .. })));
    }

    #[tokio::test]
    async fn create_twice_is_rejected() {
        let handler: CommandHandler<_, TestAggregate> = CommandHandler::new(InMemoryStore::new());
        let id = AggregateId::new();
        handler.create(id, create(id)).await.unwrap();

        let result = handler.create(id, create(id)).await;
        assert!(matches!(result, Err(DomainError::AggregateExists { .. })));
    }

    #[tokio::test]
    async fn command_without_events_writes_nothing() {
        let store = InMemoryStore::new();
        let handler: CommandHandler<_, TestAggregate> = CommandHandler::new(store.clone());
        let id = AggregateId::new();
        handler.create(id, create(id)).await.unwrap();

        let result = handler.execute(id, |_| Ok(())).await.unwrap();
        assert!(result.events.is_empty());
        assert_eq!(result.new_version, Version::new(1));
        assert_eq!(store.records().await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_writers_conflict() {
        let store = InMemoryStore::new();
        let handler: CommandHandler<_, TestAggregate> = CommandHandler::new(store.clone());
        let id = AggregateId::new();
        handler.create(id, create(id)).await.unwrap();

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        let update = |value| {
            move |agg: &mut TestAggregate| {
                agg.raise(TestEvent::Updated { value });
                Ok(())
            }
        };
        handler.execute_in(&mut first, id, update(1)).await.unwrap();
        handler.execute_in(&mut second, id, update(2)).await.unwrap();

        first.commit().await.unwrap();
        let err = DomainError::from(second.commit().await.unwrap_err());
        assert!(err.is_conflict());
    }
}
