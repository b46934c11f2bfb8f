//! Order service providing a simplified API for order operations.

use common::AggregateId;
use outbox::Store;

use crate::command::{Command, CommandHandler, CommandResult};
use crate::error::DomainError;

use super::{CancelOrder, CreateOrder, Order, PayOrder, RecordConfirmation, ShipOrder};

/// Service for managing orders.
///
/// Every successful command commits the new order row together with the
/// outbox records for the events it raised.
pub struct OrderService<S: Store> {
    handler: CommandHandler<S, Order>,
}

impl<S: Store> Clone for OrderService<S> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
        }
    }
}

impl<S: Store> OrderService<S> {
    pub fn new(store: S) -> Self {
        Self {
            handler: CommandHandler::new(store),
        }
    }

    pub fn handler(&self) -> &CommandHandler<S, Order> {
        &self.handler
    }

    #[tracing::instrument(skip(self))]
    pub async fn create_order(
        &self,
        cmd: CreateOrder,
    ) -> Result<CommandResult<Order>, DomainError> {
        let order_id = cmd.aggregate_id();
        let CreateOrder {
            customer_id, items, ..
        } = cmd;

        self.handler
            .create(order_id, |order| order.create(order_id, customer_id, items))
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn pay_order(&self, cmd: PayOrder) -> Result<CommandResult<Order>, DomainError> {
        let order_id = cmd.aggregate_id();
        let PayOrder {
            payment_id, amount, ..
        } = cmd;

        self.handler
            .execute(order_id, |order| order.pay(payment_id, amount))
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn ship_order(&self, cmd: ShipOrder) -> Result<CommandResult<Order>, DomainError> {
        let order_id = cmd.aggregate_id();

        self.handler
            .execute(order_id, |order| order.ship(cmd.tracking_number))
            .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        cmd: CancelOrder,
    ) -> Result<CommandResult<Order>, DomainError> {
        let order_id = cmd.aggregate_id();
        let CancelOrder {
            reason,
            cancelled_by,
            ..
        } = cmd;

        self.handler
            .execute(order_id, |order| order.cancel(reason, cancelled_by))
            .await
    }

    /// Records a sent payment confirmation inside the caller's unit of work,
    /// so it commits together with the caller's idempotency entry.
    #[tracing::instrument(skip(self, uow))]
    pub async fn record_confirmation_in(
        &self,
        uow: &mut S::UnitOfWork,
        cmd: RecordConfirmation,
    ) -> Result<CommandResult<Order>, DomainError> {
        let order_id = cmd.aggregate_id();
        let paid_event_id = cmd.paid_event_id;

        self.handler
            .execute_in(uow, order_id, |order| order.record_confirmation(paid_event_id))
            .await
    }

    /// Loads an order by ID. Returns None if the order doesn't exist.
    #[tracing::instrument(skip(self))]
    pub async fn get_order(&self, order_id: AggregateId) -> Result<Option<Order>, DomainError> {
        self.handler.load(order_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregate;
    use crate::order::{CustomerId, Money, OrderError, OrderEvent, OrderItem, OrderState};
    use outbox::{EventId, InMemoryStore, Sequence, UnitOfWork};

    fn items() -> Vec<OrderItem> {
        vec![OrderItem::new("SKU-001", "Widget", 2, Money::from_cents(1000))]
    }

    async fn placed_order(service: &OrderService<InMemoryStore>) -> AggregateId {
        let cmd = CreateOrder::for_customer(CustomerId::new(), items());
        let order_id = cmd.order_id;
        service.create_order(cmd).await.unwrap();
        order_id
    }

    #[tokio::test]
    async fn create_order_writes_row_and_one_outbox_record() {
        let store = InMemoryStore::new();
        let service = OrderService::new(store.clone());

        let customer_id = CustomerId::new();
        let cmd = CreateOrder::for_customer(customer_id, items());
        let order_id = cmd.order_id;
        let result = service.create_order(cmd).await.unwrap();

        assert_eq!(result.aggregate.id(), Some(order_id));
        assert_eq!(result.aggregate.customer_id(), Some(customer_id));
        assert_eq!(result.events.len(), 1);

        let records = store.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event.event_type, OrderEvent::CREATED);
        assert_eq!(records[0].event.aggregate_type, "Order");
        assert_eq!(store.aggregate_count().await, 1);
    }

    #[tokio::test]
    async fn create_order_twice_is_rejected() {
        let service = OrderService::new(InMemoryStore::new());
        let order_id = placed_order(&service).await;

        let err = service
            .create_order(CreateOrder::new(order_id, CustomerId::new(), items()))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::AggregateExists { .. }));
    }

    #[tokio::test]
    async fn pay_order_appends_sequence_one() {
        let store = InMemoryStore::new();
        let service = OrderService::new(store.clone());
        let order_id = placed_order(&service).await;

        let result = service
            .pay_order(PayOrder::new(order_id, "PAY-1", Money::from_cents(2000)))
            .await
            .unwrap();

        assert_eq!(result.aggregate.state(), OrderState::Paid);
        assert_eq!(result.events[0].event_type, OrderEvent::PAID);
        assert_eq!(result.events[0].sequence, Sequence::new(1));
        assert_eq!(store.records().await.len(), 2);
    }

    #[tokio::test]
    async fn rejected_command_writes_nothing() {
        let store = InMemoryStore::new();
        let service = OrderService::new(store.clone());
        let order_id = placed_order(&service).await;

        let err = service
            .ship_order(ShipOrder::new(order_id, None))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DomainError::Order(OrderError::InvalidStateTransition { .. })
        ));
        assert_eq!(store.records().await.len(), 1);
    }

    #[tokio::test]
    async fn unknown_order_is_not_found() {
        let service = OrderService::new(InMemoryStore::new());
        let err = service
            .cancel_order(CancelOrder::new(AggregateId::new(), "nope", None))
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::AggregateNotFound { .. }));
    }

    #[tokio::test]
    async fn cancel_order() {
        let service = OrderService::new(InMemoryStore::new());
        let order_id = placed_order(&service).await;

        let result = service
            .cancel_order(CancelOrder::new(
                order_id,
                "Customer changed mind",
                Some("customer".to_string()),
            ))
            .await
            .unwrap();

        assert_eq!(result.aggregate.state(), OrderState::Cancelled);
        assert_eq!(
            result.aggregate.cancellation_reason(),
            Some("Customer changed mind")
        );
    }

    #[tokio::test]
    async fn confirmation_commits_with_caller_unit_of_work() {
        let store = InMemoryStore::new();
        let service = OrderService::new(store.clone());
        let order_id = placed_order(&service).await;
        let paid = service
            .pay_order(PayOrder::new(order_id, "PAY-1", Money::from_cents(2000)))
            .await
            .unwrap();
        let paid_event_id = paid.events[0].event_id;

        // Rolled back: nothing recorded.
        let mut uow = store.begin().await.unwrap();
        service
            .record_confirmation_in(&mut uow, RecordConfirmation::new(order_id, paid_event_id))
            .await
            .unwrap();
        uow.rollback().await.unwrap();
        let order = service.get_order(order_id).await.unwrap().unwrap();
        assert!(!order.confirmation_sent());

        let mut uow = store.begin().await.unwrap();
        let result = service
            .record_confirmation_in(&mut uow, RecordConfirmation::new(order_id, paid_event_id))
            .await
            .unwrap();
        uow.commit().await.unwrap();

        assert_eq!(result.events.len(), 1);
        assert_eq!(result.events[0].event_type, OrderEvent::CONFIRMATION_SENT);
        let order = service.get_order(order_id).await.unwrap().unwrap();
        assert!(order.confirmation_sent());
    }

    #[tokio::test]
    async fn repeated_confirmation_writes_nothing() {
        let store = InMemoryStore::new();
        let service = OrderService::new(store.clone());
        let order_id = placed_order(&service).await;
        service
            .pay_order(PayOrder::new(order_id, "PAY-1", Money::from_cents(2000)))
            .await
            .unwrap();

        for _ in 0..2 {
            let mut uow = store.begin().await.unwrap();
            service
                .record_confirmation_in(&mut uow, RecordConfirmation::new(order_id, EventId::new()))
                .await
                .unwrap();
            uow.commit().await.unwrap();
        }

        let confirmations = store
            .records()
            .await
            .into_iter()
            .filter(|r| r.event.event_type == OrderEvent::CONFIRMATION_SENT)
            .count();
        assert_eq!(confirmations, 1);
    }

    #[tokio::test]
    async fn get_order() {
        let service = OrderService::new(InMemoryStore::new());
        assert!(service.get_order(AggregateId::new()).await.unwrap().is_none());

        let order_id = placed_order(&service).await;
        let order = service.get_order(order_id).await.unwrap().unwrap();
        assert_eq!(order.id(), Some(order_id));
        assert_eq!(order.items().len(), 1);
    }
}
