//! Background tasks that move events from the outbox to their consumers.

use std::sync::Arc;

use broker::{Broker, topic_for};
use dispatcher::{Dispatcher, SendConfirmationHandler};
use domain::{Aggregate, Order, OrderService};
use relay::{Reaper, Relay};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Backend;
use crate::config::Config;
use crate::error::StartupError;

/// Handles to the relay, dispatcher and reaper tasks.
pub struct Workers {
    cancel: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Workers {
    /// Starts the relay, the order dispatcher and the reaper. All of them
    /// stop when `cancel` fires.
    pub async fn spawn<S: Backend>(
        store: S,
        broker: Arc<dyn Broker>,
        config: &Config,
        cancel: CancellationToken,
    ) -> Result<Self, StartupError> {
        let relay = Relay::new(store.clone(), Arc::clone(&broker), config.relay.clone());

        let mut dispatcher =
            Dispatcher::new(store.clone(), Arc::clone(&broker), config.dispatcher.clone());
        dispatcher.register(Arc::new(SendConfirmationHandler::new(OrderService::new(
            store.clone(),
        ))));
        let subscription = broker
            .subscribe(&topic_for(Order::aggregate_type()), &config.dispatcher.group)
            .await?;

        let reaper = Reaper::new(store, config.reaper.clone());

        tracing::info!(
            relay_id = %config.relay.relay_id,
            group = %config.dispatcher.group,
            handlers = dispatcher.handler_count(),
            "starting outbox workers"
        );

        let relay_cancel = cancel.clone();
        let relay_task = tokio::spawn(async move { relay.run(relay_cancel).await });

        let dispatcher_cancel = cancel.clone();
        let dispatcher_task =
            tokio::spawn(async move { dispatcher.run(subscription, dispatcher_cancel).await });

        let reaper_cancel = cancel.clone();
        let reaper_task = tokio::spawn(async move { reaper.run(reaper_cancel).await });

        Ok(Self {
            cancel,
            handles: vec![
                ("relay", relay_task),
                ("dispatcher", dispatcher_task),
                ("reaper", reaper_task),
            ],
        })
    }

    /// Cancels the workers and waits for them to finish. A relay stopped
    /// mid-batch releases its claims first.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(worker = name, error = %e, "worker task failed");
            }
        }
        tracing::info!("outbox workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use broker::InMemoryBroker;
    use domain::{CreateOrder, CustomerId, Money, OrderItem, PayOrder};
    use outbox::InMemoryStore;

    use super::*;

    #[tokio::test]
    async fn workers_confirm_paid_orders_and_stop_on_shutdown() {
        let store = InMemoryStore::new();
        let broker = InMemoryBroker::new();
        let mut config = Config::default();
        config.relay.poll_interval = Duration::from_millis(10);

        let workers = Workers::spawn(
            store.clone(),
            Arc::new(broker.clone()),
            &config,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let orders = OrderService::new(store.clone());
        let items = vec![OrderItem::new("SKU-1", "Widget", 1, Money::from_cents(900))];
        let cmd = CreateOrder::for_customer(CustomerId::new(), items);
        let order_id = cmd.order_id;
        orders.create_order(cmd).await.unwrap();
        orders
            .pay_order(PayOrder::new(order_id, "PAY-1", Money::from_cents(900)))
            .await
            .unwrap();

        let mut confirmed = false;
        for _ in 0..200 {
            let order = orders.get_order(order_id).await.unwrap().unwrap();
            if order.confirmation_sent() {
                confirmed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(confirmed);

        tokio::time::timeout(Duration::from_secs(2), workers.shutdown())
            .await
            .unwrap();
    }
}
