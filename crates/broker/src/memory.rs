//! In-memory broker with consumer groups, for tests and local development.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::{
    Broker, BrokerError, DeadLetter, Delivery, DeliveryTag, Message, Result, Subscription,
    dead_letter_topic,
};

const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Retained part of a topic. Offsets are absolute and survive trimming.
#[derive(Default)]
struct TopicLog {
    /// Offset of the first retained message.
    base: usize,
    messages: VecDeque<Message>,
}

impl TopicLog {
    fn end(&self) -> usize {
        self.base + self.messages.len()
    }

    fn trim_to(&mut self, offset: usize) {
        while self.base < offset && self.messages.pop_front().is_some() {
            self.base += 1;
        }
    }
}

#[derive(Debug, Clone)]
struct Queued {
    /// Position in the topic log; redeliveries keep their original place.
    offset: usize,
    message: Message,
    deliveries: u32,
}

struct InFlight {
    queued: Queued,
    deadline: Instant,
}

#[derive(Default)]
struct Group {
    /// Next topic-log offset not yet pulled into `ready`.
    cursor: usize,
    /// Undelivered messages ordered by offset.
    ready: VecDeque<Queued>,
    in_flight: HashMap<DeliveryTag, InFlight>,
}

impl Group {
    /// Lowest offset this group still needs.
    fn low_watermark(&self) -> usize {
        self.ready
            .iter()
            .map(|q| q.offset)
            .chain(self.in_flight.values().map(|f| f.queued.offset))
            .min()
            .unwrap_or(self.cursor)
    }

    fn requeue(&mut self, queued: Queued) {
        let position = self
            .ready
            .iter()
            .position(|q| q.offset > queued.offset)
            .unwrap_or(self.ready.len());
        self.ready.insert(position, queued);
    }

    /// Picks the oldest message whose key has nothing older pending or in
    /// flight in this group.
    fn take_next(&mut self) -> Option<Queued> {
        let mut blocked: HashSet<&str> = self
            .in_flight
            .values()
            .map(|f| f.queued.message.key.as_str())
            .collect();
        let mut chosen = None;
        for (index, queued) in self.ready.iter().enumerate() {
            if blocked.insert(queued.message.key.as_str()) {
                chosen = Some(index);
                break;
            }
        }
        chosen.and_then(|index| self.ready.remove(index))
    }
}

#[derive(Default)]
struct State {
    topics: HashMap<String, TopicLog>,
    groups: HashMap<(String, String), Group>,
    dead_letters: HashMap<String, Vec<DeadLetter>>,
    next_tag: u64,
    failing_publishes: u32,
    rejected_keys: HashSet<String>,
    closed: bool,
}

impl State {
    fn group_mut(&mut self, topic: &str, group: &str) -> &mut Group {
        self.groups
            .entry((topic.to_string(), group.to_string()))
            .or_default()
    }

    /// Drops the messages every group of `topic` has settled.
    fn trim(&mut self, topic: &str) {
        let watermark = self
            .groups
            .iter()
            .filter(|((t, _), _)| t == topic)
            .map(|(_, group)| group.low_watermark())
            .min();
        if let (Some(watermark), Some(log)) = (watermark, self.topics.get_mut(topic)) {
            log.trim_to(watermark);
        }
    }

    fn park(&mut self, message: Message, reason: &str) {
        self.dead_letters
            .entry(dead_letter_topic(&message.topic))
            .or_default()
            .push(DeadLetter {
                message,
                reason: reason.to_string(),
                dead_lettered_at: Utc::now(),
            });
    }
}

struct Shared {
    state: Mutex<State>,
    notify: Notify,
    ack_timeout: Duration,
    publish_delay: Mutex<Duration>,
}

/// Broker backed by in-process queues.
///
/// Each topic is an append-only log. A consumer group created by `subscribe`
/// starts from the oldest retained message, so messages published before the
/// first subscription are not lost. Messages every group has settled are
/// dropped from the log.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_ack_timeout(DEFAULT_ACK_TIMEOUT)
    }

    /// Deliveries not settled within `ack_timeout` are redelivered.
    pub fn with_ack_timeout(ack_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                ack_timeout,
                publish_delay: Mutex::new(Duration::ZERO),
            }),
        }
    }

    /// Makes the next `count` publishes fail with `Unavailable`.
    pub async fn fail_next_publishes(&self, count: u32) {
        self.shared.state.lock().await.failing_publishes = count;
    }

    /// Makes every publish with `key` fail with `Rejected`.
    pub async fn reject_key(&self, key: impl Into<String>) {
        self.shared.state.lock().await.rejected_keys.insert(key.into());
    }

    pub async fn accept_key(&self, key: &str) {
        self.shared.state.lock().await.rejected_keys.remove(key);
    }

    /// Delays every publish acknowledgement by `delay`.
    pub async fn set_publish_delay(&self, delay: Duration) {
        *self.shared.publish_delay.lock().await = delay;
    }

    /// Messages retained on `topic`, in publish order.
    pub async fn published(&self, topic: &str) -> Vec<Message> {
        self.shared
            .state
            .lock()
            .await
            .topics
            .get(topic)
            .map(|log| log.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Messages parked on `dlq_topic`.
    pub async fn dead_letters(&self, dlq_topic: &str) -> Vec<DeadLetter> {
        self.shared
            .state
            .lock()
            .await
            .dead_letters
            .get(dlq_topic)
            .cloned()
            .unwrap_or_default()
    }

    /// Ends all subscriptions; `next` returns `None` afterwards.
    pub async fn close(&self) {
        self.shared.state.lock().await.closed = true;
        self.shared.notify.notify_waiters();
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, message: Message) -> Result<()> {
        let delay = *self.shared.publish_delay.lock().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(BrokerError::Unavailable("injected publish failure".into()));
        }
        if state.rejected_keys.contains(&message.key) {
            return Err(BrokerError::Rejected(format!(
                "key {} is not accepted",
                message.key
            )));
        }

        tracing::trace!(topic = %message.topic, key = %message.key, "message published");
        state
            .topics
            .entry(message.topic.clone())
            .or_default()
            .messages
            .push_back(message);
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, message: Message, reason: &str) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        state.park(message, reason);
        Ok(())
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let state = self.shared.state.lock().await;
        let mut letters: Vec<DeadLetter> = state.dead_letters.values().flatten().cloned().collect();
        letters.sort_by_key(|letter| letter.dead_lettered_at);
        letters.truncate(limit);
        Ok(letters)
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Box<dyn Subscription>> {
        let mut state = self.shared.state.lock().await;
        if state.closed {
            return Err(BrokerError::Closed);
        }
        state.group_mut(topic, group);
        Ok(Box::new(InMemorySubscription {
            shared: Arc::clone(&self.shared),
            topic: topic.to_string(),
            group: group.to_string(),
        }))
    }
}

struct InMemorySubscription {
    shared: Arc<Shared>,
    topic: String,
    group: String,
}

impl InMemorySubscription {
    /// Pulls new log entries, expires overdue deliveries and hands out the
    /// next eligible message. Otherwise returns the earliest ack deadline.
    fn poll(&self, state: &mut State) -> std::result::Result<Delivery, Option<Instant>> {
        let now = Instant::now();
        let State {
            topics,
            groups,
            next_tag,
            ..
        } = state;
        let group = groups
            .entry((self.topic.clone(), self.group.clone()))
            .or_default();

        if let Some(log) = topics.get(&self.topic) {
            let start = group.cursor.saturating_sub(log.base);
            for (index, message) in log.messages.iter().enumerate().skip(start) {
                group.ready.push_back(Queued {
                    offset: log.base + index,
                    message: message.clone(),
                    deliveries: 0,
                });
            }
            group.cursor = log.end();
        }

        let overdue: Vec<DeliveryTag> = group
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(tag, _)| *tag)
            .collect();
        for tag in overdue {
            if let Some(flight) = group.in_flight.remove(&tag) {
                tracing::debug!(%tag, "ack deadline passed, redelivering");
                group.requeue(flight.queued);
            }
        }

        let Some(mut queued) = group.take_next() else {
            return Err(group.in_flight.values().map(|f| f.deadline).min());
        };
        *next_tag += 1;
        let tag = DeliveryTag::new(*next_tag);
        queued.deliveries += 1;
        let delivery = Delivery {
            tag,
            message: queued.message.clone(),
            attempt: queued.deliveries,
        };
        group.in_flight.insert(
            tag,
            InFlight {
                queued,
                deadline: now + self.shared.ack_timeout,
            },
        );
        Ok(delivery)
    }

    async fn settle(&self, tag: DeliveryTag) -> Result<Queued> {
        let mut state = self.shared.state.lock().await;
        let flight = state
            .group_mut(&self.topic, &self.group)
            .in_flight
            .remove(&tag)
            .ok_or(BrokerError::UnknownDelivery(tag))?;
        Ok(flight.queued)
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_deadline = {
                let mut state = self.shared.state.lock().await;
                if state.closed {
                    return None;
                }
                match self.poll(&mut state) {
                    Ok(delivery) => return Some(delivery),
                    Err(deadline) => deadline,
                }
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<()> {
        self.settle(tag).await?;
        self.shared.state.lock().await.trim(&self.topic);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn nack(&mut self, tag: DeliveryTag) -> Result<()> {
        let queued = self.settle(tag).await?;
        self.shared
            .state
            .lock()
            .await
            .group_mut(&self.topic, &self.group)
            .requeue(queued);
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn reject(&mut self, tag: DeliveryTag, reason: &str) -> Result<()> {
        let queued = self.settle(tag).await?;
        let mut state = self.shared.state.lock().await;
        state.park(queued.message, reason);
        state.trim(&self.topic);
        drop(state);
        self.shared.notify.notify_waiters();
        Ok(())
    }
}
