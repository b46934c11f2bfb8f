//! PostgreSQL broker integration tests.
//!
//! They start a Postgres container through testcontainers, so they are
//! ignored by default. Run with:
//!
//! ```bash
//! cargo test -p broker --test postgres_integration -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use broker::{
    Broker, BrokerError, Delivery, HEADER_EVENT_ID, Message, PostgresBroker, PostgresBrokerConfig,
    Subscription,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

const TOPIC: &str = "order.events";

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            PostgresBroker::new(temp_pool.clone())
                .run_migrations()
                .await
                .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn connect() -> PgPool {
    let info = get_container_info().await;
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&info.connection_string)
        .await
        .unwrap()
}

async fn get_test_broker(ack_timeout: Duration) -> PostgresBroker {
    let pool = connect().await;
    sqlx::query(
        "TRUNCATE TABLE broker_deliveries, broker_groups, broker_messages, broker_dead_letters \
         RESTART IDENTITY",
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresBroker::with_config(
        pool,
        PostgresBrokerConfig {
            ack_timeout,
            poll_interval: Duration::from_millis(20),
        },
    )
}

/// A second broker over a fresh pool, as after a process restart.
async fn restarted(ack_timeout: Duration) -> PostgresBroker {
    PostgresBroker::with_config(
        connect().await,
        PostgresBrokerConfig {
            ack_timeout,
            poll_interval: Duration::from_millis(20),
        },
    )
}

fn message(key: &str, body: &str) -> Message {
    Message::new(TOPIC, key, body.as_bytes().to_vec()).with_header(HEADER_EVENT_ID, body)
}

async fn next_now(subscription: &mut Box<dyn Subscription>) -> Option<Delivery> {
    tokio::time::timeout(Duration::from_millis(300), subscription.next())
        .await
        .ok()
        .flatten()
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn unsettled_delivery_survives_a_restart() {
    let ack_timeout = Duration::from_millis(200);
    let broker = get_test_broker(ack_timeout).await;
    let mut sub = broker.subscribe(TOPIC, "mailer").await.unwrap();
    broker.publish(message("a", "1")).await.unwrap();

    let first = next_now(&mut sub).await.unwrap();
    assert_eq!(first.attempt, 1);
    assert_eq!(first.message.header(HEADER_EVENT_ID), Some("1"));
    drop(sub);
    broker.pool().close().await;

    let broker = restarted(ack_timeout).await;
    let mut sub = broker.subscribe(TOPIC, "mailer").await.unwrap();
    let again = tokio::time::timeout(Duration::from_secs(2), sub.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.message, first.message);
    assert_eq!(again.attempt, 2);

    sub.ack(again.tag).await.unwrap();
    assert!(next_now(&mut sub).await.is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn group_sees_messages_published_before_it_joined() {
    let broker = get_test_broker(Duration::from_secs(30)).await;
    broker.publish(message("a", "1")).await.unwrap();

    let mut sub = broker.subscribe(TOPIC, "late").await.unwrap();
    let delivery = next_now(&mut sub).await.unwrap();
    assert_eq!(delivery.message.payload, b"1");
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn same_key_waits_for_settlement() {
    let broker = get_test_broker(Duration::from_secs(30)).await;
    let mut sub = broker.subscribe(TOPIC, "g").await.unwrap();
    broker.publish(message("a", "1")).await.unwrap();
    broker.publish(message("a", "2")).await.unwrap();
    broker.publish(message("b", "3")).await.unwrap();

    let first = next_now(&mut sub).await.unwrap();
    let second = next_now(&mut sub).await.unwrap();
    assert_eq!(first.message.payload, b"1");
    assert_eq!(second.message.payload, b"3");
    assert!(next_now(&mut sub).await.is_none());

    sub.nack(first.tag).await.unwrap();
    let again = next_now(&mut sub).await.unwrap();
    assert_eq!(again.message.payload, b"1");
    assert_eq!(again.attempt, 2);
    assert!(matches!(
        sub.ack(first.tag).await,
        Err(BrokerError::UnknownDelivery(_))
    ));

    sub.ack(again.tag).await.unwrap();
    let third = next_now(&mut sub).await.unwrap();
    assert_eq!(third.message.payload, b"2");
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn messages_are_trimmed_once_every_group_settled() {
    let broker = get_test_broker(Duration::from_secs(30)).await;
    let mut mailer = broker.subscribe(TOPIC, "mailer").await.unwrap();
    let mut audit = broker.subscribe(TOPIC, "audit").await.unwrap();
    broker.publish(message("a", "1")).await.unwrap();
    broker.publish(message("b", "2")).await.unwrap();

    for _ in 0..2 {
        let delivery = next_now(&mut mailer).await.unwrap();
        mailer.ack(delivery.tag).await.unwrap();
    }
    assert_eq!(broker.retained(TOPIC).await.unwrap().len(), 2);

    let first = next_now(&mut audit).await.unwrap();
    let second = next_now(&mut audit).await.unwrap();
    audit.ack(first.tag).await.unwrap();
    assert_eq!(broker.retained(TOPIC).await.unwrap().len(), 1);

    audit.reject(second.tag, "bad payload").await.unwrap();
    assert!(broker.retained(TOPIC).await.unwrap().is_empty());

    let letters = broker.list_dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].reason, "bad payload");
    assert_eq!(letters[0].topic(), "order.events.dlq");
    assert_eq!(letters[0].message, second.message);
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn competing_subscriptions_never_share_a_delivery() {
    let broker = get_test_broker(Duration::from_secs(30)).await;
    let mut first = broker.subscribe(TOPIC, "g").await.unwrap();
    let mut second = broker.subscribe(TOPIC, "g").await.unwrap();
    broker.publish(message("a", "1")).await.unwrap();
    broker.publish(message("b", "2")).await.unwrap();

    let one = next_now(&mut first).await.unwrap();
    let two = next_now(&mut second).await.unwrap();
    assert_ne!(one.message.payload, two.message.payload);
    assert!(next_now(&mut first).await.is_none());
}

#[tokio::test]
#[ignore = "requires docker"]
#[serial]
async fn dead_letter_is_listed_with_its_source_topic() {
    let broker = get_test_broker(Duration::from_secs(30)).await;
    broker
        .dead_letter(message("a", "1"), "exhausted")
        .await
        .unwrap();

    let letters = broker.list_dead_letters(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].message.topic, TOPIC);
    assert_eq!(letters[0].message.header(HEADER_EVENT_ID), Some("1"));
    assert!(broker.list_dead_letters(0).await.unwrap().is_empty());
}
