//! Order service: HTTP boundary, outbox workers and observability.
//!
//! Order commands commit through the outbox; the relay, dispatcher and
//! reaper run as background tasks next to the HTTP server. Operators
//! inspect delivery through the `/outbox` and `/dead-letters` endpoints
//! and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;
pub mod workers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use broker::Broker;
use domain::OrderService;
use metrics_exporter_prometheus::PrometheusHandle;
use outbox::{Maintenance, OutboxStore, Store};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Config, LogFormat};
pub use error::{ApiError, StartupError};
pub use workers::Workers;

/// A store that serves commands, the relay and the reaper.
pub trait Backend: Store + OutboxStore + Maintenance {}

impl<T: Store + OutboxStore + Maintenance> Backend for T {}

/// Shared application state accessible from all handlers.
pub struct AppState<S: Backend> {
    pub orders: OrderService<S>,
    pub store: S,
    pub broker: Arc<dyn Broker>,
}

impl<S: Backend> AppState<S> {
    pub fn new(store: S, broker: Arc<dyn Broker>) -> Arc<Self> {
        Arc::new(Self {
            orders: OrderService::new(store.clone()),
            store,
            broker,
        })
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: Backend>(state: Arc<AppState<S>>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::create::<S>))
        .route("/orders/{id}", get(routes::orders::get::<S>))
        .route("/orders/{id}/pay", post(routes::orders::pay::<S>))
        .route("/orders/{id}/ship", post(routes::orders::ship::<S>))
        .route("/orders/{id}/cancel", post(routes::orders::cancel::<S>))
        .route("/outbox/stats", get(routes::outbox::stats::<S>))
        .route("/outbox/exhausted", get(routes::outbox::exhausted::<S>))
        .route("/outbox/{id}/requeue", post(routes::outbox::requeue::<S>))
        .route("/dead-letters", get(routes::outbox::dead_letters::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
