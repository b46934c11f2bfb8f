//! Order lifecycle endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::AggregateId;
use domain::{
    Aggregate, CancelOrder, CommandResult, CreateOrder, CustomerId, Money, Order, OrderItem,
    PayOrder, ProductId, ShipOrder,
};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::{AppState, Backend};

// -- Request types --

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub customer_id: Option<String>,
    pub items: Vec<OrderItemRequest>,
}

#[derive(Deserialize)]
pub struct OrderItemRequest {
    pub product_id: String,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

#[derive(Deserialize)]
pub struct PayOrderRequest {
    pub payment_id: String,
    pub amount_cents: i64,
}

#[derive(Deserialize, Default)]
pub struct ShipOrderRequest {
    #[serde(default)]
    pub tracking_number: Option<String>,
}

#[derive(Deserialize)]
pub struct CancelOrderRequest {
    pub reason: String,
    #[serde(default)]
    pub cancelled_by: Option<String>,
}

// -- Response types --

#[derive(Serialize)]
pub struct OrderResponse {
    pub id: String,
    pub customer_id: String,
    pub state: String,
    pub items: Vec<OrderItemResponse>,
    pub total_cents: i64,
    pub payment_id: Option<String>,
    pub tracking_number: Option<String>,
    pub cancellation_reason: Option<String>,
    pub confirmation_sent: bool,
    pub version: i64,
}

#[derive(Serialize)]
pub struct OrderItemResponse {
    pub product_id: String,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

/// An event the command appended to the outbox.
#[derive(Serialize)]
pub struct RaisedEventResponse {
    pub event_id: String,
    pub event_type: String,
    pub sequence: i64,
}

#[derive(Serialize)]
pub struct CommandResponse {
    pub order: OrderResponse,
    pub events: Vec<RaisedEventResponse>,
}

impl OrderResponse {
    fn from_order(id: AggregateId, order: &Order) -> Self {
        Self {
            id: id.to_string(),
            customer_id: order
                .customer_id()
                .map(|c| c.to_string())
                .unwrap_or_default(),
            state: order.state().to_string(),
            items: order
                .items()
                .iter()
                .map(|item| OrderItemResponse {
                    product_id: item.product_id.to_string(),
                    product_name: item.product_name.clone(),
                    quantity: item.quantity,
                    unit_price_cents: item.unit_price.cents(),
                })
                .collect(),
            total_cents: order.total_amount().cents(),
            payment_id: order.payment_id().map(String::from),
            tracking_number: order.tracking_number().map(String::from),
            cancellation_reason: order.cancellation_reason().map(String::from),
            confirmation_sent: order.confirmation_sent(),
            version: order.version().as_i64(),
        }
    }
}

impl CommandResponse {
    fn from_result(id: AggregateId, result: CommandResult<Order>) -> Self {
        Self {
            order: OrderResponse::from_order(id, &result.aggregate),
            events: result
                .events
                .into_iter()
                .map(|e| RaisedEventResponse {
                    event_id: e.event_id.to_string(),
                    event_type: e.event_type,
                    sequence: e.sequence.as_i64(),
                })
                .collect(),
        }
    }
}

// -- Handlers --

/// POST /orders — create an order with its items.
#[tracing::instrument(skip(state, req))]
pub async fn create<S: Backend>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CommandResponse>), ApiError> {
    let customer_id = match req.customer_id.as_deref() {
        Some(id_str) => {
            let uuid = uuid::Uuid::parse_str(id_str)
                .map_err(|e| ApiError::BadRequest(format!("Invalid customer_id: {e}")))?;
            CustomerId::from_uuid(uuid)
        }
        None => CustomerId::new(),
    };

    let items = req
        .items
        .into_iter()
        .map(|item| {
            OrderItem::new(
                ProductId::new(item.product_id),
                item.product_name,
                item.quantity,
                Money::from_cents(item.unit_price_cents),
            )
        })
        .collect();

    let cmd = CreateOrder::for_customer(customer_id, items);
    let order_id = cmd.order_id;
    let result = state.orders.create_order(cmd).await?;

    Ok((
        StatusCode::CREATED,
        Json(CommandResponse::from_result(order_id, result)),
    ))
}

/// GET /orders/{id} — load the current state of an order.
#[tracing::instrument(skip(state))]
pub async fn get<S: Backend>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = parse_aggregate_id(&id)?;
    let order = state
        .orders
        .get_order(order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {id} not found")))?;

    Ok(Json(OrderResponse::from_order(order_id, &order)))
}

/// POST /orders/{id}/pay — capture the payment for an order.
#[tracing::instrument(skip(state, req))]
pub async fn pay<S: Backend>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(req): Json<PayOrderRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let order_id = parse_aggregate_id(&id)?;
    let result = state
        .orders
        .pay_order(PayOrder::new(
            order_id,
            req.payment_id,
            Money::from_cents(req.amount_cents),
        ))
        .await?;

    Ok(Json(CommandResponse::from_result(order_id, result)))
}

/// POST /orders/{id}/ship — hand a paid order to the carrier.
#[tracing::instrument(skip(state, req))]
pub async fn ship<S: Backend>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(req): Json<ShipOrderRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let order_id = parse_aggregate_id(&id)?;
    let result = state
        .orders
        .ship_order(ShipOrder::new(order_id, req.tracking_number))
        .await?;

    Ok(Json(CommandResponse::from_result(order_id, result)))
}

/// POST /orders/{id}/cancel
#[tracing::instrument(skip(state, req))]
pub async fn cancel<S: Backend>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(req): Json<CancelOrderRequest>,
) -> Result<Json<CommandResponse>, ApiError> {
    let order_id = parse_aggregate_id(&id)?;
    let result = state
        .orders
        .cancel_order(CancelOrder::new(order_id, req.reason, req.cancelled_by))
        .await?;

    Ok(Json(CommandResponse::from_result(order_id, result)))
}

fn parse_aggregate_id(id: &str) -> Result<AggregateId, ApiError> {
    let uuid = uuid::Uuid::parse_str(id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))?;
    Ok(AggregateId::from_uuid(uuid))
}
