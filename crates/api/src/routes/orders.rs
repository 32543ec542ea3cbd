//! Order intake, cancellation and lookup endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use common::{CorrelationId, CustomerId, Money, OrderId, ProductId};
use domain::{
    CustomerInfo, NewOrder, NewOrderLine, Order, OrderEventRecord, OrderLine, OrderSummary,
};
use saga::{CreateOrderOutcome, OrderTimeline};
use serde::{Deserialize, Serialize};
use store::SagaStore;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

/// Header carrying the client's idempotency key for order creation.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

// -- Request types --

/// Body of `POST /orders`.
#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub customer_id: Uuid,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub items: Vec<OrderItemRequest>,
    pub shipping_address: Option<serde_json::Value>,
    pub notes: Option<String>,
}

/// One requested line. The unit price falls back to zero when omitted.
#[derive(Debug, Deserialize)]
pub struct OrderItemRequest {
    pub product_id: Uuid,
    pub product_name: Option<String>,
    pub quantity: u32,
    pub unit_price_cents: Option<i64>,
}

impl CreateOrderRequest {
    fn into_new_order(self) -> NewOrder {
        NewOrder {
            customer: CustomerInfo {
                id: CustomerId::from_uuid(self.customer_id),
                email: self.customer_email,
                name: self.customer_name,
            },
            items: self
                .items
                .into_iter()
                .map(|item| NewOrderLine {
                    product_id: ProductId::from_uuid(item.product_id),
                    product_name: item.product_name,
                    quantity: item.quantity,
                    unit_price: item.unit_price_cents.map(Money::from_cents),
                })
                .collect(),
            shipping_address: self.shipping_address,
            notes: self.notes,
        }
    }
}

// -- Response types --

/// The intake view of an order: identity, status and total.
#[derive(Debug, Serialize)]
pub struct OrderSummaryResponse {
    pub id: String,
    pub correlation_id: String,
    pub status: String,
    pub total_cents: i64,
    pub item_count: usize,
    pub created_at: DateTime<Utc>,
}

impl From<&OrderSummary> for OrderSummaryResponse {
    fn from(summary: &OrderSummary) -> Self {
        Self {
            id: summary.order_id.to_string(),
            correlation_id: summary.correlation_id.to_string(),
            status: summary.status.to_string(),
            total_cents: summary.total_amount.cents(),
            item_count: summary.item_count,
            created_at: summary.created_at,
        }
    }
}

/// Response of `POST /orders`.
#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub order: OrderSummaryResponse,
    pub correlation_id: String,
    /// Set only when the idempotency key replayed an earlier order.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
}

/// A stored order line with its computed subtotal.
#[derive(Debug, Serialize)]
pub struct OrderItemResponse {
    pub product_id: String,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    pub subtotal_cents: i64,
}

impl From<&OrderLine> for OrderItemResponse {
    fn from(line: &OrderLine) -> Self {
        Self {
            product_id: line.product_id.to_string(),
            product_name: line.product_name.clone(),
            quantity: line.quantity,
            unit_price_cents: line.unit_price.cents(),
            subtotal_cents: line.subtotal.cents(),
        }
    }
}

/// One entry of an order's audit timeline.
#[derive(Debug, Serialize)]
pub struct OrderEventResponse {
    pub id: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl From<OrderEventRecord> for OrderEventResponse {
    fn from(record: OrderEventRecord) -> Self {
        Self {
            id: record.id.to_string(),
            event_type: record.event_type.to_string(),
            payload: record.payload,
            created_at: record.created_at,
        }
    }
}

/// Full order with its events, oldest first.
#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub id: String,
    pub correlation_id: String,
    pub customer_id: String,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub status: String,
    pub total_cents: i64,
    pub items: Vec<OrderItemResponse>,
    pub shipping_address: Option<serde_json::Value>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub events: Vec<OrderEventResponse>,
}

impl From<OrderTimeline> for OrderResponse {
    fn from(timeline: OrderTimeline) -> Self {
        let OrderTimeline { order, events } = timeline;
        let Order {
            id,
            correlation_id,
            customer,
            items,
            total_amount,
            status,
            shipping_address,
            notes,
            created_at,
            updated_at,
        } = order;
        Self {
            id: id.to_string(),
            correlation_id: correlation_id.to_string(),
            customer_id: customer.id.to_string(),
            customer_email: customer.email,
            customer_name: customer.name,
            status: status.to_string(),
            total_cents: total_amount.cents(),
            items: items.iter().map(OrderItemResponse::from).collect(),
            shipping_address,
            notes,
            created_at,
            updated_at,
            events: events.into_iter().map(OrderEventResponse::from).collect(),
        }
    }
}

// -- Handlers --

/// POST /orders
///
/// `201` for a new order; `200` with the stored summary when the
/// `Idempotency-Key` was seen before; `409` while the first request with
/// that key is still running.
#[tracing::instrument(skip(state, headers, req))]
pub async fn create<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Extension(correlation_id): Extension<CorrelationId>,
    headers: HeaderMap,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), ApiError> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|key| !key.is_empty());

    let outcome = state
        .coordinator
        .create_order_with_correlation(req.into_new_order(), idempotency_key, correlation_id)
        .await?;

    let (status, message) = match &outcome {
        CreateOrderOutcome::Created(_) => (StatusCode::CREATED, None),
        CreateOrderOutcome::Duplicate(_) => {
            (StatusCode::OK, Some("Order already exists (idempotent)"))
        }
    };
    Ok((
        status,
        Json(CreateOrderResponse {
            order: OrderSummaryResponse::from(outcome.summary()),
            correlation_id: correlation_id.to_string(),
            message,
        }),
    ))
}

/// POST /orders/{id}/cancel
#[tracing::instrument(skip(state))]
pub async fn cancel<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = parse_id::<OrderId>(&id)?;
    state.coordinator.cancel_order(order_id).await?;
    let timeline = state
        .coordinator
        .timeline(order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {id} not found")))?;
    Ok(Json(timeline.into()))
}

/// GET /orders/{id}
#[tracing::instrument(skip(state))]
pub async fn get<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = parse_id::<OrderId>(&id)?;
    let timeline = state
        .coordinator
        .timeline(order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {id} not found")))?;
    Ok(Json(timeline.into()))
}

/// GET /orders/correlation/{correlation_id}
#[tracing::instrument(skip(state))]
pub async fn by_correlation<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(correlation_id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let parsed = parse_id::<CorrelationId>(&correlation_id)?;
    let timeline = state
        .coordinator
        .timeline_by_correlation(parsed)
        .await?
        .ok_or_else(|| {
            ApiError::NotFound(format!("No order for correlation id {correlation_id}"))
        })?;
    Ok(Json(timeline.into()))
}

fn parse_id<T>(raw: &str) -> Result<T, ApiError>
where
    T: std::str::FromStr<Err = uuid::Error>,
{
    raw.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))
}
