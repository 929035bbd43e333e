//! Events published by the engine after a commit.
//!
//! Consumers (notification senders, dashboards, the restock worker) subscribe to
//! an `EventBus<EngineEvent>`. Every event describes something that is already
//! durable in the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use stockflow_events::{Event, EventBus};
use stockflow_inventory::{ProductId, StockLevel};
use stockflow_purchasing::{RestockRequest, RestockRequestFulfilled, RestockRequestId};
use stockflow_sales::{
    OrderCancelled, OrderDelivered, OrderDispatched, OrderEvent, OrderReserved, OrderReturned,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    OrderReserved(OrderReserved),
    OrderDispatched(OrderDispatched),
    OrderCancelled(OrderCancelled),
    OrderDelivered(OrderDelivered),
    OrderReturned(OrderReturned),

    /// A restock request was opened; notify the supplier.
    RestockRequested {
        request_id: RestockRequestId,
        product_id: ProductId,
        requested_quantity: i64,
        current_stock: i64,
        occurred_at: DateTime<Utc>,
    },

    /// Available stock is below the reorder threshold.
    LowStockDetected {
        product_id: ProductId,
        available: i64,
        reorder_threshold: i64,
        occurred_at: DateTime<Utc>,
    },

    RestockFulfilled(RestockRequestFulfilled),

    /// Counters of one product after a commit that touched it.
    StockChanged {
        product_id: ProductId,
        level: StockLevel,
        occurred_at: DateTime<Utc>,
    },
}

impl EngineEvent {
    /// Build `RestockRequested` from a freshly opened request.
    ///
    /// Returns `None` for a request that was never opened.
    pub fn restock_requested(request: &RestockRequest) -> Option<Self> {
        Some(EngineEvent::RestockRequested {
            request_id: request.id_typed(),
            product_id: request.product_id()?,
            requested_quantity: request.requested_quantity(),
            current_stock: request.current_stock_at_creation(),
            occurred_at: request.created_at()?,
        })
    }

    /// The product this event is about, if it concerns a single product.
    pub fn product_id(&self) -> Option<ProductId> {
        match self {
            EngineEvent::RestockRequested { product_id, .. }
            | EngineEvent::LowStockDetected { product_id, .. }
            | EngineEvent::StockChanged { product_id, .. } => Some(*product_id),
            EngineEvent::RestockFulfilled(e) => Some(e.product_id),
            _ => None,
        }
    }
}

impl From<OrderEvent> for EngineEvent {
    fn from(event: OrderEvent) -> Self {
        match event {
            OrderEvent::OrderReserved(e) => EngineEvent::OrderReserved(e),
            OrderEvent::OrderDispatched(e) => EngineEvent::OrderDispatched(e),
            OrderEvent::OrderCancelled(e) => EngineEvent::OrderCancelled(e),
            OrderEvent::OrderDelivered(e) => EngineEvent::OrderDelivered(e),
            OrderEvent::OrderReturned(e) => EngineEvent::OrderReturned(e),
        }
    }
}

impl Event for EngineEvent {
    fn event_type(&self) -> &'static str {
        match self {
            EngineEvent::OrderReserved(_) => "sales.order.reserved",
            EngineEvent::OrderDispatched(_) => "sales.order.dispatched",
            EngineEvent::OrderCancelled(_) => "sales.order.cancelled",
            EngineEvent::OrderDelivered(_) => "sales.order.delivered",
            EngineEvent::OrderReturned(_) => "sales.order.returned",
            EngineEvent::RestockRequested { .. } => "purchasing.restock.requested",
            EngineEvent::LowStockDetected { .. } => "inventory.stock.low",
            EngineEvent::RestockFulfilled(_) => "purchasing.restock.fulfilled",
            EngineEvent::StockChanged { .. } => "inventory.stock.changed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            EngineEvent::OrderReserved(e) => e.occurred_at,
            EngineEvent::OrderDispatched(e) => e.occurred_at,
            EngineEvent::OrderCancelled(e) => e.occurred_at,
            EngineEvent::OrderDelivered(e) => e.occurred_at,
            EngineEvent::OrderReturned(e) => e.occurred_at,
            EngineEvent::RestockRequested { occurred_at, .. }
            | EngineEvent::LowStockDetected { occurred_at, .. }
            | EngineEvent::StockChanged { occurred_at, .. } => *occurred_at,
            EngineEvent::RestockFulfilled(e) => e.occurred_at,
        }
    }
}

/// Publish post-commit events in order.
///
/// The work behind them is already committed, so a failed publish is logged
/// and the remaining events are still attempted.
pub fn publish_all<B>(bus: &B, events: impl IntoIterator<Item = EngineEvent>)
where
    B: EventBus<EngineEvent> + ?Sized,
{
    for event in events {
        let event_type = event.event_type();
        if let Err(err) = bus.publish(event) {
            warn!(event = event_type, error = ?err, "failed to publish engine event");
        }
    }
}
