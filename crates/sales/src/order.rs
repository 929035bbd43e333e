use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{Aggregate, AggregateId, AggregateRoot, CustomerId, DomainError};
use stockflow_events::Event;
use stockflow_inventory::ProductId;

/// Order identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub AggregateId);

impl OrderId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for OrderId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Order status lifecycle.
///
/// `Created` is only ever seen on an unsaved order: placing an order reserves
/// its stock in the same commit, so the first persisted status is `Reserved`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Created,
    Reserved,
    Dispatched,
    Delivered,
    Cancelled,
    Returned,
}

impl OrderStatus {
    /// Whether the order still holds a stock reservation.
    pub fn holds_reservation(self) -> bool {
        matches!(self, OrderStatus::Reserved)
    }

    /// No further transitions are possible.
    pub fn is_final(self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Returned)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::Reserved => "reserved",
            OrderStatus::Dispatched => "dispatched",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Returned => "returned",
        }
    }
}

/// Order line: product, quantity, unit price snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub product_id: ProductId,
    pub quantity: i64,
    /// Price in smallest currency unit (e.g., cents) at the time of ordering.
    pub unit_price: u64,
}

impl LineItem {
    pub fn new(product_id: ProductId, quantity: i64, unit_price: u64) -> Self {
        Self {
            product_id,
            quantity,
            unit_price,
        }
    }
}

/// Reject empty orders, non-positive quantities and repeated products.
pub fn validate_lines(lines: &[LineItem]) -> Result<(), DomainError> {
    if lines.is_empty() {
        return Err(DomainError::validation("order must contain at least one line"));
    }

    let mut seen = HashSet::with_capacity(lines.len());
    for (idx, line) in lines.iter().enumerate() {
        if line.quantity <= 0 {
            return Err(DomainError::validation(format!(
                "line {idx}: quantity must be positive"
            )));
        }
        if !seen.insert(line.product_id) {
            return Err(DomainError::validation(format!(
                "line {idx}: product {} appears more than once",
                line.product_id
            )));
        }
    }

    Ok(())
}

/// Aggregate root: Order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    customer_id: Option<CustomerId>,
    status: OrderStatus,
    lines: Vec<LineItem>,
    created_at: Option<DateTime<Utc>>,
    dispatched_at: Option<DateTime<Utc>>,
    delivered_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    returned_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl Order {
    /// Create an empty, not-yet-placed aggregate instance.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            customer_id: None,
            status: OrderStatus::Created,
            lines: Vec::new(),
            created_at: None,
            dispatched_at: None,
            delivered_at: None,
            cancelled_at: None,
            returned_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn customer_id(&self) -> Option<CustomerId> {
        self.customer_id
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn lines(&self) -> &[LineItem] {
        &self.lines
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn dispatched_at(&self) -> Option<DateTime<Utc>> {
        self.dispatched_at
    }

    pub fn delivered_at(&self) -> Option<DateTime<Utc>> {
        self.delivered_at
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        self.cancelled_at
    }

    pub fn returned_at(&self) -> Option<DateTime<Utc>> {
        self.returned_at
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Total order value in smallest currency unit.
    pub fn total_value(&self) -> u128 {
        self.lines
            .iter()
            .map(|l| l.unit_price as u128 * l.quantity.max(0) as u128)
            .sum()
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: PlaceOrder (stock for every line is reserved in the same commit).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub lines: Vec<LineItem>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DispatchOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOrder {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeliverOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverOrder {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReturnOrder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReturnOrder {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    PlaceOrder(PlaceOrder),
    DispatchOrder(DispatchOrder),
    CancelOrder(CancelOrder),
    DeliverOrder(DeliverOrder),
    ReturnOrder(ReturnOrder),
}

/// Event: OrderReserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReserved {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub lines: Vec<LineItem>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderDispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDispatched {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderCancelled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderDelivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderDelivered {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderReturned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderReturned {
    pub order_id: OrderId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderEvent {
    OrderReserved(OrderReserved),
    OrderDispatched(OrderDispatched),
    OrderCancelled(OrderCancelled),
    OrderDelivered(OrderDelivered),
    OrderReturned(OrderReturned),
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderReserved(_) => "sales.order.reserved",
            OrderEvent::OrderDispatched(_) => "sales.order.dispatched",
            OrderEvent::OrderCancelled(_) => "sales.order.cancelled",
            OrderEvent::OrderDelivered(_) => "sales.order.delivered",
            OrderEvent::OrderReturned(_) => "sales.order.returned",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderReserved(e) => e.occurred_at,
            OrderEvent::OrderDispatched(e) => e.occurred_at,
            OrderEvent::OrderCancelled(e) => e.occurred_at,
            OrderEvent::OrderDelivered(e) => e.occurred_at,
            OrderEvent::OrderReturned(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderReserved(e) => {
                self.id = e.order_id;
                self.customer_id = Some(e.customer_id);
                self.lines = e.lines.clone();
                self.status = OrderStatus::Reserved;
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            OrderEvent::OrderDispatched(e) => {
                self.status = OrderStatus::Dispatched;
                self.dispatched_at = Some(e.occurred_at);
            }
            OrderEvent::OrderCancelled(e) => {
                self.status = OrderStatus::Cancelled;
                self.cancelled_at = Some(e.occurred_at);
            }
            OrderEvent::OrderDelivered(e) => {
                self.status = OrderStatus::Delivered;
                self.delivered_at = Some(e.occurred_at);
            }
            OrderEvent::OrderReturned(e) => {
                self.status = OrderStatus::Returned;
                self.returned_at = Some(e.occurred_at);
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::PlaceOrder(cmd) => self.handle_place(cmd),
            OrderCommand::DispatchOrder(cmd) => {
                if !self.transition(cmd.order_id, "dispatch", OrderStatus::Reserved, OrderStatus::Dispatched)? {
                    return Ok(vec![]);
                }
                Ok(vec![OrderEvent::OrderDispatched(OrderDispatched {
                    order_id: cmd.order_id,
                    occurred_at: cmd.occurred_at,
                })])
            }
            OrderCommand::CancelOrder(cmd) => {
                if !self.transition(cmd.order_id, "cancel", OrderStatus::Reserved, OrderStatus::Cancelled)? {
                    return Ok(vec![]);
                }
                Ok(vec![OrderEvent::OrderCancelled(OrderCancelled {
                    order_id: cmd.order_id,
                    occurred_at: cmd.occurred_at,
                })])
            }
            OrderCommand::DeliverOrder(cmd) => {
                if !self.transition(cmd.order_id, "deliver", OrderStatus::Dispatched, OrderStatus::Delivered)? {
                    return Ok(vec![]);
                }
                Ok(vec![OrderEvent::OrderDelivered(OrderDelivered {
                    order_id: cmd.order_id,
                    occurred_at: cmd.occurred_at,
                })])
            }
            OrderCommand::ReturnOrder(cmd) => {
                if !self.transition(cmd.order_id, "return", OrderStatus::Delivered, OrderStatus::Returned)? {
                    return Ok(vec![]);
                }
                Ok(vec![OrderEvent::OrderReturned(OrderReturned {
                    order_id: cmd.order_id,
                    occurred_at: cmd.occurred_at,
                })])
            }
        }
    }
}

impl Order {
    fn ensure_order_id(&self, order_id: OrderId) -> Result<(), DomainError> {
        if self.id != order_id {
            return Err(DomainError::invariant("order_id mismatch"));
        }
        Ok(())
    }

    /// Guard a lifecycle step.
    ///
    /// `Ok(true)`: move `from` → `to`. `Ok(false)`: already at `to`, nothing to
    /// do (this is what makes repeated dispatch/cancel/deliver/return safe).
    fn transition(
        &self,
        order_id: OrderId,
        action: &'static str,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_order_id(order_id)?;

        if self.status == to {
            return Ok(false);
        }
        if self.status != from {
            return Err(DomainError::invalid_transition(self.status, action));
        }
        Ok(true)
    }

    fn handle_place(&self, cmd: &PlaceOrder) -> Result<Vec<OrderEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("order already exists"));
        }
        self.ensure_order_id(cmd.order_id)?;
        validate_lines(&cmd.lines)?;

        Ok(vec![OrderEvent::OrderReserved(OrderReserved {
            order_id: cmd.order_id,
            customer_id: cmd.customer_id,
            lines: cmd.lines.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
