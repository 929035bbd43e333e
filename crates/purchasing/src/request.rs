use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use stockflow_events::Event;
use stockflow_inventory::ProductId;

/// Restock request identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RestockRequestId(pub AggregateId);

impl RestockRequestId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for RestockRequestId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Restock request status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestockStatus {
    Pending,
    Sent,
    Fulfilled,
}

impl RestockStatus {
    /// Pending and sent requests block a new request for the same product.
    pub fn is_open(self) -> bool {
        matches!(self, RestockStatus::Pending | RestockStatus::Sent)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RestockStatus::Pending => "pending",
            RestockStatus::Sent => "sent",
            RestockStatus::Fulfilled => "fulfilled",
        }
    }
}

/// How much to ask the supplier for when a product drops below its threshold.
///
/// `requested = max(threshold * multiplier - total, minimum_quantity)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestockPolicy {
    pub multiplier: i64,
    pub minimum_quantity: i64,
}

impl Default for RestockPolicy {
    fn default() -> Self {
        Self {
            multiplier: 2,
            minimum_quantity: 1,
        }
    }
}

impl RestockPolicy {
    pub fn new(multiplier: i64, minimum_quantity: i64) -> Result<Self, DomainError> {
        if multiplier < 1 {
            return Err(DomainError::validation("restock multiplier must be at least 1"));
        }
        if minimum_quantity < 1 {
            return Err(DomainError::validation("restock minimum quantity must be at least 1"));
        }
        Ok(Self {
            multiplier,
            minimum_quantity,
        })
    }

    pub fn requested_quantity(&self, reorder_threshold: i64, total: i64) -> i64 {
        reorder_threshold
            .saturating_mul(self.multiplier)
            .saturating_sub(total)
            .max(self.minimum_quantity)
    }
}

/// Aggregate root: RestockRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestockRequest {
    id: RestockRequestId,
    product_id: Option<ProductId>,
    status: RestockStatus,
    /// Available units observed when the request was opened.
    current_stock_at_creation: i64,
    requested_quantity: i64,
    received_quantity: Option<i64>,
    created_at: Option<DateTime<Utc>>,
    sent_at: Option<DateTime<Utc>>,
    fulfilled_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

impl RestockRequest {
    /// Create an empty, not-yet-opened aggregate instance.
    pub fn empty(id: RestockRequestId) -> Self {
        Self {
            id,
            product_id: None,
            status: RestockStatus::Pending,
            current_stock_at_creation: 0,
            requested_quantity: 0,
            received_quantity: None,
            created_at: None,
            sent_at: None,
            fulfilled_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn id_typed(&self) -> RestockRequestId {
        self.id
    }

    pub fn product_id(&self) -> Option<ProductId> {
        self.product_id
    }

    pub fn status(&self) -> RestockStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.created && self.status.is_open()
    }

    pub fn current_stock_at_creation(&self) -> i64 {
        self.current_stock_at_creation
    }

    pub fn requested_quantity(&self) -> i64 {
        self.requested_quantity
    }

    pub fn received_quantity(&self) -> Option<i64> {
        self.received_quantity
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn sent_at(&self) -> Option<DateTime<Utc>> {
        self.sent_at
    }

    pub fn fulfilled_at(&self) -> Option<DateTime<Utc>> {
        self.fulfilled_at
    }

    pub fn is_created(&self) -> bool {
        self.created
    }
}

impl AggregateRoot for RestockRequest {
    type Id = RestockRequestId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: OpenRestockRequest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRestockRequest {
    pub request_id: RestockRequestId,
    pub product_id: ProductId,
    pub current_stock: i64,
    pub requested_quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkRestockSent (supplier has been notified).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkRestockSent {
    pub request_id: RestockRequestId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: FulfillRestockRequest (goods received).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillRestockRequest {
    pub request_id: RestockRequestId,
    pub received_quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestockCommand {
    Open(OpenRestockRequest),
    MarkSent(MarkRestockSent),
    Fulfill(FulfillRestockRequest),
}

/// Event: RestockRequestOpened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestockRequestOpened {
    pub request_id: RestockRequestId,
    pub product_id: ProductId,
    pub current_stock: i64,
    pub requested_quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RestockRequestSent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestockRequestSent {
    pub request_id: RestockRequestId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RestockRequestFulfilled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestockRequestFulfilled {
    pub request_id: RestockRequestId,
    pub product_id: ProductId,
    pub received_quantity: i64,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestockEvent {
    Opened(RestockRequestOpened),
    Sent(RestockRequestSent),
    Fulfilled(RestockRequestFulfilled),
}

impl Event for RestockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RestockEvent::Opened(_) => "purchasing.restock_request.opened",
            RestockEvent::Sent(_) => "purchasing.restock_request.sent",
            RestockEvent::Fulfilled(_) => "purchasing.restock_request.fulfilled",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            RestockEvent::Opened(e) => e.occurred_at,
            RestockEvent::Sent(e) => e.occurred_at,
            RestockEvent::Fulfilled(e) => e.occurred_at,
        }
    }
}

impl Aggregate for RestockRequest {
    type Command = RestockCommand;
    type Event = RestockEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            RestockEvent::Opened(e) => {
                self.id = e.request_id;
                self.product_id = Some(e.product_id);
                self.status = RestockStatus::Pending;
                self.current_stock_at_creation = e.current_stock;
                self.requested_quantity = e.requested_quantity;
                self.created_at = Some(e.occurred_at);
                self.created = true;
            }
            RestockEvent::Sent(e) => {
                self.status = RestockStatus::Sent;
                self.sent_at = Some(e.occurred_at);
            }
            RestockEvent::Fulfilled(e) => {
                self.status = RestockStatus::Fulfilled;
                self.received_quantity = Some(e.received_quantity);
                self.fulfilled_at = Some(e.occurred_at);
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            RestockCommand::Open(cmd) => self.handle_open(cmd),
            RestockCommand::MarkSent(cmd) => self.handle_mark_sent(cmd),
            RestockCommand::Fulfill(cmd) => self.handle_fulfill(cmd),
        }
    }
}

impl RestockRequest {
    fn ensure_request_id(&self, request_id: RestockRequestId) -> Result<(), DomainError> {
        if self.id != request_id {
            return Err(DomainError::invariant("request_id mismatch"));
        }
        Ok(())
    }

    fn ensure_opened(&self, request_id: RestockRequestId) -> Result<ProductId, DomainError> {
        self.ensure_request_id(request_id)?;
        match (self.created, self.product_id) {
            (true, Some(product_id)) => Ok(product_id),
            _ => Err(DomainError::not_found()),
        }
    }

    fn handle_open(&self, cmd: &OpenRestockRequest) -> Result<Vec<RestockEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("restock request already exists"));
        }
        self.ensure_request_id(cmd.request_id)?;
        if cmd.requested_quantity <= 0 {
            return Err(DomainError::validation("requested quantity must be positive"));
        }

        Ok(vec![RestockEvent::Opened(RestockRequestOpened {
            request_id: cmd.request_id,
            product_id: cmd.product_id,
            current_stock: cmd.current_stock,
            requested_quantity: cmd.requested_quantity,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_mark_sent(&self, cmd: &MarkRestockSent) -> Result<Vec<RestockEvent>, DomainError> {
        self.ensure_opened(cmd.request_id)?;
        match self.status {
            RestockStatus::Pending => Ok(vec![RestockEvent::Sent(RestockRequestSent {
                request_id: cmd.request_id,
                occurred_at: cmd.occurred_at,
            })]),
            RestockStatus::Sent => Ok(vec![]),
            RestockStatus::Fulfilled => Err(DomainError::invalid_transition(self.status, "send")),
        }
    }

    fn handle_fulfill(
        &self,
        cmd: &FulfillRestockRequest,
    ) -> Result<Vec<RestockEvent>, DomainError> {
        let product_id = self.ensure_opened(cmd.request_id)?;
        if self.status == RestockStatus::Fulfilled {
            return Ok(vec![]);
        }
        if cmd.received_quantity <= 0 {
            return Err(DomainError::validation("received quantity must be positive"));
        }

        Ok(vec![RestockEvent::Fulfilled(RestockRequestFulfilled {
            request_id: cmd.request_id,
            product_id,
            received_quantity: cmd.received_quantity,
            occurred_at: cmd.occurred_at,
        })])
    }
}
