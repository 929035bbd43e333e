use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{Aggregate, AggregateId, AggregateRoot, DomainError};
use stockflow_events::Event;

use crate::transaction::{InventoryTransaction, TransactionId, TransactionKind};

/// Product identifier (the catalog owns products; the ledger owns their stock).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(pub AggregateId);

impl ProductId {
    pub fn new(id: AggregateId) -> Self {
        Self(id)
    }
}

impl core::fmt::Display for ProductId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Physical and reserved unit counters for one product.
///
/// Invariant: `0 <= reserved <= total`. `available` is derived, never stored.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockLevel {
    pub total: i64,
    pub reserved: i64,
}

impl StockLevel {
    pub fn new(total: i64, reserved: i64) -> Result<Self, DomainError> {
        let level = Self { total, reserved };
        if !level.is_consistent() {
            return Err(DomainError::invariant(format!(
                "stock level {level} violates 0 <= reserved <= total"
            )));
        }
        Ok(level)
    }

    pub fn available(&self) -> i64 {
        self.total - self.reserved
    }

    pub fn is_consistent(&self) -> bool {
        self.total >= 0 && self.reserved >= 0 && self.reserved <= self.total
    }

    /// Counters after moving `quantity` units of `kind`, or why the move is refused.
    ///
    /// A refused move leaves `self` untouched.
    pub fn moved(self, kind: TransactionKind, quantity: i64) -> Result<StockLevel, DomainError> {
        match kind {
            TransactionKind::Adjustment if quantity == 0 => {
                return Err(DomainError::validation("adjustment delta cannot be zero"));
            }
            TransactionKind::Adjustment => {}
            _ if quantity <= 0 => {
                return Err(DomainError::validation("quantity must be positive"));
            }
            _ => {}
        }

        let overflow = || DomainError::validation("quantity overflows stock counters");

        let next = match kind {
            TransactionKind::Reserve => {
                let available = self.available();
                if quantity > available {
                    return Err(DomainError::InsufficientStock {
                        requested: quantity,
                        available,
                    });
                }
                StockLevel {
                    total: self.total,
                    reserved: self.reserved + quantity,
                }
            }
            TransactionKind::Release => {
                if quantity > self.reserved {
                    return Err(DomainError::OverRelease {
                        requested: quantity,
                        reserved: self.reserved,
                    });
                }
                StockLevel {
                    total: self.total,
                    reserved: self.reserved - quantity,
                }
            }
            TransactionKind::Dispatch => {
                if quantity > self.reserved {
                    return Err(DomainError::OverRelease {
                        requested: quantity,
                        reserved: self.reserved,
                    });
                }
                StockLevel {
                    total: self.total - quantity,
                    reserved: self.reserved - quantity,
                }
            }
            TransactionKind::Return | TransactionKind::Restock => StockLevel {
                total: self.total.checked_add(quantity).ok_or_else(overflow)?,
                reserved: self.reserved,
            },
            TransactionKind::Adjustment => {
                let total = self.total.checked_add(quantity).ok_or_else(overflow)?;
                if total < 0 {
                    return Err(DomainError::invariant("stock cannot go negative"));
                }
                if total < self.reserved {
                    return Err(DomainError::invariant(
                        "adjustment would leave reserved units uncovered",
                    ));
                }
                StockLevel {
                    total,
                    reserved: self.reserved,
                }
            }
        };

        Ok(next)
    }
}

impl core::fmt::Display for StockLevel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "({}, {})", self.total, self.reserved)
    }
}

/// Aggregate root: StockRecord (one per catalogued product).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    id: ProductId,
    level: StockLevel,
    reorder_threshold: i64,
    active: bool,
    version: u64,
    created: bool,
}

impl StockRecord {
    /// Create an empty, not-yet-registered aggregate instance.
    pub fn empty(id: ProductId) -> Self {
        Self {
            id,
            level: StockLevel::default(),
            reorder_threshold: 0,
            active: false,
            version: 0,
            created: false,
        }
    }

    /// Rebuild a registered record from persisted columns.
    pub fn restore(
        id: ProductId,
        level: StockLevel,
        reorder_threshold: i64,
        active: bool,
        version: u64,
    ) -> Result<Self, DomainError> {
        if !level.is_consistent() {
            return Err(DomainError::invariant(format!(
                "persisted stock level {level} for {id} is inconsistent"
            )));
        }
        if reorder_threshold < 0 {
            return Err(DomainError::invariant("persisted reorder threshold is negative"));
        }
        Ok(Self {
            id,
            level,
            reorder_threshold,
            active,
            version,
            created: true,
        })
    }

    pub fn id_typed(&self) -> ProductId {
        self.id
    }

    pub fn level(&self) -> StockLevel {
        self.level
    }

    pub fn available(&self) -> i64 {
        self.level.available()
    }

    pub fn reorder_threshold(&self) -> i64 {
        self.reorder_threshold
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_below_threshold(&self) -> bool {
        self.level.available() < self.reorder_threshold
    }
}

impl AggregateRoot for StockRecord {
    type Id = ProductId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RegisterProduct (catalog hand-off; initial stock is recorded as a restock).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterProduct {
    pub product_id: ProductId,
    pub initial_quantity: i64,
    pub reorder_threshold: i64,
    pub transaction_id: TransactionId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MoveStock (one ledger delta).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveStock {
    pub product_id: ProductId,
    pub transaction_id: TransactionId,
    pub kind: TransactionKind,
    /// Units moved; signed only for `Adjustment`.
    pub quantity: i64,
    pub reference_order_id: Option<AggregateId>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: SetReorderThreshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetReorderThreshold {
    pub product_id: ProductId,
    pub reorder_threshold: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DeactivateProduct (soft; the record is never deleted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeactivateProduct {
    pub product_id: ProductId,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ReactivateProduct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReactivateProduct {
    pub product_id: ProductId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockCommand {
    RegisterProduct(RegisterProduct),
    MoveStock(MoveStock),
    SetReorderThreshold(SetReorderThreshold),
    DeactivateProduct(DeactivateProduct),
    ReactivateProduct(ReactivateProduct),
}

/// Event: ProductRegistered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRegistered {
    pub product_id: ProductId,
    pub reorder_threshold: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ReorderThresholdChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorderThresholdChanged {
    pub product_id: ProductId,
    pub reorder_threshold: i64,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProductDeactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductDeactivated {
    pub product_id: ProductId,
    pub occurred_at: DateTime<Utc>,
}

/// Event: ProductReactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductReactivated {
    pub product_id: ProductId,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StockEvent {
    ProductRegistered(ProductRegistered),
    /// Counter change; the payload doubles as the audit entry.
    StockMoved(InventoryTransaction),
    ReorderThresholdChanged(ReorderThresholdChanged),
    ProductDeactivated(ProductDeactivated),
    ProductReactivated(ProductReactivated),
}

impl StockEvent {
    pub fn as_transaction(&self) -> Option<&InventoryTransaction> {
        match self {
            StockEvent::StockMoved(tx) => Some(tx),
            _ => None,
        }
    }
}

impl Event for StockEvent {
    fn event_type(&self) -> &'static str {
        match self {
            StockEvent::ProductRegistered(_) => "inventory.stock.registered",
            StockEvent::StockMoved(_) => "inventory.stock.moved",
            StockEvent::ReorderThresholdChanged(_) => "inventory.stock.threshold_changed",
            StockEvent::ProductDeactivated(_) => "inventory.stock.deactivated",
            StockEvent::ProductReactivated(_) => "inventory.stock.reactivated",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            StockEvent::ProductRegistered(e) => e.occurred_at,
            StockEvent::StockMoved(e) => e.occurred_at,
            StockEvent::ReorderThresholdChanged(e) => e.occurred_at,
            StockEvent::ProductDeactivated(e) => e.occurred_at,
            StockEvent::ProductReactivated(e) => e.occurred_at,
        }
    }
}

impl Aggregate for StockRecord {
    type Command = StockCommand;
    type Event = StockEvent;
    type Error = DomainError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            StockEvent::ProductRegistered(e) => {
                self.id = e.product_id;
                self.level = StockLevel::default();
                self.reorder_threshold = e.reorder_threshold;
                self.active = true;
                self.created = true;
            }
            StockEvent::StockMoved(tx) => {
                self.level = tx.after();
            }
            StockEvent::ReorderThresholdChanged(e) => {
                self.reorder_threshold = e.reorder_threshold;
            }
            StockEvent::ProductDeactivated(_) => {
                self.active = false;
            }
            StockEvent::ProductReactivated(_) => {
                self.active = true;
            }
        }

        // Deterministic version tracking: +1 per applied event.
        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            StockCommand::RegisterProduct(cmd) => self.handle_register(cmd),
            StockCommand::MoveStock(cmd) => self.handle_move(cmd),
            StockCommand::SetReorderThreshold(cmd) => self.handle_set_threshold(cmd),
            StockCommand::DeactivateProduct(cmd) => self.handle_deactivate(cmd),
            StockCommand::ReactivateProduct(cmd) => self.handle_reactivate(cmd),
        }
    }
}

impl StockRecord {
    fn ensure_product_id(&self, product_id: ProductId) -> Result<(), DomainError> {
        if self.id != product_id {
            return Err(DomainError::invariant("product_id mismatch"));
        }
        Ok(())
    }

    fn ensure_registered(&self, product_id: ProductId) -> Result<(), DomainError> {
        if !self.created {
            return Err(DomainError::not_found());
        }
        self.ensure_product_id(product_id)
    }

    fn handle_register(&self, cmd: &RegisterProduct) -> Result<Vec<StockEvent>, DomainError> {
        if self.created {
            return Err(DomainError::conflict("product already registered"));
        }
        self.ensure_product_id(cmd.product_id)?;
        if cmd.initial_quantity < 0 {
            return Err(DomainError::validation("initial quantity cannot be negative"));
        }
        if cmd.reorder_threshold < 0 {
            return Err(DomainError::validation("reorder threshold cannot be negative"));
        }

        let mut events = vec![StockEvent::ProductRegistered(ProductRegistered {
            product_id: cmd.product_id,
            reorder_threshold: cmd.reorder_threshold,
            occurred_at: cmd.occurred_at,
        })];

        if cmd.initial_quantity > 0 {
            let before = StockLevel::default();
            let after = before.moved(TransactionKind::Restock, cmd.initial_quantity)?;
            events.push(StockEvent::StockMoved(InventoryTransaction {
                transaction_id: cmd.transaction_id,
                product_id: cmd.product_id,
                kind: TransactionKind::Restock,
                delta: cmd.initial_quantity,
                total_before: before.total,
                total_after: after.total,
                reserved_before: before.reserved,
                reserved_after: after.reserved,
                reference_order_id: None,
                occurred_at: cmd.occurred_at,
            }));
        }

        Ok(events)
    }

    fn handle_move(&self, cmd: &MoveStock) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_registered(cmd.product_id)?;

        if cmd.kind == TransactionKind::Reserve && !self.active {
            return Err(DomainError::Inactive(format!(
                "product {} is deactivated and cannot be reserved",
                cmd.product_id
            )));
        }

        let before = self.level;
        let after = before.moved(cmd.kind, cmd.quantity)?;

        Ok(vec![StockEvent::StockMoved(InventoryTransaction {
            transaction_id: cmd.transaction_id,
            product_id: cmd.product_id,
            kind: cmd.kind,
            delta: cmd.kind.signed_delta(cmd.quantity),
            total_before: before.total,
            total_after: after.total,
            reserved_before: before.reserved,
            reserved_after: after.reserved,
            reference_order_id: cmd.reference_order_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_set_threshold(
        &self,
        cmd: &SetReorderThreshold,
    ) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_registered(cmd.product_id)?;
        if cmd.reorder_threshold < 0 {
            return Err(DomainError::validation("reorder threshold cannot be negative"));
        }
        if cmd.reorder_threshold == self.reorder_threshold {
            return Ok(vec![]);
        }
        Ok(vec![StockEvent::ReorderThresholdChanged(ReorderThresholdChanged {
            product_id: cmd.product_id,
            reorder_threshold: cmd.reorder_threshold,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_deactivate(&self, cmd: &DeactivateProduct) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_registered(cmd.product_id)?;
        if !self.active {
            return Ok(vec![]);
        }
        Ok(vec![StockEvent::ProductDeactivated(ProductDeactivated {
            product_id: cmd.product_id,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_reactivate(&self, cmd: &ReactivateProduct) -> Result<Vec<StockEvent>, DomainError> {
        self.ensure_registered(cmd.product_id)?;
        if self.active {
            return Ok(vec![]);
        }
        Ok(vec![StockEvent::ProductReactivated(ProductReactivated {
            product_id: cmd.product_id,
            occurred_at: cmd.occurred_at,
        })])
    }
}
