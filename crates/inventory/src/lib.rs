//! Inventory domain module.
//!
//! Per-product stock counters and the movements that change them, implemented
//! purely as deterministic domain logic (no IO, no storage).

pub mod replay;
pub mod stock;
pub mod transaction;

pub use replay::{ReplayError, replay};
pub use stock::{
    DeactivateProduct, MoveStock, ProductDeactivated, ProductId, ProductReactivated,
    ProductRegistered, ReactivateProduct, RegisterProduct, ReorderThresholdChanged,
    SetReorderThreshold, StockCommand, StockEvent, StockLevel, StockRecord,
};
pub use transaction::{InventoryTransaction, TransactionId, TransactionKind};
