//! Infrastructure layer: storage, atomic commits, order orchestration and
//! post-commit event publishing.
//!
//! - `store`: versioned record persistence (in-memory, Postgres)
//! - `ledger`: stock deltas with audit entries
//! - `coordinator`: all-or-nothing multi-line reservation
//! - `lifecycle`: order state transitions
//! - `restock`: low-stock detection, restock requests and the restock worker
//! - `engine`: the facade tying them together

pub mod audit;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod notifications;
pub mod restock;
pub mod retry;
pub mod store;
pub mod worker;

#[cfg(test)]
mod integration_tests;

pub use audit::{AuditEntries, AuditTrail, Reconciliation};
pub use config::{ConfigError, EngineConfig};
pub use coordinator::ReservationCoordinator;
pub use engine::InventoryEngine;
pub use error::{EngineError, LineShortfall};
pub use ledger::{Committed, InventoryLedger, LedgerBatch};
pub use lifecycle::{OrderStateMachine, Transition};
pub use notifications::EngineEvent;
pub use restock::{Evaluation, Fulfillment, LowStock, RestockTrigger, RestockWorker};
pub use retry::CommitPolicy;
pub use store::{AuditRecord, EngineStore, InMemoryEngineStore, StoreError, UnitOfWork};
pub use worker::{EventWorker, WorkerHandle};
