//! Versioned record store boundary.
//!
//! Stock records, orders and restock requests are stored as whole versioned
//! records. Every mutation goes through [`EngineStore::commit`], which applies a
//! [`UnitOfWork`] all-or-nothing:
//!
//! ```text
//! UnitOfWork
//!   ├─ stock writes        (each checked against an ExpectedVersion)
//!   ├─ order writes        (each checked against an ExpectedVersion)
//!   ├─ restock writes      (each checked; at most one open request per product)
//!   └─ audit entries       (appended, assigned a global commit sequence)
//! ```
//!
//! A failed check rejects the whole unit with [`StoreError::Conflict`]; nothing
//! becomes visible. Callers reload and retry.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use stockflow_core::ExpectedVersion;
use stockflow_inventory::{InventoryTransaction, ProductId, StockRecord};
use stockflow_purchasing::{RestockRequest, RestockRequestId};
use stockflow_sales::{Order, OrderId};

pub use in_memory::InMemoryEngineStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresEngineStore;

/// A committed audit entry with its position in the store-wide commit order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Monotonically increasing across all products; never reused.
    pub sequence: u64,
    pub transaction: InventoryTransaction,
}

#[derive(Debug, Clone)]
pub struct StockWrite {
    pub record: StockRecord,
    pub expected: ExpectedVersion,
}

#[derive(Debug, Clone)]
pub struct OrderWrite {
    pub order: Order,
    pub expected: ExpectedVersion,
}

#[derive(Debug, Clone)]
pub struct RestockWrite {
    pub request: RestockRequest,
    pub expected: ExpectedVersion,
}

/// Set of writes committed together.
///
/// `ExpectedVersion::Exact(0)` on a write means the record must not exist yet.
#[derive(Debug, Clone, Default)]
pub struct UnitOfWork {
    pub stock: Vec<StockWrite>,
    pub orders: Vec<OrderWrite>,
    pub restock_requests: Vec<RestockWrite>,
    pub audit: Vec<InventoryTransaction>,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_stock(&mut self, record: StockRecord, expected: ExpectedVersion) {
        self.stock.push(StockWrite { record, expected });
    }

    pub fn put_order(&mut self, order: Order, expected: ExpectedVersion) {
        self.orders.push(OrderWrite { order, expected });
    }

    pub fn put_restock_request(&mut self, request: RestockRequest, expected: ExpectedVersion) {
        self.restock_requests.push(RestockWrite { request, expected });
    }

    pub fn append_audit(&mut self, entry: InventoryTransaction) {
        self.audit.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.stock.is_empty()
            && self.orders.is_empty()
            && self.restock_requests.is_empty()
            && self.audit.is_empty()
    }

    /// Reject units that write the same record twice.
    ///
    /// Two writes to one record inside a unit cannot both pass a version check,
    /// so this is a caller bug rather than a conflict.
    pub fn ensure_distinct(&self) -> Result<(), StoreError> {
        let mut products = BTreeSet::new();
        for w in &self.stock {
            if !products.insert(w.record.id_typed()) {
                return Err(StoreError::Corrupt(format!(
                    "unit of work writes stock record {} twice",
                    w.record.id_typed()
                )));
            }
        }

        let mut orders = BTreeSet::new();
        for w in &self.orders {
            if !orders.insert(w.order.id_typed().0) {
                return Err(StoreError::Corrupt(format!(
                    "unit of work writes order {} twice",
                    w.order.id_typed()
                )));
            }
        }

        let mut requests = BTreeSet::new();
        for w in &self.restock_requests {
            if !requests.insert(w.request.id_typed().0) {
                return Err(StoreError::Corrupt(format!(
                    "unit of work writes restock request {} twice",
                    w.request.id_typed()
                )));
            }
        }

        Ok(())
    }
}

/// Store operation error.
///
/// These are infrastructure failures. Business rule failures never reach the
/// store: they are decided before a unit of work is built.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A version check failed or a uniqueness rule was hit; reload and retry.
    #[error("write conflict: {0}")]
    Conflict(String),

    /// The backend could not be reached or refused the operation.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Persisted data could not be decoded or violates an invariant.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Persistence for the engine's records and audit trail.
///
/// Reads are snapshot reads of single records; only `commit` writes.
/// Implementations must make a committed unit visible all at once and must
/// never let a rejected unit leave partial writes behind.
pub trait EngineStore: Send + Sync {
    fn load_stock(&self, product_id: ProductId) -> Result<Option<StockRecord>, StoreError>;

    fn load_order(&self, order_id: OrderId) -> Result<Option<Order>, StoreError>;

    fn load_restock_request(
        &self,
        request_id: RestockRequestId,
    ) -> Result<Option<RestockRequest>, StoreError>;

    /// The pending or sent request for a product, if any.
    fn open_restock_request(
        &self,
        product_id: ProductId,
    ) -> Result<Option<RestockRequest>, StoreError>;

    /// All product ids with a stock record, in ascending order.
    fn product_ids(&self) -> Result<Vec<ProductId>, StoreError>;

    /// Up to `limit` audit entries for `product_id` with `occurred_at >= since`
    /// and `sequence > after_sequence`, in ascending sequence order.
    fn audit_page(
        &self,
        product_id: ProductId,
        since: DateTime<Utc>,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, StoreError>;

    /// Apply a unit of work all-or-nothing, returning the appended audit records.
    fn commit(&self, unit: UnitOfWork) -> Result<Vec<AuditRecord>, StoreError>;
}

impl<S> EngineStore for Arc<S>
where
    S: EngineStore + ?Sized,
{
    fn load_stock(&self, product_id: ProductId) -> Result<Option<StockRecord>, StoreError> {
        (**self).load_stock(product_id)
    }

    fn load_order(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        (**self).load_order(order_id)
    }

    fn load_restock_request(
        &self,
        request_id: RestockRequestId,
    ) -> Result<Option<RestockRequest>, StoreError> {
        (**self).load_restock_request(request_id)
    }

    fn open_restock_request(
        &self,
        product_id: ProductId,
    ) -> Result<Option<RestockRequest>, StoreError> {
        (**self).open_restock_request(product_id)
    }

    fn product_ids(&self) -> Result<Vec<ProductId>, StoreError> {
        (**self).product_ids()
    }

    fn audit_page(
        &self,
        product_id: ProductId,
        since: DateTime<Utc>,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        (**self).audit_page(product_id, since, after_sequence, limit)
    }

    fn commit(&self, unit: UnitOfWork) -> Result<Vec<AuditRecord>, StoreError> {
        (**self).commit(unit)
    }
}
