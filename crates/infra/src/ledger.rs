//! Inventory ledger: per-product stock counters and their deltas.
//!
//! Every delta is decided by the `StockRecord` aggregate against a fresh
//! snapshot and committed with a version check on that snapshot, so a delta
//! computed from stale counters can never be written. Each successful delta
//! appends exactly one audit entry in the same commit.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use chrono::{DateTime, Utc};
use tracing::instrument;

use stockflow_core::{Aggregate, AggregateRoot, ExpectedVersion};
use stockflow_inventory::{
    DeactivateProduct, InventoryTransaction, MoveStock, ProductId, ReactivateProduct,
    RegisterProduct, SetReorderThreshold, StockCommand, StockEvent, StockLevel, StockRecord,
    TransactionId, TransactionKind,
};
use stockflow_sales::OrderId;

use crate::error::EngineError;
use crate::retry::CommitPolicy;
use crate::store::{AuditRecord, EngineStore, UnitOfWork};

/// Result of a committed operation plus the audit entries it appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed<T> {
    pub value: T,
    pub audit: Vec<AuditRecord>,
}

impl<T> Committed<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Committed<U> {
        Committed {
            value: f(self.value),
            audit: self.audit,
        }
    }

    /// Counters after the commit, once per touched product, in first-touch order.
    pub fn latest_levels(&self) -> Vec<(ProductId, StockLevel)> {
        let mut levels: Vec<(ProductId, StockLevel)> = Vec::new();
        for record in &self.audit {
            let tx = &record.transaction;
            match levels.iter_mut().find(|(id, _)| *id == tx.product_id) {
                Some((_, level)) => *level = tx.after(),
                None => levels.push((tx.product_id, tx.after())),
            }
        }
        levels
    }
}

#[derive(Debug, Clone)]
struct Staged {
    record: StockRecord,
    loaded_version: u64,
}

/// Stages stock deltas for several products into one unit of work.
///
/// Each product is loaded once, on first touch; later deltas in the same batch
/// see the staged counters. A refused delta leaves the staged record untouched.
#[derive(Debug)]
pub struct LedgerBatch<'s, S: ?Sized> {
    store: &'s S,
    occurred_at: DateTime<Utc>,
    staged: BTreeMap<ProductId, Staged>,
    movements: Vec<InventoryTransaction>,
}

impl<'s, S> LedgerBatch<'s, S>
where
    S: EngineStore + ?Sized,
{
    pub fn new(store: &'s S, occurred_at: DateTime<Utc>) -> Self {
        Self {
            store,
            occurred_at,
            staged: BTreeMap::new(),
            movements: Vec::new(),
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    /// Staged view of a product, if it has been touched.
    pub fn record(&self, product_id: ProductId) -> Option<&StockRecord> {
        self.staged.get(&product_id).map(|s| &s.record)
    }

    pub fn movements(&self) -> &[InventoryTransaction] {
        &self.movements
    }

    fn staged(&mut self, product_id: ProductId) -> Result<&mut Staged, EngineError> {
        match self.staged.entry(product_id) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let record = self
                    .store
                    .load_stock(product_id)?
                    .ok_or(EngineError::ProductNotFound(product_id))?;
                let loaded_version = record.version();
                Ok(e.insert(Staged {
                    record,
                    loaded_version,
                }))
            }
        }
    }

    fn execute(
        &mut self,
        product_id: ProductId,
        command: StockCommand,
    ) -> Result<Vec<StockEvent>, EngineError> {
        let staged = self.staged(product_id)?;
        let events = staged
            .record
            .handle(&command)
            .map_err(|e| EngineError::from_stock(product_id, e))?;
        for event in &events {
            staged.record.apply(event);
        }

        self.movements
            .extend(events.iter().filter_map(|e| e.as_transaction().cloned()));
        Ok(events)
    }

    /// Apply one counter delta and return its audit entry.
    pub fn move_stock(
        &mut self,
        product_id: ProductId,
        kind: TransactionKind,
        quantity: i64,
        reference: Option<OrderId>,
    ) -> Result<InventoryTransaction, EngineError> {
        let command = StockCommand::MoveStock(MoveStock {
            product_id,
            transaction_id: TransactionId::new(),
            kind,
            quantity,
            reference_order_id: reference.map(|o| o.0),
            occurred_at: self.occurred_at,
        });

        self.execute(product_id, command)?
            .into_iter()
            .find_map(|e| match e {
                StockEvent::StockMoved(tx) => Some(tx),
                _ => None,
            })
            .ok_or_else(|| EngineError::Validation(format!("{kind:?} recorded no movement")))
    }

    /// `reserved += qty`, only if `available >= qty`.
    pub fn reserve(
        &mut self,
        product_id: ProductId,
        quantity: i64,
        reference: Option<OrderId>,
    ) -> Result<InventoryTransaction, EngineError> {
        self.move_stock(product_id, TransactionKind::Reserve, quantity, reference)
    }

    /// `reserved -= qty`.
    pub fn release(
        &mut self,
        product_id: ProductId,
        quantity: i64,
        reference: Option<OrderId>,
    ) -> Result<InventoryTransaction, EngineError> {
        self.move_stock(product_id, TransactionKind::Release, quantity, reference)
    }

    /// `total -= qty` and `reserved -= qty` together.
    pub fn dispatch(
        &mut self,
        product_id: ProductId,
        quantity: i64,
        reference: Option<OrderId>,
    ) -> Result<InventoryTransaction, EngineError> {
        self.move_stock(product_id, TransactionKind::Dispatch, quantity, reference)
    }

    /// `total += qty` for received supplier stock.
    pub fn restock(
        &mut self,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<InventoryTransaction, EngineError> {
        self.move_stock(product_id, TransactionKind::Restock, quantity, None)
    }

    /// `total += qty` for goods coming back from a customer.
    pub fn return_stock(
        &mut self,
        product_id: ProductId,
        quantity: i64,
        reference: Option<OrderId>,
    ) -> Result<InventoryTransaction, EngineError> {
        self.move_stock(product_id, TransactionKind::Return, quantity, reference)
    }

    /// Signed manual correction of `total`.
    pub fn adjust(
        &mut self,
        product_id: ProductId,
        delta: i64,
    ) -> Result<InventoryTransaction, EngineError> {
        self.move_stock(product_id, TransactionKind::Adjustment, delta, None)
    }

    pub fn register_product(
        &mut self,
        product_id: ProductId,
        initial_quantity: i64,
        reorder_threshold: i64,
    ) -> Result<StockRecord, EngineError> {
        if self.staged.contains_key(&product_id) || self.store.load_stock(product_id)?.is_some() {
            return Err(EngineError::AlreadyExists(format!(
                "product {product_id} is already registered"
            )));
        }
        self.staged.insert(
            product_id,
            Staged {
                record: StockRecord::empty(product_id),
                loaded_version: 0,
            },
        );

        let command = StockCommand::RegisterProduct(RegisterProduct {
            product_id,
            initial_quantity,
            reorder_threshold,
            transaction_id: TransactionId::new(),
            occurred_at: self.occurred_at,
        });
        self.execute(product_id, command)?;
        self.current(product_id)
    }

    pub fn set_reorder_threshold(
        &mut self,
        product_id: ProductId,
        reorder_threshold: i64,
    ) -> Result<StockRecord, EngineError> {
        let command = StockCommand::SetReorderThreshold(SetReorderThreshold {
            product_id,
            reorder_threshold,
            occurred_at: self.occurred_at,
        });
        self.execute(product_id, command)?;
        self.current(product_id)
    }

    pub fn deactivate_product(&mut self, product_id: ProductId) -> Result<StockRecord, EngineError> {
        let command = StockCommand::DeactivateProduct(DeactivateProduct {
            product_id,
            occurred_at: self.occurred_at,
        });
        self.execute(product_id, command)?;
        self.current(product_id)
    }

    pub fn reactivate_product(&mut self, product_id: ProductId) -> Result<StockRecord, EngineError> {
        let command = StockCommand::ReactivateProduct(ReactivateProduct {
            product_id,
            occurred_at: self.occurred_at,
        });
        self.execute(product_id, command)?;
        self.current(product_id)
    }

    fn current(&self, product_id: ProductId) -> Result<StockRecord, EngineError> {
        self.record(product_id)
            .cloned()
            .ok_or(EngineError::ProductNotFound(product_id))
    }

    /// Turn the staged state into writes checked against the loaded versions.
    ///
    /// Records that ended up unchanged are not written.
    pub fn into_unit(self) -> UnitOfWork {
        let mut unit = UnitOfWork::new();
        for staged in self.staged.into_values() {
            if staged.record.version() != staged.loaded_version {
                unit.put_stock(staged.record, ExpectedVersion::Exact(staged.loaded_version));
            }
        }
        for entry in self.movements {
            unit.append_audit(entry);
        }
        unit
    }
}

/// Single-product ledger operations, each committed on its own.
#[derive(Debug, Clone)]
pub struct InventoryLedger<S> {
    store: S,
    commit: CommitPolicy,
}

impl<S> InventoryLedger<S>
where
    S: EngineStore,
{
    pub fn new(store: S, commit: CommitPolicy) -> Self {
        Self { store, commit }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn stock(&self, product_id: ProductId) -> Result<StockRecord, EngineError> {
        self.store
            .load_stock(product_id)?
            .ok_or(EngineError::ProductNotFound(product_id))
    }

    /// Run `stage` against a fresh batch and commit it, retrying on conflicts.
    pub fn apply<T, F>(&self, operation: &'static str, stage: F) -> Result<Committed<T>, EngineError>
    where
        F: Fn(&mut LedgerBatch<'_, S>) -> Result<T, EngineError>,
    {
        self.commit.run(operation, || {
            let mut batch = LedgerBatch::new(&self.store, Utc::now());
            let value = stage(&mut batch)?;
            let audit = self.store.commit(batch.into_unit())?;
            Ok(Committed { value, audit })
        })
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub fn reserve(
        &self,
        product_id: ProductId,
        quantity: i64,
        reference: Option<OrderId>,
    ) -> Result<Committed<InventoryTransaction>, EngineError> {
        self.apply("reserve", |b| b.reserve(product_id, quantity, reference))
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub fn release(
        &self,
        product_id: ProductId,
        quantity: i64,
        reference: Option<OrderId>,
    ) -> Result<Committed<InventoryTransaction>, EngineError> {
        self.apply("release", |b| b.release(product_id, quantity, reference))
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub fn dispatch(
        &self,
        product_id: ProductId,
        quantity: i64,
        reference: Option<OrderId>,
    ) -> Result<Committed<InventoryTransaction>, EngineError> {
        self.apply("dispatch", |b| b.dispatch(product_id, quantity, reference))
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub fn restock(
        &self,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<Committed<InventoryTransaction>, EngineError> {
        self.apply("restock", |b| b.restock(product_id, quantity))
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub fn return_stock(
        &self,
        product_id: ProductId,
        quantity: i64,
        reference: Option<OrderId>,
    ) -> Result<Committed<InventoryTransaction>, EngineError> {
        self.apply("return_stock", |b| b.return_stock(product_id, quantity, reference))
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub fn adjust(
        &self,
        product_id: ProductId,
        delta: i64,
    ) -> Result<Committed<InventoryTransaction>, EngineError> {
        self.apply("adjust", |b| b.adjust(product_id, delta))
    }

    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub fn register_product(
        &self,
        product_id: ProductId,
        initial_quantity: i64,
        reorder_threshold: i64,
    ) -> Result<Committed<StockRecord>, EngineError> {
        self.apply("register_product", |b| {
            b.register_product(product_id, initial_quantity, reorder_threshold)
        })
    }

    pub fn set_reorder_threshold(
        &self,
        product_id: ProductId,
        reorder_threshold: i64,
    ) -> Result<Committed<StockRecord>, EngineError> {
        self.apply("set_reorder_threshold", |b| {
            b.set_reorder_threshold(product_id, reorder_threshold)
        })
    }

    pub fn deactivate_product(&self, product_id: ProductId) -> Result<Committed<StockRecord>, EngineError> {
        self.apply("deactivate_product", |b| b.deactivate_product(product_id))
    }

    pub fn reactivate_product(&self, product_id: ProductId) -> Result<Committed<StockRecord>, EngineError> {
        self.apply("reactivate_product", |b| b.reactivate_product(product_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use stockflow_core::AggregateId;

    use crate::store::InMemoryEngineStore;

    fn test_product_id() -> ProductId {
        ProductId::new(AggregateId::new())
    }

    fn ledger() -> InventoryLedger<Arc<InMemoryEngineStore>> {
        InventoryLedger::new(
            Arc::new(InMemoryEngineStore::new()),
            CommitPolicy {
                max_attempts: 8,
                backoff: Duration::ZERO,
            },
        )
    }

    fn with_product(ledger: &InventoryLedger<Arc<InMemoryEngineStore>>, total: i64) -> ProductId {
        let product_id = test_product_id();
        ledger.register_product(product_id, total, 3).unwrap();
        product_id
    }

    #[test]
    fn register_commits_record_and_initial_restock() {
        let ledger = ledger();
        let product_id = test_product_id();
        let committed = ledger.register_product(product_id, 10, 3).unwrap();

        assert_eq!(committed.value.level(), StockLevel { total: 10, reserved: 0 });
        assert_eq!(committed.audit.len(), 1);
        assert_eq!(committed.audit[0].transaction.kind, TransactionKind::Restock);
        assert_eq!(ledger.stock(product_id).unwrap(), committed.value);
    }

    #[test]
    fn registering_twice_is_rejected() {
        let ledger = ledger();
        let product_id = with_product(&ledger, 1);
        let err = ledger.register_product(product_id, 1, 0).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyExists(_)));
    }

    #[test]
    fn deltas_follow_counter_rules() {
        let ledger = ledger();
        let product_id = with_product(&ledger, 10);

        ledger.reserve(product_id, 8, None).unwrap();
        let err = ledger.reserve(product_id, 3, None).unwrap_err();
        assert_eq!(
            err,
            EngineError::from_stock(
                product_id,
                stockflow_core::DomainError::InsufficientStock {
                    requested: 3,
                    available: 2
                }
            )
        );

        ledger.dispatch(product_id, 5, None).unwrap();
        ledger.release(product_id, 3, None).unwrap();
        ledger.restock(product_id, 4).unwrap();
        ledger.adjust(product_id, -1).unwrap();

        assert_eq!(
            ledger.stock(product_id).unwrap().level(),
            StockLevel { total: 8, reserved: 0 }
        );
    }

    #[test]
    fn over_release_is_reported_with_product() {
        let ledger = ledger();
        let product_id = with_product(&ledger, 10);
        ledger.reserve(product_id, 2, None).unwrap();

        let err = ledger.release(product_id, 3, None).unwrap_err();
        assert_eq!(
            err,
            EngineError::OverRelease {
                product_id,
                requested: 3,
                reserved: 2
            }
        );
    }

    #[test]
    fn unknown_product_is_not_found() {
        let ledger = ledger();
        let product_id = test_product_id();
        assert_eq!(
            ledger.restock(product_id, 1).unwrap_err(),
            EngineError::ProductNotFound(product_id)
        );
    }

    #[test]
    fn batch_sees_its_own_staged_counters() {
        let ledger = ledger();
        let product_id = with_product(&ledger, 5);

        let committed = ledger
            .apply("test", |b| {
                b.reserve(product_id, 3, None)?;
                // Only 2 left in the staged view.
                assert!(b.reserve(product_id, 3, None).is_err());
                b.reserve(product_id, 2, None)
            })
            .unwrap();

        assert_eq!(committed.audit.len(), 2);
        assert_eq!(
            committed.latest_levels(),
            vec![(product_id, StockLevel { total: 5, reserved: 5 })]
        );
    }

    #[test]
    fn threshold_change_writes_no_audit_entry() {
        let ledger = ledger();
        let product_id = with_product(&ledger, 5);
        let committed = ledger.set_reorder_threshold(product_id, 7).unwrap();
        assert!(committed.audit.is_empty());
        assert_eq!(ledger.stock(product_id).unwrap().reorder_threshold(), 7);
    }

    #[test]
    fn concurrent_reservations_never_oversell() {
        let ledger = Arc::new(InventoryLedger::new(
            Arc::new(InMemoryEngineStore::new()),
            CommitPolicy {
                max_attempts: 1_000,
                backoff: Duration::ZERO,
            },
        ));
        let product_id = with_product(&ledger, 50);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| ledger.reserve(product_id, 1, None).is_ok())
                        .count()
                })
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(granted, 50);
        assert_eq!(
            ledger.stock(product_id).unwrap().level(),
            StockLevel { total: 50, reserved: 50 }
        );
    }
}
