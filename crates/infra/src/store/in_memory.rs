use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use stockflow_core::{AggregateRoot, ExpectedVersion};
use stockflow_inventory::{ProductId, StockRecord};
use stockflow_purchasing::{RestockRequest, RestockRequestId};
use stockflow_sales::{Order, OrderId};

use super::{AuditRecord, EngineStore, StoreError, UnitOfWork};

#[derive(Debug, Default)]
struct State {
    stock: BTreeMap<ProductId, StockRecord>,
    orders: HashMap<OrderId, Order>,
    restock_requests: HashMap<RestockRequestId, RestockRequest>,
    /// Open (pending/sent) request per product.
    open_restock: HashMap<ProductId, RestockRequestId>,
    audit: Vec<AuditRecord>,
    /// Positions in `audit` per product, ascending.
    audit_by_product: HashMap<ProductId, Vec<usize>>,
}

/// In-memory engine store.
///
/// Intended for tests/dev and the simulator. A single lock guards all maps so a
/// commit is visible all at once.
#[derive(Debug, Default)]
pub struct InMemoryEngineStore {
    state: RwLock<State>,
}

impl InMemoryEngineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of audit entries committed so far.
    pub fn audit_len(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.audit.len())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }
}

fn check(
    kind: &str,
    id: impl core::fmt::Display,
    expected: ExpectedVersion,
    current: u64,
) -> Result<(), StoreError> {
    if !expected.matches(current) {
        return Err(StoreError::Conflict(format!(
            "{kind} {id}: expected {expected:?}, found {current}"
        )));
    }
    Ok(())
}

impl EngineStore for InMemoryEngineStore {
    fn load_stock(&self, product_id: ProductId) -> Result<Option<StockRecord>, StoreError> {
        Ok(self.read()?.stock.get(&product_id).cloned())
    }

    fn load_order(&self, order_id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.read()?.orders.get(&order_id).cloned())
    }

    fn load_restock_request(
        &self,
        request_id: RestockRequestId,
    ) -> Result<Option<RestockRequest>, StoreError> {
        Ok(self.read()?.restock_requests.get(&request_id).cloned())
    }

    fn open_restock_request(
        &self,
        product_id: ProductId,
    ) -> Result<Option<RestockRequest>, StoreError> {
        let state = self.read()?;
        Ok(state
            .open_restock
            .get(&product_id)
            .and_then(|id| state.restock_requests.get(id))
            .cloned())
    }

    fn product_ids(&self) -> Result<Vec<ProductId>, StoreError> {
        Ok(self.read()?.stock.keys().copied().collect())
    }

    fn audit_page(
        &self,
        product_id: ProductId,
        since: DateTime<Utc>,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<AuditRecord>, StoreError> {
        let state = self.read()?;
        let Some(positions) = state.audit_by_product.get(&product_id) else {
            return Ok(vec![]);
        };

        Ok(positions
            .iter()
            .map(|&pos| &state.audit[pos])
            .filter(|r| r.sequence > after_sequence && r.transaction.occurred_at >= since)
            .take(limit)
            .cloned()
            .collect())
    }

    fn commit(&self, unit: UnitOfWork) -> Result<Vec<AuditRecord>, StoreError> {
        if unit.is_empty() {
            return Ok(vec![]);
        }
        unit.ensure_distinct()?;

        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))?;

        // 1) Validate everything; nothing is written until all checks pass.
        for w in &unit.stock {
            let id = w.record.id_typed();
            let current = state.stock.get(&id).map(|r| r.version()).unwrap_or(0);
            check("stock record", id, w.expected, current)?;
        }
        for w in &unit.orders {
            let id = w.order.id_typed();
            let current = state.orders.get(&id).map(|o| o.version()).unwrap_or(0);
            check("order", id, w.expected, current)?;
        }
        for w in &unit.restock_requests {
            let id = w.request.id_typed();
            let current = state
                .restock_requests
                .get(&id)
                .map(|r| r.version())
                .unwrap_or(0);
            check("restock request", id, w.expected, current)?;

            if let (true, Some(product_id)) = (w.request.is_open(), w.request.product_id()) {
                let held_by_other = state
                    .open_restock
                    .get(&product_id)
                    .is_some_and(|open| *open != id);
                let opened_twice = unit.restock_requests.iter().any(|other| {
                    other.request.id_typed() != id
                        && other.request.is_open()
                        && other.request.product_id() == Some(product_id)
                });
                if held_by_other || opened_twice {
                    return Err(StoreError::Conflict(format!(
                        "product {product_id} already has an open restock request"
                    )));
                }
            }
        }

        // 2) Apply.
        for w in unit.stock {
            state.stock.insert(w.record.id_typed(), w.record);
        }
        for w in unit.orders {
            state.orders.insert(w.order.id_typed(), w.order);
        }
        for w in unit.restock_requests {
            let id = w.request.id_typed();
            if let Some(product_id) = w.request.product_id() {
                if w.request.is_open() {
                    state.open_restock.insert(product_id, id);
                } else if state.open_restock.get(&product_id) == Some(&id) {
                    state.open_restock.remove(&product_id);
                }
            }
            state.restock_requests.insert(id, w.request);
        }

        let mut committed = Vec::with_capacity(unit.audit.len());
        for transaction in unit.audit {
            let pos = state.audit.len();
            let record = AuditRecord {
                sequence: pos as u64 + 1,
                transaction,
            };
            state
                .audit_by_product
                .entry(record.transaction.product_id)
                .or_default()
                .push(pos);
            state.audit.push(record.clone());
            committed.push(record);
        }

        Ok(committed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_core::AggregateId;
    use stockflow_events::execute;
    use stockflow_inventory::{RegisterProduct, StockCommand, TransactionId};
    use stockflow_purchasing::{OpenRestockRequest, RestockCommand};

    fn test_product_id() -> ProductId {
        ProductId::new(AggregateId::new())
    }

    fn registered(product_id: ProductId, initial: i64) -> (StockRecord, Vec<stockflow_inventory::InventoryTransaction>) {
        let mut record = StockRecord::empty(product_id);
        let events = execute(
            &mut record,
            &StockCommand::RegisterProduct(RegisterProduct {
                product_id,
                initial_quantity: initial,
                reorder_threshold: 2,
                transaction_id: TransactionId::new(),
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        let audit = events
            .iter()
            .filter_map(|e| e.as_transaction().cloned())
            .collect();
        (record, audit)
    }

    fn open_request(product_id: ProductId) -> RestockRequest {
        let request_id = RestockRequestId::new(AggregateId::new());
        let mut request = RestockRequest::empty(request_id);
        execute(
            &mut request,
            &RestockCommand::Open(OpenRestockRequest {
                request_id,
                product_id,
                current_stock: 0,
                requested_quantity: 4,
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        request
    }

    #[test]
    fn commit_assigns_sequences_and_indexes_audit() {
        let store = InMemoryEngineStore::new();
        let product_id = test_product_id();
        let (record, audit) = registered(product_id, 5);

        let mut unit = UnitOfWork::new();
        unit.put_stock(record, ExpectedVersion::Exact(0));
        for tx in audit {
            unit.append_audit(tx);
        }
        let committed = store.commit(unit).unwrap();

        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].sequence, 1);
        let page = store
            .audit_page(product_id, DateTime::<Utc>::MIN_UTC, 0, 10)
            .unwrap();
        assert_eq!(page, committed);
        assert_eq!(store.product_ids().unwrap(), vec![product_id]);
    }

    #[test]
    fn stale_write_rejects_whole_unit() {
        let store = InMemoryEngineStore::new();
        let a = test_product_id();
        let b = test_product_id();
        let (ra, _) = registered(a, 1);
        let (rb, audit_b) = registered(b, 1);

        let mut unit = UnitOfWork::new();
        unit.put_stock(ra.clone(), ExpectedVersion::Exact(0));
        store.commit(unit).unwrap();

        // `a` already exists, so this unit must not leave `b` or its audit behind.
        let mut unit = UnitOfWork::new();
        unit.put_stock(rb, ExpectedVersion::Exact(0));
        unit.put_stock(ra, ExpectedVersion::Exact(0));
        for tx in audit_b {
            unit.append_audit(tx);
        }
        let err = store.commit(unit).unwrap_err();

        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.load_stock(b).unwrap().is_none());
        assert_eq!(store.audit_len().unwrap(), 0);
    }

    #[test]
    fn second_open_restock_request_conflicts() {
        let store = InMemoryEngineStore::new();
        let product_id = test_product_id();

        let first = open_request(product_id);
        let mut unit = UnitOfWork::new();
        unit.put_restock_request(first.clone(), ExpectedVersion::Exact(0));
        store.commit(unit).unwrap();

        let mut unit = UnitOfWork::new();
        unit.put_restock_request(open_request(product_id), ExpectedVersion::Exact(0));
        assert!(matches!(store.commit(unit), Err(StoreError::Conflict(_))));

        assert_eq!(store.open_restock_request(product_id).unwrap(), Some(first));
    }

    #[test]
    fn duplicate_writes_in_one_unit_are_rejected() {
        let store = InMemoryEngineStore::new();
        let product_id = test_product_id();
        let (record, _) = registered(product_id, 1);

        let mut unit = UnitOfWork::new();
        unit.put_stock(record.clone(), ExpectedVersion::Exact(0));
        unit.put_stock(record, ExpectedVersion::Exact(0));
        assert!(matches!(store.commit(unit), Err(StoreError::Corrupt(_))));
    }
}
