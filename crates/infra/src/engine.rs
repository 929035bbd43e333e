//! Engine facade.
//!
//! ```text
//! caller ──▶ InventoryEngine ──▶ coordinator / lifecycle / ledger / restock
//!                 │                        │
//!                 │                        └─▶ EngineStore::commit (atomic)
//!                 └─▶ after commit: EventBus::publish
//!                                     ├─ domain events (OrderReserved, ...)
//!                                     ├─ StockChanged per touched product
//!                                     └─ restock evaluation (inline or worker)
//! ```
//!
//! Nothing after the commit can undo it. Publish and evaluation failures are
//! logged and the committed result is still returned.

use chrono::Utc;
use tracing::{instrument, warn};

use stockflow_core::CustomerId;
use stockflow_events::EventBus;
use stockflow_inventory::{InventoryTransaction, ProductId, StockLevel, StockRecord};
use stockflow_purchasing::{RestockRequest, RestockRequestId};
use stockflow_sales::{LineItem, Order, OrderId, OrderReserved};

use crate::audit::{AuditTrail, Reconciliation};
use crate::config::EngineConfig;
use crate::coordinator::ReservationCoordinator;
use crate::error::EngineError;
use crate::ledger::{Committed, InventoryLedger};
use crate::lifecycle::{OrderStateMachine, Transition};
use crate::notifications::{EngineEvent, publish_all};
use crate::restock::{Evaluation, Fulfillment, RestockTrigger, RestockWorker};
use crate::retry::CommitPolicy;
use crate::store::EngineStore;
use crate::worker::WorkerHandle;

#[derive(Debug, Clone)]
pub struct InventoryEngine<S, B> {
    ledger: InventoryLedger<S>,
    coordinator: ReservationCoordinator<S>,
    orders: OrderStateMachine<S>,
    restock: RestockTrigger<S>,
    audit: AuditTrail<S>,
    bus: B,
    config: EngineConfig,
}

impl<S, B> InventoryEngine<S, B>
where
    S: EngineStore + Clone,
    B: EventBus<EngineEvent>,
{
    pub fn new(store: S, bus: B, config: EngineConfig) -> Self {
        let commit = CommitPolicy::from(&config);
        Self {
            ledger: InventoryLedger::new(store.clone(), commit),
            coordinator: ReservationCoordinator::new(store.clone(), commit),
            orders: OrderStateMachine::new(store.clone(), commit),
            restock: RestockTrigger::new(store.clone(), config.restock_policy, commit),
            audit: AuditTrail::new(store, config.audit_page_size),
            bus,
            config,
        }
    }

    pub fn ledger(&self) -> &InventoryLedger<S> {
        &self.ledger
    }

    pub fn audit(&self) -> &AuditTrail<S> {
        &self.audit
    }

    pub fn restock_trigger(&self) -> &RestockTrigger<S> {
        &self.restock
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ---- catalog ----

    pub fn register_product(
        &self,
        product_id: ProductId,
        initial_quantity: i64,
        reorder_threshold: i64,
    ) -> Result<StockRecord, EngineError> {
        let committed = self
            .ledger
            .register_product(product_id, initial_quantity, reorder_threshold)?;
        let level = committed.value.level();
        self.after_commit(vec![], vec![(product_id, level)]);
        Ok(committed.value)
    }

    /// A new threshold can put a product below it without any stock moving,
    /// so this is followed by the same evaluation as a stock change.
    pub fn set_reorder_threshold(
        &self,
        product_id: ProductId,
        reorder_threshold: i64,
    ) -> Result<StockRecord, EngineError> {
        let record = self
            .ledger
            .set_reorder_threshold(product_id, reorder_threshold)?
            .value;
        self.after_commit(vec![], vec![(product_id, record.level())]);
        Ok(record)
    }

    pub fn deactivate_product(&self, product_id: ProductId) -> Result<StockRecord, EngineError> {
        Ok(self.ledger.deactivate_product(product_id)?.value)
    }

    pub fn reactivate_product(&self, product_id: ProductId) -> Result<StockRecord, EngineError> {
        let record = self.ledger.reactivate_product(product_id)?.value;
        self.after_commit(vec![], vec![(product_id, record.level())]);
        Ok(record)
    }

    // ---- raw ledger deltas ----

    pub fn reserve(
        &self,
        product_id: ProductId,
        quantity: i64,
        reference: Option<OrderId>,
    ) -> Result<InventoryTransaction, EngineError> {
        Ok(self.movement(self.ledger.reserve(product_id, quantity, reference)?))
    }

    pub fn release(
        &self,
        product_id: ProductId,
        quantity: i64,
        reference: Option<OrderId>,
    ) -> Result<InventoryTransaction, EngineError> {
        Ok(self.movement(self.ledger.release(product_id, quantity, reference)?))
    }

    pub fn dispatch(
        &self,
        product_id: ProductId,
        quantity: i64,
        reference: Option<OrderId>,
    ) -> Result<InventoryTransaction, EngineError> {
        Ok(self.movement(self.ledger.dispatch(product_id, quantity, reference)?))
    }

    pub fn restock(
        &self,
        product_id: ProductId,
        quantity: i64,
    ) -> Result<InventoryTransaction, EngineError> {
        Ok(self.movement(self.ledger.restock(product_id, quantity)?))
    }

    pub fn adjust(
        &self,
        product_id: ProductId,
        delta: i64,
    ) -> Result<InventoryTransaction, EngineError> {
        Ok(self.movement(self.ledger.adjust(product_id, delta)?))
    }

    fn movement(&self, committed: Committed<InventoryTransaction>) -> InventoryTransaction {
        self.after_commit(vec![], committed.latest_levels());
        committed.value
    }

    // ---- orders ----

    /// Reserve every line and create the order, all or nothing.
    pub fn place_order(
        &self,
        customer_id: CustomerId,
        lines: Vec<LineItem>,
    ) -> Result<Order, EngineError> {
        let committed = self.coordinator.place_order(customer_id, lines)?;
        let order = committed.value.clone();
        let reserved = EngineEvent::OrderReserved(OrderReserved {
            order_id: order.id_typed(),
            customer_id,
            lines: order.lines().to_vec(),
            occurred_at: order.created_at().unwrap_or_else(Utc::now),
        });
        self.after_commit(vec![reserved], committed.latest_levels());
        Ok(order)
    }

    pub fn dispatch_order(&self, order_id: OrderId) -> Result<Transition, EngineError> {
        Ok(self.transitioned(self.orders.dispatch(order_id)?))
    }

    pub fn cancel_order(&self, order_id: OrderId) -> Result<Transition, EngineError> {
        Ok(self.transitioned(self.orders.cancel(order_id)?))
    }

    pub fn deliver_order(&self, order_id: OrderId) -> Result<Transition, EngineError> {
        Ok(self.transitioned(self.orders.deliver(order_id)?))
    }

    pub fn return_order(&self, order_id: OrderId) -> Result<Transition, EngineError> {
        Ok(self.transitioned(self.orders.return_order(order_id)?))
    }

    fn transitioned(&self, committed: Committed<Transition>) -> Transition {
        let events = committed
            .value
            .event()
            .cloned()
            .map(EngineEvent::from)
            .into_iter()
            .collect();
        self.after_commit(events, committed.latest_levels());
        committed.value
    }

    pub fn order(&self, order_id: OrderId) -> Result<Order, EngineError> {
        self.orders.order(order_id)
    }

    // ---- restock ----

    /// Run restock evaluation for a product and publish what it found.
    pub fn evaluate_restock(&self, product_id: ProductId) -> Result<Evaluation, EngineError> {
        let evaluation = self.restock.evaluate(product_id)?;
        publish_all(&self.bus, evaluation.events());
        Ok(evaluation)
    }

    pub fn mark_restock_sent(
        &self,
        request_id: RestockRequestId,
    ) -> Result<RestockRequest, EngineError> {
        self.restock.mark_sent(request_id)
    }

    /// Record received goods, then re-evaluate the product.
    ///
    /// A repeated call for an already fulfilled request changes nothing and
    /// publishes nothing.
    #[instrument(skip(self), fields(request_id = %request_id), err)]
    pub fn fulfill_restock(
        &self,
        request_id: RestockRequestId,
        received_quantity: i64,
    ) -> Result<Fulfillment, EngineError> {
        let committed = self.restock.fulfill(request_id, received_quantity)?;
        let events = committed
            .value
            .event
            .clone()
            .map(EngineEvent::RestockFulfilled)
            .into_iter()
            .collect();
        self.after_commit(events, committed.latest_levels());
        Ok(committed.value)
    }

    pub fn restock_request(
        &self,
        request_id: RestockRequestId,
    ) -> Result<RestockRequest, EngineError> {
        self.restock.request(request_id)
    }

    pub fn open_restock_request(
        &self,
        product_id: ProductId,
    ) -> Result<Option<RestockRequest>, EngineError> {
        Ok(self.ledger.store().open_restock_request(product_id)?)
    }

    // ---- reads ----

    pub fn stock(&self, product_id: ProductId) -> Result<StockRecord, EngineError> {
        self.ledger.stock(product_id)
    }

    pub fn history(&self, product_id: ProductId) -> Result<Vec<InventoryTransaction>, EngineError> {
        self.audit.history(product_id)
    }

    pub fn reconcile(&self, product_id: ProductId) -> Result<Reconciliation, EngineError> {
        self.audit.reconcile(product_id)
    }

    pub fn reconcile_all(&self) -> Result<Vec<Reconciliation>, EngineError> {
        self.audit.reconcile_all()
    }

    /// Post-commit effects, in order: domain events, one `StockChanged` per
    /// touched product, then inline restock evaluation when enabled.
    fn after_commit(&self, events: Vec<EngineEvent>, levels: Vec<(ProductId, StockLevel)>) {
        let now = Utc::now();
        let changed = levels.iter().map(|(product_id, level)| EngineEvent::StockChanged {
            product_id: *product_id,
            level: *level,
            occurred_at: now,
        });
        publish_all(&self.bus, events.into_iter().chain(changed));

        if !self.config.inline_restock {
            return;
        }
        for (product_id, _) in levels {
            if let Err(err) = self.evaluate_restock(product_id) {
                warn!(product_id = %product_id, error = %err, "restock evaluation failed");
            }
        }
    }
}

impl<S, B> InventoryEngine<S, B>
where
    S: EngineStore + Clone + 'static,
    B: EventBus<EngineEvent> + Clone + 'static,
{
    /// Start a background worker that evaluates restock on every
    /// `StockChanged` published on this engine's bus.
    ///
    /// Meant for engines built with `inline_restock` disabled; with both
    /// enabled every change is evaluated twice, which is harmless but wasted.
    pub fn spawn_restock_worker(&self) -> WorkerHandle {
        RestockWorker::spawn(self.bus.clone(), self.restock.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use stockflow_core::AggregateId;
    use stockflow_events::InMemoryEventBus;
    use stockflow_purchasing::RestockStatus;

    use crate::store::InMemoryEngineStore;

    type TestEngine = InventoryEngine<Arc<InMemoryEngineStore>, Arc<InMemoryEventBus<EngineEvent>>>;

    fn engine(config: EngineConfig) -> TestEngine {
        InventoryEngine::new(
            Arc::new(InMemoryEngineStore::new()),
            Arc::new(InMemoryEventBus::new()),
            config.with_retry_backoff(Duration::ZERO),
        )
    }

    fn product_id() -> ProductId {
        ProductId::new(AggregateId::new())
    }

    fn types(events: &[EngineEvent]) -> Vec<&'static str> {
        use stockflow_events::Event;
        events.iter().map(|e| e.event_type()).collect()
    }

    #[test]
    fn place_order_publishes_after_commit() {
        let engine = engine(EngineConfig::default());
        let p = product_id();
        engine.register_product(p, 10, 3).unwrap();
        let sub = engine.bus().subscribe();

        engine
            .place_order(CustomerId::new(), vec![LineItem::new(p, 8, 5)])
            .unwrap();

        assert_eq!(
            types(&sub.drain()),
            vec![
                "sales.order.reserved",
                "inventory.stock.changed",
                "inventory.stock.low",
                "purchasing.restock.requested",
            ]
        );
    }

    #[test]
    fn unchanged_transition_publishes_nothing() {
        let engine = engine(EngineConfig::default());
        let p = product_id();
        engine.register_product(p, 10, 0).unwrap();
        let order = engine
            .place_order(CustomerId::new(), vec![LineItem::new(p, 1, 5)])
            .unwrap();
        engine.dispatch_order(order.id_typed()).unwrap();

        let sub = engine.bus().subscribe();
        let again = engine.dispatch_order(order.id_typed()).unwrap();
        assert!(!again.is_applied());
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn raising_threshold_triggers_restock() {
        let engine = engine(EngineConfig::default());
        let p = product_id();
        engine.register_product(p, 4, 0).unwrap();
        assert_eq!(engine.open_restock_request(p).unwrap(), None);

        engine.set_reorder_threshold(p, 5).unwrap();

        let request = engine.open_restock_request(p).unwrap().unwrap();
        // max(5 * 2 - 4, 1)
        assert_eq!(request.requested_quantity(), 6);
    }

    #[test]
    fn inline_restock_can_be_disabled() {
        let engine = engine(EngineConfig::default().with_inline_restock(false));
        let p = product_id();
        engine.register_product(p, 1, 5).unwrap();
        assert_eq!(engine.open_restock_request(p).unwrap(), None);

        let evaluation = engine.evaluate_restock(p).unwrap();
        assert!(evaluation.is_new_request());
    }

    #[test]
    fn fulfill_restock_closes_request_and_reevaluates() {
        let engine = engine(EngineConfig::default());
        let p = product_id();
        engine.register_product(p, 1, 5).unwrap();
        let request = engine.open_restock_request(p).unwrap().unwrap();

        let sub = engine.bus().subscribe();
        let fulfillment = engine.fulfill_restock(request.id_typed(), 20).unwrap();

        assert_eq!(fulfillment.request.status(), RestockStatus::Fulfilled);
        assert_eq!(engine.stock(p).unwrap().level().total, 21);
        assert_eq!(engine.open_restock_request(p).unwrap(), None);
        assert_eq!(
            types(&sub.drain()),
            vec!["purchasing.restock.fulfilled", "inventory.stock.changed"]
        );
    }
}
