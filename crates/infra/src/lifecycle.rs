//! Order lifecycle transitions and their ledger side effects.
//!
//! ```text
//! RESERVED --dispatch--> DISPATCHED --deliver--> DELIVERED --return--> RETURNED
//! RESERVED --cancel----> CANCELLED
//! ```
//!
//! Each transition commits the order write and its ledger deltas together.
//! The order write is checked against the version that was read, so two
//! callers racing on the same order cannot both apply the transition.

use chrono::Utc;
use tracing::{debug, info, instrument};

use stockflow_core::{Aggregate, AggregateRoot, ExpectedVersion};
use stockflow_events::Event;
use stockflow_sales::{
    CancelOrder, DeliverOrder, DispatchOrder, Order, OrderCommand, OrderEvent, OrderId,
    ReturnOrder,
};

use crate::error::EngineError;
use crate::ledger::{Committed, LedgerBatch};
use crate::retry::CommitPolicy;
use crate::store::EngineStore;

/// Outcome of a lifecycle call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The order moved to the requested state.
    Applied { order: Order, event: OrderEvent },
    /// The order was already in the requested state; nothing was written.
    Unchanged(Order),
}

impl Transition {
    pub fn order(&self) -> &Order {
        match self {
            Transition::Applied { order, .. } | Transition::Unchanged(order) => order,
        }
    }

    pub fn into_order(self) -> Order {
        match self {
            Transition::Applied { order, .. } | Transition::Unchanged(order) => order,
        }
    }

    /// The lifecycle event recorded by an applied transition.
    pub fn event(&self) -> Option<&OrderEvent> {
        match self {
            Transition::Applied { event, .. } => Some(event),
            Transition::Unchanged(_) => None,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Transition::Applied { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Dispatch,
    Cancel,
    Deliver,
    Return,
}

impl Action {
    fn name(self) -> &'static str {
        match self {
            Action::Dispatch => "dispatch_order",
            Action::Cancel => "cancel_order",
            Action::Deliver => "deliver_order",
            Action::Return => "return_order",
        }
    }

    fn command(self, order_id: OrderId, occurred_at: chrono::DateTime<Utc>) -> OrderCommand {
        match self {
            Action::Dispatch => OrderCommand::DispatchOrder(DispatchOrder {
                order_id,
                occurred_at,
            }),
            Action::Cancel => OrderCommand::CancelOrder(CancelOrder {
                order_id,
                occurred_at,
            }),
            Action::Deliver => OrderCommand::DeliverOrder(DeliverOrder {
                order_id,
                occurred_at,
            }),
            Action::Return => OrderCommand::ReturnOrder(ReturnOrder {
                order_id,
                occurred_at,
            }),
        }
    }
}

/// Drives orders through their lifecycle.
#[derive(Debug, Clone)]
pub struct OrderStateMachine<S> {
    store: S,
    commit: CommitPolicy,
}

impl<S> OrderStateMachine<S>
where
    S: EngineStore,
{
    pub fn new(store: S, commit: CommitPolicy) -> Self {
        Self { store, commit }
    }

    pub fn order(&self, order_id: OrderId) -> Result<Order, EngineError> {
        self.store
            .load_order(order_id)?
            .ok_or(EngineError::OrderNotFound(order_id))
    }

    /// RESERVED → DISPATCHED; removes the reserved units from stock.
    #[instrument(skip(self), fields(order_id = %order_id), err)]
    pub fn dispatch(&self, order_id: OrderId) -> Result<Committed<Transition>, EngineError> {
        self.transition(order_id, Action::Dispatch)
    }

    /// RESERVED → CANCELLED; releases the reservations.
    #[instrument(skip(self), fields(order_id = %order_id), err)]
    pub fn cancel(&self, order_id: OrderId) -> Result<Committed<Transition>, EngineError> {
        self.transition(order_id, Action::Cancel)
    }

    /// DISPATCHED → DELIVERED; no stock movement.
    #[instrument(skip(self), fields(order_id = %order_id), err)]
    pub fn deliver(&self, order_id: OrderId) -> Result<Committed<Transition>, EngineError> {
        self.transition(order_id, Action::Deliver)
    }

    /// DELIVERED → RETURNED; puts the units back on the shelf.
    #[instrument(skip(self), fields(order_id = %order_id), err)]
    pub fn return_order(&self, order_id: OrderId) -> Result<Committed<Transition>, EngineError> {
        self.transition(order_id, Action::Return)
    }

    fn transition(
        &self,
        order_id: OrderId,
        action: Action,
    ) -> Result<Committed<Transition>, EngineError> {
        self.commit
            .run(action.name(), || self.try_transition(order_id, action))
    }

    fn try_transition(
        &self,
        order_id: OrderId,
        action: Action,
    ) -> Result<Committed<Transition>, EngineError> {
        let mut order = self.order(order_id)?;
        let loaded_version = order.version();
        let now = Utc::now();

        let mut events = order
            .handle(&action.command(order_id, now))
            .map_err(|e| EngineError::from_order(order_id, e))?;
        let Some(event) = events.pop() else {
            debug!(order_id = %order_id, status = ?order.status(), "transition already applied");
            return Ok(Committed {
                value: Transition::Unchanged(order),
                audit: vec![],
            });
        };

        let mut batch = LedgerBatch::new(&self.store, now);
        for line in order.lines() {
            let reference = Some(order_id);
            match action {
                Action::Dispatch => {
                    batch.dispatch(line.product_id, line.quantity, reference)?;
                }
                Action::Cancel => {
                    batch.release(line.product_id, line.quantity, reference)?;
                }
                Action::Return => {
                    batch.return_stock(line.product_id, line.quantity, reference)?;
                }
                Action::Deliver => {}
            }
        }

        order.apply(&event);

        let mut unit = batch.into_unit();
        unit.put_order(order.clone(), ExpectedVersion::Exact(loaded_version));
        let audit = self.store.commit(unit)?;

        info!(
            order_id = %order_id,
            event = event.event_type(),
            movements = audit.len(),
            "order transition committed"
        );

        Ok(Committed {
            value: Transition::Applied { order, event },
            audit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use stockflow_core::{AggregateId, CustomerId};
    use stockflow_inventory::{ProductId, StockLevel, TransactionKind};
    use stockflow_sales::{LineItem, OrderStatus};

    use crate::coordinator::ReservationCoordinator;
    use crate::ledger::InventoryLedger;
    use crate::store::InMemoryEngineStore;

    struct Fixture {
        ledger: InventoryLedger<Arc<InMemoryEngineStore>>,
        coordinator: ReservationCoordinator<Arc<InMemoryEngineStore>>,
        orders: OrderStateMachine<Arc<InMemoryEngineStore>>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryEngineStore::new());
        let policy = CommitPolicy {
            max_attempts: 64,
            backoff: Duration::ZERO,
        };
        Fixture {
            ledger: InventoryLedger::new(store.clone(), policy),
            coordinator: ReservationCoordinator::new(store.clone(), policy),
            orders: OrderStateMachine::new(store, policy),
        }
    }

    fn placed(f: &Fixture, total: i64, qty: i64) -> (ProductId, OrderId) {
        let product_id = ProductId::new(AggregateId::new());
        f.ledger.register_product(product_id, total, 0).unwrap();
        let order = f
            .coordinator
            .place_order(CustomerId::new(), vec![LineItem::new(product_id, qty, 10)])
            .unwrap()
            .value;
        (product_id, order.id_typed())
    }

    fn level(f: &Fixture, product_id: ProductId) -> StockLevel {
        f.ledger.stock(product_id).unwrap().level()
    }

    #[test]
    fn dispatch_commits_reservation_once() {
        let f = fixture();
        let (p, order_id) = placed(&f, 10, 8);

        let first = f.orders.dispatch(order_id).unwrap();
        assert!(first.value.is_applied());
        assert_eq!(first.audit.len(), 1);
        assert_eq!(first.audit[0].transaction.kind, TransactionKind::Dispatch);
        assert_eq!(level(&f, p), StockLevel { total: 2, reserved: 0 });

        let second = f.orders.dispatch(order_id).unwrap();
        assert!(!second.value.is_applied());
        assert!(second.audit.is_empty());
        assert_eq!(level(&f, p), StockLevel { total: 2, reserved: 0 });
    }

    #[test]
    fn cancel_releases_reservation() {
        let f = fixture();
        let (p, order_id) = placed(&f, 10, 4);

        let t = f.orders.cancel(order_id).unwrap();
        assert_eq!(t.value.order().status(), OrderStatus::Cancelled);
        assert!(t.value.order().cancelled_at().is_some());
        assert_eq!(level(&f, p), StockLevel { total: 10, reserved: 0 });
    }

    #[test]
    fn cancel_after_dispatch_is_invalid_and_touches_nothing() {
        let f = fixture();
        let (p, order_id) = placed(&f, 10, 4);
        f.orders.dispatch(order_id).unwrap();

        let err = f.orders.cancel(order_id).unwrap_err();
        assert_eq!(
            err,
            EngineError::InvalidTransition {
                from: "Dispatched".to_string(),
                action: "cancel"
            }
        );
        assert_eq!(level(&f, p), StockLevel { total: 6, reserved: 0 });
    }

    #[test]
    fn deliver_then_return_restocks() {
        let f = fixture();
        let (p, order_id) = placed(&f, 10, 3);
        f.orders.dispatch(order_id).unwrap();

        let delivered = f.orders.deliver(order_id).unwrap();
        assert!(delivered.audit.is_empty());
        assert_eq!(delivered.value.order().status(), OrderStatus::Delivered);

        let returned = f.orders.return_order(order_id).unwrap();
        assert_eq!(returned.audit[0].transaction.kind, TransactionKind::Return);
        assert_eq!(returned.value.order().status(), OrderStatus::Returned);
        assert_eq!(level(&f, p), StockLevel { total: 10, reserved: 0 });
        assert!(matches!(
            returned.value.event(),
            Some(OrderEvent::OrderReturned(_))
        ));
    }

    #[test]
    fn deliver_before_dispatch_is_invalid() {
        let f = fixture();
        let (_, order_id) = placed(&f, 10, 3);
        assert!(matches!(
            f.orders.deliver(order_id).unwrap_err(),
            EngineError::InvalidTransition { .. }
        ));
    }

    #[test]
    fn unknown_order_is_not_found() {
        let f = fixture();
        let order_id = OrderId::new(AggregateId::new());
        assert_eq!(
            f.orders.dispatch(order_id).unwrap_err(),
            EngineError::OrderNotFound(order_id)
        );
    }

    #[test]
    fn racing_dispatches_apply_exactly_once() {
        let f = Arc::new(fixture());
        let (p, order_id) = placed(&f, 10, 5);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let f = f.clone();
                std::thread::spawn(move || f.orders.dispatch(order_id).unwrap().value.is_applied())
            })
            .collect();
        let applied = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|applied| *applied)
            .count();

        assert_eq!(applied, 1);
        assert_eq!(level(&f, p), StockLevel { total: 5, reserved: 0 });
    }
}
