//! All-or-nothing reservation of a multi-line order.

use chrono::Utc;
use tracing::{info, instrument};

use stockflow_core::{Aggregate, AggregateId, CustomerId, ExpectedVersion};
use stockflow_sales::{LineItem, Order, OrderCommand, OrderId, PlaceOrder, validate_lines};

use crate::error::EngineError;
use crate::ledger::{Committed, LedgerBatch};
use crate::retry::CommitPolicy;
use crate::store::EngineStore;

/// Reserves every line of a new order and creates the order in one commit.
///
/// Either all reservations and the `Reserved` order become visible together,
/// or nothing does. A caller that gives up mid-call therefore observes one of
/// those two states, never a partial reservation.
#[derive(Debug, Clone)]
pub struct ReservationCoordinator<S> {
    store: S,
    commit: CommitPolicy,
}

impl<S> ReservationCoordinator<S>
where
    S: EngineStore,
{
    pub fn new(store: S, commit: CommitPolicy) -> Self {
        Self { store, commit }
    }

    /// Place an order, reserving stock for every line.
    ///
    /// On shortfall, `EngineError::InsufficientStock` lists every line that
    /// could not be reserved together with what was available for it.
    #[instrument(skip(self, lines), fields(customer_id = %customer_id, lines = lines.len()), err)]
    pub fn place_order(
        &self,
        customer_id: CustomerId,
        lines: Vec<LineItem>,
    ) -> Result<Committed<Order>, EngineError> {
        validate_lines(&lines)?;
        let order_id = OrderId::new(AggregateId::new());

        let committed = self.commit.run("place_order", || {
            self.try_place(order_id, customer_id, &lines)
        })?;

        info!(
            order_id = %order_id,
            reservations = committed.audit.len(),
            "order reserved"
        );
        Ok(committed)
    }

    fn try_place(
        &self,
        order_id: OrderId,
        customer_id: CustomerId,
        lines: &[LineItem],
    ) -> Result<Committed<Order>, EngineError> {
        let now = Utc::now();
        let mut batch = LedgerBatch::new(&self.store, now);

        let mut shortfalls = Vec::new();
        for line in lines {
            match batch.reserve(line.product_id, line.quantity, Some(order_id)) {
                Ok(_) => {}
                Err(EngineError::InsufficientStock { shortfalls: mut s }) => {
                    shortfalls.append(&mut s)
                }
                Err(other) => return Err(other),
            }
        }
        if !shortfalls.is_empty() {
            // Nothing staged so far is committed.
            return Err(EngineError::InsufficientStock { shortfalls });
        }

        let mut order = Order::empty(order_id);
        let command = OrderCommand::PlaceOrder(PlaceOrder {
            order_id,
            customer_id,
            lines: lines.to_vec(),
            occurred_at: now,
        });
        let events = order
            .handle(&command)
            .map_err(|e| EngineError::from_order(order_id, e))?;
        for event in &events {
            order.apply(event);
        }

        let mut unit = batch.into_unit();
        unit.put_order(order.clone(), ExpectedVersion::Exact(0));
        let audit = self.store.commit(unit)?;

        Ok(Committed { value: order, audit })
    }
}
