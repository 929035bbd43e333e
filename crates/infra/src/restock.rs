//! Low-stock detection and restock request handling.
//!
//! `evaluate` runs after the commit that changed a product's counters, never
//! inside it. It may therefore run more than once for the same change; the
//! single-open-request rule in the store turns duplicates into no-ops.

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

use stockflow_core::{Aggregate, AggregateId, AggregateRoot, ExpectedVersion};
use stockflow_events::EventBus;
use stockflow_inventory::ProductId;
use stockflow_purchasing::{
    FulfillRestockRequest, MarkRestockSent, OpenRestockRequest, RestockCommand, RestockEvent,
    RestockPolicy, RestockRequest, RestockRequestFulfilled, RestockRequestId,
};

use crate::error::EngineError;
use crate::ledger::{Committed, LedgerBatch};
use crate::notifications::{EngineEvent, publish_all};
use crate::retry::CommitPolicy;
use crate::store::{EngineStore, UnitOfWork};
use crate::worker::{EventWorker, WorkerHandle};

/// Stock figures that put a product below its reorder threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LowStock {
    pub product_id: ProductId,
    pub available: i64,
    pub total: i64,
    pub reorder_threshold: i64,
    pub detected_at: DateTime<Utc>,
}

/// Result of one restock evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Evaluation {
    /// Deactivated products are not reordered.
    Inactive,
    Sufficient {
        available: i64,
        reorder_threshold: i64,
    },
    /// Below threshold, but a pending or sent request already covers it.
    AlreadyRequested {
        low: LowStock,
        request: RestockRequest,
    },
    /// Below threshold; this evaluation opened a new request.
    Requested {
        low: LowStock,
        request: RestockRequest,
    },
}

impl Evaluation {
    pub fn request(&self) -> Option<&RestockRequest> {
        match self {
            Evaluation::AlreadyRequested { request, .. } | Evaluation::Requested { request, .. } => {
                Some(request)
            }
            _ => None,
        }
    }

    pub fn is_new_request(&self) -> bool {
        matches!(self, Evaluation::Requested { .. })
    }

    /// Notifications for this outcome: `LowStockDetected` whenever the product
    /// is below threshold, plus `RestockRequested` when a request was opened.
    pub fn events(&self) -> Vec<EngineEvent> {
        let (low, opened) = match self {
            Evaluation::AlreadyRequested { low, .. } => (low, None),
            Evaluation::Requested { low, request } => (low, Some(request)),
            Evaluation::Inactive | Evaluation::Sufficient { .. } => return vec![],
        };

        let mut events = vec![EngineEvent::LowStockDetected {
            product_id: low.product_id,
            available: low.available,
            reorder_threshold: low.reorder_threshold,
            occurred_at: low.detected_at,
        }];
        events.extend(opened.and_then(EngineEvent::restock_requested));
        events
    }
}

/// Outcome of fulfilling a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fulfillment {
    pub request: RestockRequest,
    /// `None` when the request had already been fulfilled.
    pub event: Option<RestockRequestFulfilled>,
}

#[derive(Debug, Clone)]
pub struct RestockTrigger<S> {
    store: S,
    policy: RestockPolicy,
    commit: CommitPolicy,
}

impl<S> RestockTrigger<S>
where
    S: EngineStore,
{
    pub fn new(store: S, policy: RestockPolicy, commit: CommitPolicy) -> Self {
        Self {
            store,
            policy,
            commit,
        }
    }

    pub fn policy(&self) -> RestockPolicy {
        self.policy
    }

    pub fn request(&self, request_id: RestockRequestId) -> Result<RestockRequest, EngineError> {
        self.store
            .load_restock_request(request_id)?
            .ok_or(EngineError::RestockRequestNotFound(request_id))
    }

    /// Open a restock request if `product_id` is below threshold and none is open.
    #[instrument(skip(self), fields(product_id = %product_id), err)]
    pub fn evaluate(&self, product_id: ProductId) -> Result<Evaluation, EngineError> {
        self.commit
            .run("evaluate_restock", || self.try_evaluate(product_id))
    }

    fn try_evaluate(&self, product_id: ProductId) -> Result<Evaluation, EngineError> {
        let record = self
            .store
            .load_stock(product_id)?
            .ok_or(EngineError::ProductNotFound(product_id))?;

        if !record.is_active() {
            debug!(product_id = %product_id, "inactive product; restock skipped");
            return Ok(Evaluation::Inactive);
        }

        let available = record.available();
        let reorder_threshold = record.reorder_threshold();
        if !record.is_below_threshold() {
            debug!(product_id = %product_id, available, reorder_threshold, "stock sufficient");
            return Ok(Evaluation::Sufficient {
                available,
                reorder_threshold,
            });
        }

        let now = Utc::now();
        let low = LowStock {
            product_id,
            available,
            total: record.level().total,
            reorder_threshold,
            detected_at: now,
        };

        if let Some(request) = self.store.open_restock_request(product_id)? {
            debug!(
                product_id = %product_id,
                request_id = %request.id_typed(),
                "restock already requested"
            );
            return Ok(Evaluation::AlreadyRequested { low, request });
        }

        let request_id = RestockRequestId::new(AggregateId::new());
        let mut request = RestockRequest::empty(request_id);
        let command = RestockCommand::Open(OpenRestockRequest {
            request_id,
            product_id,
            current_stock: available,
            requested_quantity: self.policy.requested_quantity(reorder_threshold, low.total),
            occurred_at: now,
        });
        for event in request
            .handle(&command)
            .map_err(|e| EngineError::from_restock(request_id, e))?
        {
            request.apply(&event);
        }

        // A concurrent evaluation that opened one first turns this into a
        // conflict; the retry then sees its request.
        let mut unit = UnitOfWork::new();
        unit.put_restock_request(request.clone(), ExpectedVersion::Exact(0));
        self.store.commit(unit)?;

        info!(
            product_id = %product_id,
            request_id = %request_id,
            requested_quantity = request.requested_quantity(),
            available,
            "restock requested"
        );
        Ok(Evaluation::Requested { low, request })
    }

    /// PENDING → SENT once the supplier has been notified.
    #[instrument(skip(self), fields(request_id = %request_id), err)]
    pub fn mark_sent(&self, request_id: RestockRequestId) -> Result<RestockRequest, EngineError> {
        self.commit.run("mark_restock_sent", || {
            let mut request = self.request(request_id)?;
            let loaded_version = request.version();

            let events = request
                .handle(&RestockCommand::MarkSent(MarkRestockSent {
                    request_id,
                    occurred_at: Utc::now(),
                }))
                .map_err(|e| EngineError::from_restock(request_id, e))?;
            if events.is_empty() {
                return Ok(request);
            }
            for event in &events {
                request.apply(event);
            }

            let mut unit = UnitOfWork::new();
            unit.put_restock_request(request.clone(), ExpectedVersion::Exact(loaded_version));
            self.store.commit(unit)?;
            Ok(request)
        })
    }

    /// Record received goods: the request becomes FULFILLED and the stock is
    /// restocked in the same commit.
    #[instrument(skip(self), fields(request_id = %request_id), err)]
    pub fn fulfill(
        &self,
        request_id: RestockRequestId,
        received_quantity: i64,
    ) -> Result<Committed<Fulfillment>, EngineError> {
        self.commit.run("fulfill_restock", || {
            self.try_fulfill(request_id, received_quantity)
        })
    }

    fn try_fulfill(
        &self,
        request_id: RestockRequestId,
        received_quantity: i64,
    ) -> Result<Committed<Fulfillment>, EngineError> {
        let mut request = self.request(request_id)?;
        let loaded_version = request.version();
        let now = Utc::now();

        let events = request
            .handle(&RestockCommand::Fulfill(FulfillRestockRequest {
                request_id,
                received_quantity,
                occurred_at: now,
            }))
            .map_err(|e| EngineError::from_restock(request_id, e))?;

        let fulfilled = events.iter().find_map(|e| match e {
            RestockEvent::Fulfilled(f) => Some(f.clone()),
            _ => None,
        });
        let Some(fulfilled) = fulfilled else {
            debug!(request_id = %request_id, "restock request already fulfilled");
            return Ok(Committed {
                value: Fulfillment {
                    request,
                    event: None,
                },
                audit: vec![],
            });
        };

        let mut batch = LedgerBatch::new(&self.store, now);
        batch.restock(fulfilled.product_id, fulfilled.received_quantity)?;
        for event in &events {
            request.apply(event);
        }

        let mut unit = batch.into_unit();
        unit.put_restock_request(request.clone(), ExpectedVersion::Exact(loaded_version));
        let audit = self.store.commit(unit)?;

        info!(
            request_id = %request_id,
            product_id = %fulfilled.product_id,
            received_quantity,
            "restock fulfilled"
        );
        Ok(Committed {
            value: Fulfillment {
                request,
                event: Some(fulfilled),
            },
            audit,
        })
    }
}

/// Background restock evaluation driven by `StockChanged` events.
///
/// Used when evaluation is not run inline after each commit. Duplicate or
/// stale `StockChanged` deliveries are harmless: each one re-reads the
/// current counters.
#[derive(Debug)]
pub struct RestockWorker;

impl RestockWorker {
    pub fn spawn<S, B>(bus: B, trigger: RestockTrigger<S>) -> WorkerHandle
    where
        S: EngineStore + 'static,
        B: EventBus<EngineEvent> + Clone + 'static,
    {
        let publisher = bus.clone();
        EventWorker::spawn("restock-worker", &bus, move |event: EngineEvent| {
            let EngineEvent::StockChanged { product_id, .. } = event else {
                return Ok::<(), EngineError>(());
            };
            let evaluation = trigger.evaluate(product_id)?;
            publish_all(&publisher, evaluation.events());
            Ok(())
        })
    }
}
