//! Integration tests for the full engine pipeline.
//!
//! Tests: Operation → LedgerBatch → EngineStore::commit → EventBus → RestockTrigger
//!
//! Verifies:
//! - Concurrent reservations never oversell
//! - Multi-line orders reserve all lines or none
//! - Lifecycle calls are idempotent
//! - Restock requests are deduplicated
//! - The audit trail replays to the live counters

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::{Duration, Instant};

    use stockflow_core::{AggregateId, CustomerId};
    use stockflow_events::{Event, EventBus, InMemoryEventBus};
    use stockflow_inventory::{ProductId, StockLevel, TransactionKind};
    use stockflow_sales::{LineItem, OrderStatus};

    use crate::config::EngineConfig;
    use crate::engine::InventoryEngine;
    use crate::error::{EngineError, LineShortfall};
    use crate::notifications::EngineEvent;
    use crate::store::InMemoryEngineStore;

    type Bus = Arc<InMemoryEventBus<EngineEvent>>;
    type Engine = InventoryEngine<Arc<InMemoryEngineStore>, Bus>;

    fn test_product_id() -> ProductId {
        ProductId::new(AggregateId::new())
    }

    fn setup(config: EngineConfig) -> Arc<Engine> {
        let config = config
            .with_max_commit_attempts(10_000)
            .with_retry_backoff(Duration::ZERO);
        Arc::new(InventoryEngine::new(
            Arc::new(InMemoryEngineStore::new()),
            Arc::new(InMemoryEventBus::new()),
            config,
        ))
    }

    fn level(engine: &Engine, product_id: ProductId) -> StockLevel {
        engine.stock(product_id).unwrap().level()
    }

    #[test]
    fn concurrent_orders_never_oversell() {
        let engine = setup(EngineConfig::default().with_inline_restock(false));
        let p = test_product_id();
        engine.register_product(p, 50, 0).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let engine = engine.clone();
                thread::spawn(move || {
                    (0..10)
                        .filter(|_| {
                            engine
                                .place_order(CustomerId::new(), vec![LineItem::new(p, 1, 100)])
                                .is_ok()
                        })
                        .count()
                })
            })
            .collect();
        let placed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(placed, 50);
        assert_eq!(level(&engine, p), StockLevel { total: 50, reserved: 50 });
        assert!(engine.reconcile(p).unwrap().is_consistent());
    }

    #[test]
    fn racing_orders_for_last_units_succeed_exactly_once() {
        let engine = setup(EngineConfig::default().with_inline_restock(false));
        let p = test_product_id();
        engine.register_product(p, 8, 0).unwrap();

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let engine = engine.clone();
                thread::spawn(move || {
                    engine.place_order(CustomerId::new(), vec![LineItem::new(p, 8, 1)])
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let failure = results.into_iter().find_map(Result::err).unwrap();
        assert_eq!(
            failure,
            EngineError::InsufficientStock {
                shortfalls: vec![LineShortfall {
                    product_id: p,
                    requested: 8,
                    available: 0
                }]
            }
        );
        assert_eq!(level(&engine, p), StockLevel { total: 8, reserved: 8 });
    }

    #[test]
    fn multi_line_order_is_all_or_nothing() {
        let engine = setup(EngineConfig::default());
        let a = test_product_id();
        let b = test_product_id();
        let c = test_product_id();
        engine.register_product(a, 10, 0).unwrap();
        engine.register_product(b, 10, 0).unwrap();
        engine.register_product(c, 2, 0).unwrap();

        let err = engine
            .place_order(
                CustomerId::new(),
                vec![
                    LineItem::new(a, 5, 1),
                    LineItem::new(b, 5, 1),
                    LineItem::new(c, 3, 1),
                ],
            )
            .unwrap_err();

        assert!(matches!(err, EngineError::InsufficientStock { .. }));
        for p in [a, b, c] {
            assert_eq!(level(&engine, p).reserved, 0);
            // Only the registration entry.
            assert_eq!(engine.history(p).unwrap().len(), 1);
        }
    }

    #[test]
    fn repeated_dispatch_changes_counters_once() {
        let engine = setup(EngineConfig::default());
        let p = test_product_id();
        engine.register_product(p, 10, 0).unwrap();
        let order = engine
            .place_order(CustomerId::new(), vec![LineItem::new(p, 4, 1)])
            .unwrap();

        let first = engine.dispatch_order(order.id_typed()).unwrap();
        let second = engine.dispatch_order(order.id_typed()).unwrap();

        assert!(first.is_applied());
        assert!(!second.is_applied());
        assert_eq!(second.order().status(), OrderStatus::Dispatched);
        assert_eq!(level(&engine, p), StockLevel { total: 6, reserved: 0 });

        let dispatches = engine
            .history(p)
            .unwrap()
            .into_iter()
            .filter(|tx| tx.kind == TransactionKind::Dispatch)
            .count();
        assert_eq!(dispatches, 1);
    }

    #[test]
    fn concurrent_low_stock_opens_one_request() {
        let engine = setup(EngineConfig::default());
        let p = test_product_id();
        engine.register_product(p, 100, 60).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = engine.clone();
                thread::spawn(move || {
                    for _ in 0..5 {
                        engine
                            .place_order(CustomerId::new(), vec![LineItem::new(p, 1, 1)])
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        // available = 60, right at the threshold; one more pushes it below.
        assert_eq!(engine.open_restock_request(p).unwrap(), None);
        engine
            .place_order(CustomerId::new(), vec![LineItem::new(p, 20, 1)])
            .unwrap();

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let engine = engine.clone();
                thread::spawn(move || engine.evaluate_restock(p).unwrap().is_new_request())
            })
            .collect();
        let opened = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|opened| *opened)
            .count();

        // The inline evaluation after the last order opened it.
        assert_eq!(opened, 0);
        let request = engine.open_restock_request(p).unwrap().unwrap();
        // max(60 * 2 - 100, 1)
        assert_eq!(request.requested_quantity(), 20);
    }

    #[test]
    fn low_stock_walkthrough() {
        let engine = setup(EngineConfig::default());
        let sub = engine.bus().subscribe();
        let p = test_product_id();
        engine.register_product(p, 10, 3).unwrap();

        let order = engine
            .place_order(CustomerId::new(), vec![LineItem::new(p, 8, 250)])
            .unwrap();
        assert_eq!(order.status(), OrderStatus::Reserved);
        assert_eq!(level(&engine, p), StockLevel { total: 10, reserved: 8 });

        let request = engine.open_restock_request(p).unwrap().unwrap();
        assert_eq!(request.requested_quantity(), 1);

        engine.dispatch_order(order.id_typed()).unwrap();
        assert_eq!(level(&engine, p), StockLevel { total: 2, reserved: 0 });

        let err = engine.cancel_order(order.id_typed()).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));

        let err = engine
            .place_order(CustomerId::new(), vec![LineItem::new(p, 5, 250)])
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientStock {
                shortfalls: vec![LineShortfall {
                    product_id: p,
                    requested: 5,
                    available: 2
                }]
            }
        );
        assert_eq!(level(&engine, p), StockLevel { total: 2, reserved: 0 });

        // Still a single open request after every re-evaluation.
        assert_eq!(
            engine.open_restock_request(p).unwrap().map(|r| r.id_typed()),
            Some(request.id_typed())
        );

        let events: Vec<&'static str> = sub.drain().iter().map(|e| e.event_type()).collect();
        assert_eq!(
            events
                .iter()
                .filter(|t| **t == "purchasing.restock.requested")
                .count(),
            1
        );
        assert!(events.contains(&"sales.order.reserved"));
        assert!(events.contains(&"sales.order.dispatched"));
        assert!(!events.contains(&"sales.order.cancelled"));

        let reconciliation = engine.reconcile(p).unwrap();
        assert!(reconciliation.is_consistent(), "{reconciliation:?}");
    }

    #[test]
    fn restock_worker_reacts_to_stock_changes() {
        let engine = setup(EngineConfig::default().with_inline_restock(false));
        let worker = engine.spawn_restock_worker();
        let p = test_product_id();
        engine.register_product(p, 10, 5).unwrap();

        engine
            .place_order(CustomerId::new(), vec![LineItem::new(p, 7, 1)])
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut request = None;
        while request.is_none() && Instant::now() < deadline {
            request = engine.open_restock_request(p).unwrap();
            thread::sleep(Duration::from_millis(10));
        }
        worker.shutdown();

        let request = request.expect("restock worker did not open a request");
        // max(5 * 2 - 10, 1)
        assert_eq!(request.requested_quantity(), 1);
        assert_eq!(request.current_stock_at_creation(), 3);
    }

    #[test]
    fn returned_goods_are_back_in_stock() {
        let engine = setup(EngineConfig::default());
        let a = test_product_id();
        let b = test_product_id();
        engine.register_product(a, 5, 0).unwrap();
        engine.register_product(b, 5, 0).unwrap();

        let order = engine
            .place_order(
                CustomerId::new(),
                vec![LineItem::new(a, 2, 1), LineItem::new(b, 3, 1)],
            )
            .unwrap();
        let id = order.id_typed();
        engine.dispatch_order(id).unwrap();
        engine.deliver_order(id).unwrap();
        let returned = engine.return_order(id).unwrap();

        assert_eq!(returned.order().status(), OrderStatus::Returned);
        assert!(returned.order().returned_at().is_some());
        assert_eq!(level(&engine, a), StockLevel { total: 5, reserved: 0 });
        assert_eq!(level(&engine, b), StockLevel { total: 5, reserved: 0 });
        assert!(matches!(
            engine.cancel_order(id).unwrap_err(),
            EngineError::InvalidTransition { .. }
        ));
    }

    #[test]
    fn trail_reconciles_after_mixed_concurrent_traffic() {
        let engine = setup(EngineConfig::default());
        let products: Vec<ProductId> = (0..3).map(|_| test_product_id()).collect();
        for p in &products {
            engine.register_product(*p, 40, 5).unwrap();
        }

        let handles: Vec<_> = (0..6)
            .map(|worker| {
                let engine = engine.clone();
                let products = products.clone();
                thread::spawn(move || {
                    for i in 0..10 {
                        let p = products[(worker + i) % products.len()];
                        let q = products[(worker + i + 1) % products.len()];
                        let Ok(order) = engine.place_order(
                            CustomerId::new(),
                            vec![LineItem::new(p, 1, 1), LineItem::new(q, 2, 1)],
                        ) else {
                            continue;
                        };
                        let _ = match i % 3 {
                            0 => engine.cancel_order(order.id_typed()),
                            _ => engine.dispatch_order(order.id_typed()),
                        };
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let all = engine.reconcile_all().unwrap();
        assert_eq!(all.len(), 3);
        for r in all {
            assert!(r.is_consistent(), "{r:?}");
            assert!(r.recorded.is_consistent());
        }
    }

    #[test]
    fn deactivated_product_blocks_new_orders_only() {
        let engine = setup(EngineConfig::default());
        let p = test_product_id();
        engine.register_product(p, 10, 0).unwrap();
        let order = engine
            .place_order(CustomerId::new(), vec![LineItem::new(p, 3, 1)])
            .unwrap();

        engine.deactivate_product(p).unwrap();
        assert_eq!(
            engine
                .place_order(CustomerId::new(), vec![LineItem::new(p, 1, 1)])
                .unwrap_err(),
            EngineError::ProductInactive(p)
        );

        engine.dispatch_order(order.id_typed()).unwrap();
        assert_eq!(level(&engine, p), StockLevel { total: 7, reserved: 0 });

        engine.reactivate_product(p).unwrap();
        engine
            .place_order(CustomerId::new(), vec![LineItem::new(p, 1, 1)])
            .unwrap();
    }
}
