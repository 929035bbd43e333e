//! Rebuild stock counters from the audit trail (reconciliation).

use thiserror::Error;

use crate::stock::{ProductId, StockLevel};
use crate::transaction::{InventoryTransaction, TransactionId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReplayError {
    #[error("transaction {transaction_id} belongs to product {found}, not {expected}")]
    ProductMismatch {
        transaction_id: TransactionId,
        expected: ProductId,
        found: ProductId,
    },

    #[error("transaction {transaction_id} starts at {recorded} but the trail is at {replayed}")]
    BrokenChain {
        transaction_id: TransactionId,
        replayed: StockLevel,
        recorded: StockLevel,
    },

    #[error("transaction {transaction_id} records {recorded} but its delta yields {computed}")]
    DeltaMismatch {
        transaction_id: TransactionId,
        computed: StockLevel,
        recorded: StockLevel,
    },

    #[error("transaction {transaction_id} leaves inconsistent counters {level}")]
    Inconsistent {
        transaction_id: TransactionId,
        level: StockLevel,
    },
}

/// Replay a product's audit entries (in commit order) from zero.
///
/// Each entry must start where the previous one ended and its `delta` must
/// account for the recorded before/after counters exactly.
pub fn replay<'a>(
    product_id: ProductId,
    entries: impl IntoIterator<Item = &'a InventoryTransaction>,
) -> Result<StockLevel, ReplayError> {
    let mut level = StockLevel::default();

    for tx in entries {
        if tx.product_id != product_id {
            return Err(ReplayError::ProductMismatch {
                transaction_id: tx.transaction_id,
                expected: product_id,
                found: tx.product_id,
            });
        }
        if tx.before() != level {
            return Err(ReplayError::BrokenChain {
                transaction_id: tx.transaction_id,
                replayed: level,
                recorded: tx.before(),
            });
        }

        let (total_delta, reserved_delta) = tx.kind.effect(tx.delta);
        let computed = StockLevel {
            total: level.total + total_delta,
            reserved: level.reserved + reserved_delta,
        };
        if computed != tx.after() {
            return Err(ReplayError::DeltaMismatch {
                transaction_id: tx.transaction_id,
                computed,
                recorded: tx.after(),
            });
        }
        if !computed.is_consistent() {
            return Err(ReplayError::Inconsistent {
                transaction_id: tx.transaction_id,
                level: computed,
            });
        }

        level = computed;
    }

    Ok(level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use proptest::prelude::*;
    use stockflow_core::AggregateId;
    use stockflow_events::execute;

    use crate::stock::{MoveStock, RegisterProduct, StockCommand, StockRecord};
    use crate::transaction::TransactionKind;

    fn register(product_id: ProductId, initial: i64) -> (StockRecord, Vec<InventoryTransaction>) {
        let mut record = StockRecord::empty(product_id);
        let events = execute(
            &mut record,
            &StockCommand::RegisterProduct(RegisterProduct {
                product_id,
                initial_quantity: initial,
                reorder_threshold: 0,
                transaction_id: TransactionId::new(),
                occurred_at: Utc::now(),
            }),
        )
        .unwrap();
        let trail = events
            .iter()
            .filter_map(|e| e.as_transaction().cloned())
            .collect();
        (record, trail)
    }

    fn entry(product_id: ProductId, kind: TransactionKind, delta: i64, before: StockLevel) -> InventoryTransaction {
        let (dt, dr) = kind.effect(delta);
        InventoryTransaction {
            transaction_id: TransactionId::new(),
            product_id,
            kind,
            delta,
            total_before: before.total,
            total_after: before.total + dt,
            reserved_before: before.reserved,
            reserved_after: before.reserved + dr,
            reference_order_id: None,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn empty_trail_replays_to_zero() {
        let product_id = ProductId::new(AggregateId::new());
        assert_eq!(replay(product_id, &[]), Ok(StockLevel::default()));
    }

    #[test]
    fn gap_in_chain_is_reported() {
        let product_id = ProductId::new(AggregateId::new());
        let first = entry(product_id, TransactionKind::Restock, 10, StockLevel::default());
        let skipped = entry(
            product_id,
            TransactionKind::Reserve,
            3,
            StockLevel { total: 10, reserved: 2 },
        );

        let err = replay(product_id, &[first, skipped]).unwrap_err();
        assert!(matches!(err, ReplayError::BrokenChain { .. }));
    }

    #[test]
    fn tampered_delta_is_reported() {
        let product_id = ProductId::new(AggregateId::new());
        let mut tx = entry(product_id, TransactionKind::Restock, 10, StockLevel::default());
        tx.delta = 9;

        let err = replay(product_id, &[tx]).unwrap_err();
        assert!(matches!(err, ReplayError::DeltaMismatch { .. }));
    }

    #[test]
    fn foreign_entries_are_rejected() {
        let product_id = ProductId::new(AggregateId::new());
        let other = ProductId::new(AggregateId::new());
        let tx = entry(other, TransactionKind::Restock, 1, StockLevel::default());

        let err = replay(product_id, &[tx]).unwrap_err();
        assert!(matches!(err, ReplayError::ProductMismatch { .. }));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: the audit entries emitted by accepted moves replay to the
        /// record's live counters.
        #[test]
        fn trail_reproduces_counters(
            initial in 0i64..30,
            moves in prop::collection::vec((0usize..6, 1i64..15), 0..80)
        ) {
            let kinds = [
                TransactionKind::Reserve,
                TransactionKind::Release,
                TransactionKind::Dispatch,
                TransactionKind::Return,
                TransactionKind::Restock,
                TransactionKind::Adjustment,
            ];
            let product_id = ProductId::new(AggregateId::new());
            let (mut record, mut trail) = register(product_id, initial);

            for (k, qty) in moves {
                let kind = kinds[k];
                let quantity = if kind == TransactionKind::Adjustment { -qty / 2 - 1 } else { qty };
                let cmd = StockCommand::MoveStock(MoveStock {
                    product_id,
                    transaction_id: TransactionId::new(),
                    kind,
                    quantity,
                    reference_order_id: None,
                    occurred_at: Utc::now(),
                });
                if let Ok(events) = execute(&mut record, &cmd) {
                    trail.extend(events.iter().filter_map(|e| e.as_transaction().cloned()));
                }
            }

            prop_assert_eq!(replay(product_id, &trail), Ok(record.level()));
        }
    }
}
