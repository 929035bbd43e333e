use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockflow_core::AggregateId;

use crate::stock::{ProductId, StockLevel};

/// Unique audit-entry identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(pub Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a ledger call did to the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    Reserve,
    Release,
    Dispatch,
    Return,
    Restock,
    Adjustment,
}

impl TransactionKind {
    /// Split a signed `delta` into `(total_delta, reserved_delta)`.
    ///
    /// Summing these over a product's trail reproduces its counters.
    pub fn effect(self, delta: i64) -> (i64, i64) {
        match self {
            TransactionKind::Reserve | TransactionKind::Release => (0, delta),
            TransactionKind::Dispatch => (delta, delta),
            TransactionKind::Return | TransactionKind::Restock | TransactionKind::Adjustment => {
                (delta, 0)
            }
        }
    }

    /// Signed delta recorded for a movement of `quantity` units.
    ///
    /// `Adjustment` quantities are already signed.
    pub fn signed_delta(self, quantity: i64) -> i64 {
        match self {
            TransactionKind::Release | TransactionKind::Dispatch => -quantity,
            _ => quantity,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Reserve => "RESERVE",
            TransactionKind::Release => "RELEASE",
            TransactionKind::Dispatch => "DISPATCH",
            TransactionKind::Return => "RETURN",
            TransactionKind::Restock => "RESTOCK",
            TransactionKind::Adjustment => "ADJUSTMENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "RESERVE" => TransactionKind::Reserve,
            "RELEASE" => TransactionKind::Release,
            "DISPATCH" => TransactionKind::Dispatch,
            "RETURN" => TransactionKind::Return,
            "RESTOCK" => TransactionKind::Restock,
            "ADJUSTMENT" => TransactionKind::Adjustment,
            _ => return None,
        })
    }
}

/// Audit entry: one per successful ledger call, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryTransaction {
    pub transaction_id: TransactionId,
    pub product_id: ProductId,
    pub kind: TransactionKind,
    pub delta: i64,
    pub total_before: i64,
    pub total_after: i64,
    pub reserved_before: i64,
    pub reserved_after: i64,
    pub reference_order_id: Option<AggregateId>,
    pub occurred_at: DateTime<Utc>,
}

impl InventoryTransaction {
    pub fn before(&self) -> StockLevel {
        StockLevel {
            total: self.total_before,
            reserved: self.reserved_before,
        }
    }

    pub fn after(&self) -> StockLevel {
        StockLevel {
            total: self.total_after,
            reserved: self.reserved_after,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_moves_both_counters() {
        let delta = TransactionKind::Dispatch.signed_delta(4);
        assert_eq!(delta, -4);
        assert_eq!(TransactionKind::Dispatch.effect(delta), (-4, -4));
    }

    #[test]
    fn reservation_kinds_touch_reserved_only() {
        assert_eq!(TransactionKind::Reserve.effect(3), (0, 3));
        assert_eq!(TransactionKind::Release.effect(-3), (0, -3));
    }

    #[test]
    fn kind_names_parse_back() {
        for kind in [
            TransactionKind::Reserve,
            TransactionKind::Release,
            TransactionKind::Dispatch,
            TransactionKind::Return,
            TransactionKind::Restock,
            TransactionKind::Adjustment,
        ] {
            assert_eq!(TransactionKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(TransactionKind::parse("reserve"), None);
    }
}
