//! Engine-level error taxonomy.
//!
//! Domain aggregates report failures without knowing which product, order or
//! request they were asked about; the `from_*` constructors attach that
//! context. Anything without a specific mapping passes through as `Domain`.

use thiserror::Error;

use stockflow_core::DomainError;
use stockflow_inventory::ProductId;
use stockflow_purchasing::RestockRequestId;
use stockflow_sales::OrderId;

use crate::store::StoreError;

/// One order line that could not be reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineShortfall {
    pub product_id: ProductId,
    pub requested: i64,
    pub available: i64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Not enough unreserved stock; carries every failing line.
    #[error("insufficient stock on {} line(s)", shortfalls.len())]
    InsufficientStock { shortfalls: Vec<LineShortfall> },

    #[error("invalid transition: cannot {action} from {from}")]
    InvalidTransition { from: String, action: &'static str },

    /// A release or dispatch asked for more than is reserved.
    #[error("over-release on product {product_id} (requested: {requested}, reserved: {reserved})")]
    OverRelease {
        product_id: ProductId,
        requested: i64,
        reserved: i64,
    },

    /// Every commit attempt lost a version race. Safe to retry.
    #[error("{operation} gave up after {attempts} conflicting commit attempts")]
    ConcurrencyExhausted {
        operation: &'static str,
        attempts: u32,
    },

    #[error("product not found: {0}")]
    ProductNotFound(ProductId),

    #[error("order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("restock request not found: {0}")]
    RestockRequestNotFound(RestockRequestId),

    #[error("product {0} is deactivated")]
    ProductInactive(ProductId),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Domain(DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Only exhausted retries are worth retrying blindly; every other failure
    /// is a deterministic answer for the current state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrencyExhausted { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Store(StoreError::Conflict(_)))
    }

    /// Map a stock-record failure for `product_id`.
    pub fn from_stock(product_id: ProductId, err: DomainError) -> Self {
        match err {
            DomainError::NotFound => EngineError::ProductNotFound(product_id),
            DomainError::Inactive(_) => EngineError::ProductInactive(product_id),
            DomainError::InsufficientStock {
                requested,
                available,
            } => EngineError::InsufficientStock {
                shortfalls: vec![LineShortfall {
                    product_id,
                    requested,
                    available,
                }],
            },
            DomainError::OverRelease {
                requested,
                reserved,
            } => EngineError::OverRelease {
                product_id,
                requested,
                reserved,
            },
            DomainError::InvariantViolation(msg) => {
                EngineError::Validation(format!("product {product_id}: {msg}"))
            }
            other => other.into(),
        }
    }

    /// Map an order failure for `order_id`.
    pub fn from_order(order_id: OrderId, err: DomainError) -> Self {
        match err {
            DomainError::NotFound => EngineError::OrderNotFound(order_id),
            other => other.into(),
        }
    }

    /// Map a restock-request failure for `request_id`.
    pub fn from_restock(request_id: RestockRequestId, err: DomainError) -> Self {
        match err {
            DomainError::NotFound => EngineError::RestockRequestNotFound(request_id),
            other => other.into(),
        }
    }
}

impl From<DomainError> for EngineError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::Validation(msg) | DomainError::InvalidId(msg) => {
                EngineError::Validation(msg)
            }
            DomainError::InvalidTransition { from, action } => {
                EngineError::InvalidTransition { from, action }
            }
            DomainError::Conflict(msg) => EngineError::AlreadyExists(msg),
            other => EngineError::Domain(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_core::AggregateId;

    #[test]
    fn stock_errors_carry_the_product() {
        let product_id = ProductId::new(AggregateId::new());
        let err = EngineError::from_stock(
            product_id,
            DomainError::InsufficientStock {
                requested: 5,
                available: 2,
            },
        );
        assert_eq!(
            err,
            EngineError::InsufficientStock {
                shortfalls: vec![LineShortfall {
                    product_id,
                    requested: 5,
                    available: 2
                }]
            }
        );
        assert_eq!(
            EngineError::from_stock(product_id, DomainError::NotFound),
            EngineError::ProductNotFound(product_id)
        );
    }

    #[test]
    fn only_exhaustion_is_retryable() {
        assert!(EngineError::ConcurrencyExhausted {
            operation: "place_order",
            attempts: 3
        }
        .is_retryable());
        assert!(!EngineError::Store(StoreError::Conflict("x".into())).is_retryable());
        assert!(!EngineError::Validation("x".into()).is_retryable());
    }
}
