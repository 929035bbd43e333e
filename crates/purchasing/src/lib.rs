//! Purchasing domain module (supplier restock requests).
//!
//! Pure, deterministic domain logic: no IO, no storage. Deduplication of open
//! requests per product is enforced by the store, not by the aggregate.

pub mod request;

pub use request::{
    FulfillRestockRequest, MarkRestockSent, OpenRestockRequest, RestockCommand, RestockEvent,
    RestockPolicy, RestockRequest, RestockRequestFulfilled, RestockRequestId, RestockRequestOpened,
    RestockRequestSent, RestockStatus,
};
