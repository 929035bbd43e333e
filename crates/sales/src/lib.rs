//! Orders domain module.
//!
//! The order lifecycle (reserved → dispatched → delivered, cancellation and
//! returns), implemented purely as deterministic domain logic (no IO, no storage).

pub mod order;

pub use order::{
    CancelOrder, DeliverOrder, DispatchOrder, LineItem, Order, OrderCancelled, OrderCommand,
    OrderDelivered, OrderDispatched, OrderEvent, OrderId, OrderReserved, OrderReturned,
    OrderStatus, PlaceOrder, ReturnOrder, validate_lines,
};
