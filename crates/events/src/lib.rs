//! Domain events and their distribution.
//!
//! - `Event`: the contract every domain event implements
//! - `EventBus`: post-commit pub/sub to notification and dashboard consumers
//! - `execute`: run a command through an aggregate (decide + evolve)

pub mod bus;
pub mod event;
pub mod handler;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use handler::execute;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
