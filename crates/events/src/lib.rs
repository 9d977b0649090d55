//! Event distribution mechanics: the event trait, the bus abstraction and
//! the in-memory bus. Payload types live in the domain crate.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod scoped;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use scoped::WarehouseScoped;
