//! In-memory containers owned by the sync engine.

mod pins;
mod queue;

pub use pins::{PinMap, PinRecord, PinTable};
pub use queue::{BoundedQueue, QueueMap, TrimDirection};
