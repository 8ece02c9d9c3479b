//! Flow control and routing elements.
//!
//! ## Buffering
//! - [`Queue`]: thread boundary with bounded buffering and backpressure
//!
//! ## Routing
//! - [`Tee`]: 1-to-N fanout (duplicates buffers)

mod queue;
mod tee;

pub use queue::{Queue, QueueSettings};
pub use tee::Tee;
