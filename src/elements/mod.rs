//! Built-in pipeline elements.
//!
//! ## Sources
//! - [`TestSrc`]: Generates test pattern buffers
//!
//! ## Sinks
//! - [`FakeSink`]: Discards all buffers (useful for testing and benchmarking)
//!
//! ## Transforms
//! - [`Identity`]: Passes buffers unchanged, with inspection hooks
//!
//! ## Flow
//! - [`Queue`]: Asynchronous buffer queue with backpressure
//! - [`Tee`]: Duplicates buffers to multiple outputs (1-to-N fanout)
//!
//! New elements usually start from one of the [`base`] adapters.

pub mod base;
mod fakesink;
mod flow;
mod identity;
mod testsrc;

// Sources
pub use testsrc::{TestPattern, TestSrc};

// Sinks
pub use fakesink::{FakeSink, HandoffCallback};

// Transforms
pub use identity::{BufferCallback, Identity, IdentityStats};

// Flow
pub use crate::scheduler::{LeakyMode, QueueStats};
pub use flow::{Queue, QueueSettings, Tee};
