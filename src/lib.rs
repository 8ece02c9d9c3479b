//! # Sluice
//!
//! The scheduling and state-management core of a streaming dataflow
//! pipeline.
//!
//! Processing units ([`Element`](element::Element)s) expose typed,
//! directional connection points ([`Pad`](element::Pad)s) that negotiate a
//! common data format ([`Caps`](caps::Caps)) when linked. Once a graph is
//! built it is driven through the `NULL → READY → PAUSED → PLAYING` state
//! machine: buffers and events flow across links on streaming threads,
//! bounded queues push back on fast producers, and everything the
//! application needs to know arrives as messages on a [`Bus`](bus::Bus).
//!
//! ## Features
//!
//! - **State machine**: synchronous, asynchronous (preroll) and no-preroll
//!   transitions, aggregated across nested [`Bin`](bin::Bin)s
//! - **Caps algebra**: ranges, lists, intersection, fixation, textual form
//! - **Push and pull dataflow**: sticky events, flushing, EOS, probes
//! - **Threading**: one streaming task per source or queue, bounded
//!   blocking queues with leaky modes
//! - **Clocking**: pipeline clock selection, base time, running time
//!
//! ## Quick Start
//!
//! ```rust
//! use sluice::prelude::*;
//! use std::time::Duration;
//!
//! let registry = Registry::with_builtins();
//! let pipeline = Pipeline::new("pipeline");
//! let src = registry.make("testsrc", None).unwrap();
//! let queue = registry.make("queue", None).unwrap();
//! let sink = registry.make("fakesink", None).unwrap();
//! pipeline.add_many(&[&src, &queue, &sink]).unwrap();
//! link_many(&[&src, &queue, &sink]).unwrap();
//!
//! pipeline.set_state(State::Paused).unwrap();
//! let (result, current, _) = pipeline.get_state(Some(Duration::from_secs(5)));
//! assert!(result.is_ok());
//! assert_eq!(current, State::Paused);
//! pipeline.set_state(State::Null).unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bin;
pub mod buffer;
pub mod bus;
pub mod caps;
pub mod clock;
pub mod element;
pub mod elements;
pub mod error;
pub mod event;
pub mod message;
pub mod pipeline;
pub mod registry;
pub mod scheduler;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::bin::Bin;
    pub use crate::buffer::{Buffer, BufferFlags};
    pub use crate::bus::Bus;
    pub use crate::caps::{Caps, Structure, Value};
    pub use crate::clock::{Clock, ClockTime, SystemClock};
    pub use crate::element::{
        Element, ElementImpl, Pad, PadDirection, PadTemplate, State, StateChange,
        StateChangeResult, StateChangeSuccess, link_many,
    };
    pub use crate::error::{
        Error, FlowError, FlowResult, FlowSuccess, Result, StateChangeError,
    };
    pub use crate::event::{Event, EventView};
    pub use crate::message::{Message, MessageType, MessageView};
    pub use crate::pipeline::Pipeline;
    pub use crate::registry::Registry;
}

pub use error::{Error, Result};
