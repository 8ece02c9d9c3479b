//! Base classes for the common element shapes.
//!
//! - [`Source`] + [`SourceAdapter`]: one `src` pad, a streaming task in push
//!   mode and range requests in pull mode, seeking.
//! - [`Transform`] + [`TransformAdapter`]: `sink` → `src`, caps proxied
//!   through [`Transform::transform_caps`].
//! - [`Sink`] + [`SinkAdapter`]: one `sink` pad, preroll, clock sync, EOS.
//!
//! Implement the trait and wrap it with the adapter's `element` constructor
//! to get an [`Element`](crate::element::Element).

mod sink;
mod source;
mod transform;

pub use sink::{Sink, SinkAdapter, SinkSettings};
pub use source::{Source, SourceAdapter};
pub use transform::{Output, OutputIter, Transform, TransformAdapter};
