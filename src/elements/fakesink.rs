//! FakeSink - a sink that discards buffers.
//!
//! Useful for testing sources, benchmarking pipeline throughput and
//! draining a pipeline without side effects.

use super::base::{Sink, SinkAdapter, SinkSettings};
use crate::buffer::Buffer;
use crate::caps::Caps;
use crate::element::Element;
use crate::error::Result;
use std::sync::Arc;

/// Callback invoked with every rendered buffer.
pub type HandoffCallback = Arc<dyn Fn(&Buffer) + Send + Sync>;

/// A sink that counts and discards all buffers.
///
/// # Example
///
/// ```rust
/// use sluice::elements::FakeSink;
///
/// let sink = FakeSink::new().with_sync(true).build("sink");
/// assert_eq!(FakeSink::rendered(&sink), Some(0));
/// ```
pub struct FakeSink {
    sync: bool,
    caps: Caps,
    rendered: u64,
    prerolled: u64,
    handoff: Option<HandoffCallback>,
    preroll_handoff: Option<HandoffCallback>,
}

impl FakeSink {
    /// Create a new FakeSink: accepts anything, no clock sync.
    pub fn new() -> Self {
        Self {
            sync: false,
            caps: Caps::new_any(),
            rendered: 0,
            prerolled: 0,
            handoff: None,
            preroll_handoff: None,
        }
    }

    /// Hold buffers until their running time.
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Restrict accepted formats.
    pub fn with_caps(mut self, caps: Caps) -> Self {
        self.caps = caps;
        self
    }

    /// Call `callback` for every rendered buffer.
    pub fn on_handoff<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Buffer) + Send + Sync + 'static,
    {
        self.handoff = Some(Arc::new(callback));
        self
    }

    /// Call `callback` for every prerolled buffer.
    pub fn on_preroll_handoff<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Buffer) + Send + Sync + 'static,
    {
        self.preroll_handoff = Some(Arc::new(callback));
        self
    }

    /// Wrap in an element.
    pub fn build(self, name: impl Into<String>) -> Element {
        let settings = SinkSettings {
            sync: self.sync,
            ..SinkSettings::default()
        };
        Element::new(name, SinkAdapter::with_settings(self, settings))
    }

    /// Number of buffers rendered so far.
    pub fn rendered_count(&self) -> u64 {
        self.rendered
    }

    /// Number of buffers prerolled so far.
    pub fn prerolled_count(&self) -> u64 {
        self.prerolled
    }

    /// Rendered count of a FakeSink element; `None` for other elements.
    pub fn rendered(element: &Element) -> Option<u64> {
        element
            .imp_as::<SinkAdapter<FakeSink>>()
            .map(|adapter| adapter.sink().rendered)
    }
}

impl Default for FakeSink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for FakeSink {
    fn consume(&mut self, buffer: &Buffer) -> Result<()> {
        self.rendered += 1;
        tracing::trace!("fakesink: rendered {buffer:?}");
        if let Some(cb) = &self.handoff {
            cb(buffer);
        }
        Ok(())
    }

    fn preroll(&mut self, buffer: &Buffer) -> Result<()> {
        self.prerolled += 1;
        if let Some(cb) = &self.preroll_handoff {
            cb(buffer);
        }
        Ok(())
    }

    fn caps(&self) -> Caps {
        self.caps.clone()
    }

    fn start(&mut self) -> Result<()> {
        self.rendered = 0;
        self.prerolled = 0;
        Ok(())
    }
}
