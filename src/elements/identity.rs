//! Identity element with callbacks for debugging.
//!
//! A pass-through element that allows inspection of buffers via callbacks
//! and can inject a flow error after a number of buffers.

use super::base::{Output, Transform, TransformAdapter};
use crate::buffer::Buffer;
use crate::element::Element;
use crate::error::{FlowError, Result};
use std::sync::Arc;

/// Callback type for buffer inspection.
pub type BufferCallback = Arc<dyn Fn(&Buffer) + Send + Sync>;

/// An identity element that passes buffers through unchanged while
/// optionally calling callbacks for inspection.
///
/// # Example
///
/// ```rust
/// use sluice::elements::Identity;
///
/// let identity = Identity::new()
///     .on_buffer(|buf| println!("buffer of {} bytes", buf.len()))
///     .build("debug-point");
/// assert!(identity.static_pad("sink").is_some());
/// ```
#[derive(Default)]
pub struct Identity {
    callback: Option<BufferCallback>,
    error_after: Option<u64>,
    count: u64,
    bytes: u64,
}

impl Identity {
    /// Create a new identity element.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a callback to be called for each buffer.
    pub fn on_buffer<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Buffer) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
        self
    }

    /// Fail with a flow error once `count` buffers have passed.
    pub fn with_error_after(mut self, count: u64) -> Self {
        self.error_after = Some(count);
        self
    }

    /// Change error injection; `None` disables it.
    pub fn set_error_after(&mut self, count: Option<u64>) {
        self.error_after = count;
    }

    /// Wrap in an element.
    pub fn build(self, name: impl Into<String>) -> Element {
        TransformAdapter::element(name, self)
    }

    /// Get statistics.
    pub fn stats(&self) -> IdentityStats {
        IdentityStats {
            buffer_count: self.count,
            byte_count: self.bytes,
        }
    }
}

impl Transform for Identity {
    fn transform(&mut self, buffer: Buffer) -> Result<Output> {
        if self.error_after.is_some_and(|limit| self.count >= limit) {
            tracing::debug!("identity: injecting error after {} buffers", self.count);
            return Err(FlowError::Error.into());
        }
        self.count += 1;
        self.bytes += buffer.len() as u64;

        if let Some(cb) = &self.callback {
            cb(&buffer);
        }
        Ok(Output::single(buffer))
    }

    fn start(&mut self) -> Result<()> {
        self.count = 0;
        self.bytes = 0;
        Ok(())
    }
}

/// Statistics for Identity element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityStats {
    /// Number of buffers processed.
    pub buffer_count: u64,
    /// Total bytes processed.
    pub byte_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_identity_passthrough() {
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        let mut identity = Identity::new().on_buffer(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        let out = identity.transform(Buffer::from_slice(b"abc")).unwrap();
        assert_eq!(out.into_single().unwrap().data(), b"abc");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(
            identity.stats(),
            IdentityStats {
                buffer_count: 1,
                byte_count: 3
            }
        );
    }

    #[test]
    fn test_identity_error_after() {
        let mut identity = Identity::new().with_error_after(2);
        assert!(identity.transform(Buffer::from_slice(b"a")).is_ok());
        assert!(identity.transform(Buffer::from_slice(b"b")).is_ok());
        assert!(matches!(
            identity.transform(Buffer::from_slice(b"c")),
            Err(crate::error::Error::Flow(FlowError::Error))
        ));
    }
}
