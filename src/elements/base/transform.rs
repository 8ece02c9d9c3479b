//! Base for elements with one sink and one source pad.

use crate::buffer::Buffer;
use crate::caps::Caps;
use crate::element::{
    Element, ElementImpl, Pad, PadDirection, PadTemplate, StateChange, StateChangeResult,
    StateChangeSuccess,
};
use crate::error::{Error, FlowError, FlowResult, FlowSuccess, Result, StateChangeError};
use crate::event::{Event, EventView};
use std::sync::{Mutex, MutexGuard};

// ============================================================================
// Output Type
// ============================================================================

/// Output of a transform: zero, one or several buffers.
///
/// ```rust
/// use sluice::buffer::Buffer;
/// use sluice::elements::base::Output;
///
/// assert!(Output::none().is_empty());
/// let out = Output::from(vec![Buffer::from_slice(b"a"), Buffer::from_slice(b"b")]);
/// assert_eq!(out.len(), 2);
/// ```
#[derive(Debug, Default)]
pub enum Output {
    /// No output (buffer was filtered/consumed).
    #[default]
    None,
    /// Single output buffer.
    Single(Buffer),
    /// Multiple output buffers.
    Multiple(Vec<Buffer>),
}

impl Output {
    /// Create a single buffer output.
    #[inline]
    pub fn single(buf: Buffer) -> Self {
        Self::Single(buf)
    }

    /// Create an empty output.
    #[inline]
    pub fn none() -> Self {
        Self::None
    }

    /// Number of buffers.
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            Self::None => 0,
            Self::Single(_) => 1,
            Self::Multiple(v) => v.len(),
        }
    }

    /// Check if empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take the single buffer, returning None for other variants.
    pub fn into_single(self) -> Option<Buffer> {
        match self {
            Self::Single(b) => Some(b),
            _ => None,
        }
    }
}

impl From<Buffer> for Output {
    #[inline]
    fn from(b: Buffer) -> Self {
        Self::Single(b)
    }
}

impl From<Option<Buffer>> for Output {
    fn from(opt: Option<Buffer>) -> Self {
        opt.map_or(Self::None, Self::Single)
    }
}

impl From<Vec<Buffer>> for Output {
    fn from(mut v: Vec<Buffer>) -> Self {
        match v.len() {
            0 => Self::None,
            1 => v.pop().map_or(Self::None, Self::Single),
            _ => Self::Multiple(v),
        }
    }
}

impl FromIterator<Buffer> for Output {
    fn from_iter<I: IntoIterator<Item = Buffer>>(iter: I) -> Self {
        iter.into_iter().collect::<Vec<_>>().into()
    }
}

impl IntoIterator for Output {
    type Item = Buffer;
    type IntoIter = OutputIter;

    fn into_iter(self) -> Self::IntoIter {
        OutputIter(match self {
            Output::None => OutputIterInner::None,
            Output::Single(b) => OutputIterInner::Single(Some(b)),
            Output::Multiple(v) => OutputIterInner::Multiple(v.into_iter()),
        })
    }
}

/// Iterator over Output buffers.
pub struct OutputIter(OutputIterInner);

enum OutputIterInner {
    None,
    Single(Option<Buffer>),
    Multiple(std::vec::IntoIter<Buffer>),
}

impl Iterator for OutputIter {
    type Item = Buffer;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.0 {
            OutputIterInner::None => None,
            OutputIterInner::Single(opt) => opt.take(),
            OutputIterInner::Multiple(iter) => iter.next(),
        }
    }
}

// ============================================================================
// Transform Trait
// ============================================================================

/// A filter turning each input buffer into zero or more output buffers.
///
/// Wrapped in a [`TransformAdapter`], which owns the `sink` and `src` pads,
/// proxies caps queries across the element and fixes the output format when
/// the input format arrives.
pub trait Transform: Send + 'static {
    /// Process one input buffer.
    fn transform(&mut self, buffer: Buffer) -> Result<Output>;

    /// Formats accepted on the sink pad.
    fn sink_caps(&self) -> Caps {
        Caps::new_any()
    }

    /// Formats produced on the source pad.
    fn src_caps(&self) -> Caps {
        Caps::new_any()
    }

    /// Formats on the other side given `caps` on a pad of `direction`.
    /// Identity by default.
    fn transform_caps(&self, direction: PadDirection, caps: &Caps) -> Caps {
        let _ = direction;
        caps.clone()
    }

    /// Input and output formats were fixed.
    fn set_caps(&mut self, incaps: &Caps, outcaps: &Caps) -> Result<()> {
        let _ = (incaps, outcaps);
        Ok(())
    }

    /// Acquire resources (NULL → READY).
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Release resources (READY → NULL).
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// Drop buffered state after a flush.
    fn flush(&mut self) {}

    /// Emit whatever is still buffered; called at end of stream.
    fn drain(&mut self) -> Result<Output> {
        Ok(Output::None)
    }
}

/// [`ElementImpl`] for a [`Transform`].
pub struct TransformAdapter<T: Transform> {
    transform: Mutex<T>,
}

impl<T: Transform> TransformAdapter<T> {
    /// Wrap `transform`.
    pub fn new(transform: T) -> Self {
        Self {
            transform: Mutex::new(transform),
        }
    }

    /// Wrap `transform` in a new element.
    pub fn element(name: impl Into<String>, transform: T) -> Element {
        Element::new(name, Self::new(transform))
    }

    /// Exclusive access to the wrapped transform.
    pub fn transform(&self) -> MutexGuard<'_, T> {
        self.transform.lock().unwrap()
    }

    fn push_output(&self, element: &Element, output: Output) -> FlowResult {
        let src = element.static_pad("src").ok_or(FlowError::NotLinked)?;
        for buffer in output {
            src.push(buffer)?;
        }
        Ok(FlowSuccess::Ok)
    }

    /// Pick output caps for `incaps` and send them downstream.
    fn set_input_caps(&self, element: &Element, incaps: &Caps) -> bool {
        let Some(src) = element.static_pad("src") else {
            return false;
        };
        let candidates = self
            .transform()
            .transform_caps(PadDirection::Sink, incaps)
            .intersect(&src.template_caps());
        let outcaps = match src.peer() {
            Some(peer) => peer.query_caps(Some(&candidates)),
            None => candidates,
        };
        let Some(outcaps) = outcaps.fixate() else {
            tracing::warn!("{}: no output format for {incaps}", element.name());
            return false;
        };
        if let Err(err) = self.transform().set_caps(incaps, &outcaps) {
            tracing::warn!("{}: refused {incaps} -> {outcaps}: {err}", element.name());
            return false;
        }
        tracing::debug!("{}: {incaps} -> {outcaps}", element.name());
        src.push_event(Event::caps(outcaps))
    }
}

impl<T: Transform> ElementImpl for TransformAdapter<T> {
    fn pad_templates(&self) -> Vec<PadTemplate> {
        let transform = self.transform();
        vec![
            PadTemplate::sink("sink", transform.sink_caps()),
            PadTemplate::src("src", transform.src_caps()),
        ]
    }

    fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
        let result = match transition {
            StateChange::NullToReady => self.transform().start(),
            StateChange::ReadyToNull => self.transform().stop(),
            StateChange::PausedToReady => {
                self.transform().flush();
                Ok(())
            }
            _ => Ok(()),
        };
        match result {
            Ok(()) => Ok(StateChangeSuccess::Success),
            Err(err) => {
                element.post_error(err, Some(format!("{transition} failed")));
                Err(StateChangeError)
            }
        }
    }

    fn chain(&self, element: &Element, _pad: &Pad, buffer: Buffer) -> FlowResult {
        let output = self.transform().transform(buffer);
        match output {
            Ok(output) => self.push_output(element, output),
            Err(Error::Flow(flow)) => Err(flow),
            Err(err) => {
                element.post_error(err, Some("transform failed".into()));
                Err(FlowError::Error)
            }
        }
    }

    fn sink_event(&self, element: &Element, pad: &Pad, event: Event) -> bool {
        match event.view() {
            EventView::Caps(caps) => self.set_input_caps(element, caps),
            EventView::Eos => {
                let drained = self.transform().drain();
                match drained {
                    Ok(output) if !output.is_empty() => {
                        if let Err(flow) = self.push_output(element, output) {
                            tracing::debug!("{}: drain push failed: {flow}", element.name());
                        }
                    }
                    Ok(_) => {}
                    Err(err) => element.post_error(err, Some("drain failed".into())),
                }
                element.forward_event(pad, event)
            }
            EventView::FlushStop { .. } => {
                self.transform().flush();
                element.forward_event(pad, event)
            }
            _ => element.forward_event(pad, event),
        }
    }

    fn query_caps(&self, element: &Element, pad: &Pad, filter: Option<&Caps>) -> Caps {
        let other = match pad.direction() {
            PadDirection::Sink => element.static_pad("src"),
            PadDirection::Src => element.static_pad("sink"),
        };
        let Some(other) = other else {
            return pad.template_caps();
        };
        let peer_caps = other.peer_query_caps(None);
        let mapped = if peer_caps.is_any() {
            peer_caps
        } else {
            self.transform().transform_caps(other.direction(), &peer_caps)
        };
        let caps = mapped.intersect(&pad.template_caps());
        match filter {
            Some(filter) => caps.intersect(filter),
            None => caps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_from_vec() {
        assert!(Output::from(Vec::new()).is_empty());
        let one = Output::from(vec![Buffer::from_slice(b"x")]);
        assert!(matches!(one, Output::Single(_)));
        let many: Output = (0..3u8).map(|i| Buffer::from_slice(&[i])).collect();
        assert_eq!(many.len(), 3);
        let bytes: Vec<u8> = many.into_iter().map(|b| b.data()[0]).collect();
        assert_eq!(bytes, [0, 1, 2]);
    }

    #[test]
    fn test_output_into_single() {
        assert!(Output::from(Some(Buffer::from_slice(b"y"))).into_single().is_some());
        assert!(Output::none().into_single().is_none());
    }
}
