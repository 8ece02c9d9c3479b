//! Queue element for asynchronous buffering.
//!
//! Provides a buffer queue between pipeline elements, enabling:
//! - Decoupling of producer and consumer rates
//! - Backpressure handling
//! - Thread boundary crossing
//!
//! Upstream pushes into a [`DataQueue`]; the queue's own streaming task on
//! the `src` pad pops and pushes downstream.

use crate::buffer::Buffer;
use crate::caps::Caps;
use crate::clock::ClockTime;
use crate::element::{
    Element, ElementImpl, Pad, PadDirection, PadMode, PadTemplate, StateChange,
    StateChangeResult, StateChangeSuccess,
};
use crate::error::{FlowError, FlowResult, FlowSuccess, Result, StateChangeError};
use crate::event::{Event, EventView, StreamItem};
use crate::scheduler::{DataQueue, LeakyMode, QueueLimits, QueueStats};
use std::ops::ControlFlow;
use std::sync::Mutex;

/// Limits and leaky mode of a [`Queue`]. A zero limit is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Maximum queued buffers.
    pub max_buffers: usize,
    /// Maximum queued bytes.
    pub max_bytes: usize,
    /// Maximum queued duration.
    pub max_time: ClockTime,
    /// What to drop when full.
    pub leaky: LeakyMode,
}

impl Default for QueueSettings {
    fn default() -> Self {
        let limits = QueueLimits::default();
        Self {
            max_buffers: limits.max_buffers,
            max_bytes: limits.max_bytes,
            max_time: limits.max_time,
            leaky: LeakyMode::None,
        }
    }
}

impl QueueSettings {
    fn limits(&self) -> QueueLimits {
        QueueLimits {
            max_buffers: self.max_buffers,
            max_bytes: self.max_bytes,
            max_time: self.max_time,
        }
    }
}

/// A queue element that buffers data between pipeline stages.
///
/// # Example
///
/// ```rust
/// use sluice::elements::{LeakyMode, Queue};
///
/// let queue = Queue::new()
///     .with_max_buffers(100)
///     .with_leaky(LeakyMode::Downstream)
///     .build("queue");
/// assert_eq!(Queue::stats(&queue).unwrap().current_buffers, 0);
/// ```
pub struct Queue {
    settings: QueueSettings,
    queue: DataQueue,
    src_result: Mutex<FlowResult>,
}

impl Queue {
    /// Create a queue with default limits (200 buffers, 10 MiB, 1 s).
    pub fn new() -> Self {
        Self::with_settings(QueueSettings::default())
    }

    /// Create a queue with `settings`.
    pub fn with_settings(settings: QueueSettings) -> Self {
        Self {
            settings,
            queue: DataQueue::new(settings.limits(), settings.leaky),
            src_result: Mutex::new(Err(FlowError::Flushing)),
        }
    }

    /// Set the maximum buffer count.
    pub fn with_max_buffers(mut self, max: usize) -> Self {
        self.settings.max_buffers = max;
        self.queue.set_limits(self.settings.limits());
        self
    }

    /// Set the maximum byte count.
    pub fn with_max_bytes(mut self, max: usize) -> Self {
        self.settings.max_bytes = max;
        self.queue.set_limits(self.settings.limits());
        self
    }

    /// Set the maximum queued duration.
    pub fn with_max_time(mut self, max: ClockTime) -> Self {
        self.settings.max_time = max;
        self.queue.set_limits(self.settings.limits());
        self
    }

    /// Set the leaky mode.
    pub fn with_leaky(mut self, mode: LeakyMode) -> Self {
        self.settings.leaky = mode;
        self.queue.set_leaky(mode);
        self
    }

    /// Wrap in an element.
    pub fn build(self, name: impl Into<String>) -> Element {
        Element::new(name, self)
    }

    /// Current settings.
    pub fn settings(&self) -> QueueSettings {
        self.settings
    }

    /// Fill level and counters of a queue element.
    pub fn stats(element: &Element) -> Option<QueueStats> {
        element.imp_as::<Queue>().map(|q| q.queue.stats())
    }

    fn src_result(&self) -> FlowResult {
        *self.src_result.lock().unwrap()
    }

    fn set_src_result(&self, result: FlowResult) {
        *self.src_result.lock().unwrap() = result;
    }

    fn start_task(&self, element: &Element) -> Result<()> {
        let Some(src) = element.static_pad("src") else {
            return Ok(());
        };
        if src.mode() != PadMode::Push {
            return Ok(());
        }
        // The wait for data happens without a strong handle so that an idle
        // queue does not keep its element alive.
        let queue = self.queue.clone();
        let weak = element.downgrade();
        src.start_task(move || {
            let popped = queue.pop();
            let Some(element) = weak.upgrade() else {
                return ControlFlow::Break(());
            };
            let (Some(src), Some(this)) = (element.static_pad("src"), element.imp_as::<Queue>())
            else {
                return ControlFlow::Break(());
            };
            this.loop_iteration(&element, &src, popped);
            ControlFlow::Continue(())
        })
    }

    fn loop_iteration(
        &self,
        element: &Element,
        src: &Pad,
        popped: std::result::Result<StreamItem, FlowError>,
    ) {
        let item = match popped {
            Ok(item) => item,
            Err(flow) => {
                self.pause(element, src, flow);
                return;
            }
        };
        match item {
            StreamItem::Buffer(buffer) => {
                if let Err(flow) = src.push(buffer) {
                    self.pause(element, src, flow);
                }
            }
            StreamItem::Event(event) => {
                let is_eos = matches!(event.view(), EventView::Eos);
                src.push_event(event);
                if is_eos {
                    self.pause(element, src, FlowError::Eos);
                }
            }
        }
    }

    /// Stop pushing: remember why and release a blocked upstream.
    fn pause(&self, element: &Element, src: &Pad, flow: FlowError) {
        tracing::debug!("{}: pausing task, reason {flow}", element.name());
        self.set_src_result(Err(flow));
        src.pause_task();
        if flow.is_fatal() {
            // Upstream sees the error on its next push.
            self.queue.set_flushing(true);
        }
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        // Wakes the streaming thread if it is waiting for data.
        self.queue.set_flushing(true);
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl ElementImpl for Queue {
    fn pad_templates(&self) -> Vec<PadTemplate> {
        vec![
            PadTemplate::sink("sink", Caps::new_any()),
            PadTemplate::src("src", Caps::new_any()),
        ]
    }

    fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
        match transition {
            StateChange::ReadyToPaused => {
                self.queue.flush();
                self.queue.set_flushing(false);
                self.set_src_result(Ok(FlowSuccess::Ok));
                if let Err(err) = self.start_task(element) {
                    tracing::error!("{}: cannot start task: {err}", element.name());
                    return Err(StateChangeError);
                }
            }
            StateChange::PausedToReady => self.queue.flush(),
            _ => {}
        }
        Ok(StateChangeSuccess::Success)
    }

    fn unlock(&self, _element: &Element) {
        self.queue.set_flushing(true);
        self.set_src_result(Err(FlowError::Flushing));
    }

    fn chain(&self, _element: &Element, _pad: &Pad, buffer: Buffer) -> FlowResult {
        if let Err(flow) = self.src_result() {
            return Err(flow);
        }
        match self.queue.push(StreamItem::Buffer(buffer)) {
            Ok(()) => Ok(FlowSuccess::Ok),
            Err(flow) => Err(self.src_result().err().unwrap_or(flow)),
        }
    }

    fn sink_event(&self, element: &Element, pad: &Pad, event: Event) -> bool {
        let Some(src) = element.static_pad("src") else {
            return false;
        };
        match event.view() {
            EventView::FlushStart => {
                self.queue.set_flushing(true);
                self.queue.flush();
                self.set_src_result(Err(FlowError::Flushing));
                let handled = src.push_event(event);
                src.pause_task();
                handled
            }
            EventView::FlushStop { .. } => {
                // Make sure the task left its loop before restarting it.
                drop(src.stream_lock());
                self.queue.flush();
                self.queue.set_flushing(false);
                self.set_src_result(Ok(FlowSuccess::Ok));
                let handled = src.push_event(event);
                if src.is_active()
                    && let Err(err) = self.start_task(element)
                {
                    tracing::warn!("{}: cannot restart task: {err}", element.name());
                }
                handled
            }
            _ if event.is_serialized() => {
                if self.src_result() == Err(FlowError::Eos) && !event.is_sticky() {
                    return false;
                }
                match self.queue.push(StreamItem::Event(event)) {
                    Ok(()) => true,
                    Err(flow) => {
                        tracing::debug!("{}: dropping event, {flow}", pad.path());
                        false
                    }
                }
            }
            _ => src.push_event(event),
        }
    }

    fn query_caps(&self, element: &Element, pad: &Pad, filter: Option<&Caps>) -> Caps {
        let other = match pad.direction() {
            PadDirection::Sink => element.static_pad("src"),
            PadDirection::Src => element.static_pad("sink"),
        };
        match other {
            Some(other) => other.peer_query_caps(filter),
            None => pad.template_caps(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_settings_default() {
        let settings = QueueSettings::default();
        assert_eq!(settings.max_buffers, 200);
        assert_eq!(settings.max_bytes, 10 * 1024 * 1024);
        assert_eq!(settings.max_time, ClockTime::from_secs(1));
        assert_eq!(settings.leaky, LeakyMode::None);
    }

    #[test]
    fn test_queue_builder() {
        let queue = Queue::new().with_max_buffers(3).with_leaky(LeakyMode::Upstream);
        assert_eq!(queue.settings().max_buffers, 3);
        assert_eq!(queue.queue.limits().max_buffers, 3);
        let element = queue.build("q");
        assert_eq!(element.pads().len(), 2);
        assert_eq!(Queue::stats(&element).unwrap().total_pushed, 0);
    }

    #[test]
    fn test_queue_refuses_before_paused() {
        let element = Queue::new().build("q");
        let queue = element.imp_as::<Queue>().unwrap();
        let pad = element.static_pad("sink").unwrap();
        assert_eq!(
            queue.chain(&element, &pad, Buffer::from_slice(b"x")),
            Err(FlowError::Flushing)
        );
    }
}
