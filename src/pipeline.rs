//! The top-level bin.
//!
//! A [`Pipeline`] is a [`Bin`] that owns a [`Bus`] and a clock:
//!
//! - Every message posted anywhere in the tree ends up on the bus.
//! - On PAUSED → PLAYING it selects a clock (an explicit one from
//!   [`Pipeline::use_clock`], else the first element that provides one,
//!   else a system clock) and hands it to every element together with the
//!   base time, so that sinks render against the same timeline.
//! - Running time is kept across pauses: resuming continues where the
//!   pipeline stopped instead of jumping ahead by the paused duration.
//!
//! # Example
//!
//! ```rust
//! use sluice::element::{State, link_many};
//! use sluice::elements::{FakeSink, Identity, TestSrc};
//! use sluice::message::MessageType;
//! use sluice::pipeline::Pipeline;
//! use std::time::Duration;
//!
//! let pipeline = Pipeline::new("example");
//! let src = TestSrc::new().with_num_buffers(10).build("src");
//! let identity = Identity::new().build("identity");
//! let sink = FakeSink::new().build("sink");
//! pipeline.add_many(&[&src, &identity, &sink]).unwrap();
//! link_many(&[&src, &identity, &sink]).unwrap();
//!
//! pipeline.set_state(State::Playing).unwrap();
//! let bus = pipeline.bus();
//! let msg = bus.timed_pop_filtered(Duration::from_secs(5), &[MessageType::Eos, MessageType::Error]);
//! assert_eq!(msg.map(|m| m.message_type()), Some(MessageType::Eos));
//! assert_eq!(FakeSink::rendered(&sink), Some(10));
//! pipeline.set_state(State::Null).unwrap();
//! ```

use crate::bin::{Bin, BinImpl};
use crate::bus::Bus;
use crate::clock::{Clock, ClockTime, SystemClock};
use crate::element::{Element, ElementImpl, StateChange, StateChangeResult};
use crate::event::Event;
use crate::message::{Message, MessageView};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Behavior of a [`Pipeline`] element: a bin plus bus and clock handling.
pub struct PipelineImpl {
    bin: BinImpl,
    bus: Bus,
    fixed_clock: Mutex<Option<Arc<dyn Clock>>>,
    system_clock: Arc<dyn Clock>,
    auto_flush_bus: AtomicBool,
}

impl PipelineImpl {
    fn new(bus: Bus) -> Self {
        Self {
            bin: BinImpl::new(),
            bus,
            fixed_clock: Mutex::new(None),
            system_clock: Arc::new(SystemClock::with_name("system")),
            auto_flush_bus: AtomicBool::new(true),
        }
    }

    fn select_clock(&self, element: &Element) -> Arc<dyn Clock> {
        if let Some(clock) = self.fixed_clock.lock().unwrap().clone() {
            return clock;
        }
        self.bin
            .provide_clock(element)
            .unwrap_or_else(|| Arc::clone(&self.system_clock))
    }

    /// Distribute the clock and the base time before the children start
    /// playing.
    fn start_clock(&self, element: &Element) {
        let clock = self.select_clock(element);
        let changed = element
            .clock()
            .is_none_or(|old| !Arc::ptr_eq(&old, &clock));
        element.set_clock(Some(Arc::clone(&clock)));
        if changed {
            tracing::debug!("{}: selected clock {}", element.name(), clock.name());
            element.post_message(Message::new(
                element.name(),
                MessageView::NewClock {
                    clock: Arc::clone(&clock),
                },
            ));
        }

        let base_time = clock.now().saturating_sub(element.start_time());
        tracing::debug!(
            "{}: base time {base_time}, running time {}",
            element.name(),
            element.start_time()
        );
        element.set_base_time(base_time);
    }
}

impl ElementImpl for PipelineImpl {
    fn change_state(&self, element: &Element, transition: StateChange) -> StateChangeResult {
        match transition {
            StateChange::NullToReady => self.bus.set_flushing(false),
            StateChange::ReadyToPaused => element.set_start_time(ClockTime::ZERO),
            StateChange::PausedToPlaying => self.start_clock(element),
            StateChange::PlayingToPaused => {
                let running_time = element.current_running_time();
                tracing::debug!("{}: paused at running time {running_time}", element.name());
                element.set_start_time(running_time);
            }
            _ => {}
        }

        let ret = self.bin.change_state(element, transition);

        if transition == StateChange::ReadyToNull
            && ret.is_ok()
            && self.auto_flush_bus.load(Ordering::Acquire)
        {
            self.bus.set_flushing(true);
        }
        ret
    }

    fn provide_clock(&self, element: &Element) -> Option<Arc<dyn Clock>> {
        self.bin.provide_clock(element)
    }

    fn is_sink(&self, element: &Element) -> bool {
        self.bin.is_sink(element)
    }

    fn is_source(&self, element: &Element) -> bool {
        self.bin.is_source(element)
    }

    fn send_event(&self, element: &Element, event: Event) -> bool {
        self.bin.send_event(element, event)
    }

    fn as_bin(&self) -> Option<&BinImpl> {
        Some(&self.bin)
    }
}

/// A top-level bin with a bus and a clock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pipeline(Bin);

impl Pipeline {
    /// Create an empty pipeline.
    pub fn new(name: impl Into<String>) -> Pipeline {
        let bus = Bus::new();
        let element = Element::new(name, PipelineImpl::new(bus.clone()));
        element.set_bus(Some(bus));
        Pipeline(Bin(element))
    }

    /// View `element` as a pipeline, if it is one.
    pub fn from_element(element: Element) -> Option<Pipeline> {
        if element.imp_as::<PipelineImpl>().is_some() {
            Some(Pipeline(Bin(element)))
        } else {
            None
        }
    }

    fn imp(&self) -> Option<&PipelineImpl> {
        self.element().imp_as::<PipelineImpl>()
    }

    /// The bus every message of the pipeline is posted to.
    pub fn bus(&self) -> Bus {
        match self.imp() {
            Some(imp) => imp.bus.clone(),
            None => Bus::new(),
        }
    }

    /// Force `clock` as the pipeline clock; `None` returns to automatic
    /// selection. Takes effect on the next PAUSED → PLAYING.
    pub fn use_clock(&self, clock: Option<Arc<dyn Clock>>) {
        if let Some(imp) = self.imp() {
            *imp.fixed_clock.lock().unwrap() = clock;
        }
    }

    /// Running time of the pipeline: advancing while PLAYING, frozen at
    /// the pause point otherwise.
    pub fn running_time(&self) -> ClockTime {
        self.current_running_time()
    }

    /// Whether the bus is flushed when the pipeline goes to NULL.
    pub fn auto_flush_bus(&self) -> bool {
        self.imp()
            .is_some_and(|imp| imp.auto_flush_bus.load(Ordering::Acquire))
    }

    /// Flush (or keep) pending bus messages on the way to NULL. Defaults
    /// to flushing.
    pub fn set_auto_flush_bus(&self, flush: bool) {
        if let Some(imp) = self.imp() {
            imp.auto_flush_bus.store(flush, Ordering::Release);
        }
    }
}

impl Deref for Pipeline {
    type Target = Bin;

    fn deref(&self) -> &Bin {
        &self.0
    }
}

impl From<Pipeline> for Element {
    fn from(pipeline: Pipeline) -> Element {
        pipeline.0.into_element()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::element::State;
    use crate::elements::Identity;
    use crate::message::MessageType;
    use std::time::Duration;

    #[test]
    fn test_pipeline_is_bin() {
        let pipeline = Pipeline::new("p");
        assert!(pipeline.is_bin());
        assert!(pipeline.auto_flush_bus());
        let element: Element = pipeline.clone().into();
        assert_eq!(Pipeline::from_element(element), Some(pipeline));
        assert!(Pipeline::from_element(Bin::new("b").into_element()).is_none());
    }

    #[test]
    fn test_messages_reach_bus() {
        let pipeline = Pipeline::new("p");
        let identity = Identity::new().build("identity");
        pipeline.add(&identity).unwrap();

        pipeline.set_state(State::Ready).unwrap();
        let bus = pipeline.bus();
        let sources: Vec<String> = std::iter::from_fn(|| bus.timed_pop(Duration::from_millis(10)))
            .filter(|m| m.message_type() == MessageType::StateChanged)
            .map(|m| m.src().to_string())
            .collect();
        assert_eq!(sources, ["identity", "p"]);
        pipeline.set_state(State::Null).unwrap();
    }

    #[test]
    fn test_use_clock_and_running_time() {
        let pipeline = Pipeline::new("p");
        let clock = Arc::new(TestClock::with_start_time(ClockTime::from_secs(10)));
        pipeline.use_clock(Some(clock.clone() as Arc<dyn Clock>));

        pipeline.set_state(State::Playing).unwrap();
        assert_eq!(pipeline.base_time(), ClockTime::from_secs(10));
        let used = pipeline.clock().unwrap();
        assert_eq!(used.now(), ClockTime::from_secs(10));

        clock.advance(ClockTime::from_secs(2));
        assert_eq!(pipeline.running_time(), ClockTime::from_secs(2));

        pipeline.set_state(State::Paused).unwrap();
        clock.advance(ClockTime::from_secs(5));
        assert_eq!(pipeline.running_time(), ClockTime::from_secs(2));

        pipeline.set_state(State::Playing).unwrap();
        assert_eq!(pipeline.base_time(), ClockTime::from_secs(15));
        assert_eq!(pipeline.running_time(), ClockTime::from_secs(2));
        pipeline.set_state(State::Null).unwrap();
    }

    #[test]
    fn test_new_clock_posted() {
        let pipeline = Pipeline::new("p");
        pipeline.set_state(State::Playing).unwrap();
        let msg = pipeline
            .bus()
            .timed_pop_filtered(Duration::from_secs(1), &[MessageType::NewClock]);
        assert!(msg.is_some());
        pipeline.set_state(State::Null).unwrap();
    }

    #[test]
    fn test_auto_flush_bus() {
        let pipeline = Pipeline::new("p");
        pipeline.set_state(State::Ready).unwrap();
        pipeline.set_state(State::Null).unwrap();
        assert!(pipeline.bus().is_empty());

        pipeline.set_auto_flush_bus(false);
        pipeline.set_state(State::Ready).unwrap();
        pipeline.set_state(State::Null).unwrap();
        assert!(!pipeline.bus().is_empty());
    }
}
