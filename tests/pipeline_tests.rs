//! Integration tests for bin and pipeline composition.
//!
//! These tests verify that:
//! - Removing a playing child forces it to NULL before it is detached
//! - Nested bins forward data through ghost pads and aggregate EOS
//! - Children added to a running pipeline catch up with it
//! - A torn-down graph leaves no element alive through a reference cycle
//! - The pipeline picks up a clock offered by one of its elements

mod common;

use common::{drain, init_tracing, wait_for};
use sluice::bin::Bin;
use sluice::buffer::Buffer;
use sluice::clock::{Clock, ClockTime, TestClock};
use sluice::element::{Element, ElementImpl, State, link_many};
use sluice::elements::base::{Sink, SinkAdapter, SinkSettings};
use sluice::elements::{FakeSink, Identity, Queue, TestSrc};
use sluice::error::Result;
use sluice::message::{MessageType, MessageView};
use sluice::pipeline::Pipeline;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Records renders and whether any arrived after resources were released.
#[derive(Default)]
struct RenderLog {
    rendered: AtomicU64,
    stopped: AtomicBool,
    late: AtomicU64,
}

struct RecordingSink(Arc<RenderLog>);

impl Sink for RecordingSink {
    fn consume(&mut self, _buffer: &Buffer) -> Result<()> {
        if self.0.stopped.load(Ordering::SeqCst) {
            self.0.late.fetch_add(1, Ordering::SeqCst);
        }
        self.0.rendered.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(1));
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.0.stopped.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.0.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Offers its own clock to the pipeline.
struct ClockProvider(Arc<TestClock>);

impl ElementImpl for ClockProvider {
    fn provide_clock(&self, _element: &Element) -> Option<Arc<dyn Clock>> {
        Some(self.0.clone() as Arc<dyn Clock>)
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

#[test]
fn test_remove_playing_child() {
    init_tracing();
    let log = Arc::new(RenderLog::default());
    let pipeline = Pipeline::new("p");
    let src = TestSrc::new().with_blocksize(64).build("src");
    let identity = Identity::new().build("identity");
    let sink = Element::new(
        "sink",
        SinkAdapter::with_settings(
            RecordingSink(Arc::clone(&log)),
            SinkSettings {
                sync: false,
                ..SinkSettings::default()
            },
        ),
    );
    pipeline.add_many(&[&src, &identity, &sink]).unwrap();
    link_many(&[&src, &identity, &sink]).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        log.rendered.load(Ordering::SeqCst) > 5
    }));

    pipeline.remove(&sink).unwrap();
    assert!(log.stopped.load(Ordering::SeqCst));
    assert_eq!(sink.current_state(), State::Null);
    assert!(sink.parent().is_none());
    assert!(pipeline.by_name("sink").is_none());
    assert!(!identity.static_pad("src").unwrap().is_linked());
    assert!(!sink.static_pad("sink").unwrap().is_linked());

    let frozen = log.rendered.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(log.rendered.load(Ordering::SeqCst), frozen);
    assert_eq!(log.late.load(Ordering::SeqCst), 0);

    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn test_nested_bin_with_ghost_pad() {
    init_tracing();
    let pipeline = Pipeline::new("p");
    let src = TestSrc::new().with_num_buffers(5).build("src");

    let bin = Bin::new("branch");
    let identity = Identity::new().build("identity");
    let sink = FakeSink::new().build("sink");
    bin.add_many(&[&identity, &sink]).unwrap();
    identity.link(&sink).unwrap();
    bin.add_ghost_pad("sink", &identity.static_pad("sink").unwrap())
        .unwrap();

    pipeline.add_many(&[&src, &bin]).unwrap();
    src.link(&bin).unwrap();
    assert!(bin.is_sink());
    assert_eq!(pipeline.by_name_recurse("sink").as_ref(), Some(&sink));

    pipeline.set_state(State::Playing).unwrap();
    let msg = wait_for(&pipeline.bus(), &[MessageType::Eos, MessageType::Error]).unwrap();
    assert_eq!(msg.message_type(), MessageType::Eos);
    assert_eq!(msg.src(), "p");
    assert_eq!(FakeSink::rendered(&sink), Some(5));
    assert_eq!(bin.current_state(), State::Playing);

    pipeline.set_state(State::Null).unwrap();
    assert_eq!(sink.current_state(), State::Null);
}

#[test]
fn test_added_child_follows_pipeline() {
    init_tracing();
    let pipeline = Pipeline::new("p");
    pipeline.set_state(State::Playing).unwrap();

    let identity = Identity::new().build("late");
    pipeline.add(&identity).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        identity.current_state() == State::Playing
    }));

    pipeline.set_state(State::Null).unwrap();
    assert_eq!(identity.current_state(), State::Null);
}

#[test]
fn test_teardown_leaves_no_cycles() {
    init_tracing();
    let (pipeline_ref, element_refs) = {
        let pipeline = Pipeline::new("p");
        let src = TestSrc::new().with_num_buffers(3).build("src");
        let identity = Identity::new().build("identity");
        let sink = FakeSink::new().build("sink");
        pipeline.add_many(&[&src, &identity, &sink]).unwrap();
        link_many(&[&src, &identity, &sink]).unwrap();

        pipeline.set_state(State::Playing).unwrap();
        wait_for(&pipeline.bus(), &[MessageType::Eos]).unwrap();
        pipeline.set_state(State::Null).unwrap();

        for child in pipeline.children() {
            pipeline.remove(&child).unwrap();
            for pad in child.pads() {
                assert!(pad.peer().is_none());
            }
        }
        (
            pipeline.downgrade(),
            [src.downgrade(), identity.downgrade(), sink.downgrade()],
        )
    };

    // State-completion helper threads may still be dropping their handles.
    assert!(wait_until(Duration::from_secs(2), || {
        pipeline_ref.upgrade().is_none() && element_refs.iter().all(|e| e.upgrade().is_none())
    }));
}

#[test]
fn test_dropping_running_pipeline_ends_streaming() {
    init_tracing();
    let log = Arc::new(RenderLog::default());
    let (pipeline_ref, element_refs) = {
        let pipeline = Pipeline::new("p");
        let src = TestSrc::new().with_blocksize(64).build("src");
        let queue = Queue::new().build("queue");
        let sink = Element::new(
            "sink",
            SinkAdapter::with_settings(
                RecordingSink(Arc::clone(&log)),
                SinkSettings {
                    sync: false,
                    ..SinkSettings::default()
                },
            ),
        );
        pipeline.add_many(&[&src, &queue, &sink]).unwrap();
        link_many(&[&src, &queue, &sink]).unwrap();
        pipeline.set_state(State::Playing).unwrap();
        assert!(wait_until(Duration::from_secs(5), || {
            log.rendered.load(Ordering::SeqCst) > 5
        }));
        (
            pipeline.downgrade(),
            [src.downgrade(), queue.downgrade(), sink.downgrade()],
        )
    };

    // Streaming threads let go of the elements and stop.
    assert!(wait_until(Duration::from_secs(2), || {
        pipeline_ref.upgrade().is_none() && element_refs.iter().all(|e| e.upgrade().is_none())
    }));
    let frozen = log.rendered.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(log.rendered.load(Ordering::SeqCst), frozen);
}

#[test]
fn test_pipeline_uses_provided_clock() {
    init_tracing();
    let clock = Arc::new(TestClock::with_start_time(ClockTime::from_secs(100)));
    let pipeline = Pipeline::new("p");
    let provider = Element::new("provider", ClockProvider(Arc::clone(&clock)));
    let identity = Identity::new().build("identity");
    pipeline.add_many(&[&provider, &identity]).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    let used = pipeline.clock().unwrap();
    assert_eq!(used.now(), ClockTime::from_secs(100));
    assert_eq!(pipeline.base_time(), ClockTime::from_secs(100));
    assert_eq!(identity.base_time(), ClockTime::from_secs(100));
    assert!(identity.clock().is_some());

    let new_clock = drain(&pipeline.bus())
        .into_iter()
        .find(|m| matches!(m.view(), MessageView::NewClock { .. }));
    assert!(new_clock.is_some());

    clock.advance(ClockTime::from_secs(3));
    assert_eq!(pipeline.running_time(), ClockTime::from_secs(3));

    pipeline.set_state(State::Null).unwrap();
}
