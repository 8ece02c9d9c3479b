//! Integration tests for buffers and events moving through a pipeline.
//!
//! These tests verify that:
//! - Every produced buffer is rendered exactly once before EOS
//! - EOS reaches the bus once and does not change the pipeline state
//! - Flushing discards data in flight and can be repeated safely
//! - Fan-out through a tee shares buffers between branches

mod common;

use common::{drain, init_tracing, wait_for};
use sluice::buffer::Buffer;
use sluice::element::{Element, PadMode, State, link_many};
use sluice::elements::base::{Sink, SinkAdapter, SinkSettings, TransformAdapter};
use sluice::elements::{FakeSink, Identity, LeakyMode, Queue, Tee, TestSrc};
use sluice::error::Result;
use sluice::event::Event;
use sluice::message::{MessageType, MessageView};
use sluice::pipeline::Pipeline;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

fn identity_count(element: &Element) -> u64 {
    element
        .imp_as::<TransformAdapter<Identity>>()
        .map(|imp| imp.transform().stats().buffer_count)
        .unwrap_or(0)
}

// ============================================================================
// Source → Transform → Sink
// ============================================================================

/// Ten buffers then EOS: ten renders, one EOS message, still PLAYING.
#[test]
fn test_ten_buffers_then_eos() {
    init_tracing();
    let pipeline = Pipeline::new("p");
    let rendered = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&rendered);
    let src = TestSrc::new().with_num_buffers(10).build("src");
    let identity = Identity::new().build("identity");
    let sink = FakeSink::new()
        .on_handoff(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .build("sink");
    pipeline.add_many(&[&src, &identity, &sink]).unwrap();
    link_many(&[&src, &identity, &sink]).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    let bus = pipeline.bus();
    let msg = wait_for(&bus, &[MessageType::Eos, MessageType::Error]).unwrap();
    assert_eq!(msg.message_type(), MessageType::Eos);
    assert_eq!(msg.src(), "p");

    assert_eq!(rendered.load(Ordering::SeqCst), 10);
    assert_eq!(identity_count(&identity), 10);
    assert_eq!(FakeSink::rendered(&sink), Some(10));

    let rest = drain(&bus);
    assert!(rest.iter().all(|m| m.message_type() != MessageType::Eos));
    assert_eq!(pipeline.current_state(), State::Playing);

    pipeline.set_state(State::Null).unwrap();
}

/// A flow error inside a transform reaches the bus from the failing
/// branch; the core leaves the state alone.
#[test]
fn test_flow_error_posted_not_torn_down() {
    init_tracing();
    let pipeline = Pipeline::new("p");
    let src = TestSrc::new().build("src");
    let identity = Identity::new().with_error_after(3).build("identity");
    let sink = FakeSink::new().build("sink");
    pipeline.add_many(&[&src, &identity, &sink]).unwrap();
    link_many(&[&src, &identity, &sink]).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    let bus = pipeline.bus();
    let msg = wait_for(&bus, &[MessageType::Error]).unwrap();
    assert!(matches!(msg.view(), MessageView::Error { .. }));
    assert_eq!(pipeline.current_state(), State::Playing);
    assert_eq!(FakeSink::rendered(&sink), Some(3));

    pipeline.set_state(State::Null).unwrap();
    assert_eq!(pipeline.current_state(), State::Null);
}

// ============================================================================
// Queues and flushing
// ============================================================================

/// A queue decouples the source thread from the sink thread.
#[test]
fn test_queue_thread_boundary() {
    init_tracing();
    let pipeline = Pipeline::new("p");
    let threads = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&threads);
    let src = TestSrc::new().with_num_buffers(20).build("src");
    let queue = Queue::new().with_max_buffers(4).build("queue");
    let sink = FakeSink::new()
        .on_handoff(move |_| seen.lock().unwrap().push(thread::current().id()))
        .build("sink");
    pipeline.add_many(&[&src, &queue, &sink]).unwrap();
    link_many(&[&src, &queue, &sink]).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    let msg = wait_for(&pipeline.bus(), &[MessageType::Eos, MessageType::Error]).unwrap();
    assert_eq!(msg.message_type(), MessageType::Eos);
    assert_eq!(FakeSink::rendered(&sink), Some(20));

    let stats = Queue::stats(&queue).unwrap();
    assert_eq!(stats.total_dropped, 0);
    assert_eq!(stats.current_buffers, 0);

    let threads = threads.lock().unwrap();
    assert!(threads.iter().all(|id| *id == threads[0]));
    assert_ne!(threads[0], thread::current().id());
    drop(threads);

    pipeline.set_state(State::Null).unwrap();
}

/// Sending flush-start twice behaves like sending it once.
#[test]
fn test_double_flush_start() {
    init_tracing();
    let pipeline = Pipeline::new("p");
    let src = TestSrc::new().with_blocksize(8).build("src");
    let queue = Queue::new().with_max_buffers(5).build("queue");
    let sink = FakeSink::new().build("sink");
    pipeline.add_many(&[&src, &queue, &sink]).unwrap();
    link_many(&[&src, &queue, &sink]).unwrap();

    // PAUSED: the sink holds its preroll buffer and the queue fills up.
    pipeline.set_state(State::Paused).unwrap();
    let (result, current, _) = pipeline.get_state(Some(Duration::from_secs(5)));
    assert!(result.is_ok());
    assert_eq!(current, State::Paused);
    thread::sleep(Duration::from_millis(100));
    assert_eq!(Queue::stats(&queue).unwrap().current_buffers, 5);

    let sink_pad = queue.static_pad("sink").unwrap();
    assert!(sink_pad.send_event(Event::flush_start()));
    assert_eq!(Queue::stats(&queue).unwrap().current_buffers, 0);
    sink_pad.send_event(Event::flush_start());
    assert_eq!(Queue::stats(&queue).unwrap().current_buffers, 0);
    assert!(sink_pad.is_flushing());

    assert!(sink_pad.send_event(Event::flush_stop(true)));
    assert!(!sink_pad.is_flushing());

    pipeline.set_state(State::Null).unwrap();
    assert_eq!(Queue::stats(&queue).unwrap().current_buffers, 0);
}

/// A leaky queue in front of a slow consumer drops instead of blocking.
#[test]
fn test_leaky_queue_drops() {
    init_tracing();
    let pipeline = Pipeline::new("p");
    let src = TestSrc::new().with_num_buffers(50).build("src");
    let queue = Queue::new()
        .with_max_buffers(2)
        .with_leaky(LeakyMode::Downstream)
        .build("queue");
    let sink = FakeSink::new()
        .on_handoff(|_| thread::sleep(Duration::from_millis(5)))
        .build("sink");
    pipeline.add_many(&[&src, &queue, &sink]).unwrap();
    link_many(&[&src, &queue, &sink]).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    let msg = wait_for(&pipeline.bus(), &[MessageType::Eos, MessageType::Error]).unwrap();
    assert_eq!(msg.message_type(), MessageType::Eos);

    let stats = Queue::stats(&queue).unwrap();
    let rendered = FakeSink::rendered(&sink).unwrap();
    assert!(stats.total_dropped > 0);
    assert_eq!(rendered + stats.total_dropped, 50);

    pipeline.set_state(State::Null).unwrap();
}

// ============================================================================
// Fan-out
// ============================================================================

/// Both branches of a tee render every buffer, sharing the payload.
#[test]
fn test_tee_two_branches() {
    init_tracing();
    let pipeline = Pipeline::new("p");
    let first: Arc<Mutex<Vec<Buffer>>> = Arc::default();
    let second: Arc<Mutex<Vec<Buffer>>> = Arc::default();
    let (a, b) = (Arc::clone(&first), Arc::clone(&second));

    let src = TestSrc::new().with_num_buffers(5).build("src");
    let tee = Tee::new().build("tee");
    let q1 = Queue::new().build("q1");
    let q2 = Queue::new().build("q2");
    let sink1 = FakeSink::new()
        .on_handoff(move |buf| a.lock().unwrap().push(buf.clone()))
        .build("sink1");
    let sink2 = FakeSink::new()
        .on_handoff(move |buf| b.lock().unwrap().push(buf.clone()))
        .build("sink2");
    pipeline
        .add_many(&[&src, &tee, &q1, &q2, &sink1, &sink2])
        .unwrap();
    link_many(&[&src, &tee, &q1, &sink1]).unwrap();
    link_many(&[&tee, &q2, &sink2]).unwrap();
    assert_eq!(tee.src_pads().len(), 2);

    pipeline.set_state(State::Playing).unwrap();
    let msg = wait_for(&pipeline.bus(), &[MessageType::Eos, MessageType::Error]).unwrap();
    assert_eq!(msg.message_type(), MessageType::Eos);

    let first = first.lock().unwrap();
    let second = second.lock().unwrap();
    assert_eq!((first.len(), second.len()), (5, 5));
    assert!(first.iter().zip(second.iter()).all(|(x, y)| Buffer::ptr_eq(x, y)));
    drop((first, second));

    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn test_link_from_tee_requests_pad() {
    init_tracing();
    let tee = Tee::new().build("tee");
    let queue = Queue::new().build("queue");
    assert!(tee.src_pads().is_empty());

    tee.link(&queue).unwrap();
    let src_pads = tee.src_pads();
    assert_eq!(src_pads.len(), 1);
    assert_eq!(src_pads[0].peer(), queue.static_pad("sink"));

    // Nothing free on the queue: the pad requested for the attempt is released.
    assert!(tee.link(&queue).is_err());
    assert_eq!(tee.src_pads().len(), 1);
}

/// Pulls the whole stream in fixed-size blocks.
struct PullingSink {
    consumed: Arc<AtomicU64>,
}

impl Sink for PullingSink {
    fn consume(&mut self, buffer: &Buffer) -> Result<()> {
        assert_eq!(buffer.len(), 16);
        self.consumed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn prefers_pull(&self) -> bool {
        true
    }
}

/// Pull mode: the sink drives the source through range requests.
#[test]
fn test_sink_pulls_from_source() {
    init_tracing();
    let pipeline = Pipeline::new("p");
    let consumed = Arc::new(AtomicU64::new(0));
    let src = TestSrc::new().with_blocksize(16).with_num_buffers(4).build("src");
    let settings = SinkSettings {
        sync: false,
        blocksize: 16,
    };
    let sink = Element::new(
        "sink",
        SinkAdapter::with_settings(
            PullingSink {
                consumed: Arc::clone(&consumed),
            },
            settings,
        ),
    );
    pipeline.add_many(&[&src, &sink]).unwrap();
    src.link(&sink).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    let msg = wait_for(&pipeline.bus(), &[MessageType::Eos, MessageType::Error]).unwrap();
    assert_eq!(msg.message_type(), MessageType::Eos);
    assert_eq!(sink.static_pad("sink").unwrap().mode(), PadMode::Pull);
    assert_eq!(consumed.load(Ordering::SeqCst), 4);

    pipeline.set_state(State::Null).unwrap();
}
