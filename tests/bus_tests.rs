//! Integration tests for consuming pipeline messages from the bus.

mod common;

use common::init_tracing;
use sluice::bus::{Bus, BusSyncReply};
use sluice::element::{State, link_many};
use sluice::elements::{FakeSink, TestSrc};
use sluice::message::{Message, MessageType, MessageView};
use sluice::pipeline::Pipeline;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn playing_pipeline(num_buffers: u64) -> Pipeline {
    let pipeline = Pipeline::new("p");
    let src = TestSrc::new().with_num_buffers(num_buffers).build("src");
    let sink = FakeSink::new().build("sink");
    pipeline.add_many(&[&src, &sink]).unwrap();
    link_many(&[&src, &sink]).unwrap();
    pipeline
}

/// An async application loop awaits messages until EOS.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_consumer_sees_eos() {
    init_tracing();
    let pipeline = playing_pipeline(8);
    let bus = pipeline.bus();
    pipeline.set_state(State::Playing).unwrap();

    let consumer = tokio::spawn(async move {
        let mut seen = Vec::new();
        while let Some(msg) = bus.recv_async().await {
            let kind = msg.message_type();
            seen.push((msg.src().to_string(), kind));
            if matches!(kind, MessageType::Eos | MessageType::Error) {
                break;
            }
        }
        seen
    });

    let seen = tokio::time::timeout(Duration::from_secs(5), consumer)
        .await
        .expect("no EOS within five seconds")
        .unwrap();
    assert_eq!(seen.last(), Some(&("p".to_string(), MessageType::Eos)));
    assert!(seen.contains(&("p".to_string(), MessageType::StateChanged)));
    assert!(seen.contains(&("sink".to_string(), MessageType::StateChanged)));

    pipeline.set_state(State::Null).unwrap();
}

/// Messages from one element keep their posting order.
#[tokio::test]
async fn test_async_order_per_source() {
    let bus = Bus::new();
    for n in 0..20u32 {
        bus.post(Message::new("src", MessageView::StreamStart).with_seqnum(n));
    }
    for n in 0..20u32 {
        let msg = bus.recv_async().await.unwrap();
        assert_eq!(msg.seqnum(), n);
    }
    assert!(bus.is_empty());
}

/// A watch receives the pipeline's messages on its own thread.
#[test]
fn test_watch_collects_until_eos() {
    init_tracing();
    let pipeline = playing_pipeline(3);
    let collected: Arc<Mutex<Vec<MessageType>>> = Arc::default();
    let (done_tx, done_rx) = std::sync::mpsc::channel();

    let sink = Arc::clone(&collected);
    let _guard = pipeline
        .bus()
        .add_watch(move |msg| {
            sink.lock().unwrap().push(msg.message_type());
            if msg.message_type() == MessageType::Eos {
                let _ = done_tx.send(());
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        })
        .unwrap();
    assert!(pipeline.bus().add_watch(|_| ControlFlow::Continue(())).is_err());

    pipeline.set_state(State::Playing).unwrap();
    done_rx.recv_timeout(Duration::from_secs(5)).unwrap();

    let collected = collected.lock().unwrap();
    assert_eq!(collected.last(), Some(&MessageType::Eos));
    assert_eq!(
        collected.iter().filter(|t| **t == MessageType::Eos).count(),
        1
    );
    drop(collected);

    pipeline.set_state(State::Null).unwrap();
}

/// A sync handler sees messages in the posting thread and can drop them.
#[test]
fn test_sync_handler_filters() {
    init_tracing();
    let pipeline = playing_pipeline(2);
    let bus = pipeline.bus();
    bus.set_sync_handler(Some(|msg: &Message| match msg.message_type() {
        MessageType::StateChanged => BusSyncReply::Drop,
        _ => BusSyncReply::Pass,
    }));

    pipeline.set_state(State::Playing).unwrap();
    let msg = bus
        .timed_pop_filtered(Duration::from_secs(5), &[MessageType::Eos])
        .unwrap();
    assert_eq!(msg.src(), "p");
    assert!(bus.pop_filtered(&[MessageType::StateChanged]).is_none());

    bus.set_sync_handler(None::<fn(&Message) -> BusSyncReply>);
    pipeline.set_auto_flush_bus(false);
    pipeline.set_state(State::Null).unwrap();
    assert!(bus.pop_filtered(&[MessageType::StateChanged]).is_some());
}
