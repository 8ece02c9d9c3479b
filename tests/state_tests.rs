//! Integration tests for the element state machine inside pipelines.

mod common;

use common::{drain, init_tracing, wait_for};
use sluice::element::{
    Element, ElementImpl, State, StateChange, StateChangeResult, StateChangeSuccess, link_many,
};
use sluice::elements::{FakeSink, Identity, TestSrc};
use sluice::error::StateChangeError;
use sluice::message::{MessageType, MessageView};
use sluice::pipeline::Pipeline;
use std::time::Duration;

/// Refuses to acquire its resources.
struct Broken;

impl ElementImpl for Broken {
    fn change_state(&self, _element: &Element, transition: StateChange) -> StateChangeResult {
        match transition {
            StateChange::NullToReady => Err(StateChangeError),
            _ => Ok(StateChangeSuccess::Success),
        }
    }
}

fn state_changes(pipeline: &Pipeline) -> Vec<(String, State, State)> {
    drain(&pipeline.bus())
        .into_iter()
        .filter_map(|m| match m.view() {
            MessageView::StateChanged { old, new, .. } => Some((m.src().to_string(), *old, *new)),
            _ => None,
        })
        .collect()
}

#[test]
fn test_repeated_request_is_idempotent() {
    init_tracing();
    let pipeline = Pipeline::new("p");
    let identity = Identity::new().build("identity");
    pipeline.add(&identity).unwrap();

    assert_eq!(pipeline.set_state(State::Ready), Ok(StateChangeSuccess::Success));
    assert!(!state_changes(&pipeline).is_empty());

    assert_eq!(pipeline.set_state(State::Ready), Ok(StateChangeSuccess::Success));
    assert!(state_changes(&pipeline).is_empty());
    assert_eq!(identity.current_state(), State::Ready);

    pipeline.set_state(State::Null).unwrap();
}

#[test]
fn test_steps_reported_in_order() {
    init_tracing();
    let pipeline = Pipeline::new("p");
    pipeline.set_auto_flush_bus(false);
    pipeline.set_state(State::Playing).unwrap();
    pipeline.set_state(State::Null).unwrap();

    let steps: Vec<(State, State)> = state_changes(&pipeline)
        .into_iter()
        .filter(|(src, _, _)| src == "p")
        .map(|(_, old, new)| (old, new))
        .collect();
    assert_eq!(
        steps,
        [
            (State::Null, State::Ready),
            (State::Ready, State::Paused),
            (State::Paused, State::Playing),
            (State::Playing, State::Paused),
            (State::Paused, State::Ready),
            (State::Ready, State::Null),
        ]
    );
}

/// A failing child fails the bin's change and posts an error naming it;
/// its sibling is still brought up.
#[test]
fn test_failure_reported_with_origin() {
    init_tracing();
    let pipeline = Pipeline::new("p");
    let broken = Element::new("broken", Broken);
    let identity = Identity::new().build("identity");
    pipeline.add_many(&[&broken, &identity]).unwrap();

    assert_eq!(pipeline.set_state(State::Ready), Err(StateChangeError));
    let msg = wait_for(&pipeline.bus(), &[MessageType::Error]).unwrap();
    assert_eq!(msg.src(), "broken");
    assert_eq!(broken.current_state(), State::Null);
    assert_eq!(identity.current_state(), State::Ready);
    assert_eq!(pipeline.current_state(), State::Null);

    // The pipeline never left NULL; its children are the caller's to reset.
    identity.set_state(State::Null).unwrap();
}

/// Sinks preroll: READY → PAUSED completes once a buffer arrived.
#[test]
fn test_preroll_completes_async() {
    init_tracing();
    let pipeline = Pipeline::new("p");
    let src = TestSrc::new().build("src");
    let sink = FakeSink::new().build("sink");
    pipeline.add_many(&[&src, &sink]).unwrap();
    link_many(&[&src, &sink]).unwrap();

    // The sink may preroll before the bin finished its own step.
    assert!(pipeline.set_state(State::Paused).is_ok());
    let (result, current, pending) = pipeline.get_state(Some(Duration::from_secs(5)));
    assert_eq!(result, Ok(StateChangeSuccess::Success));
    assert_eq!((current, pending), (State::Paused, State::VoidPending));

    let imp = sink.imp_as::<sluice::elements::base::SinkAdapter<FakeSink>>().unwrap();
    assert_eq!(imp.sink().prerolled_count(), 1);
    assert_eq!(imp.sink().rendered_count(), 0);

    pipeline.set_state(State::Null).unwrap();
}

/// A live source cannot preroll: PAUSED is reported as no-preroll.
#[test]
fn test_live_source_no_preroll() {
    init_tracing();
    let pipeline = Pipeline::new("p");
    let src = TestSrc::new().with_live(true).build("src");
    let sink = FakeSink::new().build("sink");
    pipeline.add_many(&[&src, &sink]).unwrap();
    link_many(&[&src, &sink]).unwrap();

    assert_eq!(pipeline.set_state(State::Paused), Ok(StateChangeSuccess::NoPreroll));
    let (result, current, _) = pipeline.get_state(Some(Duration::from_millis(100)));
    assert_eq!(result, Ok(StateChangeSuccess::NoPreroll));
    assert_eq!(current, State::Paused);

    pipeline.set_state(State::Playing).unwrap();
    let (_, current, _) = pipeline.get_state(Some(Duration::from_secs(5)));
    assert_eq!(current, State::Playing);
    pipeline.set_state(State::Null).unwrap();
}

/// Going down while a preroll is pending does not wait for it.
#[test]
fn test_down_while_async_pending() {
    init_tracing();
    let pipeline = Pipeline::new("p");
    let sink = FakeSink::new().build("sink");
    pipeline.add(&sink).unwrap();

    assert_eq!(pipeline.set_state(State::Paused), Ok(StateChangeSuccess::Async));
    let (result, current, pending) = pipeline.get_state(Some(Duration::from_millis(50)));
    assert_eq!(result, Ok(StateChangeSuccess::Async));
    assert_eq!((current, pending), (State::Ready, State::Paused));

    assert_eq!(pipeline.set_state(State::Null), Ok(StateChangeSuccess::Success));
    assert_eq!(pipeline.current_state(), State::Null);
    assert_eq!(sink.current_state(), State::Null);
}

/// Pausing and resuming a running pipeline.
#[test]
fn test_pause_resume_keeps_state() {
    init_tracing();
    let pipeline = Pipeline::new("p");
    let src = TestSrc::new().build("src");
    let sink = FakeSink::new().build("sink");
    pipeline.add_many(&[&src, &sink]).unwrap();
    link_many(&[&src, &sink]).unwrap();

    pipeline.set_state(State::Playing).unwrap();
    let (_, current, _) = pipeline.get_state(Some(Duration::from_secs(5)));
    assert_eq!(current, State::Playing);

    pipeline.set_state(State::Paused).unwrap();
    let (result, current, _) = pipeline.get_state(Some(Duration::from_secs(5)));
    assert!(result.is_ok());
    assert_eq!(current, State::Paused);

    pipeline.set_state(State::Playing).unwrap();
    let (_, current, _) = pipeline.get_state(Some(Duration::from_secs(5)));
    assert_eq!(current, State::Playing);
    assert_eq!(sink.current_state(), State::Playing);

    pipeline.set_state(State::Null).unwrap();
    assert_eq!(src.current_state(), State::Null);
}
