//! Helpers shared by the integration tests.

#![allow(dead_code)]

use sluice::bus::Bus;
use sluice::message::{Message, MessageType};
use std::time::Duration;

/// Install a log subscriber once; `RUST_LOG` selects the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Wait up to five seconds for one of `types`.
pub fn wait_for(bus: &Bus, types: &[MessageType]) -> Option<Message> {
    bus.timed_pop_filtered(Duration::from_secs(5), types)
}

/// Drain everything currently queued on `bus`.
pub fn drain(bus: &Bus) -> Vec<Message> {
    std::iter::from_fn(|| bus.timed_pop(Duration::from_millis(50))).collect()
}
