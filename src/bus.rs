//! Message bus: an ordered channel from elements to the application.
//!
//! Elements post from any thread; the application drains the bus by
//! polling ([`Bus::pop`], [`Bus::timed_pop_filtered`]), awaiting
//! ([`Bus::recv_async`]), or through a watch callback ([`Bus::add_watch`]).
//! Messages from one element arrive in the order they were posted.
//!
//! # Example
//!
//! ```rust
//! use sluice::bus::Bus;
//! use sluice::message::{Message, MessageType, MessageView};
//! use std::time::Duration;
//!
//! let bus = Bus::new();
//! bus.post(Message::new("src", MessageView::StreamStart));
//! bus.post(Message::new("sink", MessageView::Eos));
//!
//! let msg = bus
//!     .timed_pop_filtered(Duration::from_millis(10), &[MessageType::Eos])
//!     .unwrap();
//! assert_eq!(msg.src(), "sink");
//! assert!(!bus.have_pending());
//! ```

use crate::error::{Error, Result};
use crate::message::{Message, MessageType};
use kanal::{Receiver, Sender};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Verdict of a synchronous bus handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusSyncReply {
    /// Queue the message as usual.
    Pass,
    /// Discard the message.
    Drop,
}

type SyncHandler = dyn Fn(&Message) -> BusSyncReply + Send + Sync;

struct BusInner {
    tx: Sender<Message>,
    rx: Receiver<Message>,
    flushing: AtomicBool,
    sync_handler: Mutex<Option<Arc<SyncHandler>>>,
    watch: Mutex<Option<Sender<Message>>>,
}

/// Shared handle to a message bus.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Create an empty bus.
    pub fn new() -> Self {
        let (tx, rx) = kanal::unbounded();
        Self {
            inner: Arc::new(BusInner {
                tx,
                rx,
                flushing: AtomicBool::new(false),
                sync_handler: Mutex::new(None),
                watch: Mutex::new(None),
            }),
        }
    }

    /// Post a message.
    ///
    /// Returns `false` when the message was dropped because the bus is
    /// flushing or the sync handler discarded it.
    pub fn post(&self, message: Message) -> bool {
        if self.inner.flushing.load(Ordering::Acquire) {
            tracing::trace!("bus flushing, dropping {message}");
            return false;
        }

        let handler = self.inner.sync_handler.lock().unwrap().clone();
        if let Some(handler) = handler
            && handler(&message) == BusSyncReply::Drop
        {
            return false;
        }

        tracing::trace!("bus post: {message}");

        let mut pending = Some(message);
        let mut watch = self.inner.watch.lock().unwrap();
        if let Some(tx) = watch.as_ref() {
            if let Ok(true) = tx.try_send_option(&mut pending) {
                return true;
            }
            // The watch thread ended without handing back its channel.
            tracing::warn!("bus watch thread is gone, queuing on the bus");
            *watch = None;
        }
        drop(watch);
        match pending {
            Some(message) => self.inner.tx.send(message).is_ok(),
            None => true,
        }
    }

    /// Take the next message without blocking.
    pub fn pop(&self) -> Option<Message> {
        self.inner.rx.try_recv().ok().flatten()
    }

    /// Wait up to `timeout` for the next message.
    pub fn timed_pop(&self, timeout: Duration) -> Option<Message> {
        self.inner.rx.recv_timeout(timeout).ok()
    }

    /// Wait up to `timeout` for a message of one of `types`.
    ///
    /// Messages of other types that arrive meanwhile are discarded.
    pub fn timed_pop_filtered(&self, timeout: Duration, types: &[MessageType]) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let msg = if remaining.is_zero() {
                self.pop()?
            } else {
                self.timed_pop(remaining)?
            };
            if types.contains(&msg.message_type()) {
                return Some(msg);
            }
        }
    }

    /// Take the next message of one of `types` without blocking,
    /// discarding others.
    pub fn pop_filtered(&self, types: &[MessageType]) -> Option<Message> {
        self.timed_pop_filtered(Duration::ZERO, types)
    }

    /// Await the next message.
    pub async fn recv_async(&self) -> Option<Message> {
        self.inner.rx.as_async().recv().await.ok()
    }

    /// Whether messages are queued.
    pub fn have_pending(&self) -> bool {
        !self.inner.rx.is_empty()
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.inner.rx.len()
    }

    /// Whether no messages are queued.
    pub fn is_empty(&self) -> bool {
        self.inner.rx.is_empty()
    }

    /// While flushing, queued messages are discarded and posts are dropped.
    pub fn set_flushing(&self, flushing: bool) {
        self.inner.flushing.store(flushing, Ordering::Release);
        if flushing {
            while self.pop().is_some() {}
        }
        tracing::debug!("bus flushing: {flushing}");
    }

    /// Whether the bus is flushing.
    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.load(Ordering::Acquire)
    }

    /// Install a handler called synchronously, in the posting thread, for
    /// every message. It may inspect the message and decide to drop it.
    pub fn set_sync_handler<F>(&self, handler: Option<F>)
    where
        F: Fn(&Message) -> BusSyncReply + Send + Sync + 'static,
    {
        *self.inner.sync_handler.lock().unwrap() =
            handler.map(|h| Arc::new(h) as Arc<SyncHandler>);
    }

    /// Dispatch every message to `callback` on a dedicated thread.
    ///
    /// Queued messages are handed over first. The watch ends when the
    /// callback returns [`ControlFlow::Break`] or the returned guard is
    /// dropped. Only one watch can be active.
    pub fn add_watch<F>(&self, mut callback: F) -> Result<BusWatchGuard>
    where
        F: FnMut(&Message) -> ControlFlow<()> + Send + 'static,
    {
        let mut watch = self.inner.watch.lock().unwrap();
        if watch.is_some() {
            return Err(Error::InvalidArgument("bus already has a watch".into()));
        }
        let (tx, rx) = kanal::unbounded::<Message>();
        while let Some(msg) = self.pop() {
            let _ = tx.send(msg);
        }
        *watch = Some(tx);
        drop(watch);

        let bus = Arc::downgrade(&self.inner);
        let handle = std::thread::Builder::new()
            .name("bus-watch".into())
            .spawn(move || {
                while let Ok(msg) = rx.recv() {
                    if callback(&msg).is_break() {
                        break;
                    }
                }
                // Hand undelivered messages back to the queue.
                if let Some(bus) = bus.upgrade() {
                    bus.watch.lock().unwrap().take();
                    while let Ok(Some(msg)) = rx.try_recv() {
                        let _ = bus.tx.send(msg);
                    }
                }
                tracing::trace!("bus watch finished");
            })?;

        Ok(BusWatchGuard {
            bus: Arc::downgrade(&self.inner),
            handle: Some(handle),
        })
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("pending", &self.len())
            .field("flushing", &self.is_flushing())
            .finish()
    }
}

/// Keeps a bus watch alive; dropping it removes the watch.
pub struct BusWatchGuard {
    bus: Weak<BusInner>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for BusWatchGuard {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            // Dropping the sender ends the watch thread's receive loop.
            bus.watch.lock().unwrap().take();
        }
        if let Some(handle) = self.handle.take()
            && handle.thread().id() != std::thread::current().id()
        {
            let _ = handle.join();
        }
    }
}
