//! Messages posted by elements for the application.

use crate::caps::Structure;
use crate::clock::{Clock, ClockTime};
use crate::element::State;
use crate::error::Error;
use crate::event::{TagList, next_seqnum};
use std::fmt;
use std::sync::Arc;

/// Kind of a message, for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// See [`MessageView::Eos`].
    Eos,
    /// See [`MessageView::Error`].
    Error,
    /// See [`MessageView::Warning`].
    Warning,
    /// See [`MessageView::Info`].
    Info,
    /// See [`MessageView::Tag`].
    Tag,
    /// See [`MessageView::StateChanged`].
    StateChanged,
    /// See [`MessageView::AsyncStart`].
    AsyncStart,
    /// See [`MessageView::AsyncDone`].
    AsyncDone,
    /// See [`MessageView::StreamStart`].
    StreamStart,
    /// See [`MessageView::NewClock`].
    NewClock,
    /// See [`MessageView::SegmentDone`].
    SegmentDone,
    /// See [`MessageView::Element`].
    Element,
    /// See [`MessageView::Application`].
    Application,
}

/// Message payload.
#[derive(Clone)]
pub enum MessageView {
    /// Every sink of the source reached end-of-stream.
    Eos,
    /// A fatal error.
    Error {
        /// The error.
        error: Arc<Error>,
        /// Extra detail for debugging.
        debug: Option<String>,
    },
    /// A recoverable problem.
    Warning {
        /// Description.
        message: String,
        /// Extra detail for debugging.
        debug: Option<String>,
    },
    /// Informational notice.
    Info {
        /// Description.
        message: String,
    },
    /// Stream metadata found.
    Tag(TagList),
    /// The source committed a state step.
    StateChanged {
        /// State before the step.
        old: State,
        /// State after the step.
        new: State,
        /// Final target, or `VoidPending` when reached.
        pending: State,
    },
    /// The source started an asynchronous state change.
    AsyncStart,
    /// The source completed an asynchronous state change.
    AsyncDone {
        /// Running time at completion, if known.
        running_time: ClockTime,
    },
    /// A new stream started flowing to a sink.
    StreamStart,
    /// The pipeline selected a clock.
    NewClock {
        /// The selected clock.
        clock: Arc<dyn Clock>,
    },
    /// A segment seek played to its end.
    SegmentDone {
        /// Final position.
        position: u64,
    },
    /// Element-specific notification.
    Element(Structure),
    /// Application-defined message.
    Application(Structure),
}

/// A message and its origin.
#[derive(Clone)]
pub struct Message {
    src: String,
    seqnum: u32,
    view: MessageView,
}

impl Message {
    /// Create a message originating from the element named `src`.
    pub fn new(src: impl Into<String>, view: MessageView) -> Self {
        Self {
            src: src.into(),
            seqnum: next_seqnum(),
            view,
        }
    }

    /// Convenience constructor for error messages.
    pub fn error(src: impl Into<String>, error: Error, debug: Option<String>) -> Self {
        Self::new(
            src,
            MessageView::Error {
                error: Arc::new(error),
                debug,
            },
        )
    }

    /// Convenience constructor for warning messages.
    pub fn warning(src: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(
            src,
            MessageView::Warning {
                message: message.into(),
                debug: None,
            },
        )
    }

    /// Convenience constructor for state-changed messages.
    pub fn state_changed(src: impl Into<String>, old: State, new: State, pending: State) -> Self {
        Self::new(src, MessageView::StateChanged { old, new, pending })
    }

    /// Tie this message to an event or another message.
    pub fn with_seqnum(mut self, seqnum: u32) -> Self {
        self.seqnum = seqnum;
        self
    }

    /// Name of the element that posted the message.
    pub fn src(&self) -> &str {
        &self.src
    }

    /// Sequence number.
    pub fn seqnum(&self) -> u32 {
        self.seqnum
    }

    /// Payload.
    pub fn view(&self) -> &MessageView {
        &self.view
    }

    /// Kind of the payload.
    pub fn message_type(&self) -> MessageType {
        match self.view {
            MessageView::Eos => MessageType::Eos,
            MessageView::Error { .. } => MessageType::Error,
            MessageView::Warning { .. } => MessageType::Warning,
            MessageView::Info { .. } => MessageType::Info,
            MessageView::Tag(_) => MessageType::Tag,
            MessageView::StateChanged { .. } => MessageType::StateChanged,
            MessageView::AsyncStart => MessageType::AsyncStart,
            MessageView::AsyncDone { .. } => MessageType::AsyncDone,
            MessageView::StreamStart => MessageType::StreamStart,
            MessageView::NewClock { .. } => MessageType::NewClock,
            MessageView::SegmentDone { .. } => MessageType::SegmentDone,
            MessageView::Element(_) => MessageType::Element,
            MessageView::Application(_) => MessageType::Application,
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message({self})")
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.view {
            MessageView::Eos => write!(f, "{}: EOS", self.src),
            MessageView::Error { error, debug } => match debug {
                Some(d) => write!(f, "{}: error: {error} ({d})", self.src),
                None => write!(f, "{}: error: {error}", self.src),
            },
            MessageView::Warning { message, .. } => write!(f, "{}: warning: {message}", self.src),
            MessageView::Info { message } => write!(f, "{}: info: {message}", self.src),
            MessageView::Tag(tags) => write!(f, "{}: {} tags", self.src, tags.len()),
            MessageView::StateChanged { old, new, pending } => {
                write!(f, "{}: state {old} -> {new} (pending {pending})", self.src)
            }
            MessageView::AsyncStart => write!(f, "{}: async-start", self.src),
            MessageView::AsyncDone { .. } => write!(f, "{}: async-done", self.src),
            MessageView::StreamStart => write!(f, "{}: stream-start", self.src),
            MessageView::NewClock { clock } => write!(f, "{}: new clock {}", self.src, clock.name()),
            MessageView::SegmentDone { position } => {
                write!(f, "{}: segment-done at {position}", self.src)
            }
            MessageView::Element(s) => write!(f, "{}: element {s}", self.src),
            MessageView::Application(s) => write!(f, "{}: application {s}", self.src),
        }
    }
}
