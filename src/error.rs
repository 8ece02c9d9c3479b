//! Error types for sluice.
//!
//! Three families of failure travel through the core:
//!
//! - [`Error`]: API misuse and setup failures (bad caps strings, unknown
//!   factories, bin membership conflicts). Returned as [`Result`].
//! - [`FlowError`]: per-buffer dataflow outcomes returned from push and pull
//!   calls. Only the fatal ones are escalated to the bus.
//! - [`StateChangeError`] / [`PadLinkError`]: results of the state machine and
//!   of pad linking.

use thiserror::Error;

/// Result type alias using sluice's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sluice operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A state change was refused by an element.
    #[error("state change failed: {0}")]
    StateChange(#[from] StateChangeError),

    /// Two pads could not be linked.
    #[error("pad link failed: {0}")]
    Link(#[from] PadLinkError),

    /// A dataflow call returned a non-ok flow result.
    #[error("flow error: {0}")]
    Flow(#[from] FlowError),

    /// A textual caps description could not be parsed.
    #[error("invalid caps description: {0}")]
    CapsParse(String),

    /// Caps could not be negotiated or fixated.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// No factory with the given name is registered.
    #[error("no element factory named '{0}'")]
    NoSuchFactory(String),

    /// No element with the given name exists.
    #[error("no element named '{0}'")]
    NoSuchElement(String),

    /// No pad with the given name exists on the element.
    #[error("no pad named '{0}'")]
    NoSuchPad(String),

    /// The element is already owned by a bin.
    #[error("element '{0}' already has a parent")]
    AlreadyParented(String),

    /// The bin already holds a child with this name.
    #[error("bin already contains an element named '{0}'")]
    DuplicateName(String),

    /// The element is not a child of the bin.
    #[error("element '{0}' is not a child of this bin")]
    NotAChild(String),

    /// An argument was outside of the accepted domain.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A processing unit reported a fault.
    #[error("element error: {0}")]
    Element(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// Flow Results
// ============================================================================

/// Non-ok outcome of a push or pull call.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowError {
    /// The pad has no peer.
    #[error("not-linked")]
    NotLinked,
    /// The pad is flushing or inactive.
    #[error("flushing")]
    Flushing,
    /// The receiver already saw end-of-stream.
    #[error("eos")]
    Eos,
    /// No format was agreed on the link.
    #[error("not-negotiated")]
    NotNegotiated,
    /// A processing hook reported an internal fault.
    #[error("error")]
    Error,
    /// The operation is not supported on this pad.
    #[error("not-supported")]
    NotSupported,
}

impl FlowError {
    /// Whether this result should stop the stream and be reported on the bus.
    ///
    /// `Flushing` and `Eos` are regular shutdown conditions.
    pub fn is_fatal(self) -> bool {
        !matches!(self, FlowError::Flushing | FlowError::Eos)
    }
}

/// Successful outcome of a push or pull call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FlowSuccess {
    /// Data was accepted.
    #[default]
    Ok,
}

/// Result of a dataflow call.
pub type FlowResult = std::result::Result<FlowSuccess, FlowError>;

// ============================================================================
// State Change / Link Errors
// ============================================================================

/// A state transition was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[error("state change failure")]
pub struct StateChangeError;

/// Reason a pad link was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadLinkError {
    /// The pads do not form a source to sink pair.
    #[error("pads have wrong direction")]
    WrongDirection,
    /// One of the pads already has a peer.
    #[error("pad was already linked")]
    WasLinked,
    /// The caps of the pads have no common format.
    #[error("pads have no common format")]
    NoFormat,
    /// The pads' elements do not share a parent bin.
    #[error("pads are in different bins")]
    WrongHierarchy,
    /// A pad is not owned by any element.
    #[error("pad has no parent element")]
    NoParent,
}
