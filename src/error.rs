//! Error types for campipe.
//!
//! Every failure is returned to the immediate caller; nothing is retried
//! inside the core. [`Error::kind`] groups the variants so callers can decide
//! whether to retry on the next event (buffer availability, next interrupt)
//! or treat the failure as a bug in the calling code.

use crate::bus::Direction;
use thiserror::Error;

/// Result type alias using campipe's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for campipe operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed parameters (bind record, configuration, payload size).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An instance identifier outside the configured range.
    #[error("instance {id} out of range (max {max})")]
    InvalidInstance {
        /// The rejected identifier.
        id: u32,
        /// Number of configured instances.
        max: u32,
    },

    /// Operation not allowed in the current lifecycle state.
    #[error("invalid state transition: {from} -> {to}")]
    InvalidState {
        /// State the object was in.
        from: &'static str,
        /// State or operation that was requested.
        to: &'static str,
    },

    /// Pre-allocation failed (zero capacity or memory could not be reserved).
    #[error("allocation failed: {0}")]
    AllocationFailed(String),

    /// Job queue has no idle slot left.
    #[error("job queue full")]
    QueueFull,

    /// Job queue has no ready item.
    #[error("job queue empty")]
    QueueEmpty,

    /// Admission scheduler node pool is exhausted.
    #[error("no free schedule node")]
    NoFreeNode,

    /// Extra-buffer pool has no slot large enough or free.
    #[error("no space in extra-buffer pool")]
    NoExtraSpace,

    /// Bus ring has reached its outstanding-message limit.
    #[error("bus ring full, retry later")]
    RetryLater,

    /// The same direction registered twice for one logical id.
    #[error("endpoint {id:#x} already bound for {direction}")]
    AlreadyBound {
        /// Logical endpoint id.
        id: u32,
        /// Direction that was registered twice.
        direction: Direction,
    },

    /// All synchronous wait slots are in use.
    #[error("no free wait slot for synchronous post")]
    NoWaitSlot,

    /// Instance already has a busy schedule node.
    #[error("instance {0} already scheduled")]
    AlreadyScheduled(u32),

    /// A blocking or allocating operation was called from interrupt context.
    #[error("{0} is not allowed in interrupt context")]
    InInterrupt(&'static str),

    /// A wire message failed to decode.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// Synchronous post got no reply in time.
    #[error("synchronous post timed out after {waited_ms} ms")]
    Timeout {
        /// Milliseconds spent waiting.
        waited_ms: u64,
    },

    /// Post to an endpoint without a bound peer.
    #[error("endpoint {0:#x} has no bound peer")]
    Unbound(u32),
}

/// Coarse classification of [`Error`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected synchronously, never retried automatically.
    InvalidArgument,
    /// Normal back-pressure; retry on the next event.
    Busy,
    /// Misuse of the API; do not retry blindly.
    Protocol,
    /// Soft failure; the peer may still act on the message.
    Timeout,
    /// No peer to deliver to.
    Unbound,
    /// Memory could not be reserved up front.
    Allocation,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) | Error::InvalidInstance { .. } | Error::InvalidState { .. } => {
                ErrorKind::InvalidArgument
            }
            Error::AllocationFailed(_) => ErrorKind::Allocation,
            Error::QueueFull
            | Error::QueueEmpty
            | Error::NoFreeNode
            | Error::NoExtraSpace
            | Error::RetryLater => ErrorKind::Busy,
            Error::AlreadyBound { .. }
            | Error::NoWaitSlot
            | Error::AlreadyScheduled(_)
            | Error::InInterrupt(_)
            | Error::Malformed(_) => ErrorKind::Protocol,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Unbound(_) => ErrorKind::Unbound,
        }
    }

    /// Whether the caller may simply retry on the next event.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Busy
    }

    /// Numeric code carried in a bus reply's `result` field.
    ///
    /// Codes are negative errno-style values; `0` is success.
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) | Error::InvalidInstance { .. } => -22,
            Error::InvalidState { .. } => -1,
            Error::AllocationFailed(_) => -12,
            Error::QueueFull | Error::NoFreeNode | Error::NoExtraSpace => -28,
            Error::QueueEmpty => -61,
            Error::RetryLater => -11,
            Error::AlreadyBound { .. } | Error::AlreadyScheduled(_) => -17,
            Error::NoWaitSlot => -16,
            Error::InInterrupt(_) => -35,
            Error::Malformed(_) => -74,
            Error::Timeout { .. } => -62,
            Error::Unbound(_) => -107,
        }
    }
}
