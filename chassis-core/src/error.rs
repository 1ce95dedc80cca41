/// Chassis Error Types
///
/// Every asynchronous outcome in the engine is reported through a promise,
/// and the same cause is often handed to many promises at once (a close fails
/// every queued write), so the error type is cheap to clone.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Main error type for channel operations
#[derive(Error, Debug, Clone)]
pub enum ChannelError {
    /// The channel is closed, or its outbound buffer was already released
    #[error("Channel closed")]
    Closed,

    /// A flush was attempted on an open channel that is not active yet
    #[error("Channel not yet connected")]
    NotYetConnected,

    /// IO error reported by a transport hook
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// An executor refused to accept a task
    #[error("Task rejected: {0}")]
    Rejected(String),

    /// Operation invoked in a state that does not permit it
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Invalid argument (promise, handler name, option value, ...)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The event loop type cannot drive this channel's transport
    #[error("Incompatible event loop type: {0}")]
    IncompatibleEventLoop(String),

    /// The promise was cancelled before the operation completed
    #[error("Operation cancelled")]
    Cancelled,

    /// A blocking wait was attempted on the executor that must complete it
    #[error("Blocking wait on the event loop thread would deadlock")]
    BlockingOperation,

    /// Failure raised by a pipeline handler
    #[error("Handler error: {0}")]
    Handler(String),

    /// A handler, task or listener panicked
    #[error("Panicked: {0}")]
    Panicked(String),

    /// Connect did not complete within the configured timeout
    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(Duration),
}

/// Result type alias for channel operations
pub type Result<T, E = ChannelError> = std::result::Result<T, E>;

impl From<io::Error> for ChannelError {
    fn from(err: io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl ChannelError {
    /// Create an illegal state error with a message
    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::IllegalState(msg.into())
    }

    /// Create an invalid argument error with a message
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a handler error with a message
    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    /// Create a rejected execution error with a message
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }

    /// Convert a caught panic payload into an error.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Self::Panicked(msg)
    }

    /// True if this failure came out of a transport I/O hook.
    #[must_use]
    pub const fn is_io(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// True if this error reports a closed channel.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// The io error kind, if this is an I/O failure.
    #[must_use]
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Io(e) => Some(e.kind()),
            _ => None,
        }
    }
}
