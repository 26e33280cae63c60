use std::fmt;
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// Which device operation a transport failure happened in. Carried on the
/// `failed` signal so subscribers can tell an open failure from a mid-drain
/// send failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    Open,
    Close,
    Send,
}

impl DeviceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceAction::Open => "open",
            DeviceAction::Close => "close",
            DeviceAction::Send => "send",
        }
    }
}

impl fmt::Display for DeviceAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure from a transport's open/close/send, preserving the underlying
/// I/O error and its source chain.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct TransportError(#[from] io::Error);

impl TransportError {
    pub fn kind(&self) -> io::ErrorKind {
        self.0.kind()
    }
}

/// Errors surfaced to callers, either synchronously or through a completion.
///
/// Completions may fan a single failure out to several waiters, so this type
/// is `Clone`; the transport error is shared behind an `Arc` for that reason.
#[derive(Debug, Error, Clone)]
pub enum LinkError {
    #[error("transport {action} failed: {source}")]
    Transport {
        action: DeviceAction,
        #[source]
        source: Arc<TransportError>,
    },

    #[error("transmit cancelled")]
    Cancelled,

    #[error("frame expired")]
    Expired,

    #[error("device was reset")]
    DeviceReset,

    #[error("device has been dropped")]
    DeviceDetached,

    #[error("did not find sent data in the transmit buffer")]
    BufferMismatch,

    #[error("pass a callback or a completion, not both")]
    CallbackConflict,

    #[error("an event loop is already defined")]
    LoopConflict,

    #[error("KISS port {0} out of range")]
    PortOutOfRange(u8),
}

impl LinkError {
    pub(crate) fn transport(action: DeviceAction, error: TransportError) -> Self {
        LinkError::Transport {
            action,
            source: Arc::new(error),
        }
    }
}

impl PartialEq for LinkError {
    fn eq(&self, other: &Self) -> bool {
        use LinkError::*;
        match (self, other) {
            (
                Transport { action, source },
                Transport {
                    action: other_action,
                    source: other_source,
                },
            ) => action == other_action && source.to_string() == other_source.to_string(),
            (Cancelled, Cancelled)
            | (Expired, Expired)
            | (DeviceReset, DeviceReset)
            | (DeviceDetached, DeviceDetached)
            | (BufferMismatch, BufferMismatch)
            | (CallbackConflict, CallbackConflict)
            | (LoopConflict, LoopConflict) => true,
            (PortOutOfRange(port), PortOutOfRange(other_port)) => port == other_port,
            _ => false,
        }
    }
}

impl Eq for LinkError {}

/// Payload of a KISS device's `failed` signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceFailure {
    pub action: DeviceAction,
    pub error: LinkError,
}
