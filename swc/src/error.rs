//! Error types for swc operations.

use std::path::PathBuf;
use std::time::Duration;

use swc_proto::{FrameError, MessageType};

use crate::session::{Cause, SessionId, State};

/// Alias for `Result<T, swc::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by client operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The daemon endpoint could not be reached. Retrying later may succeed.
    #[error("cannot connect to {}: {source}", endpoint.display())]
    Connection {
        /// Socket path that was tried.
        endpoint: PathBuf,
        /// Last connect error.
        #[source]
        source: std::io::Error,
    },

    /// The channel closed under us. The in-flight session is failed.
    #[error("connection lost")]
    ConnectionLost,

    /// The inbound stream is corrupt. The connection has been torn down.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The operation is not valid in the current session state.
    #[error("{op} is not allowed in state {state}")]
    State {
        /// Operation that was attempted.
        op: &'static str,
        /// State the session was in.
        state: State,
    },

    /// A bounded wait expired.
    #[error("{op} timed out after {after:?}")]
    Timeout {
        /// Operation that was waiting.
        op: &'static str,
        /// Time waited.
        after: Duration,
    },

    /// The daemon failed the session while the caller was waiting on it.
    #[error("update failed: {0}")]
    Failed(Cause),

    /// The image reader passed to `install` failed. The session has been
    /// cancelled; the connection is still usable.
    #[error("cannot read image: {0}")]
    Image(#[source] std::io::Error),

    /// Any other I/O error from the transport.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// `true` if the connection is gone after this error.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::ConnectionLost | Self::Frame(_) | Self::Io(_))
    }
}

/// A daemon message that was dropped instead of applied.
///
/// Warnings are logged and counted on the session; they never fail it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolWarning {
    /// The message type is not legal in the current state.
    #[error("{kind} not expected in state {state}")]
    Unexpected {
        /// Type of the dropped message.
        kind: MessageType,
        /// State at the time.
        state: State,
    },

    /// The message names a session the client never started.
    #[error("{kind} for unknown session {session} (active session is {active})")]
    UnknownSession {
        /// Type of the dropped message.
        kind: MessageType,
        /// Session named by the message.
        session: SessionId,
        /// Session the client is tracking.
        active: SessionId,
    },

    /// A `DATA_ACK` acknowledged more bytes than were sent.
    #[error("DATA_ACK for {acked} bytes but only {sent} were sent")]
    AckOverrun {
        /// Bytes acknowledged.
        acked: u64,
        /// Bytes sent.
        sent: u64,
    },

    /// A `DATA_ACK` went backwards.
    #[error("DATA_ACK went back from {previous} to {acked} bytes")]
    AckRegressed {
        /// Previously acknowledged total.
        previous: u64,
        /// New, smaller total.
        acked: u64,
    },
}
