//! Session records and the values handed to callers.

use std::fmt;

use serde::Serialize;
use swc_proto::{DaemonStatus, PROTOCOL_VERSION, Progress, RunMode, Severity, Start};

/// Client-assigned session identifier, monotonic per [`Client`](crate::Client).
pub type SessionId = u32;

/// Cause text used when the channel drops mid-session.
pub const CONNECTION_LOST: &str = "connection lost";

/// Cause text used when the caller closes the client mid-session.
pub const CONNECTION_CLOSED: &str = "connection closed";

/// Lifecycle state of an update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum State {
    /// No session.
    Idle,
    /// `START` sent, waiting for the daemon's `ACK`.
    AwaitingAck,
    /// Accepted; image bytes may be streamed.
    Streaming,
    /// All bytes delivered; the daemon is installing.
    Installing,
    /// Installed successfully.
    Done,
    /// Rejected or failed.
    Failed,
    /// Cancelled by the caller or the daemon.
    Cancelled,
}

impl State {
    /// `true` for `Done`, `Failed` and `Cancelled`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::AwaitingAck => "awaiting-ack",
            Self::Streaming => "streaming",
            Self::Installing => "installing",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Why a session failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Cause {
    /// Daemon reason / status code, when the daemon supplied one.
    pub code: Option<u32>,
    /// Human-readable cause, e.g. `"BUSY"` or `"connection lost"`.
    pub message: String,
}

impl Cause {
    /// A cause without a daemon code.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// A cause carrying a daemon code.
    pub fn with_code(code: u32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            message: message.into(),
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Final result of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
#[non_exhaustive]
pub enum Outcome {
    /// The daemon reported success.
    Success {
        /// Daemon status code.
        code: u32,
        /// Daemon message.
        message: String,
    },
    /// The session was rejected, failed, or lost its connection.
    Failed(Cause),
    /// The session was cancelled.
    Cancelled,
}

impl Outcome {
    /// `true` for [`Outcome::Success`].
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    /// Terminal state matching this outcome.
    pub const fn state(&self) -> State {
        match self {
            Self::Success { .. } => State::Done,
            Self::Failed(_) => State::Failed,
            Self::Cancelled => State::Cancelled,
        }
    }
}

/// Point-in-time progress snapshot pushed by the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct StatusNotification {
    /// Session the daemon attributed the notification to.
    pub session: SessionId,
    /// Daemon recovery status.
    pub status: DaemonStatus,
    /// Severity of `info`.
    pub severity: Severity,
    /// Total install steps.
    pub nsteps: u32,
    /// Current step.
    pub cur_step: u32,
    /// Percentage of the current step.
    pub percent: u32,
    /// Artifact being installed.
    pub cur_image: String,
    /// Daemon message.
    pub info: String,
}

impl From<Progress> for StatusNotification {
    fn from(p: Progress) -> Self {
        Self {
            session: p.session,
            status: p.status,
            severity: p.severity,
            nsteps: p.nsteps,
            cur_step: p.cur_step,
            percent: p.percent.min(100),
            cur_image: p.cur_image,
            info: p.info,
        }
    }
}

/// Something the caller can observe through [`Client::poll_event`](crate::Client::poll_event).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum Event {
    /// A session changed state.
    StateChanged {
        /// Session that moved.
        session: SessionId,
        /// Previous state.
        from: State,
        /// New state.
        to: State,
    },
    /// Progress for the active session.
    Progress(StatusNotification),
    /// Progress received with no matching active session.
    Unsolicited(StatusNotification),
}

/// Parameters of a new update session.
///
/// ```
/// use swc::UpdateRequest;
///
/// let req = UpdateRequest::new().dry_run(true).software_set("stable");
/// assert_eq!(req.software_set, "stable");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct UpdateRequest {
    /// Install or dry run.
    pub run_mode: RunMode,
    /// Software set selection, empty for the daemon default.
    pub software_set: String,
    /// Running mode selection, empty for the daemon default.
    pub running_mode: String,
    /// Announced image size, if known.
    pub image_size: Option<u64>,
}

impl UpdateRequest {
    /// A request using the daemon's defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects a dry run (`true`) or a real install (`false`).
    #[must_use]
    pub const fn dry_run(mut self, enabled: bool) -> Self {
        self.run_mode = if enabled {
            RunMode::DryRun
        } else {
            RunMode::Install
        };
        self
    }

    /// Sets the software set.
    #[must_use]
    pub fn software_set(mut self, set: impl Into<String>) -> Self {
        self.software_set = set.into();
        self
    }

    /// Sets the running mode.
    #[must_use]
    pub fn running_mode(mut self, mode: impl Into<String>) -> Self {
        self.running_mode = mode.into();
        self
    }

    /// Announces the total image size.
    #[must_use]
    pub const fn image_size(mut self, bytes: u64) -> Self {
        self.image_size = Some(bytes);
        self
    }

    /// Builds the `START` record for session `id`.
    pub(crate) fn to_start(&self, id: SessionId) -> Start {
        Start {
            version: PROTOCOL_VERSION,
            session: id,
            run_mode: self.run_mode,
            software_set: self.software_set.clone(),
            running_mode: self.running_mode.clone(),
            image_size: self.image_size.unwrap_or(0),
        }
    }
}

/// One logical update attempt.
///
/// The client keeps the live record; callers receive clones, which become
/// read-only history once the session is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct UpdateSession {
    /// Session identifier.
    pub id: SessionId,
    /// Current lifecycle state.
    pub state: State,
    /// Request that opened the session.
    pub request: UpdateRequest,
    /// Image bytes handed to the transport.
    pub bytes_sent: u64,
    /// Image bytes the daemon acknowledged (never above `bytes_sent`).
    pub bytes_acked: u64,
    /// Whether the end-of-image marker was sent.
    pub data_complete: bool,
    /// Latest progress notification.
    pub last_status: Option<StatusNotification>,
    /// Daemon messages dropped as protocol warnings.
    pub warnings: u32,
    /// Result, once terminal.
    pub outcome: Option<Outcome>,
}

impl UpdateSession {
    /// A fresh session waiting for its `ACK`.
    pub(crate) const fn new(id: SessionId, request: UpdateRequest) -> Self {
        Self {
            id,
            state: State::AwaitingAck,
            request,
            bytes_sent: 0,
            bytes_acked: 0,
            data_complete: false,
            last_status: None,
            warnings: 0,
            outcome: None,
        }
    }

    /// `true` once the session reached a terminal state.
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
