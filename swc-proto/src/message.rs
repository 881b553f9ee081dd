//! Protocol message types for client↔daemon communication.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol revision carried in [`Start`] and echoed in [`Ack`].
pub const PROTOCOL_VERSION: u8 = 1;

/// Wire type tag of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[non_exhaustive]
pub enum MessageType {
    /// Client asks the daemon to open an update session.
    Start = 1,
    /// Daemon accepts or rejects a [`MessageType::Start`].
    Ack = 2,
    /// Client streams image bytes.
    Data = 3,
    /// Daemon acknowledges received image bytes.
    DataAck = 4,
    /// Daemon progress notification.
    Progress = 5,
    /// Daemon reports a successful install.
    Success = 6,
    /// Daemon reports a failed session.
    Error = 7,
    /// Cancel request (client) or cancel confirmation (daemon).
    Cancel = 8,
}

impl MessageType {
    /// Maps a wire tag back to its type, `None` for unrecognized tags.
    pub const fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            1 => Self::Start,
            2 => Self::Ack,
            3 => Self::Data,
            4 => Self::DataAck,
            5 => Self::Progress,
            6 => Self::Success,
            7 => Self::Error,
            8 => Self::Cancel,
            _ => return None,
        })
    }

    /// Upper-case wire name, as used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Ack => "ACK",
            Self::Data => "DATA",
            Self::DataAck => "DATA_ACK",
            Self::Progress => "PROGRESS",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::Cancel => "CANCEL",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether the daemon should really install or only validate the image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
#[non_exhaustive]
pub enum RunMode {
    /// Let the daemon apply its configured default.
    #[default]
    Default = 0,
    /// Install the image.
    Install = 1,
    /// Parse and verify, but do not write anything.
    DryRun = 2,
}

impl RunMode {
    /// Maps a wire byte to a run mode.
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Default),
            1 => Some(Self::Install),
            2 => Some(Self::DryRun),
            _ => None,
        }
    }
}

/// Daemon-side recovery status reported in [`Progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
#[non_exhaustive]
pub enum DaemonStatus {
    /// Nothing running.
    Idle = 0,
    /// Update accepted, installation starting.
    Start = 1,
    /// Installation running.
    Run = 2,
    /// Installation succeeded.
    Success = 3,
    /// Installation failed.
    Failure = 4,
    /// Image is being downloaded.
    Download = 5,
    /// Daemon finished post-processing.
    Done = 6,
    /// Message relayed from a daemon subprocess.
    Subprocess = 7,
    /// Percentage-only update.
    Progress = 8,
}

impl DaemonStatus {
    /// Maps a wire byte to a status.
    pub const fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Idle,
            1 => Self::Start,
            2 => Self::Run,
            3 => Self::Success,
            4 => Self::Failure,
            5 => Self::Download,
            6 => Self::Done,
            7 => Self::Subprocess,
            8 => Self::Progress,
            _ => return None,
        })
    }

    /// `true` for statuses after which the daemon is idle again.
    pub const fn is_final(self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Done)
    }
}

/// Severity attached to a [`Progress`] notification.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
#[non_exhaustive]
pub enum Severity {
    /// Informational.
    #[default]
    Info = 0,
    /// Something unexpected, update continues.
    Warn = 1,
    /// Error condition.
    Error = 2,
}

impl Severity {
    /// Maps a wire byte to a severity.
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Info),
            1 => Some(Self::Warn),
            2 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Request to open an update session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Start {
    /// Client protocol revision.
    pub version: u8,
    /// Client-assigned session identifier.
    pub session: u32,
    /// Install or dry run.
    pub run_mode: RunMode,
    /// Software set to select (empty for daemon default).
    pub software_set: String,
    /// Running mode to select (empty for daemon default).
    pub running_mode: String,
    /// Announced image size in bytes, `0` if unknown.
    pub image_size: u64,
}

/// Daemon reply to [`Start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    /// Daemon protocol revision.
    pub version: u8,
    /// Session this reply refers to.
    pub session: u32,
    /// Whether the session was accepted.
    pub accepted: bool,
    /// Numeric rejection reason (`0` when accepted).
    pub reason_code: u32,
    /// Human-readable rejection reason, e.g. `"BUSY"`.
    pub reason: String,
}

/// Cumulative acknowledgment of image bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataAck {
    /// Session this acknowledgment refers to.
    pub session: u32,
    /// Total bytes the daemon has consumed so far.
    pub acked: u64,
}

/// A progress notification pushed by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Session the notification refers to.
    pub session: u32,
    /// Daemon recovery status.
    pub status: DaemonStatus,
    /// Notification severity.
    pub severity: Severity,
    /// Total number of install steps.
    pub nsteps: u32,
    /// Current step (1-based, `0` before the first step).
    pub cur_step: u32,
    /// Percentage of the current step, `0..=100`.
    pub percent: u32,
    /// Name of the artifact being installed.
    pub cur_image: String,
    /// Free-form text from the daemon.
    pub info: String,
}

/// Outcome record carried by [`Message::Success`] and [`Message::Error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    /// Session the report refers to.
    pub session: u32,
    /// Daemon status or reason code.
    pub code: u32,
    /// Human-readable message.
    pub message: String,
}

/// One decoded frame.
///
/// A session streams one [`Message::Start`], any number of
/// [`Message::Data`] chunks, then an empty `Data` marking the end of the
/// image. The daemon answers with `Ack`, `DataAck`s, `Progress` and exactly
/// one of `Success` / `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Message {
    /// Open a session.
    Start(Start),
    /// Accept or reject a session.
    Ack(Ack),
    /// Image bytes; empty `bytes` marks end of image.
    Data {
        /// Session the bytes belong to.
        session: u32,
        /// Raw image bytes.
        bytes: Vec<u8>,
    },
    /// Cumulative byte acknowledgment.
    DataAck(DataAck),
    /// Progress notification.
    Progress(Progress),
    /// Install succeeded.
    Success(Report),
    /// Session failed.
    Error(Report),
    /// Cancel request or confirmation.
    Cancel {
        /// Session to cancel.
        session: u32,
    },
}

impl Message {
    /// Wire tag of this message.
    pub const fn kind(&self) -> MessageType {
        match self {
            Self::Start(_) => MessageType::Start,
            Self::Ack(_) => MessageType::Ack,
            Self::Data { .. } => MessageType::Data,
            Self::DataAck(_) => MessageType::DataAck,
            Self::Progress(_) => MessageType::Progress,
            Self::Success(_) => MessageType::Success,
            Self::Error(_) => MessageType::Error,
            Self::Cancel { .. } => MessageType::Cancel,
        }
    }

    /// Session identifier the message refers to.
    pub const fn session(&self) -> u32 {
        match self {
            Self::Start(m) => m.session,
            Self::Ack(m) => m.session,
            Self::Data { session, .. } | Self::Cancel { session } => *session,
            Self::DataAck(m) => m.session,
            Self::Progress(m) => m.session,
            Self::Success(m) | Self::Error(m) => m.session,
        }
    }
}
