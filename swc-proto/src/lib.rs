//! Wire protocol between an update client and the update daemon.
//!
//! Every frame carries a 4-byte magic marker, a one-byte [`MessageType`]
//! tag and a big-endian `u32` payload length, suitable for any reliable
//! byte stream (Unix socket, TCP, pipe). [`FrameDecoder`] reassembles
//! frames from arbitrarily split reads.

mod codec;
mod message;

pub use codec::{
    DATA_OVERHEAD, DEFAULT_MAX_PAYLOAD, FrameDecoder, FrameError, HEADER_LEN, MAGIC,
    MAX_PAYLOAD_LIMIT, encode, encode_into, read_message, write_message,
};
pub use message::{
    Ack, DaemonStatus, DataAck, Message, MessageType, PROTOCOL_VERSION, Progress, Report, RunMode,
    Severity, Start,
};
