//! Magic-prefixed frame codec.
//!
//! Each frame is: `[4-byte magic][u8 type][u32 big-endian length][payload]`.
//! Structured payloads use big-endian integers and `u32`-length-prefixed
//! UTF-8 strings.

use std::io::{self, Read, Write};

use crate::message::{
    Ack, DaemonStatus, DataAck, Message, MessageType, Progress, Report, RunMode, Severity, Start,
};

/// Marker at the start of every frame.
pub const MAGIC: [u8; 4] = *b"SWUC";

/// Size of the fixed frame header (magic + type + length).
pub const HEADER_LEN: usize = MAGIC.len() + 1 + 4;

/// Default maximum accepted payload (1 MiB).
pub const DEFAULT_MAX_PAYLOAD: u32 = 1024 * 1024;

/// Hard ceiling for any payload (16 MiB), whatever the decoder is configured to.
pub const MAX_PAYLOAD_LIMIT: u32 = 16 * 1024 * 1024;

/// Bytes of a `DATA` payload taken by the session identifier.
pub const DATA_OVERHEAD: usize = 4;

/// Framing failure. Every variant is fatal for the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum FrameError {
    /// The stream does not start with [`MAGIC`] where a frame was expected.
    #[error("bad frame magic {found:02x?}, stream out of sync")]
    BadMagic {
        /// Bytes found at the magic offset.
        found: Vec<u8>,
    },

    /// The type tag is not one of the known [`MessageType`]s.
    #[error("unknown message type tag {0:#04x}")]
    UnknownType(u8),

    /// The declared payload length is above the limit.
    #[error("{kind} payload of {len} bytes exceeds the {max} byte limit")]
    Oversized {
        /// Frame type.
        kind: MessageType,
        /// Declared or actual payload length.
        len: u64,
        /// Limit in force.
        max: u32,
    },

    /// A structured payload could not be parsed.
    #[error("malformed {kind} payload: {reason}")]
    Malformed {
        /// Frame type.
        kind: MessageType,
        /// What was wrong.
        reason: &'static str,
    },
}

/// Encodes `msg` as a complete frame.
pub fn encode(msg: &Message) -> Result<Vec<u8>, FrameError> {
    let mut out = Vec::with_capacity(HEADER_LEN + 64);
    encode_into(&mut out, msg)?;
    Ok(out)
}

/// Appends the frame for `msg` to `out`.
///
/// On error `out` is left as it was.
pub fn encode_into(out: &mut Vec<u8>, msg: &Message) -> Result<(), FrameError> {
    let kind = msg.kind();
    let start = out.len();
    out.extend_from_slice(&MAGIC);
    out.push(kind as u8);
    out.extend_from_slice(&[0; 4]);
    write_payload(out, msg);

    let len = out.len() - start - HEADER_LEN;
    match u32::try_from(len) {
        Ok(len) if len <= MAX_PAYLOAD_LIMIT => {
            out[start + 5..start + HEADER_LEN].copy_from_slice(&len.to_be_bytes());
            Ok(())
        }
        _ => {
            out.truncate(start);
            Err(FrameError::Oversized {
                kind,
                len: len as u64,
                max: MAX_PAYLOAD_LIMIT,
            })
        }
    }
}

/// Encodes `msg` and writes the frame to `w`.
pub fn write_message<W: Write>(w: &mut W, msg: &Message) -> io::Result<()> {
    let frame = encode(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    w.write_all(&frame)?;
    w.flush()
}

/// Reads exactly one frame from `r` and decodes it.
///
/// Intended for simple blocking peers; the client uses [`FrameDecoder`].
pub fn read_message(r: &mut impl Read) -> io::Result<Message> {
    let mut header = [0u8; HEADER_LEN];
    r.read_exact(&mut header)?;
    let (kind, len) = parse_header(&header, MAX_PAYLOAD_LIMIT)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)?;
    read_payload(kind, &payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Incremental decoder for a byte stream.
///
/// Bytes arrive in arbitrary chunks through [`push`](Self::push); complete
/// frames come out of [`decode_next`](Self::decode_next) in order. Partial
/// frames stay buffered. After any [`FrameError`] the decoder is poisoned
/// and keeps returning that error until [`reset`](Self::reset).
#[derive(Debug)]
pub struct FrameDecoder {
    /// Unconsumed bytes, always starting at a frame boundary.
    buf: Vec<u8>,
    /// Largest payload accepted.
    max_payload: u32,
    /// First fatal error seen, if any.
    poisoned: Option<FrameError>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    /// Creates a decoder accepting payloads up to [`DEFAULT_MAX_PAYLOAD`].
    pub const fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD)
    }

    /// Creates a decoder with a custom payload limit, capped at
    /// [`MAX_PAYLOAD_LIMIT`].
    pub const fn with_max_payload(max_payload: u32) -> Self {
        let max_payload = if max_payload > MAX_PAYLOAD_LIMIT {
            MAX_PAYLOAD_LIMIT
        } else {
            max_payload
        };
        Self {
            buf: Vec::new(),
            max_payload,
            poisoned: None,
        }
    }

    /// Payload limit in force.
    pub const fn max_payload(&self) -> u32 {
        self.max_payload
    }

    /// Number of buffered bytes not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Appends received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.poisoned.is_none() {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// Decodes the next complete frame, `Ok(None)` if more bytes are needed.
    pub fn decode_next(&mut self) -> Result<Option<Message>, FrameError> {
        if let Some(e) = &self.poisoned {
            return Err(e.clone());
        }
        self.try_decode().inspect_err(|e| {
            self.buf.clear();
            self.poisoned = Some(e.clone());
        })
    }

    /// Appends `bytes` and returns every frame completed by them.
    ///
    /// Fails on the first corrupt frame; frames decoded before it in the
    /// same call are discarded along with the error.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Message>, FrameError> {
        self.push(bytes);
        let mut out = Vec::new();
        while let Some(msg) = self.decode_next()? {
            out.push(msg);
        }
        Ok(out)
    }

    /// Drops buffered bytes and clears the poisoned state.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.poisoned = None;
    }

    /// Decodes one frame from the front of `buf`.
    fn try_decode(&mut self) -> Result<Option<Message>, FrameError> {
        // Check whatever part of the magic has arrived so a desync is
        // reported without waiting for a full header.
        let seen = self.buf.len().min(MAGIC.len());
        if self.buf[..seen] != MAGIC[..seen] {
            return Err(FrameError::BadMagic {
                found: self.buf[..seen].to_vec(),
            });
        }
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let (kind, len) = parse_header(&self.buf[..HEADER_LEN], self.max_payload)?;
        let total = HEADER_LEN + len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let msg = read_payload(kind, &self.buf[HEADER_LEN..total])?;
        self.buf.drain(..total);
        Ok(Some(msg))
    }
}

/// Validates a frame header and returns its type and payload length.
fn parse_header(h: &[u8], max_payload: u32) -> Result<(MessageType, usize), FrameError> {
    if h[..MAGIC.len()] != MAGIC {
        return Err(FrameError::BadMagic {
            found: h[..MAGIC.len()].to_vec(),
        });
    }
    let kind = MessageType::from_u8(h[4]).ok_or(FrameError::UnknownType(h[4]))?;
    let len = u32::from_be_bytes([h[5], h[6], h[7], h[8]]);
    if len > max_payload {
        return Err(FrameError::Oversized {
            kind,
            len: u64::from(len),
            max: max_payload,
        });
    }
    Ok((kind, len as usize))
}

/// Appends the payload of `msg`.
fn write_payload(out: &mut Vec<u8>, msg: &Message) {
    match msg {
        Message::Start(m) => {
            out.push(m.version);
            out.extend_from_slice(&m.session.to_be_bytes());
            out.push(m.run_mode as u8);
            put_str(out, &m.software_set);
            put_str(out, &m.running_mode);
            out.extend_from_slice(&m.image_size.to_be_bytes());
        }
        Message::Ack(m) => {
            out.push(m.version);
            out.extend_from_slice(&m.session.to_be_bytes());
            out.push(u8::from(m.accepted));
            out.extend_from_slice(&m.reason_code.to_be_bytes());
            put_str(out, &m.reason);
        }
        Message::Data { session, bytes } => {
            out.extend_from_slice(&session.to_be_bytes());
            out.extend_from_slice(bytes);
        }
        Message::DataAck(m) => {
            out.extend_from_slice(&m.session.to_be_bytes());
            out.extend_from_slice(&m.acked.to_be_bytes());
        }
        Message::Progress(m) => {
            out.extend_from_slice(&m.session.to_be_bytes());
            out.push(m.status as u8);
            out.push(m.severity as u8);
            out.extend_from_slice(&m.nsteps.to_be_bytes());
            out.extend_from_slice(&m.cur_step.to_be_bytes());
            out.extend_from_slice(&m.percent.to_be_bytes());
            put_str(out, &m.cur_image);
            put_str(out, &m.info);
        }
        Message::Success(r) | Message::Error(r) => {
            out.extend_from_slice(&r.session.to_be_bytes());
            out.extend_from_slice(&r.code.to_be_bytes());
            put_str(out, &r.message);
        }
        Message::Cancel { session } => out.extend_from_slice(&session.to_be_bytes()),
    }
}

/// Appends a `u32`-length-prefixed string.
#[allow(clippy::cast_possible_truncation)]
fn put_str(out: &mut Vec<u8>, s: &str) {
    // Anything longer than u32::MAX already breaks the payload limit.
    out.extend_from_slice(&(s.len() as u32).to_be_bytes());
    out.extend_from_slice(s.as_bytes());
}

/// Parses the payload of a frame of type `kind`.
fn read_payload(kind: MessageType, payload: &[u8]) -> Result<Message, FrameError> {
    let mut r = PayloadReader { kind, rest: payload };
    let msg = match kind {
        MessageType::Start => Message::Start(Start {
            version: r.u8()?,
            session: r.u32()?,
            run_mode: RunMode::from_u8(r.u8()?).ok_or(r.malformed("unknown run mode"))?,
            software_set: r.string()?,
            running_mode: r.string()?,
            image_size: r.u64()?,
        }),
        MessageType::Ack => Message::Ack(Ack {
            version: r.u8()?,
            session: r.u32()?,
            accepted: r.flag()?,
            reason_code: r.u32()?,
            reason: r.string()?,
        }),
        MessageType::Data => {
            let session = r.u32()?;
            let bytes = std::mem::take(&mut r.rest).to_vec();
            Message::Data { session, bytes }
        }
        MessageType::DataAck => Message::DataAck(DataAck {
            session: r.u32()?,
            acked: r.u64()?,
        }),
        MessageType::Progress => Message::Progress(Progress {
            session: r.u32()?,
            status: DaemonStatus::from_u8(r.u8()?).ok_or(r.malformed("unknown daemon status"))?,
            severity: Severity::from_u8(r.u8()?).ok_or(r.malformed("unknown severity"))?,
            nsteps: r.u32()?,
            cur_step: r.u32()?,
            percent: r.u32()?,
            cur_image: r.string()?,
            info: r.string()?,
        }),
        MessageType::Success => Message::Success(r.report()?),
        MessageType::Error => Message::Error(r.report()?),
        MessageType::Cancel => Message::Cancel { session: r.u32()? },
    };
    r.finish()?;
    Ok(msg)
}

/// Bounds-checked big-endian reader over one payload.
struct PayloadReader<'a> {
    /// Frame type, for error reporting.
    kind: MessageType,
    /// Bytes not yet consumed.
    rest: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    const fn malformed(&self, reason: &'static str) -> FrameError {
        FrameError::Malformed {
            kind: self.kind,
            reason,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if self.rest.len() < n {
            return Err(self.malformed("truncated field"));
        }
        let (head, tail) = self.rest.split_at(n);
        self.rest = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    fn flag(&mut self) -> Result<bool, FrameError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(self.malformed("boolean out of range")),
        }
    }

    fn u32(&mut self) -> Result<u32, FrameError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, FrameError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn string(&mut self) -> Result<String, FrameError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| self.malformed("string is not UTF-8"))
    }

    fn report(&mut self) -> Result<Report, FrameError> {
        Ok(Report {
            session: self.u32()?,
            code: self.u32()?,
            message: self.string()?,
        })
    }

    fn finish(&self) -> Result<(), FrameError> {
        if self.rest.is_empty() {
            Ok(())
        } else {
            Err(self.malformed("trailing bytes"))
        }
    }
}
