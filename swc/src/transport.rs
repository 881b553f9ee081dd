//! Byte transport to the update daemon.
//!
//! [`UnixTransport`] talks to the daemon's well-known Unix socket. The
//! [`Transport`] trait lets tests and embedders substitute another channel.

use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ClientConfig;
use crate::{Error, Result};

/// Reliable, ordered byte channel to the daemon.
pub trait Transport: fmt::Debug + Send {
    /// Writes all of `bytes`, looping over short writes.
    fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Reads whatever is available into `buf`.
    ///
    /// With `wait == None` the call never blocks and returns `Ok(0)` when
    /// nothing is pending. With `Some(d)` it blocks for at most `d` and
    /// returns `Ok(0)` on timeout. A closed peer is [`Error::ConnectionLost`].
    fn receive(&mut self, buf: &mut [u8], wait: Option<Duration>) -> Result<usize>;

    /// Closes the channel. Idempotent.
    fn close(&mut self);

    /// `false` once closed, locally or by the peer.
    fn is_open(&self) -> bool;
}

/// [`Transport`] over a connected Unix stream socket.
#[derive(Debug)]
pub struct UnixTransport {
    /// Socket path, for diagnostics.
    endpoint: PathBuf,
    /// `None` once closed.
    stream: Option<UnixStream>,
    /// Current `O_NONBLOCK` setting of `stream`.
    nonblocking: bool,
}

impl UnixTransport {
    /// Connects to the daemon socket named by `config.endpoint`.
    ///
    /// A missing socket or a refused connection is retried
    /// `config.connect_retries` times to ride out a daemon that is still
    /// starting. Other failures are returned at once.
    pub fn connect(config: &ClientConfig) -> Result<Self> {
        let endpoint = config.endpoint.clone();
        let mut attempt = 0;
        let stream = loop {
            match UnixStream::connect(&endpoint) {
                Ok(s) => break s,
                Err(e) if is_startup_race(&e) && attempt < config.connect_retries => {
                    attempt += 1;
                    tracing::warn!(
                        endpoint = %endpoint.display(),
                        attempt,
                        error = %e,
                        "daemon not reachable yet, retrying"
                    );
                    std::thread::sleep(config.retry_delay);
                }
                Err(source) => return Err(Error::Connection { endpoint, source }),
            }
        };
        stream.set_write_timeout(config.write_timeout.filter(|d| !d.is_zero()))?;
        tracing::debug!(endpoint = %endpoint.display(), "connected");
        Ok(Self::from_stream(stream, endpoint))
    }

    /// Wraps an already connected stream (e.g. one end of a socket pair).
    pub fn from_stream(stream: UnixStream, endpoint: impl AsRef<Path>) -> Self {
        Self {
            endpoint: endpoint.as_ref().to_path_buf(),
            stream: Some(stream),
            nonblocking: false,
        }
    }

    /// Socket path this transport was opened on.
    pub fn endpoint(&self) -> &Path {
        &self.endpoint
    }

    /// Returns the open stream in the requested blocking mode.
    fn stream(&mut self, nonblocking: bool) -> Result<&mut UnixStream> {
        let stream = self.stream.as_mut().ok_or(Error::ConnectionLost)?;
        if self.nonblocking != nonblocking {
            stream.set_nonblocking(nonblocking)?;
            self.nonblocking = nonblocking;
        }
        Ok(stream)
    }

    /// Closes and maps `e` to the error the caller sees.
    fn fail(&mut self, e: io::Error) -> Error {
        if is_disconnect(&e) {
            self.close();
            Error::ConnectionLost
        } else {
            Error::Io(e)
        }
    }
}

impl Transport for UnixTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let stream = self.stream(false)?;
        let mut rest = bytes;
        let res = loop {
            if rest.is_empty() {
                break Ok(());
            }
            match stream.write(rest) {
                Ok(0) => break Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(n) => rest = &rest[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };
        res.map_err(|e| self.fail(e))
    }

    fn receive(&mut self, buf: &mut [u8], wait: Option<Duration>) -> Result<usize> {
        let stream = self.stream(wait.is_none())?;
        if let Some(d) = wait {
            // A zero timeout means "block forever" to the OS.
            stream.set_read_timeout(Some(d.max(Duration::from_millis(1))))?;
        }
        let res = loop {
            match stream.read(buf) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                other => break other,
            }
        };
        match res {
            Ok(0) if !buf.is_empty() => {
                self.close();
                Err(Error::ConnectionLost)
            }
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(0)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            tracing::debug!(endpoint = %self.endpoint.display(), "closed");
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

/// Connect errors worth retrying while the daemon boots.
fn is_startup_race(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

/// I/O errors meaning the peer is gone.
fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}
