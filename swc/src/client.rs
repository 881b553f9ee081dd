//! Caller-facing update client.
//!
//! Reading is synchronous and on demand: bytes from the daemon are pulled
//! through the decoder and the [`Machine`] only while the caller is inside a
//! [`Client`] method. There is no background reader. Commands are serialized
//! by `&mut self`, so at most one command awaits its acknowledgment at a
//! time. A blocked [`Client::wait_until_terminal`] can be interrupted from
//! another thread through a [`CancelHandle`].

use std::collections::VecDeque;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use swc_proto::{FrameDecoder, Message};

use crate::config::ClientConfig;
use crate::machine::Machine;
use crate::session::{
    CONNECTION_CLOSED, CONNECTION_LOST, Cause, Event, Outcome, State, StatusNotification,
    UpdateRequest, UpdateSession,
};
use crate::transport::{Transport, UnixTransport};
use crate::{Error, Result};

/// Size of the receive scratch buffer.
const READ_BUF: usize = 16 * 1024;

/// Thread-safe flag that interrupts a blocking wait on a [`Client`].
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Requests cancellation of the client's in-flight session.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// `true` if a cancellation is pending.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Consumes a pending request.
    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// The channel to the daemon: endpoint, transport and inbound framing.
#[derive(Debug)]
struct Connection {
    /// Socket path, resolved again on every connect.
    endpoint: PathBuf,
    /// `None` while disconnected.
    transport: Option<Box<dyn Transport>>,
    /// Reassembles inbound frames.
    decoder: FrameDecoder,
    /// Description of the last fatal error.
    last_error: Option<String>,
}

impl Connection {
    fn is_open(&self) -> bool {
        self.transport.as_ref().is_some_and(|t| t.is_open())
    }

    /// Installs a fresh transport with an empty decoder.
    fn attach(&mut self, transport: Box<dyn Transport>) {
        self.decoder.reset();
        self.transport = Some(transport);
    }

    /// Closes and forgets the transport.
    fn shutdown(&mut self, error: Option<String>) {
        if let Some(mut t) = self.transport.take() {
            t.close();
        }
        self.decoder.reset();
        if error.is_some() {
            self.last_error = error;
        }
    }
}

/// Client for one update daemon.
///
/// ```no_run
/// use std::fs::File;
/// use std::time::Duration;
/// use swc::{Client, ClientConfig, UpdateRequest};
///
/// let mut client = Client::new(ClientConfig::from_env());
/// let image = File::open("update.swu")?;
/// let outcome = client.install(UpdateRequest::new(), image, Duration::from_secs(600))?;
/// println!("{outcome:?}");
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct Client {
    /// Settings.
    config: ClientConfig,
    /// Channel to the daemon.
    conn: Connection,
    /// Session state.
    machine: Machine,
    /// Events not yet taken by the caller.
    events: VecDeque<Event>,
    /// Cross-thread cancellation flag.
    cancel: CancelHandle,
    /// Receive scratch buffer.
    rx: Vec<u8>,
}

impl Client {
    /// Creates a client. The connection is opened on first use.
    pub fn new(config: ClientConfig) -> Self {
        let conn = Connection {
            endpoint: config.endpoint.clone(),
            transport: None,
            decoder: FrameDecoder::with_max_payload(config.max_payload),
            last_error: None,
        };
        Self {
            machine: Machine::new(config.unsolicited),
            conn,
            config,
            events: VecDeque::new(),
            cancel: CancelHandle::default(),
            rx: vec![0; READ_BUF],
        }
    }

    /// Creates a client over an already connected transport.
    pub fn with_transport(config: ClientConfig, transport: Box<dyn Transport>) -> Self {
        let mut client = Self::new(config);
        client.conn.attach(transport);
        client
    }

    /// Opens the channel if it is not open. The endpoint is looked up anew
    /// each time, so a restarted daemon is picked up.
    pub fn connect(&mut self) -> Result<()> {
        if self.conn.is_open() {
            return Ok(());
        }
        let transport = UnixTransport::connect(&self.config)
            .inspect_err(|e| self.conn.last_error = Some(e.to_string()))?;
        tracing::info!(endpoint = %self.conn.endpoint.display(), "connected to daemon");
        self.conn.attach(Box::new(transport));
        Ok(())
    }

    /// `true` while the channel is open.
    pub fn is_connected(&self) -> bool {
        self.conn.is_open()
    }

    /// Daemon socket path.
    pub fn endpoint(&self) -> &Path {
        &self.conn.endpoint
    }

    /// Description of the last error that tore the connection down.
    pub fn last_error(&self) -> Option<&str> {
        self.conn.last_error.as_deref()
    }

    /// Handle that interrupts [`wait_until_terminal`](Self::wait_until_terminal)
    /// from another thread.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// State of the current session.
    pub fn state(&self) -> State {
        self.machine.state()
    }

    /// Live or most recent session.
    pub const fn session(&self) -> Option<&UpdateSession> {
        self.machine.session()
    }

    /// Forgets a finished session.
    pub fn discard_session(&mut self) -> Result<Option<UpdateSession>> {
        self.machine.discard()
    }

    /// Opens a new update session and waits for the daemon's answer.
    ///
    /// The returned snapshot is in [`State::Streaming`] if the daemon
    /// accepted, or [`State::Failed`] with the daemon's reason if it
    /// rejected. Fails with [`Error::State`] while another session is in
    /// flight.
    pub fn start_update(&mut self, request: UpdateRequest) -> Result<UpdateSession> {
        if self.machine.in_flight() {
            return Err(Error::State {
                op: "start_update",
                state: self.machine.state(),
            });
        }
        self.connect()?;
        self.drain()?;
        self.cancel.take();

        let start = {
            let s = self.machine.begin(request)?;
            s.request.to_start(s.id)
        };
        self.flush_events();
        self.send(&Message::Start(start))?;
        self.wait_while(
            |m| m.state() == State::AwaitingAck,
            self.config.ack_timeout,
            "start_update",
        )?;
        self.snapshot()
    }

    /// Streams image bytes and waits until the daemon acknowledged them.
    ///
    /// Returns the total number of bytes acknowledged so far. Only valid in
    /// [`State::Streaming`].
    pub fn feed_chunk(&mut self, bytes: &[u8]) -> Result<u64> {
        self.require(State::Streaming, "feed_chunk")?;
        self.drain()?;
        self.check_live("feed_chunk")?;

        let id = self.current_id("feed_chunk")?;
        let chunk_size = self.config.effective_chunk_size();
        for chunk in bytes.chunks(chunk_size) {
            self.send(&Message::Data {
                session: id,
                bytes: chunk.to_vec(),
            })?;
            self.machine.record_sent(chunk.len() as u64)?;
            self.drain()?;
            self.check_live("feed_chunk")?;
        }

        let target = self.session().map_or(0, |s| s.bytes_sent);
        self.wait_while(
            |m| {
                m.state() == State::Streaming && m.session().is_some_and(|s| s.bytes_acked < target)
            },
            self.config.ack_timeout,
            "feed_chunk",
        )?;
        self.check_live("feed_chunk")?;
        Ok(self.session().map_or(0, |s| s.bytes_acked))
    }

    /// Tells the daemon the image is complete.
    pub fn finish_image(&mut self) -> Result<()> {
        self.require(State::Streaming, "finish_image")?;
        let id = self.current_id("finish_image")?;
        self.send(&Message::Data {
            session: id,
            bytes: Vec::new(),
        })?;
        self.machine.mark_data_complete()
    }

    /// Latest daemon status of the current session. Never blocks.
    pub fn poll_status(&mut self) -> Result<Option<StatusNotification>> {
        self.drain()?;
        Ok(self.session().and_then(|s| s.last_status.clone()))
    }

    /// Next queued event, after reading whatever the daemon sent. Never blocks.
    pub fn poll_event(&mut self) -> Result<Option<Event>> {
        self.drain()?;
        Ok(self.events.pop_front())
    }

    /// Waits up to `timeout` for the next event.
    pub fn next_event(&mut self, timeout: Duration) -> Result<Option<Event>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(ev) = self.poll_event()? {
                return Ok(Some(ev));
            }
            if !self.conn.is_open() {
                return Err(Error::ConnectionLost);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            self.pump(Some((deadline - now).min(self.config.poll_slice())))?;
        }
    }

    /// All queued events, after reading whatever the daemon sent. Never blocks.
    pub fn drain_events(&mut self) -> Result<Vec<Event>> {
        self.drain()?;
        Ok(self.events.drain(..).collect())
    }

    /// Blocks until the session is terminal and returns its outcome.
    ///
    /// Waits in slices of `poll_interval`, so a [`CancelHandle::cancel`]
    /// from another thread is honoured within one slice: the client sends
    /// `CANCEL` and returns [`Outcome::Cancelled`] without waiting for the
    /// daemon. A lost connection ends the wait with a `"connection lost"`
    /// failure; a corrupt stream is returned as [`Error::Frame`] after the
    /// session has been failed.
    pub fn wait_until_terminal(&mut self, timeout: Duration) -> Result<Outcome> {
        if self.session().is_none() {
            return Err(Error::State {
                op: "wait_until_terminal",
                state: State::Idle,
            });
        }
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(outcome) = self.session().and_then(|s| s.outcome.clone()) {
                return Ok(outcome);
            }
            if self.cancel.take() {
                self.cancel()?;
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout {
                    op: "wait_until_terminal",
                    after: timeout,
                });
            }
            match self.pump(Some((deadline - now).min(self.config.poll_slice()))) {
                Ok(_) => {}
                // The session has been failed; the next turn returns it.
                Err(Error::ConnectionLost) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Cancels the in-flight session.
    ///
    /// The session is `Cancelled` as soon as this returns; the daemon's
    /// confirmation is only logged when it arrives.
    pub fn cancel(&mut self) -> Result<UpdateSession> {
        let id = self.machine.cancel()?;
        self.flush_events();
        if self.conn.is_open() {
            if let Err(e) = self.send(&Message::Cancel { session: id }) {
                tracing::warn!(session = id, error = %e, "cancel request not delivered");
            }
        }
        self.snapshot()
    }

    /// Runs a whole update: start, stream `image`, finish, wait.
    ///
    /// A daemon-side failure is returned as an [`Outcome::Failed`], not an
    /// error. A [`CancelHandle::cancel`] is honoured between chunks and while
    /// waiting for acknowledgments. A failing `image` cancels the session
    /// and is returned as [`Error::Image`]; the connection stays open.
    pub fn install(
        &mut self,
        request: UpdateRequest,
        mut image: impl Read,
        timeout: Duration,
    ) -> Result<Outcome> {
        let session = self.start_update(request)?;
        if session.state != State::Streaming {
            return self.wait_until_terminal(timeout);
        }

        let mut buf = vec![0u8; self.config.effective_chunk_size()];
        loop {
            if self.cancel.take() {
                self.cancel()?;
                return self.wait_until_terminal(timeout);
            }
            let n = match image.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "image read failed, cancelling");
                    if let Err(err) = self.cancel() {
                        tracing::warn!(error = %err, "cannot cancel after image read failure");
                    }
                    return Err(Error::Image(e));
                }
            };
            if let Err(e) = self.feed_chunk(&buf[..n]) {
                if self.machine.state().is_terminal() {
                    return self.wait_until_terminal(timeout);
                }
                return Err(e);
            }
        }

        self.finish_image()?;
        self.wait_until_terminal(timeout)
    }

    /// Closes the channel. Idempotent. An in-flight session is failed with
    /// `"connection closed"`.
    pub fn close(&mut self) {
        if self.machine.fail(Cause::new(CONNECTION_CLOSED)) {
            self.flush_events();
        }
        self.conn.shutdown(None);
    }

    /// Clone of the current session.
    fn snapshot(&self) -> Result<UpdateSession> {
        self.session().cloned().ok_or(Error::State {
            op: "session",
            state: State::Idle,
        })
    }

    /// Identifier of the current session.
    fn current_id(&self, op: &'static str) -> Result<u32> {
        self.session().map(|s| s.id).ok_or(Error::State {
            op,
            state: State::Idle,
        })
    }

    /// Fails with [`Error::State`] unless the session is in `state`.
    fn require(&self, state: State, op: &'static str) -> Result<()> {
        let current = self.machine.state();
        if current == state {
            Ok(())
        } else {
            Err(Error::State { op, state: current })
        }
    }

    /// Turns a session that ended during a call into the matching error.
    fn check_live(&self, op: &'static str) -> Result<()> {
        match self.session().and_then(|s| s.outcome.as_ref()) {
            Some(Outcome::Failed(cause)) => Err(Error::Failed(cause.clone())),
            Some(outcome) => Err(Error::State {
                op,
                state: outcome.state(),
            }),
            None => Ok(()),
        }
    }

    /// Encodes and sends one message.
    fn send(&mut self, msg: &Message) -> Result<()> {
        let frame = swc_proto::encode(msg)?;
        let Some(transport) = self.conn.transport.as_mut() else {
            return Err(self.teardown(Error::ConnectionLost));
        };
        tracing::debug!(kind = %msg.kind(), session = msg.session(), len = frame.len(), "send");
        let res = transport.send(&frame);
        res.map_err(|e| self.teardown(e))
    }

    /// Reads once from the transport and applies every completed frame.
    ///
    /// Returns the number of bytes read. Does nothing when disconnected.
    fn pump(&mut self, wait: Option<Duration>) -> Result<usize> {
        let Some(transport) = self.conn.transport.as_mut() else {
            return Ok(0);
        };
        let n = match transport.receive(&mut self.rx, wait) {
            Ok(n) => n,
            Err(e) => return Err(self.teardown(e)),
        };
        if n == 0 {
            return Ok(0);
        }
        self.conn.decoder.push(&self.rx[..n]);
        loop {
            match self.conn.decoder.decode_next() {
                Ok(Some(msg)) => self.dispatch(msg),
                Ok(None) => break,
                Err(e) => return Err(self.teardown(e.into())),
            }
        }
        Ok(n)
    }

    /// Pumps without blocking until the transport has nothing more.
    fn drain(&mut self) -> Result<()> {
        while self.pump(None)? > 0 {}
        Ok(())
    }

    /// Pumps until `pending` turns false or `timeout` elapses. A pending
    /// [`CancelHandle`] request cancels the in-flight session.
    fn wait_while(
        &mut self,
        pending: impl Fn(&Machine) -> bool,
        timeout: Duration,
        op: &'static str,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        while pending(&self.machine) {
            if self.machine.in_flight() && self.cancel.take() {
                self.cancel()?;
                continue;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout { op, after: timeout });
            }
            self.pump(Some((deadline - now).min(self.config.poll_slice())))?;
        }
        Ok(())
    }

    /// Feeds one decoded message to the state machine.
    fn dispatch(&mut self, msg: Message) {
        tracing::debug!(kind = %msg.kind(), session = msg.session(), "recv");
        if let Err(w) = self.machine.apply(msg) {
            tracing::warn!(warning = %w, "dropping daemon message");
        }
        self.flush_events();
    }

    /// Moves machine events into the bounded caller queue.
    fn flush_events(&mut self) {
        for ev in self.machine.take_events() {
            if self.config.event_capacity == 0 {
                continue;
            }
            if self.events.len() >= self.config.event_capacity {
                self.events.pop_front();
                tracing::warn!(
                    capacity = self.config.event_capacity,
                    "event queue full, dropped oldest event"
                );
            }
            self.events.push_back(ev);
        }
    }

    /// Tears the connection down after a fatal error and fails the session.
    fn teardown(&mut self, err: Error) -> Error {
        let cause = match &err {
            Error::ConnectionLost => Cause::new(CONNECTION_LOST),
            other => Cause::new(other.to_string()),
        };
        tracing::warn!(endpoint = %self.conn.endpoint.display(), error = %err, "connection torn down");
        self.conn.shutdown(Some(err.to_string()));
        if self.machine.fail(cause) {
            self.flush_events();
        }
        err
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.conn.shutdown(None);
    }
}

#[cfg(test)]
mod tests {
    use swc_proto::{Ack, DaemonStatus, DataAck, MAGIC, PROTOCOL_VERSION, Progress, Report, Severity};

    use super::*;
    use crate::transport::mock::MockTransport;
    use crate::{SessionId, UnsolicitedPolicy};

    fn config() -> ClientConfig {
        ClientConfig::new("/nonexistent/swc-test.sock")
            .ack_timeout(Duration::from_millis(200))
            .poll_interval(Duration::from_millis(5))
    }

    fn ack(session: SessionId, accepted: bool, reason: &str) -> Message {
        Message::Ack(Ack {
            version: PROTOCOL_VERSION,
            session,
            accepted,
            reason_code: if accepted { 0 } else { 16 },
            reason: reason.into(),
        })
    }

    fn progress(session: SessionId, percent: u32) -> Message {
        Message::Progress(Progress {
            session,
            status: DaemonStatus::Run,
            severity: Severity::Info,
            nsteps: 1,
            cur_step: 1,
            percent,
            cur_image: "rootfs".into(),
            info: "installing".into(),
        })
    }

    fn success(session: SessionId) -> Message {
        Message::Success(Report {
            session,
            code: 0,
            message: "installed".into(),
        })
    }

    /// A daemon that accepts, acknowledges every byte, and installs once the
    /// image is complete.
    fn cooperative() -> MockTransport {
        let mut received = 0u64;
        MockTransport::new(move |msg| match msg {
            Message::Start(s) => vec![ack(s.session, true, "")],
            Message::Data { session, bytes } if bytes.is_empty() => {
                vec![progress(*session, 50), success(*session)]
            }
            Message::Data { session, bytes } => {
                received += bytes.len() as u64;
                vec![Message::DataAck(DataAck {
                    session: *session,
                    acked: received,
                })]
            }
            Message::Cancel { session } => vec![Message::Cancel { session: *session }],
            _ => Vec::new(),
        })
    }

    fn client(t: &MockTransport) -> Client {
        Client::with_transport(config(), Box::new(t.clone()))
    }

    #[test]
    fn start_feed_success() {
        let t = cooperative();
        let mut c = client(&t);

        let s = c.start_update(UpdateRequest::new()).unwrap();
        assert_eq!(s.state, State::Streaming);

        assert_eq!(c.feed_chunk(&[0xab; 1024]).unwrap(), 1024);
        c.finish_image().unwrap();
        let outcome = c.wait_until_terminal(Duration::from_secs(1)).unwrap();
        assert_eq!(
            outcome,
            Outcome::Success {
                code: 0,
                message: "installed".into()
            }
        );
        assert_eq!(c.state(), State::Done);

        let sent = &t.wire().sent;
        assert!(matches!(sent[0], Message::Start(_)));
        assert!(matches!(&sent[1], Message::Data { bytes, .. } if bytes.len() == 1024));
        assert!(matches!(&sent[2], Message::Data { bytes, .. } if bytes.is_empty()));
    }

    #[test]
    fn rejected_start_reports_cause() {
        let t = MockTransport::new(|msg| match msg {
            Message::Start(s) => vec![ack(s.session, false, "BUSY")],
            _ => Vec::new(),
        });
        let mut c = client(&t);
        let s = c.start_update(UpdateRequest::new()).unwrap();
        assert_eq!(s.state, State::Failed);
        match c.wait_until_terminal(Duration::from_secs(1)).unwrap() {
            Outcome::Failed(cause) => {
                assert_eq!(cause.message, "BUSY");
                assert_eq!(cause.code, Some(16));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(matches!(
            c.feed_chunk(b"x"),
            Err(Error::State {
                state: State::Failed,
                ..
            })
        ));
    }

    #[test]
    fn second_start_is_a_state_error() {
        let t = cooperative();
        let mut c = client(&t);
        let first = c.start_update(UpdateRequest::new()).unwrap();
        assert!(matches!(
            c.start_update(UpdateRequest::new()),
            Err(Error::State {
                op: "start_update",
                state: State::Streaming
            })
        ));
        assert_eq!(c.session().unwrap().id, first.id);
        assert_eq!(t.wire().sent.len(), 1);
    }

    #[test]
    fn start_after_terminal_session_uses_next_id() {
        let t = cooperative();
        let mut c = client(&t);
        let first = c.start_update(UpdateRequest::new()).unwrap();
        c.cancel().unwrap();
        let second = c.start_update(UpdateRequest::new()).unwrap();
        assert_eq!(second.id, first.id + 1);
        assert_eq!(second.state, State::Streaming);
    }

    #[test]
    fn feed_before_start_is_a_state_error() {
        let mut c = client(&cooperative());
        assert!(matches!(
            c.feed_chunk(b"abc"),
            Err(Error::State {
                op: "feed_chunk",
                state: State::Idle
            })
        ));
        assert!(matches!(
            c.wait_until_terminal(Duration::ZERO),
            Err(Error::State { .. })
        ));
        assert!(c.cancel().is_err());
    }

    #[test]
    fn large_feed_is_split_into_chunks() {
        let t = cooperative();
        let mut c = Client::with_transport(config().chunk_size(100), Box::new(t.clone()));
        c.start_update(UpdateRequest::new()).unwrap();
        assert_eq!(c.feed_chunk(&[1; 250]).unwrap(), 250);
        let sizes: Vec<usize> = t
            .wire()
            .sent
            .iter()
            .filter_map(|m| match m {
                Message::Data { bytes, .. } => Some(bytes.len()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, [100, 100, 50]);
        assert_eq!(c.session().unwrap().bytes_sent, 250);
    }

    #[test]
    fn connection_lost_while_streaming() {
        let t = MockTransport::new(|msg| match msg {
            Message::Start(s) => vec![ack(s.session, true, "")],
            _ => Vec::new(),
        });
        let mut c = client(&t);
        c.start_update(UpdateRequest::new()).unwrap();
        t.wire().hung_up = true;

        assert!(matches!(c.poll_status(), Err(Error::ConnectionLost)));
        assert_eq!(c.state(), State::Failed);
        assert_eq!(
            c.session().unwrap().outcome,
            Some(Outcome::Failed(Cause::new(CONNECTION_LOST)))
        );
        assert!(!c.is_connected());
        assert_eq!(c.last_error(), Some("connection lost"));

        assert!(matches!(
            c.feed_chunk(b"more"),
            Err(Error::State {
                op: "feed_chunk",
                state: State::Failed
            })
        ));
        assert_eq!(
            c.wait_until_terminal(Duration::from_millis(10)).unwrap(),
            Outcome::Failed(Cause::new(CONNECTION_LOST))
        );
    }

    #[test]
    fn wait_returns_connection_lost_failure() {
        let t = MockTransport::new(|msg| match msg {
            Message::Start(s) => vec![ack(s.session, true, "")],
            _ => Vec::new(),
        });
        let mut c = client(&t);
        c.start_update(UpdateRequest::new()).unwrap();
        t.wire().hung_up = true;
        let outcome = c.wait_until_terminal(Duration::from_secs(1)).unwrap();
        assert_eq!(outcome, Outcome::Failed(Cause::new(CONNECTION_LOST)));
    }

    #[test]
    fn corrupted_magic_closes_connection() {
        let t = MockTransport::new(|msg| match msg {
            Message::Start(s) => vec![ack(s.session, true, "")],
            _ => Vec::new(),
        });
        let mut c = client(&t);
        let id = c.start_update(UpdateRequest::new()).unwrap().id;
        c.drain_events().unwrap();

        let mut frame = swc_proto::encode(&progress(id, 40)).unwrap();
        frame[1] = b'!';
        t.wire().push_raw(&frame);

        match c.poll_status() {
            Err(Error::Frame(swc_proto::FrameError::BadMagic { .. })) => {}
            other => panic!("expected frame error, got {other:?}"),
        }
        assert!(t.wire().closed);
        assert!(!c.is_connected());
        let s = c.session().unwrap();
        assert_eq!(s.state, State::Failed);
        assert!(s.last_status.is_none());
        assert!(
            c.drain_events()
                .unwrap()
                .iter()
                .all(|e| !matches!(e, Event::Progress(_)))
        );
    }

    #[test]
    fn frames_before_corruption_are_applied() {
        let t = MockTransport::new(|msg| match msg {
            Message::Start(s) => vec![ack(s.session, true, "")],
            _ => Vec::new(),
        });
        let mut c = client(&t);
        let id = c.start_update(UpdateRequest::new()).unwrap().id;
        let mut bytes = swc_proto::encode(&progress(id, 10)).unwrap();
        bytes.extend_from_slice(b"XXXXXXXXXX");
        t.wire().push_raw(&bytes);
        assert!(matches!(c.poll_status(), Err(Error::Frame(_))));
        let s = c.session().unwrap();
        assert_eq!(s.last_status.as_ref().map(|n| n.percent), Some(10));
        assert_eq!(s.state, State::Failed);
    }

    #[test]
    fn progress_while_idle_is_dropped() {
        let t = MockTransport::silent();
        let mut c = client(&t);
        t.wire().push(&progress(3, 20));
        assert_eq!(c.poll_status().unwrap(), None);
        assert_eq!(c.state(), State::Idle);
        assert!(c.is_connected());
        assert_eq!(c.poll_event().unwrap(), None);
    }

    #[test]
    fn unsolicited_progress_is_surfaced_when_configured() {
        let t = MockTransport::silent();
        let mut c = Client::with_transport(
            config().unsolicited(UnsolicitedPolicy::Surface),
            Box::new(t.clone()),
        );
        t.wire().push(&progress(3, 20));
        match c.poll_event().unwrap() {
            Some(Event::Unsolicited(n)) => assert_eq!(n.percent, 20),
            other => panic!("expected unsolicited event, got {other:?}"),
        }
    }

    #[test]
    fn progress_is_observable_by_poll_and_events() {
        let t = cooperative();
        let mut c = client(&t);
        c.start_update(UpdateRequest::new()).unwrap();
        c.feed_chunk(&[0; 10]).unwrap();
        c.finish_image().unwrap();

        let status = c.poll_status().unwrap().unwrap();
        assert_eq!(status.percent, 50);
        assert_eq!(status.cur_image, "rootfs");

        let events = c.drain_events().unwrap();
        assert!(events.iter().any(|e| matches!(e, Event::Progress(n) if n.percent == 50)));
        assert!(events.iter().any(|e| matches!(
            e,
            Event::StateChanged {
                to: State::Done,
                ..
            }
        )));
    }

    #[test]
    fn event_queue_is_bounded() {
        let t = MockTransport::silent();
        let mut c = Client::with_transport(
            config()
                .unsolicited(UnsolicitedPolicy::Surface)
                .event_capacity(2),
            Box::new(t.clone()),
        );
        for p in [1, 2, 3] {
            t.wire().push(&progress(9, p));
        }
        let events = c.drain_events().unwrap();
        let percents: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                Event::Unsolicited(n) => Some(n.percent),
                _ => None,
            })
            .collect();
        assert_eq!(percents, [2, 3]);
    }

    #[test]
    fn daemon_error_during_feed_is_returned() {
        let t = MockTransport::new(|msg| match msg {
            Message::Start(s) => vec![ack(s.session, true, "")],
            Message::Data { session, .. } => vec![Message::Error(Report {
                session: *session,
                code: 7,
                message: "no space".into(),
            })],
            _ => Vec::new(),
        });
        let mut c = client(&t);
        c.start_update(UpdateRequest::new()).unwrap();
        match c.feed_chunk(b"data") {
            Err(Error::Failed(cause)) => assert_eq!(cause, Cause::with_code(7, "no space")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(matches!(c.feed_chunk(b"data"), Err(Error::State { .. })));
    }

    #[test]
    fn missing_data_ack_times_out() {
        let t = MockTransport::new(|msg| match msg {
            Message::Start(s) => vec![ack(s.session, true, "")],
            _ => Vec::new(),
        });
        let mut c = client(&t);
        c.start_update(UpdateRequest::new()).unwrap();
        assert!(matches!(
            c.feed_chunk(b"abc"),
            Err(Error::Timeout {
                op: "feed_chunk",
                ..
            })
        ));
        assert_eq!(c.state(), State::Streaming);
    }

    #[test]
    fn missing_ack_times_out() {
        let mut c = client(&MockTransport::silent());
        assert!(matches!(
            c.start_update(UpdateRequest::new()),
            Err(Error::Timeout {
                op: "start_update",
                ..
            })
        ));
        assert_eq!(c.state(), State::AwaitingAck);
        c.cancel().unwrap();
        assert_eq!(c.state(), State::Cancelled);
    }

    #[test]
    fn cancel_is_optimistic() {
        let t = MockTransport::new(|msg| match msg {
            Message::Start(s) => vec![ack(s.session, true, "")],
            _ => Vec::new(),
        });
        let mut c = client(&t);
        let id = c.start_update(UpdateRequest::new()).unwrap().id;
        let s = c.cancel().unwrap();
        assert_eq!(s.state, State::Cancelled);
        assert_eq!(s.outcome, Some(Outcome::Cancelled));
        assert!(matches!(
            t.wire().sent.last(),
            Some(Message::Cancel { session }) if *session == id
        ));
        // Late confirmation is absorbed.
        t.wire().push(&Message::Cancel { session: id });
        assert_eq!(c.poll_status().unwrap(), None);
        assert_eq!(c.state(), State::Cancelled);
        assert!(matches!(c.cancel(), Err(Error::State { .. })));
    }

    #[test]
    fn cancel_handle_interrupts_wait() {
        let t = MockTransport::new(|msg| match msg {
            Message::Start(s) => vec![ack(s.session, true, "")],
            _ => Vec::new(),
        });
        let mut c = client(&t);
        c.start_update(UpdateRequest::new()).unwrap();

        let handle = c.cancel_handle();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.cancel();
        });
        let started = Instant::now();
        let outcome = c.wait_until_terminal(Duration::from_secs(30)).unwrap();
        canceller.join().unwrap();

        assert_eq!(outcome, Outcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(t.wire().sent.last(), Some(Message::Cancel { .. })));
    }

    #[test]
    fn corrupt_stream_during_wait_is_a_frame_error() {
        let t = MockTransport::new(|msg| match msg {
            Message::Start(s) => vec![ack(s.session, true, "")],
            _ => Vec::new(),
        });
        let mut c = client(&t);
        let id = c.start_update(UpdateRequest::new()).unwrap().id;
        let mut frame = swc_proto::encode(&progress(id, 30)).unwrap();
        frame[0] = b'X';
        t.wire().push_raw(&frame);

        match c.wait_until_terminal(Duration::from_secs(1)) {
            Err(Error::Frame(swc_proto::FrameError::BadMagic { .. })) => {}
            other => panic!("expected frame error, got {other:?}"),
        }
        assert!(!c.is_connected());
        assert_eq!(c.state(), State::Failed);
        // The failure is history now; waiting again reports it.
        assert!(matches!(
            c.wait_until_terminal(Duration::from_millis(10)).unwrap(),
            Outcome::Failed(_)
        ));
    }

    #[test]
    fn cancel_handle_interrupts_ack_waits() {
        let t = MockTransport::new(|msg| match msg {
            Message::Start(s) => vec![ack(s.session, true, "")],
            _ => Vec::new(),
        });
        let mut c = Client::with_transport(
            config().ack_timeout(Duration::from_secs(30)),
            Box::new(t.clone()),
        );
        c.start_update(UpdateRequest::new()).unwrap();

        let handle = c.cancel_handle();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.cancel();
        });
        let started = Instant::now();
        let res = c.feed_chunk(b"never acknowledged");
        canceller.join().unwrap();

        assert!(matches!(
            res,
            Err(Error::State {
                op: "feed_chunk",
                state: State::Cancelled
            })
        ));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(t.wire().sent.last(), Some(Message::Cancel { .. })));
    }

    #[test]
    fn cancel_handle_interrupts_start() {
        let t = MockTransport::silent();
        let mut c = Client::with_transport(
            config().ack_timeout(Duration::from_secs(30)),
            Box::new(t.clone()),
        );
        let handle = c.cancel_handle();
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.cancel();
        });
        let started = Instant::now();
        let s = c.start_update(UpdateRequest::new()).unwrap();
        canceller.join().unwrap();

        assert_eq!(s.state, State::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    /// Yields one chunk, then fails.
    struct BrokenImage(bool);

    impl Read for BrokenImage {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if std::mem::replace(&mut self.0, true) {
                return Err(io::Error::other("media removed"));
            }
            buf[..4].copy_from_slice(b"swu!");
            Ok(4)
        }
    }

    #[test]
    fn failing_image_cancels_but_keeps_connection() {
        let t = cooperative();
        let mut c = client(&t);
        let err = c
            .install(
                UpdateRequest::new(),
                BrokenImage(false),
                Duration::from_secs(1),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Image(_)));
        assert!(!err.is_fatal());
        assert_eq!(c.state(), State::Cancelled);
        assert!(c.is_connected());
        assert!(matches!(t.wire().sent.last(), Some(Message::Cancel { .. })));
    }

    #[test]
    fn wait_times_out() {
        let t = MockTransport::new(|msg| match msg {
            Message::Start(s) => vec![ack(s.session, true, "")],
            _ => Vec::new(),
        });
        let mut c = client(&t);
        c.start_update(UpdateRequest::new()).unwrap();
        assert!(matches!(
            c.wait_until_terminal(Duration::from_millis(20)),
            Err(Error::Timeout { .. })
        ));
    }

    #[test]
    fn install_streams_reader() {
        let t = cooperative();
        let mut c = Client::with_transport(config().chunk_size(64), Box::new(t.clone()));
        let image = io::Cursor::new(vec![7u8; 1000]);
        let outcome = c
            .install(
                UpdateRequest::new().dry_run(true),
                image,
                Duration::from_secs(1),
            )
            .unwrap();
        assert!(outcome.is_success());
        assert_eq!(c.session().unwrap().bytes_acked, 1000);
        assert!(matches!(
            &t.wire().sent[0],
            Message::Start(s) if s.run_mode == swc_proto::RunMode::DryRun
        ));
    }

    #[test]
    fn install_returns_rejection_as_outcome() {
        let t = MockTransport::new(|msg| match msg {
            Message::Start(s) => vec![ack(s.session, false, "BUSY")],
            _ => Vec::new(),
        });
        let mut c = client(&t);
        let outcome = c
            .install(
                UpdateRequest::new(),
                io::Cursor::new(b"img".to_vec()),
                Duration::from_secs(1),
            )
            .unwrap();
        assert!(matches!(outcome, Outcome::Failed(ref c) if c.message == "BUSY"));
    }

    #[test]
    fn close_is_idempotent_and_fails_session() {
        let t = cooperative();
        let mut c = client(&t);
        c.start_update(UpdateRequest::new()).unwrap();
        c.close();
        c.close();
        assert!(t.wire().closed);
        assert_eq!(
            c.session().unwrap().outcome,
            Some(Outcome::Failed(Cause::new(CONNECTION_CLOSED)))
        );
        assert!(c.discard_session().unwrap().is_some());
        assert_eq!(c.state(), State::Idle);
    }

    #[test]
    fn discard_refuses_live_session() {
        let mut c = client(&cooperative());
        c.start_update(UpdateRequest::new()).unwrap();
        assert!(matches!(
            c.discard_session(),
            Err(Error::State {
                op: "discard_session",
                ..
            })
        ));
    }

    #[test]
    fn lazy_connect_reports_missing_endpoint() {
        let mut c = Client::new(config().connect_retries(0));
        assert!(matches!(
            c.start_update(UpdateRequest::new()),
            Err(Error::Connection { .. })
        ));
        assert_eq!(c.state(), State::Idle);
        assert!(c.last_error().is_some());
        // Never connected: polling is a no-op.
        assert_eq!(c.poll_status().unwrap(), None);
    }

    #[test]
    fn magic_constant_is_used_on_the_wire() {
        let t = cooperative();
        let mut c = client(&t);
        c.start_update(UpdateRequest::new()).unwrap();
        let frame = swc_proto::encode(&t.wire().sent[0]).unwrap();
        assert_eq!(&frame[..4], &MAGIC);
    }
}
