//! Update session state machine.
//!
//! Every daemon message goes through [`Machine::apply`], which validates it
//! against the current session and either applies the transition or
//! reports a [`ProtocolWarning`]. Warnings are never fatal: a daemon that is
//! slightly ahead of or behind the client only loses the offending message.
//!
//! ```text
//! Idle ──begin──▶ AwaitingAck ──ACK ok──▶ Streaming ──PROGRESS (data done)──▶ Installing
//!                      │                     │  ▲ DATA_ACK                      │  ▲ PROGRESS
//!                      └──ACK reject─────────┴──┴──ERROR──▶ Failed ◀──ERROR─────┘  │
//!                                            └──SUCCESS (data done)──▶ Done ◀─SUCCESS
//! any non-terminal ──cancel──▶ Cancelled
//! ```

use std::mem;

use swc_proto::{Ack, Message, MessageType, PROTOCOL_VERSION, Progress, Report};

use crate::config::UnsolicitedPolicy;
use crate::error::ProtocolWarning;
use crate::session::{
    Cause, Event, Outcome, SessionId, State, StatusNotification, UpdateRequest, UpdateSession,
};
use crate::{Error, Result};

/// Tracks at most one update session and the transitions applied to it.
#[derive(Debug)]
pub struct Machine {
    /// Live or most recent session.
    current: Option<UpdateSession>,
    /// Identifier handed to the next session.
    next_id: SessionId,
    /// Handling of progress without an active session.
    unsolicited: UnsolicitedPolicy,
    /// Events produced since the last [`take_events`](Self::take_events).
    outbox: Vec<Event>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new(UnsolicitedPolicy::default())
    }
}

impl Machine {
    /// An idle machine. Session identifiers start at 1.
    pub const fn new(unsolicited: UnsolicitedPolicy) -> Self {
        Self {
            current: None,
            next_id: 1,
            unsolicited,
            outbox: Vec::new(),
        }
    }

    /// State of the current session, [`State::Idle`] if there is none.
    pub fn state(&self) -> State {
        self.current.as_ref().map_or(State::Idle, |s| s.state)
    }

    /// Live or most recent session.
    pub const fn session(&self) -> Option<&UpdateSession> {
        self.current.as_ref()
    }

    /// `true` while a session is between `begin` and a terminal state.
    pub fn in_flight(&self) -> bool {
        self.current.as_ref().is_some_and(|s| !s.is_terminal())
    }

    /// Drains pending events.
    pub fn take_events(&mut self) -> Vec<Event> {
        mem::take(&mut self.outbox)
    }

    /// Opens a new session in [`State::AwaitingAck`].
    ///
    /// Fails with [`Error::State`] while another session is in flight; a
    /// terminal session is replaced.
    pub fn begin(&mut self, request: UpdateRequest) -> Result<&UpdateSession> {
        if self.in_flight() {
            return Err(Error::State {
                op: "start_update",
                state: self.state(),
            });
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        tracing::info!(session = id, "session opened");
        self.outbox.push(Event::StateChanged {
            session: id,
            from: State::Idle,
            to: State::AwaitingAck,
        });
        Ok(&*self.current.insert(UpdateSession::new(id, request)))
    }

    /// Records `n` image bytes handed to the transport.
    pub fn record_sent(&mut self, n: u64) -> Result<()> {
        let s = self.streaming_mut("feed_chunk")?;
        s.bytes_sent += n;
        Ok(())
    }

    /// Records that the end-of-image marker was sent.
    pub fn mark_data_complete(&mut self) -> Result<()> {
        let s = self.streaming_mut("finish_image")?;
        s.data_complete = true;
        tracing::debug!(session = s.id, bytes = s.bytes_sent, "image complete");
        Ok(())
    }

    /// Moves the in-flight session to [`State::Cancelled`].
    pub fn cancel(&mut self) -> Result<SessionId> {
        let state = self.state();
        match self.current.as_mut() {
            Some(s) if !s.is_terminal() => {
                let id = s.id;
                finish(s, Outcome::Cancelled, &mut self.outbox);
                Ok(id)
            }
            _ => Err(Error::State { op: "cancel", state }),
        }
    }

    /// Fails the in-flight session with `cause`. Returns `false` if there
    /// was nothing to fail.
    pub fn fail(&mut self, cause: Cause) -> bool {
        match self.current.as_mut() {
            Some(s) if !s.is_terminal() => {
                finish(s, Outcome::Failed(cause), &mut self.outbox);
                true
            }
            _ => false,
        }
    }

    /// Forgets a terminal session, returning it.
    pub fn discard(&mut self) -> Result<Option<UpdateSession>> {
        if self.in_flight() {
            return Err(Error::State {
                op: "discard_session",
                state: self.state(),
            });
        }
        Ok(self.current.take())
    }

    /// Applies one daemon message.
    pub fn apply(&mut self, msg: Message) -> std::result::Result<(), ProtocolWarning> {
        let res = self.dispatch(msg);
        if res.is_err() {
            if let Some(s) = self.current.as_mut().filter(|s| !s.is_terminal()) {
                s.warnings += 1;
            }
        }
        res
    }

    /// Routes `msg` to the current session, or handles it as stray.
    fn dispatch(&mut self, msg: Message) -> std::result::Result<(), ProtocolWarning> {
        let kind = msg.kind();
        let id = msg.session();

        let Some(s) = self.current.as_mut() else {
            return self.stray(msg, State::Idle);
        };

        if id != s.id {
            if id < s.id {
                tracing::debug!(%kind, session = id, "ignoring message for a finished session");
                return Ok(());
            }
            if s.is_terminal() {
                return self.stray(msg, State::Idle);
            }
            return Err(ProtocolWarning::UnknownSession {
                kind,
                session: id,
                active: s.id,
            });
        }

        if s.is_terminal() {
            if kind == MessageType::Cancel && s.state == State::Cancelled {
                tracing::info!(session = id, "daemon confirmed cancellation");
            } else {
                tracing::debug!(%kind, session = id, state = %s.state, "ignoring message for a terminal session");
            }
            return Ok(());
        }

        let out = &mut self.outbox;
        match (s.state, msg) {
            (State::AwaitingAck, Message::Ack(ack)) => on_ack(s, ack, out),
            (State::Streaming, Message::DataAck(d)) => {
                if d.acked > s.bytes_sent {
                    return Err(ProtocolWarning::AckOverrun {
                        acked: d.acked,
                        sent: s.bytes_sent,
                    });
                }
                if d.acked < s.bytes_acked {
                    return Err(ProtocolWarning::AckRegressed {
                        previous: s.bytes_acked,
                        acked: d.acked,
                    });
                }
                s.bytes_acked = d.acked;
            }
            (State::Streaming | State::Installing, Message::Progress(p)) => on_progress(s, p, out),
            (State::Streaming, Message::Success(r)) if s.data_complete => on_success(s, r, out),
            (State::Installing, Message::Success(r)) => on_success(s, r, out),
            (State::AwaitingAck | State::Streaming | State::Installing, Message::Error(r)) => {
                tracing::warn!(session = id, code = r.code, message = %r.message, "daemon failed the session");
                finish(
                    s,
                    Outcome::Failed(Cause::with_code(r.code, r.message)),
                    out,
                );
            }
            (_, Message::Cancel { .. }) => {
                tracing::warn!(session = id, "daemon cancelled the session");
                finish(s, Outcome::Cancelled, out);
            }
            (state, _) => return Err(ProtocolWarning::Unexpected { kind, state }),
        }
        Ok(())
    }

    /// Handles a message that matches no live session.
    fn stray(&mut self, msg: Message, state: State) -> std::result::Result<(), ProtocolWarning> {
        match (msg, self.unsolicited) {
            (Message::Progress(p), UnsolicitedPolicy::Surface) => {
                self.outbox.push(Event::Unsolicited(p.into()));
                Ok(())
            }
            (msg, _) => Err(ProtocolWarning::Unexpected {
                kind: msg.kind(),
                state,
            }),
        }
    }

    /// The current session, if it is streaming.
    fn streaming_mut(&mut self, op: &'static str) -> Result<&mut UpdateSession> {
        let state = self.state();
        match self.current.as_mut() {
            Some(s) if s.state == State::Streaming => Ok(s),
            _ => Err(Error::State { op, state }),
        }
    }
}

/// `AwaitingAck` + `ACK`.
fn on_ack(s: &mut UpdateSession, ack: Ack, out: &mut Vec<Event>) {
    if !ack.accepted {
        let reason = if ack.reason.is_empty() {
            "rejected".to_owned()
        } else {
            ack.reason
        };
        tracing::warn!(session = s.id, code = ack.reason_code, %reason, "daemon rejected the session");
        finish(
            s,
            Outcome::Failed(Cause::with_code(ack.reason_code, reason)),
            out,
        );
    } else if ack.version != PROTOCOL_VERSION {
        let cause = Cause::new(format!(
            "protocol version mismatch: daemon v{}, client v{PROTOCOL_VERSION}",
            ack.version
        ));
        finish(s, Outcome::Failed(cause), out);
    } else {
        transition(s, State::Streaming, out);
    }
}

/// `Streaming`/`Installing` + `PROGRESS`.
fn on_progress(s: &mut UpdateSession, p: Progress, out: &mut Vec<Event>) {
    let note = StatusNotification::from(p);
    tracing::debug!(
        session = s.id,
        step = note.cur_step,
        nsteps = note.nsteps,
        percent = note.percent,
        "progress"
    );
    // Progress once the whole image is out means the daemon is installing.
    if s.state == State::Streaming && s.data_complete {
        transition(s, State::Installing, out);
    }
    s.last_status = Some(note.clone());
    out.push(Event::Progress(note));
}

/// `SUCCESS` after the whole image was delivered.
fn on_success(s: &mut UpdateSession, r: Report, out: &mut Vec<Event>) {
    finish(
        s,
        Outcome::Success {
            code: r.code,
            message: r.message,
        },
        out,
    );
}

/// Moves `s` to `to` and queues the matching event.
fn transition(s: &mut UpdateSession, to: State, out: &mut Vec<Event>) {
    let from = mem::replace(&mut s.state, to);
    tracing::info!(session = s.id, %from, %to, "session state changed");
    out.push(Event::StateChanged {
        session: s.id,
        from,
        to,
    });
}

/// Makes `s` terminal with `outcome`.
fn finish(s: &mut UpdateSession, outcome: Outcome, out: &mut Vec<Event>) {
    transition(s, outcome.state(), out);
    s.outcome = Some(outcome);
}
