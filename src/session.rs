//! Sans-io protocol session: frames in, frames out, close handshake.
//!
//! A [`Session`] owns the parser, the assembler, the close state machine and
//! the outbound queue of exactly one connection. It never touches a socket
//! for reading; the caller feeds it buffered transport bytes and pumps the
//! write side, which is what [`Connection`](crate::connection::Connection)
//! does for `Read + Write` transports.

use crate::{
    connection::outbox::{Outbox, SendHandle, SendOptions},
    error::{Error, ProtocolError, Result},
    frame::{
        coding::{CloseCode, Control, Data, OpCode},
        mask::{Masker, RandomMasker},
        CloseFrame, Frame, Parser, Utf8Bytes,
    },
    message::{Message, MessageKind},
    policy::{Policy, Role},
};
use bytes::{Bytes, BytesMut};
use log::*;
use std::{io::Write, sync::Arc, time::Instant};

/// Status code and reason of the effective close, as seen by observers.
///
/// Unlike a wire-level [`CloseFrame`] the code is always present; a
/// code-less peer close surfaces as 1005 and a dead transport as 1006.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    /// The close code.
    pub code: CloseCode,
    /// The close reason.
    pub reason: Utf8Bytes,
}

impl CloseInfo {
    fn new(code: CloseCode) -> Self {
        CloseInfo { code, reason: Utf8Bytes::default() }
    }
}

impl From<CloseFrame> for CloseInfo {
    fn from(frame: CloseFrame) -> Self {
        CloseInfo { code: frame.code, reason: frame.reason }
    }
}

/// One protocol event surfaced to the collaborator.
#[derive(Debug)]
pub enum Inbound {
    /// A whole TEXT or BINARY message.
    Message(Message),
    /// An inbound ping. The pong reply is already queued unless the policy
    /// opted out of auto-pong.
    Ping(Bytes),
    /// An inbound pong.
    Pong(Bytes),
    /// The connection reached its terminal state. Last event, seen once.
    Closed(CloseInfo),
}

/// Close handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    /// Frames flow both ways.
    Open,
    /// We queued a CLOSE, the peer has not answered yet.
    ClosingLocal,
    /// The peer sent a CLOSE; ours goes out and then the transport drops.
    ClosingRemote,
    /// Terminal.
    Closed,
}

/// The protocol engine of a single connection.
#[derive(Debug)]
pub struct Session {
    role: Role,
    policy: Policy,
    parser: Parser,
    assembler: crate::message::Assembler,
    outbox: Outbox,
    state: SessionState,
    /// Handle of the single CLOSE frame this session will ever queue.
    close_handle: Option<SendHandle>,
    effective_close: Option<CloseInfo>,
    closed_reported: bool,
    /// Hard-drop deadline armed when we initiate the close handshake.
    close_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
}

impl Session {
    /// Create a session with a random per-frame masker.
    pub fn new(role: Role, policy: Policy) -> Self {
        Self::with_masker(role, policy, Box::new(RandomMasker))
    }

    /// Create a session with the given masker. Client connections consult
    /// it for every outgoing frame; servers never mask.
    pub fn with_masker(role: Role, policy: Policy, masker: Box<dyn Masker>) -> Self {
        Session {
            role,
            policy,
            parser: Parser::new(role, policy.max_frame_payload_size),
            assembler: crate::message::Assembler::new(policy.max_message_size),
            outbox: Outbox::new(role, masker, policy.max_outbound_queue_bytes),
            state: SessionState::Open,
            close_handle: None,
            effective_close: None,
            closed_reported: false,
            close_deadline: None,
            idle_deadline: None,
        }
    }

    /// The local role.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The session reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// No close was initiated by either side yet.
    pub fn is_open(&self) -> bool {
        self.state == SessionState::Open
    }

    // ---------------------------------------------------------------- inbound

    /// Consume buffered transport bytes and surface at most one event.
    ///
    /// Call again until `Ok(None)` to drain a buffer that holds several
    /// frames. Protocol violations come back as errors; feed them to
    /// [`Self::fail`] to run the error close handshake.
    pub fn receive(&mut self, buf: &mut BytesMut, now: Instant) -> Result<Option<Inbound>> {
        if self.state == SessionState::Closed {
            return Err(Error::AlreadyClosed);
        }
        if let Some(idle) = self.policy.idle_timeout {
            self.idle_deadline = Some(now + idle);
        }
        while let Some(frame) = self.parser.parse(buf)? {
            if let Some(event) = self.route_frame(frame)? {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    /// The transport reached EOF. An EOF before the close handshake
    /// finished surfaces as the synthetic close code 1006.
    pub fn transport_eof(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        debug!("transport EOF before the close handshake finished");
        self.terminate(CloseInfo::new(CloseCode::Abnormal));
    }

    fn route_frame(&mut self, frame: Frame) -> Result<Option<Inbound>> {
        if matches!(self.state, SessionState::ClosingRemote | SessionState::Closed) {
            return Err(Error::Protocol(ProtocolError::ReceivedAfterClosing));
        }
        match frame.header().opcode {
            OpCode::Control(Control::Close) => self.on_close_frame(frame),
            OpCode::Control(Control::Ping) => {
                let payload = frame.into_payload();
                if self.policy.auto_pong {
                    // Queued as control so it overtakes pending data.
                    if let Err(err) = self.outbox.enqueue_control(Frame::pong(payload.clone())) {
                        warn!("dropping automatic pong: {}", err);
                    }
                }
                Ok(Some(Inbound::Ping(payload)))
            }
            OpCode::Control(Control::Pong) => Ok(Some(Inbound::Pong(frame.into_payload()))),
            OpCode::Control(Control::Reserved(i)) => {
                Err(Error::Protocol(ProtocolError::InvalidOpcode(i)))
            }
            OpCode::Data(_) => Ok(self.assembler.sink(frame)?.map(Inbound::Message)),
        }
    }

    fn on_close_frame(&mut self, frame: Frame) -> Result<Option<Inbound>> {
        let close = frame.into_close()?;
        if let Some(close) = &close {
            if !close.code.is_allowed() {
                return Err(Error::Protocol(ProtocolError::InvalidCloseCode(close.code.into())));
            }
        }
        if self.assembler.is_mid_message() {
            // RFC 6455 allows abandoning a partial message on close.
            debug!("close frame mid-message, dropping the partial message");
            self.assembler.reset();
        }
        match self.state {
            SessionState::Open => {
                debug!("received close frame: {:?}", close);
                self.state = SessionState::ClosingRemote;
                self.effective_close = Some(match close.clone() {
                    Some(close) => close.into(),
                    None => CloseInfo::new(CloseCode::Status),
                });
                // Echo the peer's code, or 1000 when it sent none.
                let echo = close.unwrap_or(CloseFrame {
                    code: CloseCode::Normal,
                    reason: Utf8Bytes::default(),
                });
                self.queue_close(Frame::close(Some(echo)));
                Ok(None)
            }
            SessionState::ClosingLocal => {
                debug!("peer confirmed our close: {:?}", close);
                self.close_deadline = None;
                self.state = SessionState::Closed;
                if let Some(close) = close {
                    self.effective_close = Some(close.into());
                }
                Ok(None)
            }
            // Filtered in route_frame.
            SessionState::ClosingRemote | SessionState::Closed => {
                Err(Error::Protocol(ProtocolError::ReceivedAfterClosing))
            }
        }
    }

    // --------------------------------------------------------------- outbound

    /// Queue a TEXT or BINARY message. With a `fragment_threshold` set and a
    /// payload above it, the message goes out as a fragment chain; all
    /// fragments share the returned handle, which resolves after the last
    /// one is flushed.
    pub fn send_message(
        &mut self,
        kind: MessageKind,
        payload: Bytes,
        options: SendOptions,
    ) -> Result<SendHandle> {
        match self.state {
            SessionState::Open => {}
            SessionState::Closed => return Err(Error::AlreadyClosed),
            _ => return Err(Error::Protocol(ProtocolError::SendAfterClosing)),
        }
        self.outbox.enqueue_data(fragment(kind, payload, options.fragment_threshold))
    }

    /// Queue a ping. Pings stay legal while the close handshake runs.
    pub fn send_ping(&mut self, payload: Bytes) -> Result<SendHandle> {
        self.send_control(Frame::ping(payload))
    }

    /// Queue a pong, e.g. a unidirectional heartbeat.
    pub fn send_pong(&mut self, payload: Bytes) -> Result<SendHandle> {
        self.send_control(Frame::pong(payload))
    }

    fn send_control(&mut self, frame: Frame) -> Result<SendHandle> {
        if self.state == SessionState::Closed {
            return Err(Error::AlreadyClosed);
        }
        if frame.payload().len() > 125 {
            return Err(Error::Protocol(ProtocolError::ControlFrameTooBig));
        }
        self.outbox.enqueue_control(frame)
    }

    /// Initiate the close handshake. Idempotent: once a CLOSE is queued,
    /// every later call returns a handle to that same close.
    ///
    /// A code that may not appear on the wire degrades to the code-less
    /// close frame. The reason is truncated so the payload fits 125 bytes.
    pub fn send_close(&mut self, code: CloseCode, reason: &str, now: Instant) -> Result<SendHandle> {
        if let Some(handle) = &self.close_handle {
            return Ok(handle.clone());
        }
        if self.state == SessionState::Closed {
            return Err(Error::AlreadyClosed);
        }
        let reason = truncate_reason(reason);
        let close = code
            .is_allowed()
            .then(|| CloseFrame { code, reason: reason.into() });
        Ok(self.begin_local_close(close, CloseInfo { code, reason: reason.into() }, now))
    }

    /// Fail the connection: pending sends resolve with `err` as their
    /// cause, and (for protocol-level errors) a CLOSE with the mapped code
    /// goes out. Returns the shared cause for the caller to report.
    pub fn fail(&mut self, err: Error, now: Instant) -> Arc<Error> {
        let cause = Arc::new(err);
        if self.state == SessionState::Closed {
            return cause;
        }
        match &*cause {
            Error::Io(_) | Error::ConnectionClosed => {
                self.outbox.shutdown(&cause);
                self.terminate(CloseInfo::new(CloseCode::Abnormal));
            }
            _ => {
                let spare = self.close_handle.clone();
                self.outbox.fail_queued(&cause, spare.as_ref());
                let code = cause.close_code();
                self.begin_local_close(
                    Some(CloseFrame { code, reason: Utf8Bytes::default() }),
                    CloseInfo::new(code),
                    now,
                );
            }
        }
        cause
    }

    fn begin_local_close(
        &mut self,
        close: Option<CloseFrame>,
        info: CloseInfo,
        now: Instant,
    ) -> SendHandle {
        let handle = self.queue_close(Frame::close(close));
        if self.state == SessionState::Open {
            self.state = SessionState::ClosingLocal;
            self.close_deadline = Some(now + self.policy.close_timeout);
        }
        if self.effective_close.is_none() {
            self.effective_close = Some(info);
        }
        handle
    }

    /// At most one CLOSE ever reaches the queue.
    fn queue_close(&mut self, frame: Frame) -> SendHandle {
        if let Some(handle) = &self.close_handle {
            return handle.clone();
        }
        let handle = self.outbox.enqueue_close(frame);
        self.close_handle = Some(handle.clone());
        handle
    }

    // ---------------------------------------------------------------- driving

    /// Write queued frames to the transport and advance the close
    /// handshake. `WouldBlock` comes back as an `Io` error with everything
    /// staged for the next pump.
    pub fn pump<S: Write>(&mut self, stream: &mut S) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        self.outbox.pump(stream)?;
        if self.state == SessionState::ClosingRemote && self.close_flushed() {
            // Outbound close flushed; the transport may drop now.
            self.state = SessionState::Closed;
        }
        Ok(())
    }

    /// Fire expired timers. The idle timer initiates a 1001 close; the
    /// close timer hard-drops a handshake the peer never answered.
    pub fn check_timers(&mut self, now: Instant) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(deadline) = self.close_deadline {
            if now >= deadline {
                debug!("close handshake timed out, dropping the transport");
                self.close_deadline = None;
                self.outbox.shutdown(&Arc::new(Error::ConnectionClosed));
                self.terminate(CloseInfo::new(CloseCode::Abnormal));
                return;
            }
        }
        if let Some(idle) = self.policy.idle_timeout {
            match self.idle_deadline {
                // Not armed yet: the first timer pass starts the countdown.
                None => self.idle_deadline = Some(now + idle),
                Some(deadline) if now >= deadline && self.state == SessionState::Open => {
                    debug!("idle timeout, closing");
                    self.idle_deadline = None;
                    self.begin_local_close(
                        Some(CloseFrame {
                            code: CloseCode::Away,
                            reason: Utf8Bytes::from_static("idle timeout"),
                        }),
                        CloseInfo {
                            code: CloseCode::Away,
                            reason: Utf8Bytes::from_static("idle timeout"),
                        },
                        now,
                    );
                }
                Some(_) => {}
            }
        }
    }

    /// The next instant a timer wants [`Self::check_timers`] called.
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.close_deadline, self.idle_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Once the session is terminal this yields the close event, exactly
    /// one time. The caller dispatches it as its `on_close`.
    pub fn poll_closed(&mut self) -> Option<Inbound> {
        if self.state == SessionState::Closed && !self.closed_reported {
            self.closed_reported = true;
            let info = self
                .effective_close
                .clone()
                .unwrap_or_else(|| CloseInfo::new(CloseCode::Abnormal));
            return Some(Inbound::Closed(info));
        }
        None
    }

    fn close_flushed(&self) -> bool {
        self.close_handle.as_ref().map_or(false, |handle| handle.is_done())
    }

    fn terminate(&mut self, fallback: CloseInfo) {
        self.state = SessionState::Closed;
        self.close_deadline = None;
        if self.effective_close.is_none() {
            self.effective_close = Some(fallback);
        }
    }
}

/// Cut a close reason down so code plus reason fit a control payload.
fn truncate_reason(reason: &str) -> &str {
    const MAX: usize = 125 - 2;
    if reason.len() <= MAX {
        return reason;
    }
    let mut end = MAX;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// Split a payload into a fragment chain of at most `threshold`-sized
/// frames; the first carries the message opcode, only the last has FIN.
fn fragment(kind: MessageKind, payload: Bytes, threshold: Option<usize>) -> Vec<Frame> {
    let opcode = kind.opcode();
    match threshold {
        Some(threshold) if threshold > 0 && payload.len() > threshold => {
            let mut frames = Vec::with_capacity((payload.len() + threshold - 1) / threshold);
            let mut offset = 0;
            while offset < payload.len() {
                let end = (offset + threshold).min(payload.len());
                let first = offset == 0;
                let last = end == payload.len();
                frames.push(Frame::message(
                    payload.slice(offset..end),
                    if first { opcode } else { OpCode::Data(Data::Continuation) },
                    last,
                ));
                offset = end;
            }
            frames
        }
        _ => vec![Frame::message(payload, opcode, true)],
    }
}
