//! Per-connection actor: one transport, one session, one endpoint.

pub mod outbox;
pub mod registry;

pub use self::outbox::{SendHandle, SendOptions, SendResult};

use self::registry::{Registry, SessionId};
use crate::{
    endpoint::Endpoint,
    error::{Error, Result},
    frame::{coding::CloseCode, mask::Masker, Utf8Bytes},
    message::MessageKind,
    policy::{Policy, Role},
    session::{Inbound, Session},
};
use bytes::{Bytes, BytesMut};
use log::*;
use std::{
    io::{self, Read, Write},
    sync::Arc,
    time::Instant,
};

/// How much to ask the transport for per read.
const READ_CHUNK: usize = 64 * 1024;

/// A WebSocket connection over an established, already upgraded byte
/// duplex.
///
/// The connection is a single-threaded actor: it owns the transport, the
/// [`Session`] and the application [`Endpoint`], and everything happens on
/// the caller's thread inside [`service`](Self::service). Handles returned
/// by the `send_*` methods may travel to other threads; the connection
/// itself does not.
///
/// With a blocking transport, give the stream a read timeout so timers get
/// a chance to fire; with a non-blocking one, call `service` from your
/// event loop whenever the transport is ready (or a deadline from
/// [`next_deadline`](Self::next_deadline) passes).
#[derive(Debug)]
pub struct Connection<Stream, E> {
    stream: Stream,
    session: Session,
    endpoint: E,
    read_buf: BytesMut,
    registry: Option<(Arc<Registry>, SessionId)>,
    error_reported: bool,
    finished: bool,
}

impl<Stream, E: Endpoint> Connection<Stream, E> {
    /// Wrap an upgraded transport. The role decides the masking direction.
    pub fn new(stream: Stream, role: Role, policy: Policy, endpoint: E) -> Self {
        Connection {
            stream,
            session: Session::new(role, policy),
            endpoint,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            registry: None,
            error_reported: false,
            finished: false,
        }
    }

    /// Like [`Self::new`] with an explicit masker (e.g.
    /// [`FixedMasker`](crate::frame::mask::FixedMasker) in tests).
    pub fn with_masker(
        stream: Stream,
        role: Role,
        policy: Policy,
        endpoint: E,
        masker: Box<dyn Masker>,
    ) -> Self {
        Connection {
            stream,
            session: Session::with_masker(role, policy, masker),
            endpoint,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            registry: None,
            error_reported: false,
            finished: false,
        }
    }

    /// Report this connection's lifecycle to `registry`. Registers it as
    /// open right away; the close report happens when the session ends.
    pub fn attach_registry(&mut self, registry: Arc<Registry>) -> SessionId {
        let id = registry.session_opened();
        self.registry = Some((registry, id));
        id
    }

    /// Returns a shared reference to the inner stream.
    pub fn get_ref(&self) -> &Stream {
        &self.stream
    }

    /// Returns a mutable reference to the inner stream.
    pub fn get_mut(&mut self) -> &mut Stream {
        &mut self.stream
    }

    /// Returns a shared reference to the endpoint.
    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    /// Returns a mutable reference to the endpoint.
    pub fn endpoint_mut(&mut self) -> &mut E {
        &mut self.endpoint
    }

    /// The id under which this connection is registered, if any.
    pub fn id(&self) -> Option<SessionId> {
        self.registry.as_ref().map(|(_, id)| *id)
    }

    /// The session reached its terminal state and `on_close` was delivered.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// The next instant a timer wants servicing.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.session.next_deadline()
    }
}

impl<Stream: Read + Write, E: Endpoint> Connection<Stream, E> {
    /// Queue a TEXT message.
    pub fn send_text(&mut self, text: impl Into<Utf8Bytes>) -> Result<SendHandle> {
        self.send_message(MessageKind::Text, text.into().into(), SendOptions::default())
    }

    /// Queue a BINARY message.
    pub fn send_binary(&mut self, payload: impl Into<Bytes>) -> Result<SendHandle> {
        self.send_message(MessageKind::Binary, payload.into(), SendOptions::default())
    }

    /// Queue a message with explicit options, e.g. a fragment threshold.
    /// For TEXT the payload must already be valid UTF-8 (use
    /// [`send_text`](Self::send_text) for checked input).
    pub fn send_message(
        &mut self,
        kind: MessageKind,
        payload: Bytes,
        options: SendOptions,
    ) -> Result<SendHandle> {
        let handle = self.session.send_message(kind, payload, options)?;
        self.try_pump();
        Ok(handle)
    }

    /// Queue a ping with up to 125 bytes of payload.
    pub fn send_ping(&mut self, payload: impl Into<Bytes>) -> Result<SendHandle> {
        let handle = self.session.send_ping(payload.into())?;
        self.try_pump();
        Ok(handle)
    }

    /// Queue a pong with up to 125 bytes of payload.
    pub fn send_pong(&mut self, payload: impl Into<Bytes>) -> Result<SendHandle> {
        let handle = self.session.send_pong(payload.into())?;
        self.try_pump();
        Ok(handle)
    }

    /// Initiate (or join) the close handshake.
    pub fn close(&mut self, code: CloseCode, reason: &str) -> Result<SendHandle> {
        let handle = self.session.send_close(code, reason, Instant::now())?;
        self.try_pump();
        Ok(handle)
    }

    /// Drive the connection once: fire timers, write, read, dispatch.
    /// Returns `false` once the connection finished and may be dropped.
    pub fn service(&mut self) -> bool {
        if self.finished {
            return false;
        }
        let now = Instant::now();
        self.session.check_timers(now);
        self.pump_outbound();

        if !self.session.is_closed() {
            match self.fill_read_buf() {
                Ok(0) => self.session.transport_eof(),
                Ok(_) => self.drain_events(now),
                Err(err) if would_block(&err) => {}
                Err(err) => self.handle_failure(Error::Io(err), now),
            }
        }

        // Replies queued while reading (pongs, close echoes) go out now.
        self.pump_outbound();
        self.dispatch_closed();
        !self.finished
    }

    /// Service in a loop until the connection finishes. Meant for blocking
    /// transports; set a read timeout on the stream when timers matter.
    pub fn run(&mut self) {
        while self.service() {}
    }

    fn drain_events(&mut self, now: Instant) {
        loop {
            match self.session.receive(&mut self.read_buf, now) {
                Ok(Some(event)) => self.dispatch(event),
                Ok(None) => break,
                Err(err) => {
                    self.handle_failure(err, now);
                    break;
                }
            }
        }
    }

    fn dispatch(&mut self, event: Inbound) {
        match event {
            Inbound::Message(message) => self.endpoint.on_message(message),
            Inbound::Ping(payload) => self.endpoint.on_ping(&payload),
            Inbound::Pong(payload) => self.endpoint.on_pong(&payload),
            Inbound::Closed(info) => {
                self.finished = true;
                if let Some((registry, id)) = &self.registry {
                    registry.session_closed(*id);
                }
                self.endpoint.on_close(&info);
            }
        }
    }

    fn dispatch_closed(&mut self) {
        if let Some(event) = self.session.poll_closed() {
            self.dispatch(event);
        }
    }

    /// Protocol and transport failures both end here: the session runs its
    /// error close path and the endpoint hears about it once.
    fn handle_failure(&mut self, err: Error, now: Instant) {
        let cause = self.session.fail(err, now);
        if !self.error_reported {
            self.error_reported = true;
            self.endpoint.on_error(&cause);
        }
    }

    fn pump_outbound(&mut self) {
        match self.session.pump(&mut self.stream) {
            Ok(()) => {}
            Err(Error::Io(err)) if would_block(&err) => {}
            Err(err) => self.handle_failure(err, Instant::now()),
        }
    }

    /// Best-effort write right after queueing a send; `service` retries.
    fn try_pump(&mut self) {
        if let Err(err) = self.session.pump(&mut self.stream) {
            match err {
                Error::Io(ref io_err) if would_block(io_err) => {}
                err => trace!("deferred write error until service: {}", err),
            }
        }
    }

    /// Read into the spare tail of the buffer: grow, read, shrink back to
    /// what actually arrived.
    fn fill_read_buf(&mut self) -> io::Result<usize> {
        let len = self.read_buf.len();
        self.read_buf.resize(len + READ_CHUNK, 0);
        let size = self.stream.read(&mut self.read_buf[len..]);
        self.read_buf.truncate(len + size.as_ref().copied().unwrap_or(0));
        size
    }
}

impl<Stream, E> Drop for Connection<Stream, E> {
    fn drop(&mut self) {
        if !self.finished {
            if let Some((registry, id)) = &self.registry {
                registry.session_closed(*id);
            }
        }
    }
}

fn would_block(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}
