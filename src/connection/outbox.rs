//! Outbound frame queue and per-send completion handles.
//!
//! Two FIFO classes feed a single writer: control frames go first and may
//! slip between the fragments of a data message, while fragments of one
//! message are never interleaved with fragments of another. Every send gets
//! a [`SendHandle`] that resolves once its last frame is flushed.

use crate::{
    error::{CapacityError, Error, Result},
    frame::{mask::Masker, Frame, Generator},
    policy::Role,
};
use log::*;
use std::{
    collections::VecDeque,
    fmt,
    io::{self, Write},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};

/// Options for a single send.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Split payloads larger than this into fragments of this size. The
    /// first fragment carries the message opcode, the rest are
    /// continuations; only the last one has FIN set.
    pub fragment_threshold: Option<usize>,
}

/// The outcome of one send: empty on success, otherwise carrying the cause.
#[derive(Debug, Clone)]
pub struct SendResult {
    cause: Option<Arc<Error>>,
}

impl SendResult {
    fn ok() -> Self {
        SendResult { cause: None }
    }

    fn failed(cause: Arc<Error>) -> Self {
        SendResult { cause: Some(cause) }
    }

    /// Whether the frames of this send were fully flushed to the transport.
    pub fn is_ok(&self) -> bool {
        self.cause.is_none()
    }

    /// The failure cause, if any.
    pub fn cause(&self) -> Option<&Error> {
        self.cause.as_deref()
    }
}

#[derive(Debug)]
struct HandleCore {
    /// Set once the first byte of the send is staged for the transport;
    /// cancellation is only possible before that.
    started: bool,
    cancelled: bool,
    /// `None` while the send is in flight.
    outcome: Option<SendResult>,
}

#[derive(Debug)]
struct HandleInner {
    core: Mutex<HandleCore>,
    cond: Condvar,
}

/// Completion and cancellation handle for one queued send.
///
/// Cloning shares the same underlying send; the handle stays valid after
/// the connection is gone and resolves exactly once.
#[derive(Debug, Clone)]
pub struct SendHandle {
    inner: Arc<HandleInner>,
}

impl SendHandle {
    fn new(started: bool) -> Self {
        SendHandle {
            inner: Arc::new(HandleInner {
                core: Mutex::new(HandleCore { started, cancelled: false, outcome: None }),
                cond: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HandleCore> {
        match self.inner.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Block until the send completes, fails or is cancelled.
    pub fn await_completion(&self) -> SendResult {
        let mut core = self.lock();
        loop {
            if let Some(outcome) = &core.outcome {
                return outcome.clone();
            }
            core = match self.inner.cond.wait(core) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    /// Like [`Self::await_completion`] with an upper bound on the wait.
    /// Returns [`Error::Timeout`] when the deadline passes first.
    pub fn await_completion_for(&self, timeout: Duration) -> Result<SendResult> {
        let deadline = Instant::now() + timeout;
        let mut core = self.lock();
        loop {
            if let Some(outcome) = &core.outcome {
                return Ok(outcome.clone());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }
            core = match self.inner.cond.wait_timeout(core, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Withdraw the send if none of its bytes were staged for the transport
    /// yet. Returns `false` once writing began: aborting a frame midway
    /// would desync the peer's parser, so a started send always runs to
    /// completion or failure.
    pub fn cancel(&self) -> bool {
        let mut core = self.lock();
        if core.started || core.outcome.is_some() {
            return false;
        }
        core.cancelled = true;
        core.outcome = Some(SendResult::failed(Arc::new(Error::Cancelled)));
        self.inner.cond.notify_all();
        true
    }

    /// Whether the send reached an outcome (success, failure or cancel).
    pub fn is_done(&self) -> bool {
        self.lock().outcome.is_some()
    }

    /// Whether the send was cancelled before reaching the transport.
    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Mark the send as writing. False if it was cancelled while queued.
    fn begin(&self) -> bool {
        let mut core = self.lock();
        if core.cancelled {
            return false;
        }
        core.started = true;
        true
    }

    fn complete_ok(&self) {
        self.finish(SendResult::ok());
    }

    fn complete_err(&self, cause: Arc<Error>) {
        self.finish(SendResult::failed(cause));
    }

    fn finish(&self, outcome: SendResult) {
        let mut core = self.lock();
        if core.outcome.is_none() {
            core.outcome = Some(outcome);
            self.inner.cond.notify_all();
        }
    }

    fn same(&self, other: &SendHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// One queued send: a frame chain sharing a single handle.
#[derive(Debug)]
struct Entry {
    frames: VecDeque<Frame>,
    handle: SendHandle,
    wire_len: usize,
}

impl Entry {
    fn new(frames: Vec<Frame>, handle: SendHandle) -> Self {
        let wire_len = frames.iter().map(Frame::len).sum();
        Entry { frames: frames.into(), handle, wire_len }
    }
}

/// The outbound half of a connection: two priority queues, one writer.
pub(crate) struct Outbox {
    role: Role,
    masker: Box<dyn Masker>,
    generator: Generator,
    control: VecDeque<Entry>,
    data: VecDeque<Entry>,
    /// Data entry whose fragments are partially staged.
    active: Option<Entry>,
    /// Bytes staged for the transport but not yet written.
    out_buf: Vec<u8>,
    /// Running count of bytes handed to the transport.
    total_written: u64,
    /// Handles completing once `total_written` passes their end offset
    /// and a flush has succeeded.
    in_flight: VecDeque<(u64, SendHandle)>,
    needs_flush: bool,
    queued_bytes: usize,
    max_queue_bytes: Option<usize>,
}

impl Outbox {
    pub(crate) fn new(
        role: Role,
        masker: Box<dyn Masker>,
        max_queue_bytes: Option<usize>,
    ) -> Self {
        Outbox {
            role,
            masker,
            generator: Generator,
            control: VecDeque::new(),
            data: VecDeque::new(),
            active: None,
            out_buf: Vec::new(),
            total_written: 0,
            in_flight: VecDeque::new(),
            needs_flush: false,
            queued_bytes: 0,
            max_queue_bytes,
        }
    }

    /// Queue a control frame (ping/pong). Control frames overtake data.
    pub(crate) fn enqueue_control(&mut self, frame: Frame) -> Result<SendHandle> {
        let entry = self.prepare(vec![frame])?;
        let handle = entry.handle.clone();
        self.control.push_back(entry);
        Ok(handle)
    }

    /// Queue a data frame chain behind all previously queued data.
    pub(crate) fn enqueue_data(&mut self, frames: Vec<Frame>) -> Result<SendHandle> {
        let entry = self.prepare(frames)?;
        let handle = entry.handle.clone();
        self.data.push_back(entry);
        Ok(handle)
    }

    /// Queue the close frame at the tail of the data class, so messages
    /// queued before the close still drain first. The handle comes back
    /// pre-started: a committed close cannot be cancelled, and it bypasses
    /// the queue bound.
    pub(crate) fn enqueue_close(&mut self, frame: Frame) -> SendHandle {
        let mut frame = frame;
        self.mask(&mut frame);
        let entry = Entry::new(vec![frame], SendHandle::new(true));
        let handle = entry.handle.clone();
        self.queued_bytes += entry.wire_len;
        self.data.push_back(entry);
        handle
    }

    fn prepare(&mut self, mut frames: Vec<Frame>) -> Result<Entry> {
        for frame in &mut frames {
            self.mask(frame);
        }
        let entry = Entry::new(frames, SendHandle::new(false));
        if let Some(max_bytes) = self.max_queue_bytes {
            let queued = self.queued_bytes + self.out_buf.len();
            if queued + entry.wire_len > max_bytes {
                return Err(Error::Capacity(CapacityError::SendQueueFull { queued, max_bytes }));
            }
        }
        self.queued_bytes += entry.wire_len;
        Ok(entry)
    }

    /// Clients mask every outgoing frame that does not carry a key yet;
    /// servers never mask.
    fn mask(&mut self, frame: &mut Frame) {
        if self.role == Role::Client && frame.header().mask.is_none() {
            frame.header_mut().mask = Some(self.masker.next_mask());
        }
    }

    /// Write staged and queued frames to the transport, flush, and resolve
    /// the handles of everything fully flushed. `WouldBlock` surfaces as an
    /// error and leaves the remaining bytes staged for the next pump.
    pub(crate) fn pump<S: Write>(&mut self, stream: &mut S) -> Result<()> {
        loop {
            if self.out_buf.is_empty() && !self.stage_next() {
                break;
            }
            while !self.out_buf.is_empty() {
                match stream.write(&self.out_buf) {
                    Ok(0) => {
                        return Err(io::Error::new(
                            io::ErrorKind::ConnectionReset,
                            "Connection reset while sending",
                        )
                        .into())
                    }
                    Ok(n) => {
                        self.out_buf.drain(..n);
                        self.total_written += n as u64;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        if self.needs_flush {
            stream.flush()?;
            self.needs_flush = false;
        }
        self.complete_flushed();
        Ok(())
    }

    /// Stage the next frame into `out_buf`: control first, then the active
    /// fragment chain, then the next data entry. False when nothing is left.
    fn stage_next(&mut self) -> bool {
        loop {
            if let Some(entry) = self.control.pop_front() {
                self.queued_bytes = self.queued_bytes.saturating_sub(entry.wire_len);
                if !entry.handle.begin() {
                    continue; // cancelled while queued
                }
                self.stage_entry(entry);
                return true;
            }
            if self.active.is_none() {
                match self.data.pop_front() {
                    Some(entry) => {
                        self.queued_bytes = self.queued_bytes.saturating_sub(entry.wire_len);
                        if !entry.handle.begin() {
                            continue;
                        }
                        self.active = Some(entry);
                    }
                    None => return false,
                }
            }
            if let Some(mut entry) = self.active.take() {
                if let Some(frame) = entry.frames.pop_front() {
                    let last = entry.frames.is_empty();
                    let handle = entry.handle.clone();
                    if !last {
                        self.active = Some(entry);
                    }
                    self.stage_frame(&frame, last.then_some(handle));
                    return true;
                }
            }
        }
    }

    fn stage_entry(&mut self, mut entry: Entry) {
        while let Some(frame) = entry.frames.pop_front() {
            let last = entry.frames.is_empty();
            self.stage_frame(&frame, last.then_some(entry.handle.clone()));
        }
    }

    fn stage_frame(&mut self, frame: &Frame, completes: Option<SendHandle>) {
        self.generator.generate(frame, &mut self.out_buf);
        self.needs_flush = true;
        if let Some(handle) = completes {
            let end = self.total_written + self.out_buf.len() as u64;
            self.in_flight.push_back((end, handle));
        }
    }

    fn complete_flushed(&mut self) {
        while let Some((end, _)) = self.in_flight.front() {
            if *end > self.total_written {
                break;
            }
            if let Some((_, handle)) = self.in_flight.pop_front() {
                handle.complete_ok();
            }
        }
    }

    /// Fail every queued send with `cause`, keeping only the entry whose
    /// handle matches `spare` (the already queued close frame, if any).
    /// Bytes already staged for the transport still go out.
    pub(crate) fn fail_queued(&mut self, cause: &Arc<Error>, spare: Option<&SendHandle>) {
        for entry in self.control.drain(..) {
            entry.handle.complete_err(cause.clone());
        }
        if let Some(entry) = self.active.take() {
            debug!("dropping partially sent message: {}", cause);
            entry.handle.complete_err(cause.clone());
        }
        let mut kept = VecDeque::new();
        for entry in self.data.drain(..) {
            if spare.map_or(false, |handle| handle.same(&entry.handle)) {
                kept.push_back(entry);
            } else {
                entry.handle.complete_err(cause.clone());
            }
        }
        self.queued_bytes = kept.iter().map(|entry| entry.wire_len).sum();
        self.data = kept;
    }

    /// The transport is gone: fail everything, staged bytes included.
    pub(crate) fn shutdown(&mut self, cause: &Arc<Error>) {
        self.fail_queued(cause, None);
        for entry in self.data.drain(..) {
            entry.handle.complete_err(cause.clone());
        }
        for (_, handle) in self.in_flight.drain(..) {
            handle.complete_err(cause.clone());
        }
        self.out_buf.clear();
        self.needs_flush = false;
        self.queued_bytes = 0;
    }

    /// Nothing queued, staged or awaiting completion.
    pub(crate) fn is_idle(&self) -> bool {
        self.control.is_empty()
            && self.data.is_empty()
            && self.active.is_none()
            && self.out_buf.is_empty()
            && self.in_flight.is_empty()
    }
}

impl Drop for Outbox {
    fn drop(&mut self) {
        if !self.is_idle() {
            self.shutdown(&Arc::new(Error::ConnectionClosed));
        }
    }
}

impl fmt::Debug for Outbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outbox")
            .field("role", &self.role)
            .field("control", &self.control.len())
            .field("data", &self.data.len())
            .field("staged_bytes", &self.out_buf.len())
            .field("queued_bytes", &self.queued_bytes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{
        coding::{Data, OpCode},
        mask::FixedMasker,
    };

    fn outbox(max: Option<usize>) -> Outbox {
        Outbox::new(Role::Server, Box::new(FixedMasker([0; 4])), max)
    }

    fn text(payload: &'static str) -> Frame {
        Frame::message(payload, OpCode::Data(Data::Text), true)
    }

    #[test]
    fn completes_after_flush() {
        let mut queue = outbox(None);
        let handle = queue.enqueue_data(vec![text("hi")]).unwrap();
        assert!(!handle.is_done());

        let mut wire = Vec::new();
        queue.pump(&mut wire).unwrap();
        assert_eq!(wire, [0x81, 0x02, b'h', b'i']);
        assert!(handle.is_done());
        assert!(handle.await_completion().is_ok());
        assert!(queue.is_idle());
    }

    #[test]
    fn control_overtakes_data() {
        let mut queue = outbox(None);
        queue.enqueue_data(vec![text("hi")]).unwrap();
        queue.enqueue_control(Frame::ping(&b"p"[..])).unwrap();

        let mut wire = Vec::new();
        queue.pump(&mut wire).unwrap();
        assert_eq!(&wire[..3], &[0x89, 0x01, b'p']);
        assert_eq!(&wire[3..], &[0x81, 0x02, b'h', b'i']);
    }

    #[test]
    fn cancel_before_write() {
        let mut queue = outbox(None);
        let first = queue.enqueue_data(vec![text("first")]).unwrap();
        let second = queue.enqueue_data(vec![text("second")]).unwrap();
        assert!(second.cancel());
        assert!(second.is_cancelled());
        assert!(matches!(second.await_completion().cause(), Some(Error::Cancelled)));

        let mut wire = Vec::new();
        queue.pump(&mut wire).unwrap();
        assert!(first.await_completion().is_ok());
        assert_eq!(wire, [0x81, 0x05, b'f', b'i', b'r', b's', b't']);
    }

    #[test]
    fn cancel_after_write_fails() {
        let mut queue = outbox(None);
        let handle = queue.enqueue_data(vec![text("hi")]).unwrap();
        let mut wire = Vec::new();
        queue.pump(&mut wire).unwrap();
        assert!(!handle.cancel());
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn queue_bound_rejects() {
        let mut queue = outbox(Some(8));
        queue.enqueue_data(vec![text("abcd")]).unwrap();
        assert!(matches!(
            queue.enqueue_data(vec![text("efgh")]),
            Err(Error::Capacity(CapacityError::SendQueueFull { .. }))
        ));
    }

    #[test]
    fn failed_sends_resolve_with_cause() {
        let mut queue = outbox(None);
        let handle = queue.enqueue_data(vec![text("hi")]).unwrap();
        queue.fail_queued(&Arc::new(Error::AlreadyClosed), None);
        assert!(matches!(handle.await_completion().cause(), Some(Error::AlreadyClosed)));
    }

    #[test]
    fn await_with_deadline_times_out() {
        let mut queue = outbox(None);
        let handle = queue.enqueue_data(vec![text("hi")]).unwrap();
        assert!(matches!(
            handle.await_completion_for(Duration::from_millis(10)),
            Err(Error::Timeout)
        ));
        drop(queue);
        assert!(handle.is_done());
    }

    #[test]
    fn client_frames_are_masked() {
        let mut queue = Outbox::new(Role::Client, Box::new(FixedMasker([1, 2, 3, 4])), None);
        queue.enqueue_data(vec![text("Hi")]).unwrap();
        let mut wire = Vec::new();
        queue.pump(&mut wire).unwrap();
        assert_eq!(wire[1] & 0x80, 0x80);
        assert_eq!(&wire[2..6], &[1, 2, 3, 4]);
        assert_eq!(wire[6], b'H' ^ 1);
        assert_eq!(wire[7], b'i' ^ 2);
    }
}
