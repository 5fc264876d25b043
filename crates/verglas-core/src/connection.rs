use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use mio::{Interest, Registry, Token};
use parking_lot::{Condvar, Mutex};

use verglas_codec::{InputStream, OutputStream};
use verglas_wire::{
    EncodingVersion, MessageHeader, MessageType, ReplyStatus, HEADER_SIZE,
};

use crate::message::{
    build_frame, control_frame, read_request_body, write_request_body, ParsedRequest, ReplyData,
    RequestSpec,
};
use crate::selector::{EventHandler, Ready};
use crate::thread_pool::{ThreadPool, ThreadPoolCurrent};
use crate::timer::{Timer, TimerToken};
use crate::transport::{InitStatus, Transport};
use crate::{LocalError, ProtocolError, TransportError};

/// How [`Connection::close`] winds the connection down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseMode {
    /// Refuse new invocations, wait for outstanding replies, announce the
    /// close, then close the transport.
    Gracefully,
    /// Like `Gracefully`, and also wait for in-flight dispatches to
    /// return their replies.
    GracefullyWithWait,
    /// Close the transport immediately; pending invocations fail.
    Forcefully,
}

/// Connection lifecycle phases, in order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    NotInitialized,
    Validating,
    Active,
    Holding,
    Closing,
    Closed,
    Finished,
}

/// Static knobs the connection reads from the runtime configuration.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionConfig {
    /// Maximum inbound frame size, bytes.
    pub message_size_max: usize,
    /// Batch buffer flush threshold, bytes.
    pub batch_auto_flush_size: usize,
    /// Idle close and heartbeat cadence; zero disables ACM.
    pub acm_timeout: Duration,
    /// Reject inbound compressed frames when false.
    pub accept_compressed: bool,
    pub warn_connections: bool,
}

pub(crate) type ReplyCallback = Box<dyn FnOnce(Result<ReplyData, LocalError>) + Send>;
pub(crate) type ConnectCallback = Box<dyn FnOnce(Result<Arc<Connection>, LocalError>) + Send>;

/// Receives requests that arrived on a connection; the server side of the
/// house implements this.
pub(crate) trait IncomingDispatcher: Send + Sync {
    fn dispatch(&self, connection: &Arc<Connection>, request: ParsedRequest);
}

struct PendingSend {
    frame: Bytes,
    /// Waiter already registered under this id; on failure before the
    /// frame is written the id is failed through the request table.
    request_id: Option<i32>,
}

struct BatchBuffer {
    bodies: Vec<u8>,
    count: i32,
}

struct ConnState {
    transport: Box<dyn Transport>,
    token: Option<Token>,
    phase: Phase,
    /// Interest currently registered with the selector.
    interest: Ready,
    read_buf: Vec<u8>,
    write_queue: VecDeque<Bytes>,
    write_offset: usize,
    requests: HashMap<i32, ReplyCallback>,
    next_request_id: i32,
    pending_sends: Vec<PendingSend>,
    connect_waiters: Vec<ConnectCallback>,
    batch: BatchBuffer,
    /// Dispatches currently running in servant code.
    dispatch_count: usize,
    close_mode: Option<CloseMode>,
    close_frame_queued: bool,
    error: Option<LocalError>,
    last_read: Instant,
    last_write: Instant,
    acm_token: Option<TimerToken>,
}

/// One connection: a transport, an input buffer, an output queue, the
/// active-request table and the state machine gluing them together.
///
/// The outgoing connection factory (or an object adapter's acceptor) is
/// the sole owner; proxies resolve a weak handle per invocation. All
/// mutation happens under one mutex; user-visible callbacks always run
/// after it is released.
pub struct Connection {
    state: Mutex<ConnState>,
    cond: Condvar,
    pool: Arc<ThreadPool>,
    timer: Arc<Timer>,
    config: ConnectionConfig,
    encoding: EncodingVersion,
    /// Client connections initiated the transport and expect validation;
    /// server connections send it.
    outgoing: bool,
    datagram: bool,
    /// Endpoint-level `-z`: compress requests whose proxy left the
    /// choice open.
    compress_default: bool,
    dispatcher: Mutex<Option<Arc<dyn IncomingDispatcher>>>,
    desc: String,
}

enum Action {
    Complete(ReplyCallback, Result<ReplyData, LocalError>),
    ConnectDone(ConnectCallback, Result<Arc<Connection>, LocalError>),
    Dispatch(ParsedRequest),
}

impl Connection {
    pub(crate) fn new(
        transport: Box<dyn Transport>,
        pool: Arc<ThreadPool>,
        timer: Arc<Timer>,
        config: ConnectionConfig,
        encoding: EncodingVersion,
        outgoing: bool,
        compress_default: bool,
    ) -> Arc<Self> {
        let datagram = transport.is_datagram();
        let desc = transport.describe();
        Arc::new(Connection {
            state: Mutex::new(ConnState {
                transport,
                token: None,
                phase: Phase::NotInitialized,
                interest: Ready::empty(),
                read_buf: Vec::new(),
                write_queue: VecDeque::new(),
                write_offset: 0,
                requests: HashMap::new(),
                next_request_id: 0,
                pending_sends: Vec::new(),
                connect_waiters: Vec::new(),
                batch: BatchBuffer { bodies: Vec::new(), count: 0 },
                dispatch_count: 0,
                close_mode: None,
                close_frame_queued: false,
                error: None,
                last_read: Instant::now(),
                last_write: Instant::now(),
                acm_token: None,
            }),
            cond: Condvar::new(),
            pool,
            timer,
            config,
            encoding,
            outgoing,
            datagram,
            compress_default,
            dispatcher: Mutex::new(None),
            desc,
        })
    }

    pub(crate) fn set_dispatcher(&self, dispatcher: Arc<dyn IncomingDispatcher>) {
        *self.dispatcher.lock() = Some(dispatcher);
    }

    /// Register with the thread pool and begin establishment. Datagram
    /// transports skip validation and go straight to `Active`.
    pub(crate) fn start(self: &Arc<Self>) -> Result<(), LocalError> {
        let interest = Ready::READ | Ready::WRITE;
        let token = self
            .pool
            .initialize(self.clone() as Arc<dyn EventHandler>, interest)
            .map_err(TransportError::Socket)?;
        let mut st = self.state.lock();
        st.token = Some(token);
        st.interest = interest;
        drop(st);
        self.schedule_acm();
        // Kick establishment in case the socket is already usable.
        self.pool.ready(token, Ready::WRITE);
        Ok(())
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn describe(&self) -> String {
        self.desc.clone()
    }

    pub(crate) fn is_datagram(&self) -> bool {
        self.datagram
    }

    /// Whether new invocations may be queued on this connection.
    pub(crate) fn is_usable(&self) -> bool {
        let st = self.state.lock();
        st.error.is_none()
            && matches!(
                st.phase,
                Phase::NotInitialized | Phase::Validating | Phase::Active
            )
    }

    /// Register a callback run once the connection is usable (or failed).
    pub(crate) fn on_established(self: &Arc<Self>, callback: ConnectCallback) {
        let mut st = self.state.lock();
        match st.phase {
            Phase::Active | Phase::Holding => {
                drop(st);
                callback(Ok(self.clone()));
            }
            Phase::Closing | Phase::Closed | Phase::Finished => {
                let err = Self::pending_error(&st);
                drop(st);
                callback(Err(err));
            }
            _ => st.connect_waiters.push(callback),
        }
    }

    fn pending_error(st: &ConnState) -> LocalError {
        st.error
            .as_ref()
            .map(LocalError::duplicate)
            .unwrap_or_else(|| ProtocolError::CloseConnection.into())
    }

    // --- outbound path ------------------------------------------------

    /// Queue a request. A twoway request registers `response` in the
    /// active-request table before any byte reaches the wire; the
    /// allocated id is returned so the invocation can cancel it later.
    pub(crate) fn send_request(
        self: &Arc<Self>,
        spec: RequestSpec,
        response: Option<ReplyCallback>,
    ) -> Result<Option<i32>, LocalError> {
        let mut st = self.state.lock();
        match st.phase {
            Phase::NotInitialized | Phase::Validating | Phase::Active => {}
            Phase::Holding => {}
            _ => return Err(Self::pending_error(&st)),
        }
        if st.error.is_some() {
            return Err(Self::pending_error(&st));
        }

        let request_id = if response.is_some() {
            // Positive, monotonically increasing; zero stays reserved for
            // oneway requests even after wrapping.
            if st.next_request_id == i32::MAX {
                st.next_request_id = 0;
            }
            st.next_request_id += 1;
            Some(st.next_request_id)
        } else {
            None
        };

        let frame = build_frame(MessageType::Request, self.encoding, |out| {
            out.write_i32(request_id.unwrap_or(0));
            write_request_body(out, &spec)
        })?;
        let frame =
            self.maybe_compress(frame, spec.compress.unwrap_or(self.compress_default))?;

        if let (Some(id), Some(callback)) = (request_id, response) {
            st.requests.insert(id, callback);
        }

        if st.phase == Phase::Active || st.phase == Phase::Holding {
            self.queue_frame(&mut st, frame)?;
        } else {
            st.pending_sends.push(PendingSend { frame, request_id });
        }
        Ok(request_id)
    }

    /// Append a request to the batch buffer, flushing first when the
    /// buffer would cross the auto-flush threshold.
    pub(crate) fn send_batch_request(
        self: &Arc<Self>,
        spec: RequestSpec,
    ) -> Result<(), LocalError> {
        let mut body = OutputStream::new(self.encoding);
        write_request_body(&mut body, &spec)?;
        let body = body.finished();

        let mut st = self.state.lock();
        if st.error.is_some() {
            return Err(Self::pending_error(&st));
        }
        if st.batch.count > 0
            && st.batch.bodies.len() + body.len() > self.config.batch_auto_flush_size
        {
            self.flush_batch_locked(&mut st)?;
        }
        st.batch.bodies.extend_from_slice(&body);
        st.batch.count += 1;
        Ok(())
    }

    /// Emit the accumulated batch as one BatchRequest message.
    pub fn flush_batch(self: &Arc<Self>) -> Result<(), LocalError> {
        let mut st = self.state.lock();
        self.flush_batch_locked(&mut st)
    }

    fn flush_batch_locked(&self, st: &mut ConnState) -> Result<(), LocalError> {
        if st.batch.count == 0 {
            return Ok(());
        }
        let count = st.batch.count;
        let bodies = std::mem::take(&mut st.batch.bodies);
        st.batch.count = 0;
        let frame = build_frame(MessageType::BatchRequest, self.encoding, |out| {
            // The count placeholder is known by now; requests were
            // appended body-first into the side buffer.
            out.write_i32(count);
            out.write_blob(&bodies);
            Ok(())
        })?;
        if st.phase == Phase::Active || st.phase == Phase::Holding {
            self.queue_frame(st, frame)
        } else {
            st.pending_sends.push(PendingSend { frame, request_id: None });
            Ok(())
        }
    }

    pub(crate) fn send_reply(
        self: &Arc<Self>,
        request_id: i32,
        status: ReplyStatus,
        body: Bytes,
    ) {
        let frame = match build_frame(MessageType::Reply, self.encoding, |out| {
            out.write_i32(request_id);
            out.write_u8(status.as_u8());
            out.write_blob(&body);
            Ok(())
        }) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(connection = %self.desc, error = %e, "cannot marshal reply");
                return;
            }
        };
        let mut st = self.state.lock();
        if st.error.is_some() || st.phase >= Phase::Closed {
            return; // The caller is gone with the connection.
        }
        if let Err(e) = self.queue_frame(&mut st, frame) {
            tracing::debug!(connection = %self.desc, error = %e, "reply dropped");
        }
    }

    /// A dispatch finished; relevant for graceful-with-wait close.
    pub(crate) fn dispatch_finished(self: &Arc<Self>) {
        let mut st = self.state.lock();
        st.dispatch_count = st.dispatch_count.saturating_sub(1);
        let actions = self.maybe_progress_close(&mut st);
        drop(st);
        self.run_actions(actions);
    }

    /// Remove a waiter before its reply arrived (cancellation). Returns
    /// the callback when it was still registered.
    pub(crate) fn remove_waiter(&self, request_id: i32) -> Option<ReplyCallback> {
        let mut st = self.state.lock();
        st.requests.remove(&request_id)
    }

    // --- close --------------------------------------------------------

    pub fn close(self: &Arc<Self>, mode: CloseMode) {
        let actions = {
            let mut st = self.state.lock();
            if st.phase >= Phase::Closed {
                return;
            }
            match mode {
                CloseMode::Forcefully => self.fail_locked(
                    &mut st,
                    ProtocolError::ConnectionManuallyClosed { graceful: false }.into(),
                ),
                CloseMode::Gracefully | CloseMode::GracefullyWithWait => {
                    if st.close_mode.is_none() {
                        st.close_mode = Some(mode);
                        if st.phase < Phase::Closing {
                            st.phase = Phase::Closing;
                        }
                    }
                    self.maybe_progress_close(&mut st)
                }
            }
        };
        self.run_actions(actions);
    }

    /// Stop reading (and thus dispatching); writes still drain.
    pub fn hold(self: &Arc<Self>) {
        let mut st = self.state.lock();
        if st.phase == Phase::Active {
            st.phase = Phase::Holding;
            if let Some(token) = st.token {
                st.interest -= Ready::READ;
                self.pool.update(token, Ready::READ, Ready::empty());
            }
        }
    }

    pub fn resume(self: &Arc<Self>) {
        let mut st = self.state.lock();
        if st.phase == Phase::Holding {
            st.phase = Phase::Active;
            if let Some(token) = st.token {
                st.interest |= Ready::READ;
                self.pool.update(token, Ready::empty(), Ready::READ);
            }
        }
    }

    /// Block until the connection reached `Finished`.
    pub fn wait_finished(&self) {
        let mut st = self.state.lock();
        while st.phase != Phase::Finished {
            self.cond.wait(&mut st);
        }
    }

    /// Terminate with `error`: every pending waiter completes exactly
    /// once, then the transport closes.
    pub(crate) fn fail(self: &Arc<Self>, error: LocalError) {
        let actions = {
            let mut st = self.state.lock();
            if st.phase >= Phase::Closed {
                return;
            }
            self.fail_locked(&mut st, error)
        };
        self.run_actions(actions);
    }

    fn fail_locked(&self, st: &mut ConnState, error: LocalError) -> Vec<Action> {
        if self.config.warn_connections {
            tracing::warn!(connection = %self.desc, error = %error, "connection failed");
        } else {
            tracing::debug!(connection = %self.desc, error = %error, "connection failed");
        }
        let mut actions = Vec::new();
        for (_, callback) in st.requests.drain() {
            actions.push(Action::Complete(callback, Err(error.duplicate())));
        }
        st.pending_sends.clear();
        for waiter in st.connect_waiters.drain(..) {
            actions.push(Action::ConnectDone(waiter, Err(error.duplicate())));
        }
        st.error = Some(error);
        st.phase = Phase::Closed;
        st.transport.close();
        if let Some(token) = st.acm_token.take() {
            self.timer.cancel(token);
        }
        if let Some(token) = st.token.take() {
            // finished() flips the phase to Finished on a pool thread.
            self.pool.finish(token);
        } else {
            st.phase = Phase::Finished;
            self.cond.notify_all();
        }
        actions
    }

    /// Advance a graceful close: once replies (and, with wait, dispatches)
    /// are in, announce the close and shut the transport down.
    fn maybe_progress_close(&self, st: &mut ConnState) -> Vec<Action> {
        if st.phase != Phase::Closing || st.close_frame_queued {
            return Vec::new();
        }
        let Some(mode) = st.close_mode else {
            return Vec::new();
        };
        let replies_done = st.requests.is_empty();
        let dispatches_done =
            mode != CloseMode::GracefullyWithWait || st.dispatch_count == 0;
        if !(replies_done && dispatches_done) {
            return Vec::new();
        }
        st.close_frame_queued = true;
        if !self.datagram {
            let frame = control_frame(MessageType::CloseConnection, self.encoding);
            if let Err(e) = self.queue_frame(st, frame) {
                return self.fail_locked(st, e);
            }
        }
        // The transport closes once the write queue drains.
        self.maybe_finish_close(st)
    }

    fn maybe_finish_close(&self, st: &mut ConnState) -> Vec<Action> {
        if st.phase == Phase::Closing
            && st.close_frame_queued
            && st.write_queue.is_empty()
        {
            return self.fail_locked(
                st,
                ProtocolError::ConnectionManuallyClosed { graceful: true }.into(),
            );
        }
        Vec::new()
    }

    // --- wire plumbing ------------------------------------------------

    fn maybe_compress(&self, frame: Bytes, requested: bool) -> Result<Bytes, LocalError> {
        if !requested || frame.len() <= 100 {
            return Ok(frame);
        }
        use flate2::read::DeflateEncoder;
        let mut compressed = Vec::with_capacity(frame.len() / 2 + HEADER_SIZE);
        compressed.extend_from_slice(&frame[..HEADER_SIZE]);
        let mut encoder =
            DeflateEncoder::new(&frame[HEADER_SIZE..], flate2::Compression::default());
        encoder
            .read_to_end(&mut compressed)
            .map_err(TransportError::Socket)?;
        if compressed.len() >= frame.len() {
            return Ok(frame); // Incompressible payload; send it plain.
        }
        compressed[9] = 2; // Compression status.
        let size = compressed.len() as i32;
        compressed[10..14].copy_from_slice(&size.to_le_bytes());
        Ok(Bytes::from(compressed))
    }

    /// Queue a frame and push as much of the queue as the socket takes.
    fn queue_frame(&self, st: &mut ConnState, frame: Bytes) -> Result<(), LocalError> {
        st.write_queue.push_back(frame);
        match Self::flush_writes(st) {
            Ok(()) => {
                self.update_write_interest(st);
                Ok(())
            }
            Err(e) => Err(TransportError::ConnectionLost(Some(e)).into()),
        }
    }

    /// Non-blocking drain of the output queue; partial writes leave the
    /// remainder queued for write readiness.
    fn flush_writes(st: &mut ConnState) -> io::Result<()> {
        if st.phase == Phase::NotInitialized {
            return Ok(()); // Establishment still owns the socket.
        }
        while let Some(front) = st.write_queue.front() {
            let remaining = &front[st.write_offset..];
            match st.transport.write(remaining) {
                Ok(n) => {
                    st.write_offset += n;
                    st.last_write = Instant::now();
                    if st.write_offset == front.len() {
                        st.write_queue.pop_front();
                        st.write_offset = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn update_write_interest(&self, st: &mut ConnState) {
        let Some(token) = st.token else {
            return;
        };
        let wants_write = !st.write_queue.is_empty() || st.phase == Phase::NotInitialized;
        let has_write = st.interest.contains(Ready::WRITE);
        if wants_write && !has_write {
            st.interest |= Ready::WRITE;
            self.pool.update(token, Ready::empty(), Ready::WRITE);
        } else if !wants_write && has_write {
            st.interest -= Ready::WRITE;
            self.pool.update(token, Ready::WRITE, Ready::empty());
        }
    }

    /// Establishment step: transport connect plus validation hand-off.
    fn initialize_step(self: &Arc<Self>, st: &mut ConnState) -> Result<Vec<Action>, LocalError> {
        match st.transport.initialize() {
            Ok(InitStatus::Done) => {
                if self.datagram {
                    return Ok(self.enter_active(st));
                }
                st.phase = Phase::Validating;
                if !self.outgoing {
                    // The server speaks first.
                    let frame = control_frame(MessageType::ValidateConnection, self.encoding);
                    st.write_queue.push_back(frame);
                    Self::flush_writes(st).map_err(|e| {
                        LocalError::from(TransportError::ConnectionLost(Some(e)))
                    })?;
                    self.update_write_interest(st);
                    // Nothing stops us dispatching immediately after.
                    return Ok(self.enter_active(st));
                }
                self.update_write_interest(st);
                Ok(Vec::new())
            }
            Ok(InitStatus::NeedRead) | Ok(InitStatus::NeedWrite) => Ok(Vec::new()),
            Err(e) => Err(TransportError::ConnectFailed(e).into()),
        }
    }

    /// Validation done (or skipped): release queued requests and waiters.
    fn enter_active(self: &Arc<Self>, st: &mut ConnState) -> Vec<Action> {
        st.phase = Phase::Active;
        let pending = std::mem::take(&mut st.pending_sends);
        for send in pending {
            if let Err(e) = self.queue_frame(st, send.frame) {
                if let Some(id) = send.request_id {
                    if let Some(callback) = st.requests.remove(&id) {
                        let mut actions = vec![Action::Complete(callback, Err(e))];
                        actions.extend(self.fail_locked(
                            st,
                            TransportError::ConnectionLost(None).into(),
                        ));
                        return actions;
                    }
                }
            }
        }
        let mut actions = Vec::new();
        for waiter in st.connect_waiters.drain(..) {
            actions.push(Action::ConnectDone(waiter, Ok(self.clone())));
        }
        tracing::debug!(connection = %self.desc, "connection established");
        actions
    }

    /// Pull bytes and split complete frames off the input buffer.
    fn read_step(self: &Arc<Self>, st: &mut ConnState) -> Result<Vec<Action>, LocalError> {
        let mut chunk = vec![0u8; if self.datagram { self.config.message_size_max } else { 16 * 1024 }];
        loop {
            match st.transport.read(&mut chunk) {
                Ok(0) if !self.datagram => {
                    return Err(TransportError::ConnectionLost(None).into());
                }
                Ok(n) => {
                    st.last_read = Instant::now();
                    st.read_buf.extend_from_slice(&chunk[..n]);
                    if self.datagram {
                        // One datagram, one frame; parse it right away so
                        // the next datagram starts clean.
                        let actions = self.parse_frames(st)?;
                        st.read_buf.clear();
                        if !actions.is_empty() {
                            return Ok(actions);
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::ConnectionLost(Some(e)).into()),
            }
        }
        self.parse_frames(st)
    }

    fn parse_frames(self: &Arc<Self>, st: &mut ConnState) -> Result<Vec<Action>, LocalError> {
        let mut actions = Vec::new();
        loop {
            if st.read_buf.len() < HEADER_SIZE {
                break;
            }
            let mut header_bytes = [0u8; HEADER_SIZE];
            header_bytes.copy_from_slice(&st.read_buf[..HEADER_SIZE]);
            let header =
                MessageHeader::from_bytes(&header_bytes).map_err(map_header_error)?;
            let size = header.size as usize;
            if size > self.config.message_size_max {
                return Err(ProtocolError::IllegalMessageSize(header.size).into());
            }
            if st.read_buf.len() < size {
                break; // Wait for the rest of the frame.
            }
            let rest: Vec<u8> = st.read_buf.split_off(size);
            let frame = std::mem::replace(&mut st.read_buf, rest);
            let payload = self.decompress(&header, frame)?;
            self.handle_frame(st, header, payload, &mut actions)?;
        }
        Ok(actions)
    }

    /// Payload after the header, inflated when the sender compressed it.
    fn decompress(&self, header: &MessageHeader, frame: Vec<u8>) -> Result<Bytes, LocalError> {
        match header.compression {
            verglas_wire::CompressionStatus::None
            | verglas_wire::CompressionStatus::Supported => {
                Ok(Bytes::from(frame).slice(HEADER_SIZE..))
            }
            verglas_wire::CompressionStatus::Compressed => {
                if !self.config.accept_compressed {
                    return Err(ProtocolError::CompressionNotSupported(
                        header.compression.as_u8(),
                    )
                    .into());
                }
                use flate2::read::DeflateDecoder;
                let mut decoder = DeflateDecoder::new(&frame[HEADER_SIZE..]);
                let mut payload = Vec::new();
                // The uncompressed size comes from the deflate stream
                // itself; a separate field would not be trustworthy.
                let limit = self.config.message_size_max as u64;
                let read = decoder
                    .by_ref()
                    .take(limit + 1)
                    .read_to_end(&mut payload)
                    .map_err(|e| ProtocolError::Violation(format!("bad deflate data: {e}")))?;
                if read as u64 > limit {
                    return Err(ProtocolError::IllegalMessageSize(i32::MAX).into());
                }
                Ok(Bytes::from(payload))
            }
        }
    }

    fn handle_frame(
        self: &Arc<Self>,
        st: &mut ConnState,
        header: MessageHeader,
        payload: Bytes,
        actions: &mut Vec<Action>,
    ) -> Result<(), LocalError> {
        match header.message_type {
            MessageType::ValidateConnection => {
                if self.outgoing && st.phase == Phase::Validating {
                    actions.extend(self.enter_active(st));
                } // Otherwise a heartbeat: the read timestamp is enough.
                Ok(())
            }
            MessageType::Reply => {
                let mut input = InputStream::new(payload.clone(), header.encoding);
                let request_id = input.read_i32()?;
                let status_byte = input.read_u8()?;
                let status = ReplyStatus::from_u8(status_byte)
                    .ok_or(ProtocolError::UnknownReplyStatus(status_byte))?;
                let Some(callback) = st.requests.remove(&request_id) else {
                    // Correlation is strict: a reply nobody waits for can
                    // only mean the peers disagree about the table.
                    return Err(ProtocolError::Violation(format!(
                        "reply for unknown request id {request_id}"
                    ))
                    .into());
                };
                let body = payload.slice((input.pos())..);
                actions.push(Action::Complete(
                    callback,
                    Ok(ReplyData { status, body, encoding: header.encoding }),
                ));
                if st.phase == Phase::Closing {
                    actions.extend(self.maybe_progress_close(st));
                }
                Ok(())
            }
            MessageType::Request => {
                if st.phase == Phase::Closing {
                    // Too late; the peer learns through CloseConnection.
                    return Ok(());
                }
                let mut input = InputStream::new(payload, header.encoding);
                let request_id = input.read_i32()?;
                if self.datagram && request_id != 0 {
                    return Err(ProtocolError::Violation(
                        "twoway request on a datagram transport".into(),
                    )
                    .into());
                }
                let request = read_request_body(&mut input, request_id, header.encoding)?;
                st.dispatch_count += 1;
                actions.push(Action::Dispatch(request));
                Ok(())
            }
            MessageType::BatchRequest => {
                if st.phase == Phase::Closing {
                    return Ok(());
                }
                let mut input = InputStream::new(payload, header.encoding);
                let count = input.read_i32()?;
                if count < 0 {
                    return Err(
                        ProtocolError::Violation(format!("batch count {count}")).into()
                    );
                }
                for _ in 0..count {
                    let request = read_request_body(&mut input, 0, header.encoding)?;
                    st.dispatch_count += 1;
                    actions.push(Action::Dispatch(request));
                }
                Ok(())
            }
            MessageType::CloseConnection => {
                if self.datagram {
                    return Err(ProtocolError::Violation(
                        "close message on a datagram transport".into(),
                    )
                    .into());
                }
                // Outstanding requests were provably not dispatched; the
                // close error is retryable.
                Err(ProtocolError::CloseConnection.into())
            }
        }
    }

    // --- ACM ----------------------------------------------------------

    fn schedule_acm(self: &Arc<Self>) {
        if self.config.acm_timeout.is_zero() || self.datagram {
            return;
        }
        let weak = Arc::downgrade(self);
        let token = self
            .timer
            .schedule_repeated(self.config.acm_timeout / 4, move || {
                if let Some(conn) = weak.upgrade() {
                    conn.acm_tick();
                }
            });
        self.state.lock().acm_token = Some(token);
    }

    fn acm_tick(self: &Arc<Self>) {
        let timeout = self.config.acm_timeout;
        let now = Instant::now();
        let mut st = self.state.lock();
        if st.phase != Phase::Active {
            return;
        }
        let last_activity = st.last_read.max(st.last_write);
        if now.duration_since(last_activity) >= timeout {
            drop(st);
            tracing::debug!(connection = %self.desc, "idle beyond the ACM timeout");
            self.fail(TransportError::ConnectionTimeout.into());
            return;
        }
        // Keep the link warm from the initiating side.
        if self.outgoing && now.duration_since(st.last_write) >= timeout / 4 {
            let frame = control_frame(MessageType::ValidateConnection, self.encoding);
            if let Err(e) = self.queue_frame(&mut st, frame) {
                drop(st);
                self.fail(e);
            }
        }
    }

    // --- action plumbing ----------------------------------------------

    fn run_actions(self: &Arc<Self>, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Complete(callback, result) => callback(result),
                Action::ConnectDone(callback, result) => callback(result),
                Action::Dispatch(request) => {
                    let dispatcher = self.dispatcher.lock().clone();
                    match dispatcher {
                        Some(dispatcher) => dispatcher.dispatch(self, request),
                        None => {
                            self.reply_request_failed(&request);
                            self.dispatch_finished();
                        }
                    }
                }
            }
        }
    }

    /// ObjectNotExist for requests nobody can dispatch.
    fn reply_request_failed(self: &Arc<Self>, request: &ParsedRequest) {
        if request.request_id == 0 {
            return;
        }
        let mut out = OutputStream::new(request.encoding);
        let body = crate::adapter::encode_request_failed(&mut out, request)
            .map(|()| out.finished())
            .unwrap_or_default();
        self.send_reply(request.request_id, ReplyStatus::ObjectNotExist, body);
    }
}

fn map_header_error(e: verglas_wire::HeaderError) -> ProtocolError {
    use verglas_wire::HeaderError;
    match e {
        HeaderError::BadMagic(magic) => ProtocolError::BadMagic(magic),
        HeaderError::UnsupportedProtocol(v) => ProtocolError::UnsupportedProtocol(v),
        HeaderError::UnsupportedEncoding(v) => ProtocolError::UnsupportedEncoding(v),
        HeaderError::UnknownMessageType(t) => ProtocolError::UnknownMessageType(t),
        HeaderError::UnknownCompression(c) => ProtocolError::CompressionNotSupported(c),
        HeaderError::IllegalSize(sz) => ProtocolError::IllegalMessageSize(sz),
    }
}

impl EventHandler for Connection {
    fn message(
        self: Arc<Self>,
        pool: &Arc<ThreadPool>,
        ready: Ready,
        current: &mut ThreadPoolCurrent,
    ) {
        let result: Result<Vec<Action>, LocalError> = {
            let mut st = self.state.lock();
            let mut actions = Vec::new();
            let step = (|| {
                if st.phase == Phase::NotInitialized {
                    actions.extend(self.initialize_step(&mut st)?);
                    if st.phase == Phase::NotInitialized {
                        return Ok(()); // Still connecting.
                    }
                    // Establishment freed the socket for normal traffic.
                    actions.extend(match Self::flush_writes(&mut st) {
                        Ok(()) => Vec::new(),
                        Err(e) => {
                            return Err(LocalError::from(TransportError::ConnectionLost(
                                Some(e),
                            )))
                        }
                    });
                }
                if ready.contains(Ready::WRITE) && st.phase != Phase::NotInitialized {
                    Self::flush_writes(&mut st).map_err(|e| {
                        LocalError::from(TransportError::ConnectionLost(Some(e)))
                    })?;
                    self.update_write_interest(&mut st);
                    actions.extend(self.maybe_finish_close(&mut st));
                }
                if ready.contains(Ready::READ)
                    && st.phase >= Phase::Validating
                    && st.phase < Phase::Closed
                {
                    actions.extend(self.read_step(&mut st)?);
                }
                Ok(())
            })();
            match step {
                Ok(()) => Ok(actions),
                Err(e) => {
                    let mut failure_actions = actions;
                    failure_actions.extend(self.fail_locked(&mut st, e));
                    Ok(failure_actions)
                }
            }
        };

        match result {
            Ok(actions) if actions.is_empty() => {}
            Ok(actions) => {
                // About to run completions and dispatches: hand off the
                // leader role first so I/O keeps moving.
                pool.io_completed(current);
                self.run_actions(actions);
            }
            Err(_) => {}
        }
    }

    fn finished(self: Arc<Self>, _pool: &Arc<ThreadPool>) {
        let mut st = self.state.lock();
        st.phase = Phase::Finished;
        self.cond.notify_all();
        tracing::debug!(connection = %self.desc, "connection finished");
    }

    fn register_source(
        &self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.state.lock().transport.register(registry, token, interest)
    }

    fn reregister_source(
        &self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        self.state.lock().transport.reregister(registry, token, interest)
    }

    fn deregister_source(&self, registry: &Registry) -> io::Result<()> {
        self.state.lock().transport.deregister(registry)
    }

    fn description(&self) -> String {
        self.desc.clone()
    }
}
