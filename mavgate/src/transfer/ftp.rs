//! File chunk transfer over FILE_TRANSFER_PROTOCOL.
//!
//! Files move in fixed [`FTP_CHUNK_SIZE`] chunks with the same
//! count/request/chunk/ack choreography the mission protocols use. A compact
//! codec packs each exchange into the message's fixed 251-byte payload:
//!
//! ```text
//! offset  size  field
//!      0     1  op
//!      1     1  session
//!      2     2  seq      (little endian)
//!      4     2  size     (little endian, bytes of data)
//!      6     1  role     (0 = requester, 1 = responder)
//!      7     1  reserved (zero)
//!      8     4  offset   (little endian)
//!     12   239  data     (first `size` bytes are meaningful)
//! ```
//!
//! The role byte lets a node that plays both sides over one link tell replies
//! apart from initiations.
//!
//! [`FtpOp::Count`] announces a payload of `seq` chunks and `offset` total
//! bytes; with `offset` set to [`COUNT_QUERY`] it instead asks the responder
//! to announce its stored payload. [`FtpOp::Request`] pulls chunk `seq`,
//! [`FtpOp::Chunk`] carries it, and [`FtpOp::Ack`] closes the exchange.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mavio::dialects::common::messages::FileTransferProtocol;
use mavio::protocol::Versionless;
use mavio::Frame;

use crate::consts::{FTP_CHUNK_SIZE, FTP_PAYLOAD_SIZE, TRANSFER_RETRIES, TRANSFER_TIMEOUT};
use crate::io::SendFrame;
use crate::prelude::*;
use crate::protocol::{msg_id, Common, Endpoint, Message, V2};
use crate::router::Router;
use crate::transfer::{Slots, TransferError, TransferKind, TransferResult};
use crate::utils::{Cookie, TimeoutHandler};

const HEADER_SIZE: usize = 12;

/// `offset` value marking a [`FtpOp::Count`] as a query for the stored
/// payload.
pub const COUNT_QUERY: u32 = u32::MAX;

type Key = (u8, u8);
type DoneCallback = Box<dyn FnOnce(TransferResult<()>) + Send>;
type DataCallback = Box<dyn FnOnce(TransferResult<Vec<u8>>) + Send>;

/// Operation of an FTP exchange step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FtpOp {
    /// Announces (or, with [`COUNT_QUERY`], asks for) the chunk count.
    Count = 0,
    /// Requests one chunk by sequence number.
    Request = 1,
    /// Carries one chunk.
    Chunk = 2,
    /// Closes the exchange.
    Ack = 3,
}

impl TryFrom<u8> for FtpOp {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, ()> {
        match value {
            0 => Ok(FtpOp::Count),
            1 => Ok(FtpOp::Request),
            2 => Ok(FtpOp::Chunk),
            3 => Ok(FtpOp::Ack),
            _ => Err(()),
        }
    }
}

/// One decoded FTP exchange step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FtpPayload {
    /// Operation.
    pub op: FtpOp,
    /// Exchange the step belongs to.
    pub session: u8,
    /// Chunk sequence number, or the chunk count for [`FtpOp::Count`].
    pub seq: u16,
    /// `true` when sent by the responder side.
    pub from_server: bool,
    /// Byte offset of the chunk, or the total size for [`FtpOp::Count`].
    pub offset: u32,
    /// Chunk data, at most [`FTP_CHUNK_SIZE`] bytes.
    pub data: Vec<u8>,
}

impl FtpPayload {
    /// Requester-side control payload without data.
    pub fn request(op: FtpOp, session: u8, seq: u16, offset: u32) -> Self {
        Self {
            op,
            session,
            seq,
            from_server: false,
            offset,
            data: Vec::new(),
        }
    }

    /// Responder-side control payload without data.
    pub fn response(op: FtpOp, session: u8, seq: u16, offset: u32) -> Self {
        Self {
            from_server: true,
            ..Self::request(op, session, seq, offset)
        }
    }

    /// Packs into the fixed message payload.
    pub fn pack(&self) -> [u8; FTP_PAYLOAD_SIZE] {
        debug_assert!(self.data.len() <= FTP_CHUNK_SIZE);

        let mut payload = [0u8; FTP_PAYLOAD_SIZE];
        payload[0] = self.op as u8;
        payload[1] = self.session;
        payload[2..4].copy_from_slice(&self.seq.to_le_bytes());
        payload[4..6].copy_from_slice(&(self.data.len() as u16).to_le_bytes());
        payload[6] = u8::from(self.from_server);
        payload[8..12].copy_from_slice(&self.offset.to_le_bytes());
        payload[HEADER_SIZE..HEADER_SIZE + self.data.len()].copy_from_slice(&self.data);
        payload
    }

    /// Unpacks from the fixed message payload.
    ///
    /// Returns `None` for unknown ops, roles and out-of-bounds sizes.
    pub fn unpack(payload: &[u8; FTP_PAYLOAD_SIZE]) -> Option<Self> {
        let op = FtpOp::try_from(payload[0]).ok()?;
        let size = u16::from_le_bytes([payload[4], payload[5]]) as usize;
        if size > FTP_CHUNK_SIZE {
            return None;
        }
        let from_server = match payload[6] {
            0 => false,
            1 => true,
            _ => return None,
        };
        Some(Self {
            op,
            session: payload[1],
            seq: u16::from_le_bytes([payload[2], payload[3]]),
            from_server,
            offset: u32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]),
            data: payload[HEADER_SIZE..HEADER_SIZE + size].to_vec(),
        })
    }
}

enum PushStep {
    SendCount,
    SendChunks,
}

struct PushState {
    target_system: u8,
    target_component: u8,
    generation: u64,
    chunks: Vec<Vec<u8>>,
    total_size: u32,
    step: PushStep,
    next_sequence: usize,
    retries_done: usize,
    cookie: Cookie,
    callback: Option<DoneCallback>,
}

struct PullState {
    target_system: u8,
    target_component: u8,
    generation: u64,
    expected_chunks: Option<u16>,
    data: Vec<u8>,
    next_sequence: u16,
    retries_done: usize,
    cookie: Cookie,
    callback: Option<DataCallback>,
}

struct FtpClientInner {
    sender: Arc<dyn SendFrame>,
    endpoint: Arc<Endpoint<V2>>,
    timeouts: TimeoutHandler,
    timeout: Duration,
    retries: usize,
    slots: Arc<Slots>,
    pushes: Mutex<HashMap<Key, PushState>>,
    pulls: Mutex<HashMap<Key, PullState>>,
}

/// File transfer client.
///
/// Pushes and pulls byte payloads against a remote [`FtpServer`] (or any
/// responder speaking the same codec). At most one file transfer per target
/// runs at a time.
#[derive(Clone)]
pub struct FtpClient {
    inner: Arc<FtpClientInner>,
}

impl FtpClient {
    /// Creates a client wired into `router` with default retry settings.
    pub fn new(
        sender: Arc<dyn SendFrame>,
        endpoint: Arc<Endpoint<V2>>,
        router: &Router,
        timeouts: TimeoutHandler,
        slots: Arc<Slots>,
    ) -> Self {
        Self::with_retry(
            sender,
            endpoint,
            router,
            timeouts,
            slots,
            TRANSFER_TIMEOUT,
            TRANSFER_RETRIES,
        )
    }

    /// Creates a client with an explicit re-send interval and budget.
    pub fn with_retry(
        sender: Arc<dyn SendFrame>,
        endpoint: Arc<Endpoint<V2>>,
        router: &Router,
        timeouts: TimeoutHandler,
        slots: Arc<Slots>,
        timeout: Duration,
        retries: usize,
    ) -> Self {
        let inner = Arc::new(FtpClientInner {
            sender,
            endpoint,
            timeouts,
            timeout,
            retries,
            slots,
            pushes: Mutex::new(HashMap::new()),
            pulls: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        router.subscribe_message(msg_id::FILE_TRANSFER_PROTOCOL, move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.on_message(frame);
            }
        });

        Self { inner }
    }

    /// Pushes `data` to a target as `session`.
    ///
    /// Fails synchronously with [`Error::TransferBusy`] while another file
    /// transfer runs against the same target.
    pub fn push(
        &self,
        target_system: u8,
        target_component: u8,
        session: u8,
        data: &[u8],
        callback: impl FnOnce(TransferResult<()>) + Send + 'static,
    ) -> Result<()> {
        let generation = self
            .inner
            .slots
            .claim(target_system, TransferKind::File)?;
        let key = (target_system, session);

        let chunks: Vec<Vec<u8>> = data.chunks(FTP_CHUNK_SIZE).map(<[u8]>::to_vec).collect();
        {
            let cookie = self.inner.arm_push(key, generation);
            self.inner.pushes.lock().unwrap().insert(
                key,
                PushState {
                    target_system,
                    target_component,
                    generation,
                    chunks,
                    total_size: data.len() as u32,
                    step: PushStep::SendCount,
                    next_sequence: 0,
                    retries_done: 0,
                    cookie,
                    callback: Some(Box::new(callback)),
                },
            );
        }

        log::debug!(
            "pushing {} bytes to system {target_system} (session {session})",
            data.len()
        );
        self.inner.send_push_count(key);
        Ok(())
    }

    /// Pulls the payload stored as `session` on a target.
    pub fn pull(
        &self,
        target_system: u8,
        target_component: u8,
        session: u8,
        callback: impl FnOnce(TransferResult<Vec<u8>>) + Send + 'static,
    ) -> Result<()> {
        let generation = self
            .inner
            .slots
            .claim(target_system, TransferKind::File)?;
        let key = (target_system, session);
        {
            let cookie = self.inner.arm_pull(key, generation);
            self.inner.pulls.lock().unwrap().insert(
                key,
                PullState {
                    target_system,
                    target_component,
                    generation,
                    expected_chunks: None,
                    data: Vec::new(),
                    next_sequence: 0,
                    retries_done: 0,
                    cookie,
                    callback: Some(Box::new(callback)),
                },
            );
        }

        log::debug!("pulling session {session} from system {target_system}");
        self.inner.send_count_query(key);
        Ok(())
    }

    /// Cancels the active file transfer for `(target_system, session)`.
    ///
    /// Returns `false` when nothing was active.
    pub fn cancel(&self, target_system: u8, session: u8) -> bool {
        let key = (target_system, session);
        if self.inner.pushes.lock().unwrap().contains_key(&key) {
            self.inner.finish_push(key, Err(TransferError::Cancelled));
            return true;
        }
        if self.inner.pulls.lock().unwrap().contains_key(&key) {
            self.inner.finish_pull(key, Err(TransferError::Cancelled));
            return true;
        }
        false
    }
}

impl FtpClientInner {
    fn send_payload(&self, target_system: u8, target_component: u8, payload: &FtpPayload) -> Result<()> {
        let message = FileTransferProtocol {
            target_network: 0,
            target_system,
            target_component,
            payload: payload.pack(),
        };
        let frame = self.endpoint.next_frame(&message as &dyn Message)?;
        self.sender.send_frame(&frame)
    }

    fn on_message(self: &Arc<Self>, frame: &Frame<Versionless>) {
        let message = match frame.decode() {
            Ok(Common::FileTransferProtocol(message)) => message,
            _ => return,
        };
        let Some(payload) = FtpPayload::unpack(&message.payload) else {
            log::debug!("dropping malformed FTP payload from system {}", frame.system_id());
            return;
        };
        if !payload.from_server {
            // Another requester's traffic.
            return;
        }
        let key = (frame.system_id(), payload.session);

        match payload.op {
            FtpOp::Request => self.on_chunk_request(key, payload.seq),
            FtpOp::Ack => self.on_push_ack(key, payload.seq),
            FtpOp::Count => self.on_pull_count(key, &payload),
            FtpOp::Chunk => self.on_pull_chunk(key, &payload),
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Push

    fn arm_push(self: &Arc<Self>, key: Key, generation: u64) -> Cookie {
        let weak = Arc::downgrade(self);
        self.timeouts.add(self.timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_push_timeout(key, generation);
            }
        })
    }

    fn send_push_count(self: &Arc<Self>, key: Key) {
        let (target, payload) = {
            let pushes = self.pushes.lock().unwrap();
            let Some(state) = pushes.get(&key) else {
                return;
            };
            (
                (state.target_system, state.target_component),
                FtpPayload::request(
                    FtpOp::Count,
                    key.1,
                    state.chunks.len() as u16,
                    state.total_size,
                ),
            )
        };

        if let Err(err) = self.send_payload(target.0, target.1, &payload) {
            log::warn!("failed to announce FTP push: {err:?}");
            self.finish_push(key, Err(TransferError::ConnectionError));
        }
    }

    fn on_chunk_request(self: &Arc<Self>, key: Key, seq: u16) {
        enum Action {
            Nothing,
            Timeout,
            Send(u8, u8, FtpPayload),
        }

        let action = {
            let mut pushes = self.pushes.lock().unwrap();
            let Some(state) = pushes.get_mut(&key) else {
                return;
            };
            state.step = PushStep::SendChunks;

            let seq = seq as usize;
            if seq >= state.chunks.len() {
                log::warn!("system {} requested FTP chunk {seq} out of range", key.0);
                Action::Nothing
            } else if state.next_sequence < seq {
                log::warn!("FTP request from system {} skips chunks, ignoring", key.0);
                Action::Nothing
            } else if state.next_sequence > seq && state.retries_done >= self.retries {
                Action::Timeout
            } else {
                if state.next_sequence == seq {
                    state.next_sequence = seq + 1;
                    state.retries_done = 0;
                } else {
                    // Duplicate request, re-answer without rewinding.
                    state.retries_done += 1;
                }
                self.timeouts.refresh(state.cookie);
                Action::Send(
                    state.target_system,
                    state.target_component,
                    FtpPayload {
                        op: FtpOp::Chunk,
                        session: key.1,
                        seq: seq as u16,
                        from_server: false,
                        offset: (seq * FTP_CHUNK_SIZE) as u32,
                        data: state.chunks[seq].clone(),
                    },
                )
            }
        };

        match action {
            Action::Nothing => {}
            Action::Timeout => self.finish_push(key, Err(TransferError::Timeout)),
            Action::Send(system, component, payload) => {
                if let Err(err) = self.send_payload(system, component, &payload) {
                    log::warn!("failed to send FTP chunk: {err:?}");
                    self.finish_push(key, Err(TransferError::ConnectionError));
                }
            }
        }
    }

    fn on_push_ack(&self, key: Key, seq: u16) {
        let result = {
            let pushes = self.pushes.lock().unwrap();
            let Some(state) = pushes.get(&key) else {
                return;
            };
            if state.next_sequence == state.chunks.len() && seq as usize == state.chunks.len() {
                Ok(())
            } else {
                Err(TransferError::ProtocolError)
            }
        };
        self.finish_push(key, result);
    }

    fn on_push_timeout(self: &Arc<Self>, key: Key, generation: u64) {
        enum Action {
            Nothing,
            Timeout,
            ResendCount,
        }

        let action = {
            let mut pushes = self.pushes.lock().unwrap();
            let Some(state) = pushes.get_mut(&key) else {
                return;
            };
            if state.generation != generation {
                return;
            }

            if state.retries_done >= self.retries {
                Action::Timeout
            } else {
                state.retries_done += 1;
                state.cookie = self.arm_push(key, generation);
                match state.step {
                    PushStep::SendCount => Action::ResendCount,
                    // Chunks are pulled by the responder; keep waiting.
                    PushStep::SendChunks => Action::Nothing,
                }
            }
        };

        match action {
            Action::Nothing => {}
            Action::Timeout => {
                log::warn!("FTP push to system {} timed out", key.0);
                self.finish_push(key, Err(TransferError::Timeout));
            }
            Action::ResendCount => self.send_push_count(key),
        }
    }

    fn finish_push(&self, key: Key, result: TransferResult<()>) {
        let Some(mut state) = self.pushes.lock().unwrap().remove(&key) else {
            return;
        };
        self.timeouts.remove(state.cookie);
        self.slots
            .release(key.0, TransferKind::File, state.generation);

        log::debug!("FTP push to system {} finished: {result:?}", key.0);
        if let Some(callback) = state.callback.take() {
            callback(result);
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Pull

    fn arm_pull(self: &Arc<Self>, key: Key, generation: u64) -> Cookie {
        let weak = Arc::downgrade(self);
        self.timeouts.add(self.timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_pull_timeout(key, generation);
            }
        })
    }

    fn send_count_query(self: &Arc<Self>, key: Key) {
        let target = {
            let pulls = self.pulls.lock().unwrap();
            let Some(state) = pulls.get(&key) else {
                return;
            };
            (state.target_system, state.target_component)
        };

        let payload = FtpPayload::request(FtpOp::Count, key.1, 0, COUNT_QUERY);
        if let Err(err) = self.send_payload(target.0, target.1, &payload) {
            log::warn!("failed to query FTP session: {err:?}");
            self.finish_pull(key, Err(TransferError::ConnectionError));
        }
    }

    fn send_chunk_request(self: &Arc<Self>, key: Key) {
        let (target, seq) = {
            let pulls = self.pulls.lock().unwrap();
            let Some(state) = pulls.get(&key) else {
                return;
            };
            self.timeouts.refresh(state.cookie);
            (
                (state.target_system, state.target_component),
                state.next_sequence,
            )
        };

        let payload = FtpPayload::request(FtpOp::Request, key.1, seq, 0);
        if let Err(err) = self.send_payload(target.0, target.1, &payload) {
            log::warn!("failed to request FTP chunk: {err:?}");
            self.finish_pull(key, Err(TransferError::ConnectionError));
        }
    }

    fn on_pull_count(self: &Arc<Self>, key: Key, payload: &FtpPayload) {
        enum Action {
            Nothing,
            RequestNext,
            Complete,
        }

        let action = {
            let mut pulls = self.pulls.lock().unwrap();
            let Some(state) = pulls.get_mut(&key) else {
                return;
            };

            if state.expected_chunks.is_some() {
                self.timeouts.refresh(state.cookie);
                Action::Nothing
            } else {
                state.expected_chunks = Some(payload.seq);
                state.retries_done = 0;
                if payload.seq == 0 {
                    Action::Complete
                } else {
                    Action::RequestNext
                }
            }
        };

        match action {
            Action::Nothing => {}
            Action::RequestNext => self.send_chunk_request(key),
            Action::Complete => self.complete_pull(key),
        }
    }

    fn on_pull_chunk(self: &Arc<Self>, key: Key, payload: &FtpPayload) {
        enum Action {
            Nothing,
            RequestNext,
            Complete,
        }

        let action = {
            let mut pulls = self.pulls.lock().unwrap();
            let Some(state) = pulls.get_mut(&key) else {
                return;
            };
            let Some(expected) = state.expected_chunks else {
                return;
            };

            if payload.seq != state.next_sequence {
                Action::Nothing
            } else {
                state.retries_done = 0;
                state.data.extend_from_slice(&payload.data);
                state.next_sequence += 1;
                if state.next_sequence == expected {
                    Action::Complete
                } else {
                    Action::RequestNext
                }
            }
        };

        match action {
            Action::Nothing => {}
            Action::RequestNext => self.send_chunk_request(key),
            Action::Complete => self.complete_pull(key),
        }
    }

    fn complete_pull(self: &Arc<Self>, key: Key) {
        let (target, chunks) = {
            let pulls = self.pulls.lock().unwrap();
            let Some(state) = pulls.get(&key) else {
                return;
            };
            (
                (state.target_system, state.target_component),
                state.next_sequence,
            )
        };

        let ack = FtpPayload::request(FtpOp::Ack, key.1, chunks, 0);
        if let Err(err) = self.send_payload(target.0, target.1, &ack) {
            log::warn!("failed to send final FTP ack: {err:?}");
            self.finish_pull(key, Err(TransferError::ConnectionError));
            return;
        }

        let Some(mut state) = self.pulls.lock().unwrap().remove(&key) else {
            return;
        };
        self.timeouts.remove(state.cookie);
        self.slots
            .release(key.0, TransferKind::File, state.generation);

        log::debug!(
            "pulled {} bytes from system {} (session {})",
            state.data.len(),
            key.0,
            key.1
        );
        if let Some(callback) = state.callback.take() {
            callback(Ok(std::mem::take(&mut state.data)));
        }
    }

    fn on_pull_timeout(self: &Arc<Self>, key: Key, generation: u64) {
        enum Action {
            Timeout,
            ResendQuery,
            ResendRequest,
        }

        let action = {
            let mut pulls = self.pulls.lock().unwrap();
            let Some(state) = pulls.get_mut(&key) else {
                return;
            };
            if state.generation != generation {
                return;
            }

            if state.retries_done >= self.retries {
                Action::Timeout
            } else {
                state.retries_done += 1;
                state.cookie = self.arm_pull(key, generation);
                if state.expected_chunks.is_none() {
                    Action::ResendQuery
                } else {
                    Action::ResendRequest
                }
            }
        };

        match action {
            Action::Timeout => {
                log::warn!("FTP pull from system {} timed out", key.0);
                self.finish_pull(key, Err(TransferError::Timeout));
            }
            Action::ResendQuery => self.send_count_query(key),
            Action::ResendRequest => self.send_chunk_request(key),
        }
    }

    fn finish_pull(&self, key: Key, result: TransferResult<Vec<u8>>) {
        let Some(mut state) = self.pulls.lock().unwrap().remove(&key) else {
            return;
        };
        self.timeouts.remove(state.cookie);
        self.slots
            .release(key.0, TransferKind::File, state.generation);

        log::debug!("FTP pull from system {} finished: {result:?}", key.0);
        if let Some(callback) = state.callback.take() {
            callback(result);
        }
    }
}

struct IncomingFile {
    remote_system: u8,
    remote_component: u8,
    generation: u64,
    expected: u16,
    next_sequence: u16,
    data: Vec<u8>,
    retries_done: usize,
    cookie: Cookie,
}

struct FtpServerInner {
    sender: Arc<dyn SendFrame>,
    endpoint: Arc<Endpoint<V2>>,
    timeouts: TimeoutHandler,
    timeout: Duration,
    retries: usize,
    generations: AtomicU64,
    stored: Mutex<HashMap<u8, Vec<u8>>>,
    incoming: Mutex<HashMap<Key, IncomingFile>>,
}

/// File transfer responder.
///
/// Accepts pushed payloads and serves stored ones, keyed by session number.
#[derive(Clone)]
pub struct FtpServer {
    inner: Arc<FtpServerInner>,
}

impl FtpServer {
    /// Creates a server wired into `router` with default retry settings.
    pub fn new(
        sender: Arc<dyn SendFrame>,
        endpoint: Arc<Endpoint<V2>>,
        router: &Router,
        timeouts: TimeoutHandler,
    ) -> Self {
        Self::with_retry(
            sender,
            endpoint,
            router,
            timeouts,
            TRANSFER_TIMEOUT,
            TRANSFER_RETRIES,
        )
    }

    /// Creates a server with an explicit re-request interval and budget.
    pub fn with_retry(
        sender: Arc<dyn SendFrame>,
        endpoint: Arc<Endpoint<V2>>,
        router: &Router,
        timeouts: TimeoutHandler,
        timeout: Duration,
        retries: usize,
    ) -> Self {
        let inner = Arc::new(FtpServerInner {
            sender,
            endpoint,
            timeouts,
            timeout,
            retries,
            generations: AtomicU64::new(0),
            stored: Mutex::new(HashMap::new()),
            incoming: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        router.subscribe_message(msg_id::FILE_TRANSFER_PROTOCOL, move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.on_message(frame);
            }
        });

        Self { inner }
    }

    /// The payload stored as `session`, if any.
    pub fn file(&self, session: u8) -> Option<Vec<u8>> {
        self.inner.stored.lock().unwrap().get(&session).cloned()
    }

    /// Stores a payload to serve as `session`.
    pub fn set_file(&self, session: u8, data: Vec<u8>) {
        self.inner.stored.lock().unwrap().insert(session, data);
    }
}

impl FtpServerInner {
    fn send_payload(&self, target_system: u8, target_component: u8, payload: &FtpPayload) -> Result<()> {
        let message = FileTransferProtocol {
            target_network: 0,
            target_system,
            target_component,
            payload: payload.pack(),
        };
        let frame = self.endpoint.next_frame(&message as &dyn Message)?;
        self.sender.send_frame(&frame)
    }

    fn on_message(self: &Arc<Self>, frame: &Frame<Versionless>) {
        let message = match frame.decode() {
            Ok(Common::FileTransferProtocol(message)) => message,
            _ => return,
        };
        let Some(payload) = FtpPayload::unpack(&message.payload) else {
            return;
        };
        if payload.from_server {
            // Another responder's traffic.
            return;
        }
        let remote_system = frame.system_id();
        let remote_component = frame.component_id();
        let key = (remote_system, payload.session);

        match payload.op {
            FtpOp::Count if payload.offset == COUNT_QUERY => {
                self.announce(remote_system, remote_component, payload.session);
            }
            FtpOp::Count => self.start_incoming(key, remote_component, payload.seq),
            FtpOp::Chunk => self.on_chunk(key, &payload),
            FtpOp::Request => {
                self.serve_chunk(remote_system, remote_component, payload.session, payload.seq)
            }
            FtpOp::Ack => {}
        }
    }

    fn announce(&self, remote_system: u8, remote_component: u8, session: u8) {
        let (chunks, size) = {
            let stored = self.stored.lock().unwrap();
            match stored.get(&session) {
                Some(data) => (data.chunks(FTP_CHUNK_SIZE).count() as u16, data.len() as u32),
                None => (0, 0),
            }
        };

        let payload = FtpPayload::response(FtpOp::Count, session, chunks, size);
        if let Err(err) = self.send_payload(remote_system, remote_component, &payload) {
            log::warn!("failed to announce FTP session {session}: {err:?}");
        }
    }

    fn serve_chunk(&self, remote_system: u8, remote_component: u8, session: u8, seq: u16) {
        let chunk = {
            let stored = self.stored.lock().unwrap();
            stored.get(&session).and_then(|data| {
                data.chunks(FTP_CHUNK_SIZE)
                    .nth(seq as usize)
                    .map(<[u8]>::to_vec)
            })
        };
        let Some(chunk) = chunk else {
            log::warn!("system {remote_system} requested FTP chunk {seq} out of range");
            return;
        };

        let payload = FtpPayload {
            op: FtpOp::Chunk,
            session,
            seq,
            from_server: true,
            offset: seq as u32 * FTP_CHUNK_SIZE as u32,
            data: chunk,
        };
        if let Err(err) = self.send_payload(remote_system, remote_component, &payload) {
            log::warn!("failed to serve FTP chunk: {err:?}");
        }
    }

    fn arm_incoming(self: &Arc<Self>, key: Key, generation: u64) -> Cookie {
        let weak = Arc::downgrade(self);
        self.timeouts.add(self.timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_incoming_timeout(key, generation);
            }
        })
    }

    fn start_incoming(self: &Arc<Self>, key: Key, remote_component: u8, chunks: u16) {
        if chunks == 0 {
            self.stored.lock().unwrap().insert(key.1, Vec::new());
            let ack = FtpPayload::response(FtpOp::Ack, key.1, 0, 0);
            if let Err(err) = self.send_payload(key.0, remote_component, &ack) {
                log::warn!("failed to ack empty FTP push: {err:?}");
            }
            return;
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut incoming = self.incoming.lock().unwrap();
            if let Some(previous) = incoming.remove(&key) {
                self.timeouts.remove(previous.cookie);
            }
            let cookie = self.arm_incoming(key, generation);
            incoming.insert(
                key,
                IncomingFile {
                    remote_system: key.0,
                    remote_component,
                    generation,
                    expected: chunks,
                    next_sequence: 0,
                    data: Vec::new(),
                    retries_done: 0,
                    cookie,
                },
            );
        }
        self.request_next(key);
    }

    fn request_next(&self, key: Key) {
        let (target, seq) = {
            let incoming = self.incoming.lock().unwrap();
            let Some(state) = incoming.get(&key) else {
                return;
            };
            self.timeouts.refresh(state.cookie);
            (
                (state.remote_system, state.remote_component),
                state.next_sequence,
            )
        };

        let payload = FtpPayload::response(FtpOp::Request, key.1, seq, 0);
        if let Err(err) = self.send_payload(target.0, target.1, &payload) {
            log::warn!("failed to request FTP chunk: {err:?}");
            self.drop_incoming(key);
        }
    }

    fn on_chunk(self: &Arc<Self>, key: Key, payload: &FtpPayload) {
        enum Action {
            Nothing,
            RequestNext,
            Complete,
        }

        let action = {
            let mut incoming = self.incoming.lock().unwrap();
            let Some(state) = incoming.get_mut(&key) else {
                return;
            };

            if payload.seq != state.next_sequence {
                Action::Nothing
            } else {
                state.retries_done = 0;
                state.data.extend_from_slice(&payload.data);
                state.next_sequence += 1;
                if state.next_sequence == state.expected {
                    Action::Complete
                } else {
                    Action::RequestNext
                }
            }
        };

        match action {
            Action::Nothing => {}
            Action::RequestNext => self.request_next(key),
            Action::Complete => self.complete_incoming(key),
        }
    }

    fn complete_incoming(&self, key: Key) {
        let Some(state) = self.incoming.lock().unwrap().remove(&key) else {
            return;
        };
        self.timeouts.remove(state.cookie);

        log::info!(
            "accepted {} bytes from system {} (session {})",
            state.data.len(),
            key.0,
            key.1
        );
        let ack = FtpPayload::response(FtpOp::Ack, key.1, state.expected, 0);
        self.stored.lock().unwrap().insert(key.1, state.data);
        if let Err(err) = self.send_payload(state.remote_system, state.remote_component, &ack) {
            log::warn!("failed to send final FTP ack: {err:?}");
        }
    }

    fn on_incoming_timeout(self: &Arc<Self>, key: Key, generation: u64) {
        let resend = {
            let mut incoming = self.incoming.lock().unwrap();
            let Some(state) = incoming.get_mut(&key) else {
                return;
            };
            if state.generation != generation {
                return;
            }

            if state.retries_done >= self.retries {
                false
            } else {
                state.retries_done += 1;
                state.cookie = self.arm_incoming(key, generation);
                true
            }
        };

        if resend {
            self.request_next(key);
        } else {
            log::warn!("FTP push from system {} stalled, dropping it", key.0);
            self.drop_incoming(key);
        }
    }

    fn drop_incoming(&self, key: Key) {
        if let Some(state) = self.incoming.lock().unwrap().remove(&key) {
            self.timeouts.remove(state.cookie);
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
//                                   Tests                                   //
///////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test_ftp {
    use super::*;
    use std::sync::mpsc;

    use mavio::protocol::MavLinkId;

    #[test]
    fn payload_round_trips_through_the_codec() {
        let payload = FtpPayload {
            op: FtpOp::Chunk,
            session: 7,
            seq: 42,
            from_server: true,
            offset: 42 * FTP_CHUNK_SIZE as u32,
            data: vec![0xAB; 100],
        };

        let packed = payload.pack();
        assert_eq!(packed[0], FtpOp::Chunk as u8);
        assert_eq!(FtpPayload::unpack(&packed).unwrap(), payload);
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let mut packed = FtpPayload::request(FtpOp::Ack, 0, 0, 0).pack();
        packed[0] = 0xFF;
        assert!(FtpPayload::unpack(&packed).is_none());

        let mut oversized = FtpPayload::request(FtpOp::Chunk, 0, 0, 0).pack();
        oversized[4..6].copy_from_slice(&(FTP_CHUNK_SIZE as u16 + 1).to_le_bytes());
        assert!(FtpPayload::unpack(&oversized).is_none());

        let mut bad_role = FtpPayload::request(FtpOp::Count, 0, 0, 0).pack();
        bad_role[6] = 2;
        assert!(FtpPayload::unpack(&bad_role).is_none());
    }

    #[test]
    fn full_chunks_use_the_whole_data_field() {
        let payload = FtpPayload {
            op: FtpOp::Chunk,
            session: 0,
            seq: 0,
            from_server: false,
            offset: 0,
            data: vec![1; FTP_CHUNK_SIZE],
        };
        assert_eq!(
            FtpPayload::unpack(&payload.pack()).unwrap().data.len(),
            FTP_CHUNK_SIZE
        );
    }

    // Client and server wired back-to-back over a pair of routers.
    struct Link {
        client: FtpClient,
        server: FtpServer,
        client_router: Router,
        server_router: Router,
        client_out: mpsc::Receiver<Frame<V2>>,
        server_out: mpsc::Receiver<Frame<V2>>,
    }

    fn link() -> Link {
        let (client_tx, client_out) = mpsc::channel();
        let client_tx = Mutex::new(client_tx);
        let client_sender: Arc<dyn SendFrame> = Arc::new(move |frame: &Frame<V2>| {
            client_tx.lock().unwrap().send(frame.clone()).unwrap();
            Ok(())
        });
        let (server_tx, server_out) = mpsc::channel();
        let server_tx = Mutex::new(server_tx);
        let server_sender: Arc<dyn SendFrame> = Arc::new(move |frame: &Frame<V2>| {
            server_tx.lock().unwrap().send(frame.clone()).unwrap();
            Ok(())
        });

        let client_router = Router::new();
        let server_router = Router::new();
        let client = FtpClient::with_retry(
            client_sender,
            Arc::new(Endpoint::new(MavLinkId::new(245, 190))),
            &client_router,
            TimeoutHandler::spawn(),
            Arc::new(Slots::new()),
            Duration::from_secs(1),
            3,
        );
        let server = FtpServer::new(
            server_sender,
            Arc::new(Endpoint::new(MavLinkId::new(1, 1))),
            &server_router,
            TimeoutHandler::spawn(),
        );

        Link {
            client,
            server,
            client_router,
            server_router,
            client_out,
            server_out,
        }
    }

    // Shuttles frames between the two sides until both go quiet.
    fn pump(link: &Link) {
        loop {
            let mut idle = true;
            while let Ok(frame) = link.client_out.try_recv() {
                link.server_router.process(&frame.to_versionless());
                idle = false;
            }
            while let Ok(frame) = link.server_out.try_recv() {
                link.client_router.process(&frame.to_versionless());
                idle = false;
            }
            if idle {
                break;
            }
        }
    }

    #[test]
    fn push_splits_into_chunks_and_round_trips() {
        let link = link();
        let data: Vec<u8> = (0..1000).map(|byte| byte as u8).collect();

        let (tx, rx) = mpsc::channel();
        link.client
            .push(1, 1, 3, &data, move |result| tx.send(result).unwrap())
            .unwrap();
        pump(&link);

        assert_eq!(rx.try_recv().unwrap(), Ok(()));
        assert_eq!(link.server.file(3).unwrap(), data);
    }

    #[test]
    fn pull_reassembles_the_stored_payload() {
        let link = link();
        let data: Vec<u8> = (0..500).map(|byte| (byte * 7) as u8).collect();
        link.server.set_file(9, data.clone());

        let (tx, rx) = mpsc::channel();
        link.client
            .pull(1, 1, 9, move |result| tx.send(result).unwrap())
            .unwrap();
        pump(&link);

        assert_eq!(rx.try_recv().unwrap(), Ok(data));
    }

    #[test]
    fn pull_of_empty_session_completes_empty() {
        let link = link();
        link.server.set_file(2, Vec::new());

        let (tx, rx) = mpsc::channel();
        link.client
            .pull(1, 1, 2, move |result| tx.send(result).unwrap())
            .unwrap();
        pump(&link);

        assert_eq!(rx.try_recv().unwrap(), Ok(Vec::new()));
    }

    #[test]
    fn concurrent_transfers_to_one_target_are_busy() {
        let link = link();

        link.client.push(1, 1, 0, &[1, 2, 3], |_| {}).unwrap();
        assert!(matches!(
            link.client.pull(1, 1, 1, |_| {}),
            Err(Error::TransferBusy)
        ));
    }

    #[test]
    fn duplicate_chunk_request_does_not_derail_the_push() {
        let link = link();
        let data = vec![7u8; FTP_CHUNK_SIZE * 3];

        let (tx, rx) = mpsc::channel();
        link.client
            .push(1, 1, 4, &data, move |result| tx.send(result).unwrap())
            .unwrap();

        // Drive the client directly, replaying one request.
        let responder: Endpoint<V2> = Endpoint::new(MavLinkId::new(1, 1));
        let send = |payload: FtpPayload| {
            let message = FileTransferProtocol {
                target_network: 0,
                target_system: 245,
                target_component: 190,
                payload: payload.pack(),
            };
            let frame = responder.next_frame(&message as &dyn Message).unwrap();
            link.client_router.process(&frame.to_versionless());
        };

        for seq in [0u16, 1, 2, 1] {
            send(FtpPayload::response(FtpOp::Request, 4, seq, 0));
        }
        send(FtpPayload::response(FtpOp::Ack, 4, 3, 0));

        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn cancel_finishes_the_push() {
        let link = link();
        let (tx, rx) = mpsc::channel();

        link.client
            .push(1, 1, 5, &[0; 600], move |result| tx.send(result).unwrap())
            .unwrap();
        assert!(link.client.cancel(1, 5));

        assert_eq!(rx.try_recv().unwrap(), Err(TransferError::Cancelled));
        assert!(!link.client.cancel(1, 5));
    }
}
