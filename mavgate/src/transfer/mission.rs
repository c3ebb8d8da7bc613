//! Initiator side of the mission transfer protocols.
//!
//! [`MissionClient`] drives uploads, downloads, clears and set-current
//! exchanges against a remote system. Every operation takes a callback that
//! receives exactly one terminal [`TransferResult`]; re-sends and protocol
//! quirks are handled internally.
//!
//! Uploads follow the count/request/item/ack choreography: after MISSION_COUNT
//! the remote pulls items one by one with MISSION_REQUEST_INT and closes the
//! exchange with MISSION_ACK. ArduPilot still pulls with the deprecated
//! float MISSION_REQUEST, which is accepted from that flavor only; other
//! flavors get a MAV_MISSION_UNSUPPORTED nack and are expected to switch to
//! the int variant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mavio::dialects::common::enums::{MavMissionResult, MavMissionType};
use mavio::dialects::common::messages::{
    MissionAck, MissionClearAll, MissionCount, MissionItemInt, MissionRequestInt,
    MissionRequestList, MissionSetCurrent,
};
use mavio::protocol::Versionless;
use mavio::Frame;

use crate::consts::{TRANSFER_RETRIES, TRANSFER_TIMEOUT};
use crate::io::SendFrame;
use crate::prelude::*;
use crate::protocol::{msg_id, Autopilot, Common, Endpoint, Message, MissionItem, V2};
use crate::router::Router;
use crate::transfer::{Slots, TransferError, TransferKind, TransferResult};
use crate::utils::{Cookie, TimeoutHandler};

type Key = (u8, TransferKind);
type DoneCallback = Box<dyn FnOnce(TransferResult<()>) + Send>;
type ItemsCallback = Box<dyn FnOnce(TransferResult<Vec<MissionItem>>) + Send>;

/// `MAV_MISSION_TYPE` of a transfer kind, `None` for kinds that never appear
/// in mission messages.
fn dialect_mission_type(kind: TransferKind) -> Option<MavMissionType> {
    match kind {
        TransferKind::Mission => Some(MavMissionType::Mission),
        TransferKind::Fence => Some(MavMissionType::Fence),
        TransferKind::Rally => Some(MavMissionType::Rally),
        TransferKind::File => None,
    }
}

/// Maps a MISSION_ACK nack onto a terminal error.
fn map_nack(result: MavMissionResult) -> TransferError {
    match result {
        MavMissionResult::MavMissionError => TransferError::ProtocolError,
        MavMissionResult::MavMissionUnsupportedFrame => TransferError::UnsupportedFrame,
        MavMissionResult::MavMissionUnsupported => TransferError::Unsupported,
        MavMissionResult::MavMissionNoSpace => TransferError::TooManyMissionItems,
        MavMissionResult::MavMissionInvalid
        | MavMissionResult::MavMissionInvalidParam1
        | MavMissionResult::MavMissionInvalidParam2
        | MavMissionResult::MavMissionInvalidParam3
        | MavMissionResult::MavMissionInvalidParam4
        | MavMissionResult::MavMissionInvalidParam5X
        | MavMissionResult::MavMissionInvalidParam6Y
        | MavMissionResult::MavMissionInvalidParam7 => TransferError::InvalidParam,
        MavMissionResult::MavMissionInvalidSequence => TransferError::InvalidSequence,
        MavMissionResult::MavMissionDenied => TransferError::Denied,
        MavMissionResult::MavMissionOperationCancelled => TransferError::Cancelled,
        _ => TransferError::ProtocolError,
    }
}

enum UploadStep {
    SendCount,
    SendItems,
}

struct UploadState {
    target_system: u8,
    target_component: u8,
    mission_type: MavMissionType,
    generation: u64,
    items: Vec<MissionItemInt>,
    step: UploadStep,
    next_sequence: usize,
    retries_done: usize,
    cookie: Cookie,
    callback: Option<DoneCallback>,
}

enum DownloadStep {
    RequestList,
    RequestItem,
}

struct DownloadState {
    target_system: u8,
    target_component: u8,
    mission_type: MavMissionType,
    generation: u64,
    expected_count: Option<u16>,
    items: Vec<MissionItem>,
    next_sequence: u16,
    step: DownloadStep,
    retries_done: usize,
    cookie: Cookie,
    callback: Option<ItemsCallback>,
}

struct ClearState {
    target_system: u8,
    target_component: u8,
    mission_type: MavMissionType,
    generation: u64,
    retries_done: usize,
    cookie: Cookie,
    callback: Option<DoneCallback>,
}

struct SetCurrentState {
    target_system: u8,
    target_component: u8,
    seq: u16,
    generation: u64,
    retries_done: usize,
    cookie: Cookie,
    callback: Option<DoneCallback>,
}

struct MissionClientInner {
    sender: Arc<dyn SendFrame>,
    endpoint: Arc<Endpoint<V2>>,
    router: Router,
    timeouts: TimeoutHandler,
    timeout: Duration,
    retries: usize,
    slots: Arc<Slots>,
    uploads: Mutex<HashMap<Key, UploadState>>,
    downloads: Mutex<HashMap<Key, DownloadState>>,
    clears: Mutex<HashMap<Key, ClearState>>,
    set_currents: Mutex<HashMap<u8, SetCurrentState>>,
}

/// Mission transfer client.
///
/// At most one transfer per `(target, kind)` runs at a time; a second request
/// fails synchronously with [`Error::TransferBusy`]. Cloning produces another
/// handle to the same transfer table.
#[derive(Clone)]
pub struct MissionClient {
    inner: Arc<MissionClientInner>,
}

impl MissionClient {
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
        let inner = Arc::new(MissionClientInner {
            sender,
            endpoint,
            router: router.clone(),
            timeouts,
            timeout,
            retries,
            slots,
            uploads: Mutex::new(HashMap::new()),
            downloads: Mutex::new(HashMap::new()),
            clears: Mutex::new(HashMap::new()),
            set_currents: Mutex::new(HashMap::new()),
        });

        let weak = Arc::downgrade(&inner);
        router.subscribe_message(msg_id::MISSION_REQUEST_INT, move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.on_request_int(frame);
            }
        });
        let weak = Arc::downgrade(&inner);
        router.subscribe_message(msg_id::MISSION_REQUEST, move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.on_request(frame);
            }
        });
        let weak = Arc::downgrade(&inner);
        router.subscribe_message(msg_id::MISSION_ACK, move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.on_ack(frame);
            }
        });
        let weak = Arc::downgrade(&inner);
        router.subscribe_message(msg_id::MISSION_COUNT, move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.on_count(frame);
            }
        });
        let weak = Arc::downgrade(&inner);
        router.subscribe_message(msg_id::MISSION_ITEM_INT, move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.on_item(frame);
            }
        });
        let weak = Arc::downgrade(&inner);
        router.subscribe_message(msg_id::MISSION_CURRENT, move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.on_current(frame);
            }
        });

        Self { inner }
    }

    /// Uploads `items` to a target.
    ///
    /// The transfer kind is derived from the items' mission type. Items are
    /// validated before anything is sent: they must be non-empty, carry one
    /// mission type, be numbered contiguously from zero, and mark exactly one
    /// item current. Validation failures are delivered through `callback`
    /// before this method returns.
    ///
    /// Fails synchronously with [`Error::TransferBusy`] while another transfer
    /// of the same kind runs against the same target.
    pub fn upload(
        &self,
        target_system: u8,
        target_component: u8,
        items: &[MissionItem],
        callback: impl FnOnce(TransferResult<()>) + Send + 'static,
    ) -> Result<()> {
        if items.is_empty() {
            callback(Err(TransferError::NoMissionAvailable));
            return Ok(());
        }

        let mission_type = items[0].mission_type;
        let Some(kind) = TransferKind::from_mission_type(mission_type) else {
            callback(Err(TransferError::Unsupported));
            return Ok(());
        };
        if items.iter().any(|item| item.mission_type != mission_type) {
            callback(Err(TransferError::MissionTypeNotConsistent));
            return Ok(());
        }
        if items
            .iter()
            .enumerate()
            .any(|(index, item)| item.seq as usize != index)
        {
            callback(Err(TransferError::InvalidSequence));
            return Ok(());
        }
        if items.iter().filter(|item| item.current != 0).count() != 1 {
            callback(Err(TransferError::CurrentInvalid));
            return Ok(());
        }

        let mut messages = Vec::with_capacity(items.len());
        for item in items {
            match item.to_message(target_system, target_component) {
                Ok(message) => messages.push(message),
                Err(err) => {
                    log::debug!("rejecting mission item {}: {err}", item.seq);
                    callback(Err(TransferError::InvalidParam));
                    return Ok(());
                }
            }
        }

        let generation = self.inner.slots.claim(target_system, kind)?;
        let key = (target_system, kind);
        let wire_type = messages[0].mission_type;
        {
            let cookie = self.inner.arm_upload(key, generation);
            self.inner.uploads.lock().unwrap().insert(
                key,
                UploadState {
                    target_system,
                    target_component,
                    mission_type: wire_type,
                    generation,
                    items: messages,
                    step: UploadStep::SendCount,
                    next_sequence: 0,
                    retries_done: 0,
                    cookie,
                    callback: Some(Box::new(callback)),
                },
            );
        }

        log::debug!(
            "uploading {} {kind:?} items to system {target_system}",
            items.len()
        );
        self.inner.send_count(key);
        Ok(())
    }

    /// Downloads the `kind` list from a target.
    pub fn download(
        &self,
        target_system: u8,
        target_component: u8,
        kind: TransferKind,
        callback: impl FnOnce(TransferResult<Vec<MissionItem>>) + Send + 'static,
    ) -> Result<()> {
        let Some(mission_type) = dialect_mission_type(kind) else {
            callback(Err(TransferError::Unsupported));
            return Ok(());
        };

        let generation = self.inner.slots.claim(target_system, kind)?;
        let key = (target_system, kind);
        {
            let cookie = self.inner.arm_download(key, generation);
            self.inner.downloads.lock().unwrap().insert(
                key,
                DownloadState {
                    target_system,
                    target_component,
                    mission_type,
                    generation,
                    expected_count: None,
                    items: Vec::new(),
                    next_sequence: 0,
                    step: DownloadStep::RequestList,
                    retries_done: 0,
                    cookie,
                    callback: Some(Box::new(callback)),
                },
            );
        }

        log::debug!("downloading {kind:?} list from system {target_system}");
        self.inner.send_request_list(key);
        Ok(())
    }

    /// Clears the `kind` list on a target.
    pub fn clear(
        &self,
        target_system: u8,
        target_component: u8,
        kind: TransferKind,
        callback: impl FnOnce(TransferResult<()>) + Send + 'static,
    ) -> Result<()> {
        let Some(mission_type) = dialect_mission_type(kind) else {
            callback(Err(TransferError::Unsupported));
            return Ok(());
        };

        let generation = self.inner.slots.claim(target_system, kind)?;
        let key = (target_system, kind);
        {
            let cookie = self.inner.arm_clear(key, generation);
            self.inner.clears.lock().unwrap().insert(
                key,
                ClearState {
                    target_system,
                    target_component,
                    mission_type,
                    generation,
                    retries_done: 0,
                    cookie,
                    callback: Some(Box::new(callback)),
                },
            );
        }

        self.inner.send_clear(key);
        Ok(())
    }

    /// Makes `seq` the current mission item on a target.
    ///
    /// Completion is confirmed by the target broadcasting a matching
    /// MISSION_CURRENT.
    pub fn set_current(
        &self,
        target_system: u8,
        target_component: u8,
        seq: u16,
        callback: impl FnOnce(TransferResult<()>) + Send + 'static,
    ) -> Result<()> {
        let generation = self.inner.slots.claim(target_system, TransferKind::Mission)?;
        {
            let cookie = self.inner.arm_set_current(target_system, generation);
            self.inner.set_currents.lock().unwrap().insert(
                target_system,
                SetCurrentState {
                    target_system,
                    target_component,
                    seq,
                    generation,
                    retries_done: 0,
                    cookie,
                    callback: Some(Box::new(callback)),
                },
            );
        }

        self.inner.send_set_current(target_system);
        Ok(())
    }

    /// Cancels the active transfer for `(target_system, kind)`.
    ///
    /// The remote is notified with a MISSION_ACK carrying
    /// `MAV_MISSION_OPERATION_CANCELLED` and the transfer's callback receives
    /// [`TransferError::Cancelled`]. Returns `false` when nothing was active.
    pub fn cancel(&self, target_system: u8, kind: TransferKind) -> bool {
        let inner = &self.inner;
        let key = (target_system, kind);

        if inner.uploads.lock().unwrap().contains_key(&key) {
            if let Err(err) =
                inner.send_upload_ack(key, MavMissionResult::MavMissionOperationCancelled)
            {
                log::debug!("failed to send cancel MISSION_ACK: {err:?}");
            }
            inner.finish_upload(key, Err(TransferError::Cancelled));
            return true;
        }
        if inner.downloads.lock().unwrap().contains_key(&key) {
            if let Err(err) =
                inner.send_download_ack(key, MavMissionResult::MavMissionOperationCancelled)
            {
                log::debug!("failed to send cancel MISSION_ACK: {err:?}");
            }
            inner.finish_download(key, Err(TransferError::Cancelled));
            return true;
        }
        if inner.clears.lock().unwrap().contains_key(&key) {
            inner.finish_clear(key, Err(TransferError::Cancelled));
            return true;
        }
        if kind == TransferKind::Mission
            && inner.set_currents.lock().unwrap().contains_key(&target_system)
        {
            inner.finish_set_current(target_system, Err(TransferError::Cancelled));
            return true;
        }

        false
    }
}

impl MissionClientInner {
    fn send(&self, message: &dyn Message) -> Result<()> {
        let frame = self.endpoint.next_frame(message)?;
        self.sender.send_frame(&frame)
    }

    ////////////////////////////////////////////////////////////////////////////
    // Upload

    fn arm_upload(self: &Arc<Self>, key: Key, generation: u64) -> Cookie {
        let weak = Arc::downgrade(self);
        self.timeouts.add(self.timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_upload_timeout(key, generation);
            }
        })
    }

    fn send_count(self: &Arc<Self>, key: Key) {
        let message = {
            let uploads = self.uploads.lock().unwrap();
            let Some(state) = uploads.get(&key) else {
                return;
            };
            MissionCount {
                target_system: state.target_system,
                target_component: state.target_component,
                count: state.items.len() as u16,
                mission_type: state.mission_type,
                ..Default::default()
            }
        };

        if let Err(err) = self.send(&message) {
            log::warn!("failed to send MISSION_COUNT: {err:?}");
            self.finish_upload(key, Err(TransferError::ConnectionError));
        }
    }

    fn send_upload_ack(&self, key: Key, result: MavMissionResult) -> Result<()> {
        let message = {
            let uploads = self.uploads.lock().unwrap();
            let Some(state) = uploads.get(&key) else {
                return Ok(());
            };
            MissionAck {
                target_system: state.target_system,
                target_component: state.target_component,
                type_: result,
                mission_type: state.mission_type,
                ..Default::default()
            }
        };
        self.send(&message)
    }

    fn on_request_int(self: &Arc<Self>, frame: &Frame<Versionless>) {
        let message = match frame.decode() {
            Ok(Common::MissionRequestInt(message)) => message,
            _ => return,
        };
        self.handle_item_request(frame.system_id(), message.seq, message.mission_type as u8);
    }

    fn on_request(self: &Arc<Self>, frame: &Frame<Versionless>) {
        let message = match frame.decode() {
            Ok(Common::MissionRequest(message)) => message,
            _ => return,
        };
        let system_id = frame.system_id();
        let mission_type = message.mission_type as u8;

        if self.router.autopilot_of(system_id) == Autopilot::ArduPilot {
            // ArduPilot still pulls with the deprecated float request.
            self.handle_item_request(system_id, message.seq, mission_type);
            return;
        }

        let Some(kind) = TransferKind::from_mission_type(mission_type) else {
            return;
        };
        let key = (system_id, kind);
        let active = {
            let uploads = self.uploads.lock().unwrap();
            match uploads.get(&key) {
                Some(state) => {
                    self.timeouts.refresh(state.cookie);
                    true
                }
                None => false,
            }
        };
        if !active {
            return;
        }

        log::warn!("system {system_id} pulls with MISSION_REQUEST, nacking as unsupported");
        if self
            .send_upload_ack(key, MavMissionResult::MavMissionUnsupported)
            .is_err()
        {
            self.finish_upload(key, Err(TransferError::ConnectionError));
        }
    }

    fn handle_item_request(self: &Arc<Self>, system_id: u8, seq: u16, mission_type: u8) {
        enum Action {
            Nothing,
            Timeout,
            Send(MissionItemInt),
        }

        let Some(kind) = TransferKind::from_mission_type(mission_type) else {
            return;
        };
        let key = (system_id, kind);

        let action = {
            let mut uploads = self.uploads.lock().unwrap();
            let Some(state) = uploads.get_mut(&key) else {
                log::debug!("unsolicited mission request from system {system_id}");
                return;
            };
            state.step = UploadStep::SendItems;

            let seq = seq as usize;
            if seq >= state.items.len() {
                log::warn!("system {system_id} requested mission item {seq} out of range");
                Action::Nothing
            } else if state.next_sequence < seq {
                log::warn!("mission request from system {system_id} skips items, ignoring");
                Action::Nothing
            } else if state.next_sequence > seq && state.retries_done >= self.retries {
                Action::Timeout
            } else {
                if state.next_sequence == seq {
                    // In-order request, the remote is making progress.
                    state.next_sequence = seq + 1;
                    state.retries_done = 0;
                } else {
                    // Duplicate of an already served item; re-answer without
                    // rewinding the progress counter.
                    state.retries_done += 1;
                }
                self.timeouts.refresh(state.cookie);
                Action::Send(state.items[seq].clone())
            }
        };

        match action {
            Action::Nothing => {}
            Action::Timeout => {
                log::warn!("mission upload to system {system_id} exceeded its retry budget");
                self.finish_upload(key, Err(TransferError::Timeout));
            }
            Action::Send(message) => {
                log::trace!("sending mission item {} to system {system_id}", message.seq);
                if let Err(err) = self.send(&message) {
                    log::warn!("failed to send MISSION_ITEM_INT: {err:?}");
                    self.finish_upload(key, Err(TransferError::ConnectionError));
                }
            }
        }
    }

    fn on_upload_timeout(self: &Arc<Self>, key: Key, generation: u64) {
        enum Action {
            Nothing,
            Timeout,
            ResendCount,
        }

        let action = {
            let mut uploads = self.uploads.lock().unwrap();
            let Some(state) = uploads.get_mut(&key) else {
                return;
            };
            if state.generation != generation {
                return;
            }

            if state.retries_done >= self.retries {
                Action::Timeout
            } else {
                state.retries_done += 1;
                state.cookie = self.arm_upload(key, generation);
                match state.step {
                    UploadStep::SendCount => Action::ResendCount,
                    // Items are pulled by the remote; keep waiting for the
                    // next request instead of pushing unasked.
                    UploadStep::SendItems => Action::Nothing,
                }
            }
        };

        match action {
            Action::Nothing => {}
            Action::Timeout => {
                log::warn!("mission upload to system {} timed out", key.0);
                self.finish_upload(key, Err(TransferError::Timeout));
            }
            Action::ResendCount => {
                log::trace!("re-sending MISSION_COUNT to system {}", key.0);
                self.send_count(key);
            }
        }
    }

    fn finish_upload(&self, key: Key, result: TransferResult<()>) {
        let Some(mut state) = self.uploads.lock().unwrap().remove(&key) else {
            return;
        };
        self.timeouts.remove(state.cookie);
        self.slots.release(key.0, key.1, state.generation);

        log::debug!("mission upload to system {} finished: {result:?}", key.0);
        if let Some(callback) = state.callback.take() {
            callback(result);
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Download

    fn arm_download(self: &Arc<Self>, key: Key, generation: u64) -> Cookie {
        let weak = Arc::downgrade(self);
        self.timeouts.add(self.timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_download_timeout(key, generation);
            }
        })
    }

    fn send_request_list(self: &Arc<Self>, key: Key) {
        let message = {
            let downloads = self.downloads.lock().unwrap();
            let Some(state) = downloads.get(&key) else {
                return;
            };
            MissionRequestList {
                target_system: state.target_system,
                target_component: state.target_component,
                mission_type: state.mission_type,
                ..Default::default()
            }
        };

        if let Err(err) = self.send(&message) {
            log::warn!("failed to send MISSION_REQUEST_LIST: {err:?}");
            self.finish_download(key, Err(TransferError::ConnectionError));
        }
    }

    fn send_request_item(self: &Arc<Self>, key: Key) {
        let message = {
            let downloads = self.downloads.lock().unwrap();
            let Some(state) = downloads.get(&key) else {
                return;
            };
            self.timeouts.refresh(state.cookie);
            MissionRequestInt {
                target_system: state.target_system,
                target_component: state.target_component,
                seq: state.next_sequence,
                mission_type: state.mission_type,
                ..Default::default()
            }
        };

        if let Err(err) = self.send(&message) {
            log::warn!("failed to send MISSION_REQUEST_INT: {err:?}");
            self.finish_download(key, Err(TransferError::ConnectionError));
        }
    }

    fn send_download_ack(&self, key: Key, result: MavMissionResult) -> Result<()> {
        let message = {
            let downloads = self.downloads.lock().unwrap();
            let Some(state) = downloads.get(&key) else {
                return Ok(());
            };
            MissionAck {
                target_system: state.target_system,
                target_component: state.target_component,
                type_: result,
                mission_type: state.mission_type,
                ..Default::default()
            }
        };
        self.send(&message)
    }

    fn on_count(self: &Arc<Self>, frame: &Frame<Versionless>) {
        enum Action {
            Nothing,
            RequestNext,
            Complete,
        }

        let message = match frame.decode() {
            Ok(Common::MissionCount(message)) => message,
            _ => return,
        };
        let Some(kind) = TransferKind::from_mission_type(message.mission_type as u8) else {
            return;
        };
        let key = (frame.system_id(), kind);

        let action = {
            let mut downloads = self.downloads.lock().unwrap();
            let Some(state) = downloads.get_mut(&key) else {
                log::debug!("unsolicited MISSION_COUNT from system {}", frame.system_id());
                return;
            };

            if state.expected_count.is_some() {
                // Duplicate count, the first one won.
                self.timeouts.refresh(state.cookie);
                Action::Nothing
            } else {
                state.expected_count = Some(message.count);
                state.step = DownloadStep::RequestItem;
                state.retries_done = 0;
                if message.count == 0 {
                    Action::Complete
                } else {
                    Action::RequestNext
                }
            }
        };

        match action {
            Action::Nothing => {}
            Action::RequestNext => self.send_request_item(key),
            Action::Complete => self.complete_download(key),
        }
    }

    fn on_item(self: &Arc<Self>, frame: &Frame<Versionless>) {
        enum Action {
            Nothing,
            RequestNext,
            Complete,
        }

        let message = match frame.decode() {
            Ok(Common::MissionItemInt(message)) => message,
            _ => return,
        };
        let Some(kind) = TransferKind::from_mission_type(message.mission_type as u8) else {
            return;
        };
        let key = (frame.system_id(), kind);

        let action = {
            let mut downloads = self.downloads.lock().unwrap();
            let Some(state) = downloads.get_mut(&key) else {
                return;
            };
            let Some(expected) = state.expected_count else {
                // Item before the count; wait for the count re-send.
                return;
            };

            if message.seq != state.next_sequence {
                log::trace!(
                    "ignoring out-of-order mission item {} from system {}",
                    message.seq,
                    frame.system_id()
                );
                Action::Nothing
            } else {
                state.retries_done = 0;
                state.items.push(MissionItem::from(&message));
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
            Action::RequestNext => self.send_request_item(key),
            Action::Complete => self.complete_download(key),
        }
    }

    fn complete_download(self: &Arc<Self>, key: Key) {
        let sent = self.send_download_ack(key, MavMissionResult::MavMissionAccepted);

        let Some(mut state) = self.downloads.lock().unwrap().remove(&key) else {
            return;
        };
        self.timeouts.remove(state.cookie);
        self.slots.release(key.0, key.1, state.generation);

        let Some(callback) = state.callback.take() else {
            return;
        };
        match sent {
            Ok(()) => {
                log::debug!(
                    "downloaded {} items from system {}",
                    state.items.len(),
                    key.0
                );
                callback(Ok(std::mem::take(&mut state.items)));
            }
            Err(err) => {
                log::warn!("failed to send final MISSION_ACK: {err:?}");
                callback(Err(TransferError::ConnectionError));
            }
        }
    }

    fn on_download_timeout(self: &Arc<Self>, key: Key, generation: u64) {
        enum Action {
            Timeout,
            ResendList,
            ResendItem,
        }

        let action = {
            let mut downloads = self.downloads.lock().unwrap();
            let Some(state) = downloads.get_mut(&key) else {
                return;
            };
            if state.generation != generation {
                return;
            }

            if state.retries_done >= self.retries {
                Action::Timeout
            } else {
                state.retries_done += 1;
                state.cookie = self.arm_download(key, generation);
                match state.step {
                    DownloadStep::RequestList => Action::ResendList,
                    DownloadStep::RequestItem => Action::ResendItem,
                }
            }
        };

        match action {
            Action::Timeout => {
                log::warn!("mission download from system {} timed out", key.0);
                self.finish_download(key, Err(TransferError::Timeout));
            }
            Action::ResendList => self.send_request_list(key),
            Action::ResendItem => self.send_request_item(key),
        }
    }

    fn finish_download(&self, key: Key, result: TransferResult<Vec<MissionItem>>) {
        let Some(mut state) = self.downloads.lock().unwrap().remove(&key) else {
            return;
        };
        self.timeouts.remove(state.cookie);
        self.slots.release(key.0, key.1, state.generation);

        log::debug!("mission download from system {} finished: {result:?}", key.0);
        if let Some(callback) = state.callback.take() {
            callback(result);
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Clear

    fn arm_clear(self: &Arc<Self>, key: Key, generation: u64) -> Cookie {
        let weak = Arc::downgrade(self);
        self.timeouts.add(self.timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_clear_timeout(key, generation);
            }
        })
    }

    fn send_clear(self: &Arc<Self>, key: Key) {
        let message = {
            let clears = self.clears.lock().unwrap();
            let Some(state) = clears.get(&key) else {
                return;
            };
            MissionClearAll {
                target_system: state.target_system,
                target_component: state.target_component,
                mission_type: state.mission_type,
                ..Default::default()
            }
        };

        if let Err(err) = self.send(&message) {
            log::warn!("failed to send MISSION_CLEAR_ALL: {err:?}");
            self.finish_clear(key, Err(TransferError::ConnectionError));
        }
    }

    fn on_clear_timeout(self: &Arc<Self>, key: Key, generation: u64) {
        let resend = {
            let mut clears = self.clears.lock().unwrap();
            let Some(state) = clears.get_mut(&key) else {
                return;
            };
            if state.generation != generation {
                return;
            }

            if state.retries_done >= self.retries {
                false
            } else {
                state.retries_done += 1;
                state.cookie = self.arm_clear(key, generation);
                true
            }
        };

        if resend {
            self.send_clear(key);
        } else {
            log::warn!("mission clear on system {} timed out", key.0);
            self.finish_clear(key, Err(TransferError::Timeout));
        }
    }

    fn finish_clear(&self, key: Key, result: TransferResult<()>) {
        let Some(mut state) = self.clears.lock().unwrap().remove(&key) else {
            return;
        };
        self.timeouts.remove(state.cookie);
        self.slots.release(key.0, key.1, state.generation);

        if let Some(callback) = state.callback.take() {
            callback(result);
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Set current

    fn arm_set_current(self: &Arc<Self>, target: u8, generation: u64) -> Cookie {
        let weak = Arc::downgrade(self);
        self.timeouts.add(self.timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_set_current_timeout(target, generation);
            }
        })
    }

    fn send_set_current(self: &Arc<Self>, target: u8) {
        let message = {
            let set_currents = self.set_currents.lock().unwrap();
            let Some(state) = set_currents.get(&target) else {
                return;
            };
            self.timeouts.refresh(state.cookie);
            MissionSetCurrent {
                target_system: state.target_system,
                target_component: state.target_component,
                seq: state.seq,
            }
        };

        if let Err(err) = self.send(&message) {
            log::warn!("failed to send MISSION_SET_CURRENT: {err:?}");
            self.finish_set_current(target, Err(TransferError::ConnectionError));
        }
    }

    fn on_current(self: &Arc<Self>, frame: &Frame<Versionless>) {
        enum Action {
            Nothing,
            Confirmed,
            Resend,
        }

        let message = match frame.decode() {
            Ok(Common::MissionCurrent(message)) => message,
            _ => return,
        };
        let target = frame.system_id();

        let action = {
            let mut set_currents = self.set_currents.lock().unwrap();
            let Some(state) = set_currents.get_mut(&target) else {
                return;
            };

            if message.seq == state.seq {
                Action::Confirmed
            } else if state.retries_done >= self.retries {
                Action::Nothing
            } else {
                state.retries_done += 1;
                Action::Resend
            }
        };

        match action {
            Action::Nothing => {}
            Action::Confirmed => self.finish_set_current(target, Ok(())),
            Action::Resend => {
                log::trace!("system {target} reports another current item, re-sending");
                self.send_set_current(target);
            }
        }
    }

    fn on_set_current_timeout(self: &Arc<Self>, target: u8, generation: u64) {
        let resend = {
            let mut set_currents = self.set_currents.lock().unwrap();
            let Some(state) = set_currents.get_mut(&target) else {
                return;
            };
            if state.generation != generation {
                return;
            }

            if state.retries_done >= self.retries {
                false
            } else {
                state.retries_done += 1;
                state.cookie = self.arm_set_current(target, generation);
                true
            }
        };

        if resend {
            self.send_set_current(target);
        } else {
            log::warn!("set-current on system {target} timed out");
            self.finish_set_current(target, Err(TransferError::Timeout));
        }
    }

    fn finish_set_current(&self, target: u8, result: TransferResult<()>) {
        let Some(mut state) = self.set_currents.lock().unwrap().remove(&target) else {
            return;
        };
        self.timeouts.remove(state.cookie);
        self.slots
            .release(target, TransferKind::Mission, state.generation);

        if let Some(callback) = state.callback.take() {
            callback(result);
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Acknowledgments

    fn on_ack(self: &Arc<Self>, frame: &Frame<Versionless>) {
        let ack = match frame.decode() {
            Ok(Common::MissionAck(ack)) => ack,
            _ => return,
        };
        let Some(kind) = TransferKind::from_mission_type(ack.mission_type as u8) else {
            return;
        };
        let key = (frame.system_id(), kind);

        let upload_result = {
            let uploads = self.uploads.lock().unwrap();
            uploads.get(&key).map(|state| match ack.type_ {
                MavMissionResult::MavMissionAccepted => {
                    if state.next_sequence == state.items.len() {
                        Ok(())
                    } else {
                        // Accepted before every item was pulled.
                        Err(TransferError::ProtocolError)
                    }
                }
                other => Err(map_nack(other)),
            })
        };
        if let Some(result) = upload_result {
            self.finish_upload(key, result);
            return;
        }

        let in_clears = self.clears.lock().unwrap().contains_key(&key);
        if in_clears {
            let result = match ack.type_ {
                MavMissionResult::MavMissionAccepted => Ok(()),
                other => Err(map_nack(other)),
            };
            self.finish_clear(key, result);
            return;
        }

        log::debug!(
            "unexpected MISSION_ACK {:?} from system {}",
            ack.type_,
            frame.system_id()
        );
    }
}

///////////////////////////////////////////////////////////////////////////////
//                                   Tests                                   //
///////////////////////////////////////////////////////////////////////////////
