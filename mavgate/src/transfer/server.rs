//! Responder side of the mission transfer protocols.
//!
//! [`MissionServer`] plays the vehicle role: it accepts item lists pushed by a
//! remote (answering MISSION_COUNT with item requests and a final ack) and
//! serves its retained lists to remotes that pull them with
//! MISSION_REQUEST_LIST. One list per [`TransferKind`] is retained.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mavio::dialects::common::enums::{MavMissionResult, MavMissionType};
use mavio::dialects::common::messages::{MissionAck, MissionCount, MissionItemInt, MissionRequestInt};
use mavio::protocol::Versionless;
use mavio::Frame;

use crate::callback::{CallbackList, Handle};
use crate::consts::{TRANSFER_RETRIES, TRANSFER_TIMEOUT};
use crate::io::SendFrame;
use crate::prelude::*;
use crate::protocol::{msg_id, Common, Endpoint, Message, MissionItem, V2};
use crate::router::Router;
use crate::transfer::TransferKind;
use crate::utils::{Cookie, TimeoutHandler};

type Key = (u8, TransferKind);

struct IncomingState {
    remote_system: u8,
    remote_component: u8,
    mission_type: MavMissionType,
    generation: u64,
    expected: u16,
    next_sequence: u16,
    items: Vec<MissionItemInt>,
    retries_done: usize,
    cookie: Cookie,
}

struct OutgoingState {
    generation: u64,
    retries_done: usize,
    cookie: Cookie,
}

struct MissionServerInner {
    sender: Arc<dyn SendFrame>,
    endpoint: Arc<Endpoint<V2>>,
    timeouts: TimeoutHandler,
    timeout: Duration,
    retries: usize,
    own_system_id: u8,
    generations: AtomicU64,
    stored: Mutex<HashMap<TransferKind, Vec<MissionItemInt>>>,
    incoming: Mutex<HashMap<Key, IncomingState>>,
    outgoing: Mutex<HashMap<Key, OutgoingState>>,
    uploaded: CallbackList<(TransferKind, Vec<MissionItem>)>,
}

/// Mission transfer responder.
///
/// Cloning produces another handle to the same retained lists.
#[derive(Clone)]
pub struct MissionServer {
    inner: Arc<MissionServerInner>,
}

impl MissionServer {
    /// Creates a server wired into `router` with default retry settings.
    ///
    /// Only exchanges addressed to `own_system_id` (or broadcast) are handled.
    pub fn new(
        sender: Arc<dyn SendFrame>,
        endpoint: Arc<Endpoint<V2>>,
        router: &Router,
        timeouts: TimeoutHandler,
        own_system_id: u8,
    ) -> Self {
        Self::with_retry(
            sender,
            endpoint,
            router,
            timeouts,
            own_system_id,
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
        own_system_id: u8,
        timeout: Duration,
        retries: usize,
    ) -> Self {
        let inner = Arc::new(MissionServerInner {
            sender,
            endpoint,
            timeouts,
            timeout,
            retries,
            own_system_id,
            generations: AtomicU64::new(0),
            stored: Mutex::new(HashMap::new()),
            incoming: Mutex::new(HashMap::new()),
            outgoing: Mutex::new(HashMap::new()),
            uploaded: CallbackList::new(),
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
        router.subscribe_message(msg_id::MISSION_REQUEST_LIST, move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.on_request_list(frame);
            }
        });
        let weak = Arc::downgrade(&inner);
        router.subscribe_message(msg_id::MISSION_REQUEST_INT, move |frame| {
            if let Some(inner) = weak.upgrade() {
                if let Ok(Common::MissionRequestInt(message)) = frame.decode() {
                    if inner.addressed(message.target_system) {
                        inner.serve_item(
                            frame.system_id(),
                            frame.component_id(),
                            message.seq,
                            message.mission_type as u8,
                        );
                    }
                }
            }
        });
        let weak = Arc::downgrade(&inner);
        router.subscribe_message(msg_id::MISSION_REQUEST, move |frame| {
            if let Some(inner) = weak.upgrade() {
                // The deprecated float request is served with int items too.
                if let Ok(Common::MissionRequest(message)) = frame.decode() {
                    if inner.addressed(message.target_system) {
                        inner.serve_item(
                            frame.system_id(),
                            frame.component_id(),
                            message.seq,
                            message.mission_type as u8,
                        );
                    }
                }
            }
        });
        let weak = Arc::downgrade(&inner);
        router.subscribe_message(msg_id::MISSION_ACK, move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.on_ack(frame);
            }
        });
        let weak = Arc::downgrade(&inner);
        router.subscribe_message(msg_id::MISSION_CLEAR_ALL, move |frame| {
            if let Some(inner) = weak.upgrade() {
                inner.on_clear_all(frame);
            }
        });

        Self { inner }
    }

    /// The retained `kind` list.
    pub fn items(&self, kind: TransferKind) -> Vec<MissionItem> {
        let stored = self.inner.stored.lock().unwrap();
        stored
            .get(&kind)
            .map(|items| items.iter().map(MissionItem::from).collect())
            .unwrap_or_default()
    }

    /// Replaces the retained `kind` list served to downloading remotes.
    pub fn set_items(&self, kind: TransferKind, items: &[MissionItem]) -> Result<()> {
        let mut messages = Vec::with_capacity(items.len());
        for item in items {
            messages.push(item.to_message(0, 0)?);
        }
        self.inner.stored.lock().unwrap().insert(kind, messages);
        Ok(())
    }

    /// Subscribes to completed uploads.
    ///
    /// The callback receives the kind and the freshly accepted list.
    pub fn subscribe_uploaded(
        &self,
        callback: impl Fn(&(TransferKind, Vec<MissionItem>)) + Send + Sync + 'static,
    ) -> Handle {
        self.inner.uploaded.subscribe(callback)
    }

    /// Removes an upload subscription.
    pub fn unsubscribe_uploaded(&self, handle: Handle) {
        self.inner.uploaded.unsubscribe(handle)
    }
}

impl MissionServerInner {
    fn send(&self, message: &dyn Message) -> Result<()> {
        let frame = self.endpoint.next_frame(message)?;
        self.sender.send_frame(&frame)
    }

    fn addressed(&self, target_system: u8) -> bool {
        target_system == 0 || target_system == self.own_system_id
    }

    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    ////////////////////////////////////////////////////////////////////////////
    // Accepting uploads

    fn arm_incoming(self: &Arc<Self>, key: Key, generation: u64) -> Cookie {
        let weak = Arc::downgrade(self);
        self.timeouts.add(self.timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_incoming_timeout(key, generation);
            }
        })
    }

    fn on_count(self: &Arc<Self>, frame: &Frame<Versionless>) {
        let message = match frame.decode() {
            Ok(Common::MissionCount(message)) => message,
            _ => return,
        };
        if !self.addressed(message.target_system) {
            return;
        }
        let Some(kind) = TransferKind::from_mission_type(message.mission_type as u8) else {
            return;
        };
        let remote_system = frame.system_id();
        let remote_component = frame.component_id();
        let key = (remote_system, kind);

        if message.count == 0 {
            // Nothing to pull; an empty list replaces the stored one.
            self.stored.lock().unwrap().insert(kind, Vec::new());
            self.incoming.lock().unwrap().remove(&key);
            self.send_ack(
                remote_system,
                remote_component,
                message.mission_type,
                MavMissionResult::MavMissionAccepted,
            );
            self.uploaded.notify(&(kind, Vec::new()));
            return;
        }

        log::debug!(
            "accepting {} {kind:?} items from system {remote_system}",
            message.count
        );
        let generation = self.next_generation();
        {
            let mut incoming = self.incoming.lock().unwrap();
            // A fresh count restarts any half-done exchange from this remote.
            if let Some(previous) = incoming.remove(&key) {
                self.timeouts.remove(previous.cookie);
            }
            let cookie = self.arm_incoming(key, generation);
            incoming.insert(
                key,
                IncomingState {
                    remote_system,
                    remote_component,
                    mission_type: message.mission_type,
                    generation,
                    expected: message.count,
                    next_sequence: 0,
                    items: Vec::with_capacity(message.count as usize),
                    retries_done: 0,
                    cookie,
                },
            );
        }
        self.request_next(key);
    }

    fn request_next(&self, key: Key) {
        let message = {
            let mut incoming = self.incoming.lock().unwrap();
            let Some(state) = incoming.get_mut(&key) else {
                return;
            };
            state.retries_done += 1;
            self.timeouts.refresh(state.cookie);
            MissionRequestInt {
                target_system: state.remote_system,
                target_component: state.remote_component,
                seq: state.next_sequence,
                mission_type: state.mission_type,
                ..Default::default()
            }
        };

        if let Err(err) = self.send(&message) {
            log::warn!("failed to request mission item: {err:?}");
            self.drop_incoming(key);
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
        if !self.addressed(message.target_system) {
            return;
        }
        let Some(kind) = TransferKind::from_mission_type(message.mission_type as u8) else {
            return;
        };
        let key = (frame.system_id(), kind);

        let action = {
            let mut incoming = self.incoming.lock().unwrap();
            let Some(state) = incoming.get_mut(&key) else {
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
                state.items.push(message);
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

        let items: Vec<MissionItem> = state.items.iter().map(MissionItem::from).collect();
        log::info!(
            "accepted {} {:?} items from system {}",
            items.len(),
            key.1,
            state.remote_system
        );
        self.stored.lock().unwrap().insert(key.1, state.items);
        self.send_ack(
            state.remote_system,
            state.remote_component,
            state.mission_type,
            MavMissionResult::MavMissionAccepted,
        );
        self.uploaded.notify(&(key.1, items));
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
                state.cookie = self.arm_incoming(key, generation);
                true
            }
        };

        if resend {
            self.request_next(key);
        } else {
            log::warn!("upload from system {} stalled, dropping it", key.0);
            self.drop_incoming(key);
        }
    }

    fn drop_incoming(&self, key: Key) {
        if let Some(state) = self.incoming.lock().unwrap().remove(&key) {
            self.timeouts.remove(state.cookie);
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Serving downloads

    fn arm_outgoing(self: &Arc<Self>, key: Key, generation: u64) -> Cookie {
        let weak = Arc::downgrade(self);
        self.timeouts.add(self.timeout, move || {
            if let Some(inner) = weak.upgrade() {
                inner.on_outgoing_timeout(key, generation);
            }
        })
    }

    fn on_request_list(self: &Arc<Self>, frame: &Frame<Versionless>) {
        let message = match frame.decode() {
            Ok(Common::MissionRequestList(message)) => message,
            _ => return,
        };
        if !self.addressed(message.target_system) {
            return;
        }
        let Some(kind) = TransferKind::from_mission_type(message.mission_type as u8) else {
            return;
        };
        let remote_system = frame.system_id();
        let remote_component = frame.component_id();
        let key = (remote_system, kind);

        let count = {
            let stored = self.stored.lock().unwrap();
            stored.get(&kind).map(Vec::len).unwrap_or(0) as u16
        };

        if count > 0 {
            // The serve session lives until the remote's final ack.
            let generation = self.next_generation();
            let mut outgoing = self.outgoing.lock().unwrap();
            if let Some(previous) = outgoing.remove(&key) {
                self.timeouts.remove(previous.cookie);
            }
            let cookie = self.arm_outgoing(key, generation);
            outgoing.insert(
                key,
                OutgoingState {
                    generation,
                    retries_done: 0,
                    cookie,
                },
            );
        }

        log::debug!("serving {count} {kind:?} items to system {remote_system}");
        let message = MissionCount {
            target_system: remote_system,
            target_component: remote_component,
            count,
            mission_type: message.mission_type,
            ..Default::default()
        };
        if let Err(err) = self.send(&message) {
            log::warn!("failed to send MISSION_COUNT: {err:?}");
        }
    }

    /// Answers a single item request from the retained list.
    ///
    /// Requests are honored even without a live serve session, so a remote
    /// that re-requests an item after its final ack got lost still gets an
    /// answer.
    fn serve_item(&self, remote_system: u8, remote_component: u8, seq: u16, mission_type: u8) {
        let Some(kind) = TransferKind::from_mission_type(mission_type) else {
            return;
        };
        let key = (remote_system, kind);
        {
            let mut outgoing = self.outgoing.lock().unwrap();
            if let Some(state) = outgoing.get_mut(&key) {
                state.retries_done = 0;
                self.timeouts.refresh(state.cookie);
            }
        }

        let item = {
            let stored = self.stored.lock().unwrap();
            stored
                .get(&kind)
                .and_then(|items| items.get(seq as usize))
                .cloned()
        };
        let Some(mut item) = item else {
            log::warn!("system {remote_system} requested {kind:?} item {seq} out of range");
            return;
        };

        item.target_system = remote_system;
        item.target_component = remote_component;
        if let Err(err) = self.send(&item) {
            log::warn!("failed to send MISSION_ITEM_INT: {err:?}");
        }
    }

    fn on_ack(self: &Arc<Self>, frame: &Frame<Versionless>) {
        let ack = match frame.decode() {
            Ok(Common::MissionAck(ack)) => ack,
            _ => return,
        };
        if !self.addressed(ack.target_system) {
            return;
        }
        let Some(kind) = TransferKind::from_mission_type(ack.mission_type as u8) else {
            return;
        };
        let key = (frame.system_id(), kind);

        if let Some(state) = self.outgoing.lock().unwrap().remove(&key) {
            self.timeouts.remove(state.cookie);
            log::debug!(
                "system {} closed the {kind:?} download with {:?}",
                frame.system_id(),
                ack.type_
            );
        }
    }

    fn on_outgoing_timeout(self: &Arc<Self>, key: Key, generation: u64) {
        let mut outgoing = self.outgoing.lock().unwrap();
        let Some(state) = outgoing.get_mut(&key) else {
            return;
        };
        if state.generation != generation {
            return;
        }

        if state.retries_done >= self.retries {
            log::debug!("download served to system {} went quiet, dropping it", key.0);
            outgoing.remove(&key);
        } else {
            state.retries_done += 1;
            state.cookie = self.arm_outgoing(key, generation);
        }
    }

    ////////////////////////////////////////////////////////////////////////////
    // Clearing

    fn on_clear_all(self: &Arc<Self>, frame: &Frame<Versionless>) {
        let message = match frame.decode() {
            Ok(Common::MissionClearAll(message)) => message,
            _ => return,
        };
        if !self.addressed(message.target_system) {
            return;
        }
        let Some(kind) = TransferKind::from_mission_type(message.mission_type as u8) else {
            return;
        };

        log::info!("clearing the {kind:?} list on request of system {}", frame.system_id());
        self.stored.lock().unwrap().remove(&kind);
        self.send_ack(
            frame.system_id(),
            frame.component_id(),
            message.mission_type,
            MavMissionResult::MavMissionAccepted,
        );
        self.uploaded.notify(&(kind, Vec::new()));
    }

    fn send_ack(
        &self,
        target_system: u8,
        target_component: u8,
        mission_type: MavMissionType,
        result: MavMissionResult,
    ) {
        let message = MissionAck {
            target_system,
            target_component,
            type_: result,
            mission_type,
            ..Default::default()
        };
        if let Err(err) = self.send(&message) {
            log::warn!("failed to send MISSION_ACK: {err:?}");
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
//                                   Tests                                   //
///////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test_mission_server {
    use super::*;
    use std::sync::mpsc;

    use mavio::dialects::common::messages::MissionRequestList;
    use mavio::protocol::MavLinkId;

    const GCS: u8 = 255;
    const VEHICLE: u8 = 1;

    fn test_server(router: &Router) -> (MissionServer, Arc<Mutex<Vec<Frame<V2>>>>) {
        let sent: Arc<Mutex<Vec<Frame<V2>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let sender: Arc<dyn SendFrame> = Arc::new(move |frame: &Frame<V2>| {
            sink.lock().unwrap().push(frame.clone());
            Ok(())
        });
        let endpoint = Arc::new(Endpoint::new(MavLinkId::new(VEHICLE, 1)));
        let server = MissionServer::new(
            sender,
            endpoint,
            router,
            TimeoutHandler::spawn(),
            VEHICLE,
        );
        (server, sent)
    }

    fn gcs_frame(message: &dyn Message) -> Frame<Versionless> {
        let endpoint: Endpoint<V2> = Endpoint::new(MavLinkId::new(GCS, 190));
        endpoint.next_frame(message).unwrap().to_versionless()
    }

    fn waypoints(count: u16) -> Vec<MissionItem> {
        (0..count)
            .map(|seq| MissionItem {
                seq,
                frame: 6,
                command: 16,
                current: u8::from(seq == 0),
                autocontinue: 1,
                x: 473_977_507,
                y: 85_456_075 + i32::from(seq),
                z: 25.0,
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn upload_is_pulled_item_by_item_and_acked() {
        let router = Router::new();
        let (server, sent) = test_server(&router);

        let (tx, rx) = mpsc::channel();
        server.subscribe_uploaded(move |(kind, items)| {
            tx.send((*kind, items.clone())).unwrap();
        });

        router.process(&gcs_frame(&MissionCount {
            target_system: VEHICLE,
            target_component: 1,
            count: 2,
            ..Default::default()
        }));

        // The server pulls item 0, then 1, then acks.
        let items = waypoints(2);
        {
            let sent = sent.lock().unwrap();
            match sent.last().unwrap().decode().unwrap() {
                Common::MissionRequestInt(request) => {
                    assert_eq!(request.seq, 0);
                    assert_eq!(request.target_system, GCS);
                }
                other => panic!("expected MISSION_REQUEST_INT, got {other:?}"),
            }
        }
        router.process(&gcs_frame(&items[0].to_message(VEHICLE, 1).unwrap()));
        router.process(&gcs_frame(&items[1].to_message(VEHICLE, 1).unwrap()));

        {
            let sent = sent.lock().unwrap();
            match sent.last().unwrap().decode().unwrap() {
                Common::MissionAck(ack) => {
                    assert_eq!(ack.type_, MavMissionResult::MavMissionAccepted)
                }
                other => panic!("expected MISSION_ACK, got {other:?}"),
            }
        }

        let (kind, uploaded) = rx.try_recv().unwrap();
        assert_eq!(kind, TransferKind::Mission);
        assert_eq!(uploaded.len(), 2);
        assert_eq!(server.items(TransferKind::Mission).len(), 2);
    }

    #[test]
    fn duplicate_items_are_ignored() {
        let router = Router::new();
        let (server, _) = test_server(&router);

        router.process(&gcs_frame(&MissionCount {
            target_system: VEHICLE,
            target_component: 1,
            count: 2,
            ..Default::default()
        }));

        let items = waypoints(2);
        router.process(&gcs_frame(&items[0].to_message(VEHICLE, 1).unwrap()));
        router.process(&gcs_frame(&items[0].to_message(VEHICLE, 1).unwrap()));
        router.process(&gcs_frame(&items[1].to_message(VEHICLE, 1).unwrap()));

        assert_eq!(server.items(TransferKind::Mission).len(), 2);
    }

    #[test]
    fn empty_count_replaces_the_stored_list() {
        let router = Router::new();
        let (server, sent) = test_server(&router);
        server.set_items(TransferKind::Mission, &waypoints(3)).unwrap();

        router.process(&gcs_frame(&MissionCount {
            target_system: VEHICLE,
            target_component: 1,
            count: 0,
            ..Default::default()
        }));

        assert!(server.items(TransferKind::Mission).is_empty());
        let sent = sent.lock().unwrap();
        assert!(matches!(
            sent.last().unwrap().decode().unwrap(),
            Common::MissionAck(_)
        ));
    }

    #[test]
    fn download_is_served_from_the_stored_list() {
        let router = Router::new();
        let (server, sent) = test_server(&router);
        let items = waypoints(2);
        server.set_items(TransferKind::Mission, &items).unwrap();

        router.process(&gcs_frame(&MissionRequestList {
            target_system: VEHICLE,
            target_component: 1,
            ..Default::default()
        }));
        {
            let sent = sent.lock().unwrap();
            match sent.last().unwrap().decode().unwrap() {
                Common::MissionCount(count) => assert_eq!(count.count, 2),
                other => panic!("expected MISSION_COUNT, got {other:?}"),
            }
        }

        for seq in 0..2u16 {
            router.process(&gcs_frame(&MissionRequestInt {
                target_system: VEHICLE,
                target_component: 1,
                seq,
                ..Default::default()
            }));
            let sent = sent.lock().unwrap();
            match sent.last().unwrap().decode().unwrap() {
                Common::MissionItemInt(item) => {
                    assert_eq!(item.seq, seq);
                    assert_eq!(item.target_system, GCS);
                }
                other => panic!("expected MISSION_ITEM_INT, got {other:?}"),
            }
        }

        // The remote closes the exchange. A straggling re-request (its ack
        // may have been lost) is still answered from the retained list.
        router.process(&gcs_frame(&MissionAck {
            target_system: VEHICLE,
            target_component: 1,
            type_: MavMissionResult::MavMissionAccepted,
            ..Default::default()
        }));
        router.process(&gcs_frame(&MissionRequestInt {
            target_system: VEHICLE,
            target_component: 1,
            seq: 0,
            ..Default::default()
        }));
        let sent = sent.lock().unwrap();
        match sent.last().unwrap().decode().unwrap() {
            Common::MissionItemInt(item) => assert_eq!(item.seq, 0),
            other => panic!("expected MISSION_ITEM_INT, got {other:?}"),
        }
    }

    #[test]
    fn served_download_survives_quiet_intervals() {
        let router = Router::new();
        let sent: Arc<Mutex<Vec<Frame<V2>>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = sent.clone();
        let sender: Arc<dyn SendFrame> = Arc::new(move |frame: &Frame<V2>| {
            sink.lock().unwrap().push(frame.clone());
            Ok(())
        });
        let server = MissionServer::with_retry(
            sender,
            Arc::new(Endpoint::new(MavLinkId::new(VEHICLE, 1))),
            &router,
            TimeoutHandler::spawn(),
            VEHICLE,
            Duration::from_millis(30),
            10,
        );
        server.set_items(TransferKind::Mission, &waypoints(2)).unwrap();

        router.process(&gcs_frame(&MissionRequestList {
            target_system: VEHICLE,
            target_component: 1,
            ..Default::default()
        }));

        // Several quiet intervals pass before the remote asks for an item,
        // as happens when its requests are lost on the way.
        std::thread::sleep(Duration::from_millis(150));
        router.process(&gcs_frame(&MissionRequestInt {
            target_system: VEHICLE,
            target_component: 1,
            seq: 0,
            ..Default::default()
        }));

        let sent = sent.lock().unwrap();
        match sent.last().unwrap().decode().unwrap() {
            Common::MissionItemInt(item) => assert_eq!(item.seq, 0),
            other => panic!("expected MISSION_ITEM_INT, got {other:?}"),
        }
    }

    #[test]
    fn requests_for_other_systems_are_ignored() {
        let router = Router::new();
        let (server, sent) = test_server(&router);
        server.set_items(TransferKind::Mission, &waypoints(1)).unwrap();

        router.process(&gcs_frame(&MissionRequestList {
            target_system: 99,
            target_component: 1,
            ..Default::default()
        }));

        assert!(sent.lock().unwrap().is_empty());
    }

    #[test]
    fn clear_all_empties_the_stored_list() {
        let router = Router::new();
        let (server, sent) = test_server(&router);
        server.set_items(TransferKind::Fence, &{
            let mut items = waypoints(2);
            for item in &mut items {
                item.mission_type = 1;
            }
            items
        })
        .unwrap();

        router.process(&gcs_frame(&mavio::dialects::common::messages::MissionClearAll {
            target_system: VEHICLE,
            target_component: 1,
            mission_type: MavMissionType::Fence,
            ..Default::default()
        }));

        assert!(server.items(TransferKind::Fence).is_empty());
        let sent = sent.lock().unwrap();
        match sent.last().unwrap().decode().unwrap() {
            Common::MissionAck(ack) => {
                assert_eq!(ack.type_, MavMissionResult::MavMissionAccepted)
            }
            other => panic!("expected MISSION_ACK, got {other:?}"),
        }
    }
}
