//! Mission transfer system tests over an in-memory lossy link.
//!
//! A GCS-side [`MissionClient`] and a vehicle-side [`MissionServer`] run
//! against each other through a pair of frame queues with a deterministic
//! drop filter, exercising the full retry machinery without sockets.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use mavio::dialects::common::enums::{MavMissionResult, MavMissionType};
use mavio::dialects::common::messages::MissionAck;
use mavio::protocol::{Endpoint, MavLinkId, V2};
use mavio::Frame;

use mavgate::io::SendFrame;
use mavgate::protocol::{msg_id, MissionItem};
use mavgate::router::Router;
use mavgate::transfer::mission::MissionClient;
use mavgate::transfer::server::MissionServer;
use mavgate::transfer::{Slots, TransferError, TransferKind, TransferResult};
use mavgate::utils::TimeoutHandler;

const GCS_SYSTEM: u8 = mavgate::consts::DEFAULT_SYSTEM_ID;
const GCS_COMPONENT: u8 = mavgate::consts::DEFAULT_COMPONENT_ID;
const VEHICLE_SYSTEM: u8 = 1;
const VEHICLE_COMPONENT: u8 = 1;

const LINK_TIMEOUT: Duration = Duration::from_millis(30);
const LINK_RETRIES: usize = 10;
const TEST_DEADLINE: Duration = Duration::from_secs(60);

static INIT: std::sync::Once = std::sync::Once::new();

fn initialize() {
    INIT.call_once(|| {
        env_logger::builder()
            .filter_level(log::LevelFilter::Warn)
            .filter_module(env!("CARGO_PKG_NAME"), log::LevelFilter::Debug)
            .is_test(true)
            .init();
    });
}

/// Small xorshift generator so drop patterns are reproducible.
struct Xorshift(u64);

impl Xorshift {
    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }
}

/// One direction of the in-memory link.
///
/// Senders push frames into the queue; the test thread pumps them into the
/// destination router, so no callback ever recurses into its own sender.
/// MISSION_ACK frames are never dropped, everything else is dropped with the
/// configured per-mille probability.
struct LossyLink {
    queue: Mutex<VecDeque<Frame<V2>>>,
    rng: Mutex<Xorshift>,
    drop_permille: u64,
    dropped: AtomicUsize,
}

impl LossyLink {
    fn new(seed: u64, drop_permille: u64) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            rng: Mutex::new(Xorshift(seed)),
            drop_permille,
            dropped: AtomicUsize::new(0),
        })
    }

    fn sender(self: &Arc<Self>) -> Arc<dyn SendFrame> {
        let link = self.clone();
        Arc::new(move |frame: &Frame<V2>| {
            link.offer(frame);
            Ok(())
        })
    }

    fn offer(&self, frame: &Frame<V2>) {
        if frame.message_id() != msg_id::MISSION_ACK
            && self.rng.lock().unwrap().next() % 1000 < self.drop_permille
        {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.queue.lock().unwrap().push_back(frame.clone());
    }

    /// Delivers every queued frame to `destination`, returns whether any moved.
    fn pump(&self, destination: &Router) -> bool {
        let mut moved = false;
        loop {
            let frame = self.queue.lock().unwrap().pop_front();
            match frame {
                Some(frame) => {
                    destination.process(&frame.to_versionless());
                    moved = true;
                }
                None => break,
            }
        }
        moved
    }
}

struct Pair {
    client: MissionClient,
    server: MissionServer,
    gcs_router: Router,
    vehicle_router: Router,
    to_vehicle: Arc<LossyLink>,
    to_gcs: Arc<LossyLink>,
}

impl Pair {
    fn new(seed: u64, drop_permille: u64) -> Self {
        let gcs_router = Router::new();
        let vehicle_router = Router::new();

        let to_vehicle = LossyLink::new(seed, drop_permille);
        let to_gcs = LossyLink::new(seed.wrapping_mul(31).wrapping_add(7), drop_permille);

        let client = MissionClient::with_retry(
            to_vehicle.sender(),
            Arc::new(Endpoint::new(MavLinkId::new(GCS_SYSTEM, GCS_COMPONENT))),
            &gcs_router,
            TimeoutHandler::spawn(),
            Arc::new(Slots::new()),
            LINK_TIMEOUT,
            LINK_RETRIES,
        );

        let server = MissionServer::with_retry(
            to_gcs.sender(),
            Arc::new(Endpoint::new(MavLinkId::new(
                VEHICLE_SYSTEM,
                VEHICLE_COMPONENT,
            ))),
            &vehicle_router,
            TimeoutHandler::spawn(),
            VEHICLE_SYSTEM,
            LINK_TIMEOUT,
            LINK_RETRIES,
        );

        Self {
            client,
            server,
            gcs_router,
            vehicle_router,
            to_vehicle,
            to_gcs,
        }
    }

    /// Pumps both directions until `done` yields a value.
    fn pump_until<T>(&self, done: &mpsc::Receiver<T>) -> T {
        let deadline = Instant::now() + TEST_DEADLINE;
        loop {
            let moved = self.to_vehicle.pump(&self.vehicle_router) | self.to_gcs.pump(&self.gcs_router);
            if let Ok(result) = done.try_recv() {
                return result;
            }
            if !moved {
                thread::sleep(Duration::from_millis(1));
            }
            assert!(Instant::now() < deadline, "transfer did not terminate");
        }
    }
}

fn waypoints(count: u16) -> Vec<MissionItem> {
    (0..count)
        .map(|seq| MissionItem {
            seq,
            frame: 6,    // MAV_FRAME_GLOBAL_RELATIVE_ALT_INT
            command: 16, // MAV_CMD_NAV_WAYPOINT
            current: u8::from(seq == 0),
            autocontinue: 1,
            param1: f32::from(seq % 10),
            x: 473_977_507 + i32::from(seq),
            y: 85_456_075 - i32::from(seq),
            z: 50.0,
            ..Default::default()
        })
        .collect()
}

fn result_channel<T: Send + 'static>() -> (
    impl FnOnce(TransferResult<T>) + Send + 'static,
    mpsc::Receiver<TransferResult<T>>,
) {
    let (tx, rx) = mpsc::channel();
    (move |result| tx.send(result).unwrap(), rx)
}

fn run_lossy_upload(seed: u64, count: u16) {
    let pair = Pair::new(seed, 50); // p = 0.05
    let items = waypoints(count);

    let (callback, done) = result_channel();
    pair.client
        .upload(VEHICLE_SYSTEM, VEHICLE_COMPONENT, &items, callback)
        .unwrap();

    let result = pair.pump_until(&done);
    assert_eq!(result, Ok(()));

    let stored = pair.server.items(TransferKind::Mission);
    assert_eq!(stored, items, "uploaded list must round-trip unchanged");

    if count >= 1000 {
        // With ~2000 messages at p = 0.05 a lossless run is impossible.
        let dropped = pair.to_vehicle.dropped.load(Ordering::Relaxed)
            + pair.to_gcs.dropped.load(Ordering::Relaxed);
        assert!(dropped > 0, "the lossy link should have dropped something");
    }
}

#[test]
fn lossy_upload_of_twenty_items_succeeds() {
    initialize();
    run_lossy_upload(0x5eed_0001, 20);
}

#[test]
fn lossy_upload_of_a_thousand_items_succeeds() {
    initialize();
    run_lossy_upload(0x5eed_0002, 1000);
}

#[test]
fn lossy_download_round_trips_the_stored_list() {
    initialize();
    let pair = Pair::new(0x5eed_0003, 50);

    let items = waypoints(20);
    pair.server.set_items(TransferKind::Mission, &items).unwrap();

    let (callback, done) = result_channel();
    pair.client
        .download(
            VEHICLE_SYSTEM,
            VEHICLE_COMPONENT,
            TransferKind::Mission,
            callback,
        )
        .unwrap();

    let result = pair.pump_until(&done);
    assert_eq!(result, Ok(items));
}

#[test]
fn cancel_racing_a_late_ack_yields_exactly_one_callback() {
    initialize();
    let pair = Pair::new(0x5eed_0004, 0);

    let outcomes: Arc<Mutex<Vec<TransferResult<()>>>> = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));

    {
        let outcomes = outcomes.clone();
        let calls = calls.clone();
        pair.client
            .upload(
                VEHICLE_SYSTEM,
                VEHICLE_COMPONENT,
                &waypoints(5),
                move |result| {
                    outcomes.lock().unwrap().push(result);
                    calls.fetch_add(1, Ordering::SeqCst);
                },
            )
            .unwrap();
    }

    // Cancel before the vehicle had a chance to answer.
    assert!(pair.client.cancel(VEHICLE_SYSTEM, TransferKind::Mission));

    // A reply that lost the race must not produce a second callback.
    let vehicle: Endpoint<V2> =
        Endpoint::new(MavLinkId::new(VEHICLE_SYSTEM, VEHICLE_COMPONENT));
    let late_ack = vehicle
        .next_frame(&MissionAck {
            target_system: GCS_SYSTEM,
            target_component: GCS_COMPONENT,
            type_: MavMissionResult::MavMissionAccepted,
            mission_type: MavMissionType::Mission,
            ..Default::default()
        })
        .unwrap();
    pair.gcs_router.process(&late_ack.to_versionless());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes.lock().unwrap()[0], Err(TransferError::Cancelled));

    // The cancel notification went out to the vehicle.
    let notified = pair
        .to_vehicle
        .queue
        .lock()
        .unwrap()
        .iter()
        .any(|frame| frame.message_id() == msg_id::MISSION_ACK);
    assert!(notified);
}

#[test]
fn second_transfer_is_rejected_while_the_first_is_active() {
    initialize();
    let pair = Pair::new(0x5eed_0005, 0);
    let items = waypoints(8);

    let (callback, done) = result_channel();
    pair.client
        .upload(VEHICLE_SYSTEM, VEHICLE_COMPONENT, &items, callback)
        .unwrap();

    // Same target, same kind: synchronous Busy, no callback involved.
    let started = pair.client.upload(
        VEHICLE_SYSTEM,
        VEHICLE_COMPONENT,
        &items,
        |_: TransferResult<()>| panic!("rejected transfer must not report"),
    );
    assert!(matches!(started, Err(mavgate::errors::Error::TransferBusy)));

    // The first transfer is undisturbed and completes.
    let result = pair.pump_until(&done);
    assert_eq!(result, Ok(()));
    assert_eq!(pair.server.items(TransferKind::Mission), items);

    // The slot is free again afterwards.
    let (callback, done) = result_channel();
    pair.client
        .upload(VEHICLE_SYSTEM, VEHICLE_COMPONENT, &items, callback)
        .unwrap();
    assert_eq!(pair.pump_until(&done), Ok(()));
}
