//! Transport system tests over real loopback sockets.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use mavio::dialects::minimal::messages::Heartbeat;
use mavio::protocol::{Endpoint, MavLinkId, Versionless, V2};
use mavio::Frame;

use mavgate::errors::Error;
use mavgate::io::{ConnAddr, Connection};

const HOST: &str = "127.0.0.1";
const CONNECT_DEADLINE: Duration = Duration::from_secs(15);

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

fn addr(scheme: &str, port: u16) -> ConnAddr {
    format!("{scheme}://{HOST}:{port}").parse().unwrap()
}

/// Sends heartbeats until one arrives at `receiver`.
///
/// Used to wait out connection establishment: sends fail or go nowhere until
/// the transport is actually wired up.
fn send_until_received(
    connection: &Connection,
    endpoint: &Endpoint<V2>,
    receiver: &mpsc::Receiver<Frame<Versionless>>,
) {
    let deadline = Instant::now() + CONNECT_DEADLINE;
    loop {
        let frame = endpoint.next_frame(&Heartbeat::default()).unwrap();
        if connection.send_frame(&frame).is_ok()
            && receiver.recv_timeout(Duration::from_millis(100)).is_ok()
        {
            return;
        }
        assert!(Instant::now() < deadline, "no traffic arrived in time");
        thread::sleep(Duration::from_millis(50));
    }
}

#[test]
fn udp_sequence_increments_and_remotes_are_learned() {
    initialize();
    let port = portpicker::pick_unused_port().unwrap();

    let (server_tx, server_rx) = mpsc::channel();
    let mut server = Connection::connect(&addr("udpin", port), server_tx).unwrap();

    let (client_tx, client_rx) = mpsc::channel();
    let mut client = Connection::connect(&addr("udpout", port), client_tx).unwrap();

    let endpoint: Endpoint<V2> = Endpoint::new(MavLinkId::new(245, 190));

    // Nothing has talked to the server yet, so it has nowhere to send.
    let unrouted = endpoint.next_frame(&Heartbeat::default()).unwrap();
    assert!(matches!(server.send_frame(&unrouted), Err(Error::NoRemotes)));

    // More than 256 frames so the sequence counter wraps at least once.
    const BATCH: usize = 300;
    for sent in 0..BATCH {
        let frame = endpoint.next_frame(&Heartbeat::default()).unwrap();
        client.send_frame(&frame).unwrap();
        // Pace the batch so loopback buffers are not overrun.
        if sent % 32 == 0 {
            thread::sleep(Duration::from_millis(5));
        }
    }

    let mut received = Vec::with_capacity(BATCH);
    while received.len() < BATCH {
        match server_rx.recv_timeout(Duration::from_secs(2)) {
            Ok(frame) => received.push(frame),
            Err(_) => break,
        }
    }
    assert_eq!(received.len(), BATCH);
    for window in received.windows(2) {
        assert_eq!(
            window[1].sequence(),
            window[0].sequence().wrapping_add(1),
            "sequence numbers must increment mod 256"
        );
    }

    // The server learned the client's address from traffic and can answer.
    let vehicle: Endpoint<V2> = Endpoint::new(MavLinkId::new(1, 1));
    let reply = vehicle.next_frame(&Heartbeat::default()).unwrap();
    server.send_frame(&reply).unwrap();
    let answered = client_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(answered.system_id(), 1);

    client.stop();
    server.stop();
}

#[test]
fn tcp_stop_quiesces_the_frame_channel() {
    initialize();
    let port = portpicker::pick_unused_port().unwrap();
    let endpoint: Endpoint<V2> = Endpoint::new(MavLinkId::new(245, 190));

    let (server_tx, server_rx) = mpsc::channel();
    let mut server = Connection::connect(&addr("tcpin", port), server_tx).unwrap();

    let (client_tx, _client_rx) = mpsc::channel();
    let mut client = Connection::connect(&addr("tcpout", port), client_tx).unwrap();

    send_until_received(&client, &endpoint, &server_rx);

    // Once stop() returns every reader thread has exited, so a frame written
    // by the peer afterwards must never show up on the channel.
    server.stop();
    let frame = endpoint.next_frame(&Heartbeat::default()).unwrap();
    let _ = client.send_frame(&frame);
    assert!(server_rx.recv_timeout(Duration::from_millis(700)).is_err());

    client.stop();
}

#[test]
fn tcp_client_survives_a_server_restart() {
    initialize();
    let port = portpicker::pick_unused_port().unwrap();
    let endpoint: Endpoint<V2> = Endpoint::new(MavLinkId::new(245, 190));

    let (server_tx, server_rx) = mpsc::channel();
    let mut server = Connection::connect(&addr("tcpin", port), server_tx).unwrap();

    let (client_tx, _client_rx) = mpsc::channel();
    let mut client = Connection::connect(&addr("tcpout", port), client_tx).unwrap();

    send_until_received(&client, &endpoint, &server_rx);

    // The server goes away; the client is expected to notice and reconnect
    // on its own once a server is listening again.
    server.stop();
    drop(server_rx);
    thread::sleep(Duration::from_millis(700));

    let (server_tx, server_rx) = mpsc::channel();
    let mut server = Connection::connect(&addr("tcpin", port), server_tx).unwrap();

    send_until_received(&client, &endpoint, &server_rx);

    client.stop();
    server.stop();
}
