//! Connection over any supported transport.

use std::net::{Ipv4Addr, SocketAddr};

use mavio::protocol::V2;
use mavio::Frame;

use crate::io::transport::{SerialConnection, TcpConnection, UdpConnection};
use crate::io::{ConnAddr, FrameProducer, SendFrame};

use crate::prelude::*;

/// A started connection.
///
/// One variant per transport; every variant owns its background threads and
/// pushes parsed frames into the producer it was started with.
pub enum Connection {
    /// UDP socket.
    Udp(UdpConnection),
    /// TCP server or client.
    Tcp(TcpConnection),
    /// Serial device.
    Serial(SerialConnection),
}

impl Connection {
    /// Starts a connection described by `addr`.
    pub fn connect(addr: &ConnAddr, producer: FrameProducer) -> Result<Self> {
        log::info!("starting connection {addr}");
        match addr {
            ConnAddr::UdpIn(bind_addr) => {
                Ok(Connection::Udp(UdpConnection::connect(*bind_addr, None, producer)?))
            }
            ConnAddr::UdpOut(remote_addr) => {
                let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
                Ok(Connection::Udp(UdpConnection::connect(
                    bind_addr,
                    Some(*remote_addr),
                    producer,
                )?))
            }
            ConnAddr::TcpIn(bind_addr) => {
                Ok(Connection::Tcp(TcpConnection::listen(*bind_addr, producer)?))
            }
            ConnAddr::TcpOut(remote_addr) => Ok(Connection::Tcp(TcpConnection::connect(
                *remote_addr,
                producer,
            )?)),
            ConnAddr::Serial { path, baud } => Ok(Connection::Serial(SerialConnection::connect(
                path, *baud, producer,
            )?)),
        }
    }

    /// Sends a frame through the transport.
    pub fn send_frame(&self, frame: &Frame<V2>) -> Result<()> {
        match self {
            Connection::Udp(conn) => conn.send_frame(frame),
            Connection::Tcp(conn) => conn.send_frame(frame),
            Connection::Serial(conn) => conn.send_frame(frame),
        }
    }

    /// Stops background threads and closes the transport.
    pub fn stop(&mut self) {
        match self {
            Connection::Udp(conn) => conn.stop(),
            Connection::Tcp(conn) => conn.stop(),
            Connection::Serial(conn) => conn.stop(),
        }
    }
}

impl SendFrame for Connection {
    fn send_frame(&self, frame: &Frame<V2>) -> Result<()> {
        Connection::send_frame(self, frame)
    }
}
