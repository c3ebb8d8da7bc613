//! UDP transport.

use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread;

use mavio::protocol::V2;
use mavio::Frame;

use crate::consts::{RECV_TIMEOUT, REMOTE_TIMEOUT};
use crate::io::remote::RemoteTable;
use crate::io::{frame_to_bytes, frames_from_bytes, FrameProducer};
use crate::utils::{Closable, Closer};

use crate::prelude::*;

/// UDP connection.
///
/// One socket, one receive thread. Outgoing frames are replicated to every
/// remote in the table; incoming datagrams may carry several frames and are
/// parsed until exhausted. Datagrams whose frames carry a zero source system
/// `ID` do not register their sender as a remote.
#[derive(Debug)]
pub struct UdpConnection {
    socket: UdpSocket,
    remotes: Arc<Mutex<RemoteTable>>,
    closer: Closer,
    recv_thread: Option<thread::JoinHandle<()>>,
}

impl UdpConnection {
    /// Binds `bind_addr` and starts the receive thread.
    ///
    /// When `remote` is set the connection behaves as `udpout://`: the remote
    /// is permanent and traffic-learned remotes are added next to it.
    pub fn connect(
        bind_addr: SocketAddr,
        remote: Option<SocketAddr>,
        producer: FrameProducer,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr)?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        let mut table = RemoteTable::new();
        if let Some(addr) = remote {
            table.add_fixed(addr);
        }
        let remotes = Arc::new(Mutex::new(table));

        let closer = Closer::new();
        let recv_thread = {
            let socket = socket.try_clone()?;
            let remotes = remotes.clone();
            let state = closer.to_closable();
            thread::spawn(move || Self::recv_loop(socket, remotes, producer, state))
        };

        log::debug!("[udp] listening on {}", socket.local_addr()?);

        Ok(Self {
            socket,
            remotes,
            closer,
            recv_thread: Some(recv_thread),
        })
    }

    fn recv_loop(
        socket: UdpSocket,
        remotes: Arc<Mutex<RemoteTable>>,
        producer: FrameProducer,
        state: Closable,
    ) {
        let mut buf = vec![0u8; 65535];

        while !state.is_closed() {
            let (len, src_addr) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                    ) =>
                {
                    continue;
                }
                Err(err) => {
                    if state.is_closed() {
                        break;
                    }
                    log::debug!("[udp] recv error: {err:?}");
                    continue;
                }
            };

            for frame in frames_from_bytes(&buf[..len]) {
                if frame.system_id() != 0 {
                    let new_remote = remotes.lock().unwrap().observe(src_addr);
                    if new_remote {
                        log::debug!("[udp] new remote endpoint {src_addr}");
                    }
                }

                if producer.send(frame).is_err() {
                    log::trace!("[udp] frame consumer is gone, stopping receive loop");
                    return;
                }
            }
        }
    }

    /// Sends a frame to every known remote endpoint.
    ///
    /// Stale learned remotes are evicted first. Fails with
    /// [`Error::NoRemotes`] when the table is empty and with
    /// [`Error::AllRemotesFailed`] when no remote accepted the datagram;
    /// partial failure is logged and reported as success.
    pub fn send_frame(&self, frame: &Frame<V2>) -> Result<()> {
        if self.closer.is_closed() {
            return Err(Error::ConnectionStopped);
        }

        let bytes = frame_to_bytes(frame)?;

        let addrs = {
            let mut remotes = self.remotes.lock().unwrap();
            for addr in remotes.evict_stale(REMOTE_TIMEOUT) {
                log::debug!("[udp] evicting stale remote endpoint {addr}");
            }
            remotes.addrs()
        };

        if addrs.is_empty() {
            return Err(Error::NoRemotes);
        }

        let mut failures = 0;
        for addr in &addrs {
            if let Err(err) = self.socket.send_to(&bytes, addr) {
                log::warn!("[udp] send to {addr} failed: {err:?}");
                failures += 1;
            }
        }

        if failures == addrs.len() {
            return Err(Error::AllRemotesFailed);
        }
        Ok(())
    }

    /// Stops the receive thread and closes the connection.
    pub fn stop(&mut self) {
        self.closer.close();
        if let Some(handle) = self.recv_thread.take() {
            if handle.join().is_err() {
                log::error!("[udp] receive thread panicked");
            }
        }
        log::debug!("[udp] connection stopped");
    }

    /// Local address of the bound socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Number of currently known remote endpoints.
    pub fn remote_count(&self) -> usize {
        self.remotes.lock().unwrap().len()
    }
}
