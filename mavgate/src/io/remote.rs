//! UDP remote endpoint table.
//!
//! A UDP connection does not have a peer in the TCP sense: remotes are either
//! configured up front (`udpout://`) or learned from incoming traffic
//! (`udpin://`). Outgoing frames are replicated to every known remote.
//!
//! Learned remotes go stale: one that has been silent longer than the eviction
//! timeout is dropped on the next send, so frames stop flowing to endpoints
//! that went away. Configured remotes are permanent.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// How a remote endpoint entered the table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemoteOption {
    /// Configured from the connection address; never evicted.
    Fixed,
    /// Learned from incoming traffic; evicted when silent for too long.
    Found,
}

#[derive(Clone, Debug)]
struct Remote {
    addr: SocketAddr,
    option: RemoteOption,
    last_activity: Instant,
}

/// Table of remote endpoints known to a UDP connection.
#[derive(Debug, Default)]
pub struct RemoteTable {
    remotes: Vec<Remote>,
}

impl RemoteTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a permanent remote endpoint.
    ///
    /// Ignored if the address is already present.
    pub fn add_fixed(&mut self, addr: SocketAddr) {
        if self.remotes.iter().any(|remote| remote.addr == addr) {
            return;
        }
        self.remotes.push(Remote {
            addr,
            option: RemoteOption::Fixed,
            last_activity: Instant::now(),
        });
    }

    /// Records activity from `addr`.
    ///
    /// Inserts a [`Found`](RemoteOption::Found) entry for an unknown address
    /// and returns `true`; refreshes the activity timestamp of a known one and
    /// returns `false`.
    pub fn observe(&mut self, addr: SocketAddr) -> bool {
        match self.remotes.iter_mut().find(|remote| remote.addr == addr) {
            Some(remote) => {
                remote.last_activity = Instant::now();
                false
            }
            None => {
                self.remotes.push(Remote {
                    addr,
                    option: RemoteOption::Found,
                    last_activity: Instant::now(),
                });
                true
            }
        }
    }

    /// Drops learned remotes that have been silent longer than `timeout`.
    ///
    /// Returns the evicted addresses. Fixed remotes are never dropped.
    pub fn evict_stale(&mut self, timeout: Duration) -> Vec<SocketAddr> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.remotes.retain(|remote| {
            let keep = remote.option == RemoteOption::Fixed
                || now.duration_since(remote.last_activity) < timeout;
            if !keep {
                evicted.push(remote.addr);
            }
            keep
        });
        evicted
    }

    /// Addresses of every known remote.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.remotes.iter().map(|remote| remote.addr).collect()
    }

    /// Returns `true` if no remotes are known.
    pub fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }

    /// Number of known remotes.
    pub fn len(&self) -> usize {
        self.remotes.len()
    }
}

///////////////////////////////////////////////////////////////////////////////
//                                   Tests                                   //
///////////////////////////////////////////////////////////////////////////////
