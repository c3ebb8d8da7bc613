//! Remote MAVLink system.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::callback::{CallbackList, Handle};
use crate::protocol::Autopilot;

/// A remote system discovered from its heartbeats.
///
/// Created by the router on the first heartbeat with an unseen system `ID` and
/// kept for the lifetime of the process: a system that stops sending
/// heartbeats is marked disconnected, not removed, and flips back to connected
/// when heartbeats resume.
pub struct System {
    system_id: u8,
    components: Mutex<BTreeSet<u8>>,
    autopilot: Mutex<Autopilot>,
    connected: AtomicBool,
    last_heartbeat: Mutex<Instant>,
    connectivity: CallbackList<bool>,
}

impl System {
    pub(crate) fn new(system_id: u8) -> Self {
        Self {
            system_id,
            components: Mutex::new(BTreeSet::new()),
            autopilot: Mutex::new(Autopilot::Unknown),
            connected: AtomicBool::new(false),
            last_heartbeat: Mutex::new(Instant::now()),
            connectivity: CallbackList::new(),
        }
    }

    /// System `ID`.
    pub fn system_id(&self) -> u8 {
        self.system_id
    }

    /// Component `ID`s seen from this system so far.
    pub fn components(&self) -> Vec<u8> {
        self.components.lock().unwrap().iter().copied().collect()
    }

    /// Autopilot flavor reported by the latest heartbeat.
    pub fn autopilot(&self) -> Autopilot {
        *self.autopilot.lock().unwrap()
    }

    /// Returns `true` while heartbeats keep arriving.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Subscribes to connectivity changes.
    ///
    /// The callback receives `true` when the system (re)connects and `false`
    /// when it times out.
    pub fn subscribe_connectivity(
        &self,
        callback: impl Fn(&bool) + Send + Sync + 'static,
    ) -> Handle {
        self.connectivity.subscribe(callback)
    }

    /// Removes a connectivity subscription.
    pub fn unsubscribe_connectivity(&self, handle: Handle) {
        self.connectivity.unsubscribe(handle)
    }

    pub(crate) fn on_heartbeat(&self, autopilot: Autopilot, component_id: u8) {
        if autopilot != Autopilot::Unknown {
            *self.autopilot.lock().unwrap() = autopilot;
        }
        self.record_component(component_id);
        *self.last_heartbeat.lock().unwrap() = Instant::now();

        if !self.connected.swap(true, Ordering::AcqRel) {
            log::debug!("system {} is connected", self.system_id);
            self.connectivity.notify(&true);
        }
    }

    pub(crate) fn record_component(&self, component_id: u8) {
        if self.components.lock().unwrap().insert(component_id) {
            log::debug!(
                "system {}: new component {component_id}",
                self.system_id
            );
        }
    }

    /// Marks the system disconnected if its last heartbeat is older than
    /// `timeout`.
    pub(crate) fn check_timeout(&self, timeout: Duration) {
        let elapsed = self.last_heartbeat.lock().unwrap().elapsed();
        if elapsed < timeout {
            return;
        }

        if self.connected.swap(false, Ordering::AcqRel) {
            log::debug!(
                "system {} timed out ({}ms without heartbeat)",
                self.system_id,
                elapsed.as_millis()
            );
            self.connectivity.notify(&false);
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
//                                   Tests                                   //
///////////////////////////////////////////////////////////////////////////////
