//! Incoming frame router and system discovery.
//!
//! All transports feed a single channel of [`Versionless`] frames. The router
//! drains that channel, maintains the table of remote [`System`]s from
//! heartbeats, and fans each frame out to the callbacks subscribed to its
//! message `ID`.
//!
//! [`Router::process`] is public so tests and in-memory links can inject
//! frames without a transport.

use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use mavio::protocol::{MessageId, Versionless};
use mavio::Frame;

use crate::callback::{CallbackList, Handle};
use crate::consts::HEARTBEAT_TIMEOUT;
use crate::protocol::{msg_id, Autopilot, Common};
use crate::system::System;
use crate::utils::Closer;

const INGEST_POLL_INTERVAL: Duration = Duration::from_millis(100);

struct RouterInner {
    handlers: Mutex<HashMap<MessageId, CallbackList<Frame<Versionless>>>>,
    systems: Mutex<HashMap<u8, Arc<System>>>,
    discovered: CallbackList<Arc<System>>,
}

/// Frame router.
///
/// Cloning produces another handle to the same registry.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    /// Creates an empty router.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                handlers: Mutex::new(HashMap::new()),
                systems: Mutex::new(HashMap::new()),
                discovered: CallbackList::new(),
            }),
        }
    }

    /// Subscribes `callback` to every incoming frame with `message_id`.
    pub fn subscribe_message(
        &self,
        message_id: MessageId,
        callback: impl Fn(&Frame<Versionless>) + Send + Sync + 'static,
    ) -> Handle {
        let list = self.handler_list(message_id);
        list.subscribe(callback)
    }

    /// Removes a message subscription.
    pub fn unsubscribe_message(&self, message_id: MessageId, handle: Handle) {
        let list = {
            let handlers = self.inner.handlers.lock().unwrap();
            handlers.get(&message_id).cloned()
        };
        if let Some(list) = list {
            list.unsubscribe(handle);
        }
    }

    /// Subscribes to newly discovered systems.
    pub fn subscribe_discovered(
        &self,
        callback: impl Fn(&Arc<System>) + Send + Sync + 'static,
    ) -> Handle {
        self.inner.discovered.subscribe(callback)
    }

    /// Removes a discovery subscription.
    pub fn unsubscribe_discovered(&self, handle: Handle) {
        self.inner.discovered.unsubscribe(handle)
    }

    /// Returns the system with `system_id`, if discovered.
    pub fn system(&self, system_id: u8) -> Option<Arc<System>> {
        self.inner.systems.lock().unwrap().get(&system_id).cloned()
    }

    /// All systems discovered so far, connected or not.
    pub fn systems(&self) -> Vec<Arc<System>> {
        self.inner.systems.lock().unwrap().values().cloned().collect()
    }

    /// Autopilot flavor of a system, [`Autopilot::Unknown`] if undiscovered.
    pub fn autopilot_of(&self, system_id: u8) -> Autopilot {
        self.system(system_id)
            .map(|system| system.autopilot())
            .unwrap_or_default()
    }

    /// Routes one frame.
    ///
    /// Heartbeats update the system table before the frame is dispatched to
    /// its message subscribers.
    pub fn process(&self, frame: &Frame<Versionless>) {
        if frame.message_id() == msg_id::HEARTBEAT && frame.system_id() != 0 {
            self.process_heartbeat(frame);
        } else if let Some(system) = self.system(frame.system_id()) {
            system.record_component(frame.component_id());
        }

        let list = {
            let handlers = self.inner.handlers.lock().unwrap();
            handlers.get(&frame.message_id()).cloned()
        };
        if let Some(list) = list {
            list.notify(frame);
        }
    }

    /// Sweeps the system table for heartbeat timeouts.
    pub fn tick(&self) {
        for system in self.systems() {
            system.check_timeout(HEARTBEAT_TIMEOUT);
        }
    }

    /// Spawns the ingest thread draining `receiver`.
    ///
    /// The thread routes every received frame and sweeps heartbeat timeouts
    /// between frames. It exits when the returned [`Closer`] is closed or all
    /// producers are gone.
    pub fn spawn_ingest(&self, receiver: mpsc::Receiver<Frame<Versionless>>) -> Closer {
        let closer = Closer::new();
        let state = closer.to_closable();
        let router = self.clone();

        thread::spawn(move || {
            while !state.is_closed() {
                match receiver.recv_timeout(INGEST_POLL_INTERVAL) {
                    Ok(frame) => router.process(&frame),
                    Err(mpsc::RecvTimeoutError::Timeout) => {}
                    Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
                router.tick();
            }
            log::trace!("ingest thread stopped");
        });

        closer
    }

    fn handler_list(&self, message_id: MessageId) -> CallbackList<Frame<Versionless>> {
        let mut handlers = self.inner.handlers.lock().unwrap();
        handlers.entry(message_id).or_default().clone()
    }

    fn process_heartbeat(&self, frame: &Frame<Versionless>) {
        let autopilot = match frame.decode() {
            Ok(Common::Heartbeat(heartbeat)) => Autopilot::from(heartbeat.autopilot),
            Ok(_) => return,
            Err(err) => {
                log::debug!("dropping malformed heartbeat: {err:?}");
                return;
            }
        };

        let (system, new_system) = {
            let mut systems = self.inner.systems.lock().unwrap();
            match systems.get(&frame.system_id()) {
                Some(system) => (system.clone(), false),
                None => {
                    let system = Arc::new(System::new(frame.system_id()));
                    systems.insert(frame.system_id(), system.clone());
                    (system, true)
                }
            }
        };

        system.on_heartbeat(autopilot, frame.component_id());

        if new_system {
            log::info!("discovered system {}", frame.system_id());
            self.inner.discovered.notify(&system);
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
//                                   Tests                                   //
///////////////////////////////////////////////////////////////////////////////
