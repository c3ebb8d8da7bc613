//! Deadline scheduler for protocol retries.
//!
//! Protocol clients arm a deadline for every message that expects an answer
//! and re-send from the expiry callback. Entries are addressed by [`Cookie`]s
//! so a client can [`refresh`](TimeoutHandler::refresh) the deadline when the
//! exchange progresses or [`remove`](TimeoutHandler::remove) it once the
//! answer arrives.
//!
//! Expired callbacks run on the driver thread, outside the internal lock, so
//! they are free to arm new deadlines or remove existing ones.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::utils::Closer;

/// Identifier of a scheduled deadline.
pub type Cookie = u64;

const TICK_INTERVAL: Duration = Duration::from_millis(5);

type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Entry {
    deadline: Instant,
    duration: Duration,
    callback: Callback,
}

/// Cookie-addressed deadline scheduler.
///
/// Owns a driver thread which fires due callbacks. An expired entry is removed
/// before its callback runs; re-arming is done by scheduling a new entry from
/// within the callback. The driver thread exits once the last handle is
/// dropped.
pub struct TimeoutHandler {
    entries: Arc<Mutex<HashMap<Cookie, Entry>>>,
    next_cookie: Arc<AtomicU64>,
    _closer: Arc<Closer>,
}

impl Clone for TimeoutHandler {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            next_cookie: self.next_cookie.clone(),
            _closer: self._closer.clone(),
        }
    }
}

impl TimeoutHandler {
    /// Creates a scheduler and spawns its driver thread.
    pub fn spawn() -> Self {
        let entries: Arc<Mutex<HashMap<Cookie, Entry>>> = Arc::new(Mutex::new(HashMap::new()));
        let closer = Closer::new();
        let state = closer.to_closable();

        {
            let entries = entries.clone();
            thread::spawn(move || {
                while !state.is_closed() {
                    thread::sleep(TICK_INTERVAL);

                    let now = Instant::now();
                    let due: Vec<Callback> = {
                        let mut entries = entries.lock().unwrap();
                        let cookies: Vec<Cookie> = entries
                            .iter()
                            .filter(|(_, entry)| entry.deadline <= now)
                            .map(|(cookie, _)| *cookie)
                            .collect();
                        cookies
                            .into_iter()
                            .filter_map(|cookie| entries.remove(&cookie))
                            .map(|entry| entry.callback)
                            .collect()
                    };

                    // Expired callbacks run outside the lock so they can
                    // schedule and remove entries.
                    for callback in due {
                        callback();
                    }
                }
                log::trace!("timeout driver thread stopped");
            });
        }

        Self {
            entries,
            next_cookie: Arc::new(AtomicU64::new(1)),
            _closer: Arc::new(closer),
        }
    }

    /// Schedules `callback` to run once `timeout` elapses.
    pub fn add(&self, timeout: Duration, callback: impl FnOnce() + Send + 'static) -> Cookie {
        let cookie = self.next_cookie.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            deadline: Instant::now() + timeout,
            duration: timeout,
            callback: Box::new(callback),
        };
        self.entries.lock().unwrap().insert(cookie, entry);
        cookie
    }

    /// Pushes the deadline of `cookie` forward by its original timeout.
    ///
    /// Returns `false` if the entry has already fired or been removed.
    pub fn refresh(&self, cookie: Cookie) -> bool {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&cookie) {
            Some(entry) => {
                entry.deadline = Instant::now() + entry.duration;
                true
            }
            None => false,
        }
    }

    /// Cancels the deadline addressed by `cookie`.
    ///
    /// Returns `false` if the entry has already fired or been removed. A
    /// callback popped by the driver thread may still run concurrently with
    /// `remove`; callers re-check their own state from the callback.
    pub fn remove(&self, cookie: Cookie) -> bool {
        self.entries.lock().unwrap().remove(&cookie).is_some()
    }
}

///////////////////////////////////////////////////////////////////////////////
//                                   Tests                                   //
///////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test_timeout {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const WAIT: Duration = Duration::from_millis(100);

    #[test]
    fn expired_entry_fires_once() {
        let timeouts = TimeoutHandler::spawn();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        timeouts.add(Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(WAIT);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_entry_never_fires() {
        let timeouts = TimeoutHandler::spawn();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let cookie = timeouts.add(Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timeouts.remove(cookie));

        thread::sleep(WAIT);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timeouts.remove(cookie));
    }

    #[test]
    fn refresh_postpones_deadline() {
        let timeouts = TimeoutHandler::spawn();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let cookie = timeouts.add(Duration::from_millis(60), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(40));
        assert!(timeouts.refresh(cookie));
        thread::sleep(Duration::from_millis(40));

        // The original deadline has passed but the refreshed one has not.
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        thread::sleep(WAIT);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_can_rearm() {
        let timeouts = TimeoutHandler::spawn();
        let fired = Arc::new(AtomicUsize::new(0));

        let counter = fired.clone();
        let rearm = timeouts.clone();
        timeouts.add(Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let counter = counter.clone();
            rearm.add(Duration::from_millis(20), move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        });

        thread::sleep(WAIT * 2);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
