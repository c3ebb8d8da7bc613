//! Multi-subscriber callback registry.
//!
//! [`CallbackList`] fans a value out to every subscribed callback. Handles
//! returned by [`CallbackList::subscribe`] are unique for the lifetime of the
//! list and never reused, so a stale handle can be unsubscribed safely (the
//! call is a no-op).
//!
//! The list is reentrancy-safe: a callback may subscribe or unsubscribe on the
//! list that is currently invoking it. Mutations that can't take the lock are
//! parked on side lists and applied at the next safe point, which is the end
//! of the current notification pass.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Subscription handle.
///
/// Identifies one subscription within the list that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle(u64);

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync + 'static>;

/// Closure executor used by [`CallbackList::queue`].
///
/// The registry hands each pending invocation to the executor instead of
/// running it inline. A typical executor pushes the closure onto a
/// user-serviced queue.
pub type Executor = dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync;

struct Inner<T> {
    list: Mutex<Vec<(u64, Callback<T>)>>,
    subscribe_later: Mutex<Vec<(u64, Callback<T>)>>,
    remove_later: Mutex<Vec<u64>>,
    remove_all_later: AtomicBool,
    next_id: AtomicU64,
}

/// Broadcast list of callbacks over values of type `T`.
///
/// Cloning the list produces another handle to the same registry.
pub struct CallbackList<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CallbackList<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for CallbackList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CallbackList<T> {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                list: Mutex::new(Vec::new()),
                subscribe_later: Mutex::new(Vec::new()),
                remove_later: Mutex::new(Vec::new()),
                remove_all_later: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Subscribes `callback` and returns its [`Handle`].
    ///
    /// When called from within a notification pass the subscription is parked
    /// and takes effect at the end of the pass; the handle is valid either way.
    pub fn subscribe(&self, callback: impl Fn(&T) + Send + Sync + 'static) -> Handle {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let callback: Callback<T> = Arc::new(callback);

        match self.inner.list.try_lock() {
            Ok(mut list) => list.push((id, callback)),
            Err(_) => self
                .inner
                .subscribe_later
                .lock()
                .unwrap()
                .push((id, callback)),
        }

        Handle(id)
    }

    /// Removes the subscription behind `handle`.
    ///
    /// Unknown or already removed handles are ignored. When called from within
    /// a notification pass the removal is parked and applied at the end of the
    /// pass, so the callback will not run again after the current pass.
    pub fn unsubscribe(&self, handle: Handle) {
        match self.inner.list.try_lock() {
            Ok(mut list) => {
                list.retain(|(id, _)| *id != handle.0);
                self.inner
                    .subscribe_later
                    .lock()
                    .unwrap()
                    .retain(|(id, _)| *id != handle.0);
            }
            Err(_) => self.inner.remove_later.lock().unwrap().push(handle.0),
        }
    }

    /// Removes every subscription, including parked ones.
    pub fn unsubscribe_all(&self) {
        match self.inner.list.try_lock() {
            Ok(mut list) => {
                list.clear();
                self.inner.subscribe_later.lock().unwrap().clear();
                self.inner.remove_later.lock().unwrap().clear();
            }
            Err(_) => self.inner.remove_all_later.store(true, Ordering::SeqCst),
        }
    }

    /// Invokes every subscribed callback with `value`.
    ///
    /// Mutations requested during the pass are applied before this returns.
    pub fn notify(&self, value: &T) {
        {
            let list = self.inner.list.lock().unwrap();
            for (_, callback) in list.iter() {
                callback(value);
            }
        }
        self.apply_deferred();
    }

    /// Hands one pending invocation per subscriber to `executor`.
    ///
    /// Nothing runs inline; each closure invokes its callback with a clone of
    /// `value` when the executor decides to run it.
    pub fn queue(&self, value: T, executor: &Executor)
    where
        T: Clone + Send + Sync + 'static,
    {
        let snapshot: Vec<Callback<T>> = {
            let list = self.inner.list.lock().unwrap();
            list.iter().map(|(_, callback)| callback.clone()).collect()
        };
        self.apply_deferred();

        for callback in snapshot {
            let value = value.clone();
            executor(Box::new(move || callback(&value)));
        }
    }

    /// Returns `true` if no callbacks are subscribed.
    pub fn is_empty(&self) -> bool {
        self.inner.list.lock().unwrap().is_empty()
            && self.inner.subscribe_later.lock().unwrap().is_empty()
    }

    fn apply_deferred(&self) {
        let mut list = match self.inner.list.try_lock() {
            Ok(list) => list,
            // Another pass is active; it will apply the side lists.
            Err(_) => return,
        };

        if self.inner.remove_all_later.swap(false, Ordering::SeqCst) {
            list.clear();
            self.inner.subscribe_later.lock().unwrap().clear();
            self.inner.remove_later.lock().unwrap().clear();
            return;
        }

        let removals: Vec<u64> = self.inner.remove_later.lock().unwrap().drain(..).collect();
        if !removals.is_empty() {
            list.retain(|(id, _)| !removals.contains(id));
        }

        let parked: Vec<(u64, Callback<T>)> = self
            .inner
            .subscribe_later
            .lock()
            .unwrap()
            .drain(..)
            .collect();
        for (id, callback) in parked {
            if !removals.contains(&id) {
                list.push((id, callback));
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
//                                   Tests                                   //
///////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test_callback_list {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn handles_are_unique_across_threads() {
        let list: CallbackList<u32> = CallbackList::new();

        let mut join_handles = Vec::new();
        for _ in 0..8 {
            let list = list.clone();
            join_handles.push(thread::spawn(move || {
                let mut handles = Vec::with_capacity(100);
                for _ in 0..100 {
                    handles.push(list.subscribe(|_| {}));
                }
                handles
            }));
        }

        let mut seen = HashSet::new();
        for join_handle in join_handles {
            for handle in join_handle.join().unwrap() {
                assert!(seen.insert(handle));
            }
        }
        assert_eq!(seen.len(), 800);
    }

    #[test]
    fn notify_reaches_all_subscribers() {
        let list: CallbackList<u32> = CallbackList::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..3 {
            let counter = counter.clone();
            list.subscribe(move |value| {
                counter.fetch_add(*value as usize, Ordering::SeqCst);
            });
        }

        list.notify(&7);
        assert_eq!(counter.load(Ordering::SeqCst), 21);
    }

    #[test]
    fn unsubscribe_unknown_handle_is_noop() {
        let list: CallbackList<u32> = CallbackList::new();
        let handle = list.subscribe(|_| {});
        list.unsubscribe(handle);
        list.unsubscribe(handle);
        assert!(list.is_empty());
    }

    #[test]
    fn self_unsubscribe_inside_callback() {
        let list: CallbackList<u32> = CallbackList::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let handle_slot: Arc<Mutex<Option<Handle>>> = Arc::new(Mutex::new(None));
        let handle = {
            let list = list.clone();
            let counter = counter.clone();
            let handle_slot = handle_slot.clone();
            list.clone().subscribe(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                if let Some(handle) = *handle_slot.lock().unwrap() {
                    list.unsubscribe(handle);
                }
            })
        };
        *handle_slot.lock().unwrap() = Some(handle);

        list.notify(&0);
        list.notify(&0);

        // The callback removed itself during the first pass.
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribe_inside_callback_takes_effect_next_pass() {
        let list: CallbackList<u32> = CallbackList::new();
        let counter = Arc::new(AtomicUsize::new(0));

        {
            let list = list.clone();
            let counter = counter.clone();
            list.clone().subscribe(move |_| {
                let counter = counter.clone();
                list.subscribe(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            });
        }

        list.notify(&0);
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        list.notify(&0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queue_defers_to_executor() {
        let list: CallbackList<String> = CallbackList::new();
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let counter = counter.clone();
            list.subscribe(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        let queued: Arc<Mutex<Vec<Box<dyn FnOnce() + Send>>>> = Arc::new(Mutex::new(Vec::new()));
        {
            let queued = queued.clone();
            list.queue("payload".to_string(), &move |invocation| {
                queued.lock().unwrap().push(invocation);
            });
        }

        assert_eq!(counter.load(Ordering::SeqCst), 0);

        for invocation in queued.lock().unwrap().drain(..) {
            invocation();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unsubscribe_all_inside_callback() {
        let list: CallbackList<u32> = CallbackList::new();
        let counter = Arc::new(AtomicUsize::new(0));

        {
            let list = list.clone();
            let counter = counter.clone();
            list.clone().subscribe(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                list.unsubscribe_all();
            });
        }
        {
            let counter = counter.clone();
            list.subscribe(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        list.notify(&0);
        let after_first = counter.load(Ordering::SeqCst);
        assert_eq!(after_first, 2);

        list.notify(&0);
        assert_eq!(counter.load(Ordering::SeqCst), after_first);
        assert!(list.is_empty());
    }
}
