//! Shutdown-state primitives for connections and background threads.
//!
//! [`Closer`] is owned by the resource itself and closes when dropped; it is
//! intentionally not [`Clone`]. [`Closable`] is a read-only view for
//! dependent tasks: a receive loop polls it between reads and exits once the
//! flag is set.

use std::sync::atomic::AtomicBool;
use std::sync::{atomic, Arc};

/// Owned shutdown state of a resource.
///
/// Closes when [`Closer::close`] is called or when the instance is dropped.
/// Read-only views are obtained with [`Closer::to_closable`].
#[derive(Debug)]
#[must_use]
pub struct Closer(Arc<AtomicBool>);

impl Closer {
    /// Creates a new, open state.
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    /// Returns a read-only [`Closable`] view over the same state.
    pub fn to_closable(&self) -> Closable {
        Closable(self.0.clone())
    }

    /// Closes the resource for all views.
    pub fn close(&mut self) {
        self.0.store(true, atomic::Ordering::Release);
    }

    /// Returns `true` if the resource is closed.
    pub fn is_closed(&self) -> bool {
        self.0.load(atomic::Ordering::Acquire)
    }
}

impl Default for Closer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Closer {
    fn drop(&mut self) {
        self.close()
    }
}

/// Read-only view of a shutdown state.
#[derive(Clone, Debug)]
#[must_use]
pub struct Closable(Arc<AtomicBool>);

impl Closable {
    /// Returns `true` if the resource is closed.
    pub fn is_closed(&self) -> bool {
        self.0.load(atomic::Ordering::Acquire)
    }
}

///////////////////////////////////////////////////////////////////////////////
//                                   Tests                                   //
///////////////////////////////////////////////////////////////////////////////
