//! Internal utilities shared by transports and protocol clients.

pub mod closable;
pub mod timeout;

pub use closable::{Closable, Closer};
pub use timeout::{Cookie, TimeoutHandler};
