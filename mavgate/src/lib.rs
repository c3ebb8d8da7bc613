//! # Mavgate
//!
//! A MAVLink ground-side middleware library built on
//! [Mavio](https://gitlab.com/mavka/libs/mavio). Mavgate handles the stateful
//! parts of talking to a vehicle: connection management over UDP, TCP and
//! serial links, system discovery from heartbeats, reliable command sending,
//! sequenced mission and file transfers with retries, and mission plan file
//! import.
//!
//! The building blocks are deliberately independent. A [`router::Router`]
//! fans incoming frames out to per-message subscribers; protocol clients like
//! [`transfer::mission::MissionClient`] and [`command::CommandSender`] sit on
//! top of it and report outcomes through callbacks, so none of them block the
//! network threads.

#![warn(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod callback;
pub mod command;
pub mod consts;
pub mod errors;
pub mod io;
pub mod logger;
pub mod plan;
pub mod prelude;
pub mod protocol;
pub mod router;
pub mod system;
pub mod transfer;
pub mod utils;

#[doc(inline)]
pub extern crate mavio;

#[doc(inline)]
pub use mavio::dialects;
