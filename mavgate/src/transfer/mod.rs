//! Sequenced transfer protocols.
//!
//! MAVLink moves item lists (missions, geofences, rally points) and file
//! chunks with the same count/request/item/ack choreography. This module holds
//! what the concrete protocols share: the terminal result taxonomy, the
//! transfer kinds, and the per-target busy slots.
//!
//! * [`mission`] — initiator side of the mission protocols
//!   (upload / download / clear / set-current);
//! * [`server`] — responder side (accept uploads, serve downloads);
//! * [`ftp`] — file chunk transfer over FILE_TRANSFER_PROTOCOL.

pub mod ftp;
pub mod mission;
pub mod server;

use std::collections::HashMap;
use std::sync::Mutex;

use crate::prelude::*;

/// Terminal failure of a transfer.
///
/// Exactly one terminal result (success or one of these) reaches the caller's
/// callback per transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferError {
    /// Transport failure while sending; never retried.
    ConnectionError,
    /// Target denied the transfer.
    Denied,
    /// Target answered outside the protocol, or acknowledged a transfer that
    /// was not finished.
    ProtocolError,
    /// Retry budget exhausted without an answer.
    Timeout,
    /// Target does not support the transfer or an item in it.
    Unsupported,
    /// Target rejected an item's coordinate frame.
    UnsupportedFrame,
    /// Nothing to transfer: the item list is empty.
    NoMissionAvailable,
    /// Transfer was cancelled on this side.
    Cancelled,
    /// Items mix several mission types.
    MissionTypeNotConsistent,
    /// Item sequence numbers are not contiguous from zero.
    InvalidSequence,
    /// Not exactly one item is marked current.
    CurrentInvalid,
    /// Target rejected an item parameter, or an item carries a value the
    /// dialect cannot express.
    InvalidParam,
    /// Target cannot store the transferred list.
    TooManyMissionItems,
}

/// Shorthand for results delivered through transfer callbacks.
pub type TransferResult<T> = std::result::Result<T, TransferError>;

/// What a transfer moves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransferKind {
    /// Waypoint mission.
    Mission,
    /// Geofence.
    Fence,
    /// Rally points.
    Rally,
    /// File payload.
    File,
}

impl TransferKind {
    /// Maps a `MAV_MISSION_TYPE` value onto a kind.
    pub fn from_mission_type(mission_type: u8) -> Option<Self> {
        match mission_type {
            0 => Some(TransferKind::Mission),
            1 => Some(TransferKind::Fence),
            2 => Some(TransferKind::Rally),
            _ => None,
        }
    }

    /// The `MAV_MISSION_TYPE` value of this kind.
    ///
    /// Meaningless for [`TransferKind::File`], which never appears in mission
    /// messages.
    pub fn mission_type(self) -> u8 {
        match self {
            TransferKind::Mission => 0,
            TransferKind::Fence => 1,
            TransferKind::Rally => 2,
            TransferKind::File => u8::MAX,
        }
    }
}

#[derive(Default)]
struct Slot {
    generation: u64,
    active: bool,
}

/// Per-(target, kind) transfer slots.
///
/// At most one transfer per slot is active; a second request fails
/// synchronously. Each claim bumps the slot's generation so that completions
/// of an older session can never release a newer one.
#[derive(Default)]
pub struct Slots {
    map: Mutex<HashMap<(u8, TransferKind), Slot>>,
}

impl Slots {
    /// Creates an empty slot table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the slot for `(target, kind)`.
    ///
    /// Returns the session generation, or [`Error::TransferBusy`] if the slot
    /// is taken.
    pub fn claim(&self, target: u8, kind: TransferKind) -> Result<u64> {
        let mut map = self.map.lock().unwrap();
        let slot = map.entry((target, kind)).or_default();
        if slot.active {
            return Err(Error::TransferBusy);
        }
        slot.generation += 1;
        slot.active = true;
        Ok(slot.generation)
    }

    /// Releases the slot if `generation` still owns it.
    pub fn release(&self, target: u8, kind: TransferKind, generation: u64) {
        let mut map = self.map.lock().unwrap();
        if let Some(slot) = map.get_mut(&(target, kind)) {
            if slot.generation == generation {
                slot.active = false;
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
//                                   Tests                                   //
///////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test_slots {
    use super::*;

    #[test]
    fn second_claim_is_busy() {
        let slots = Slots::new();

        let generation = slots.claim(1, TransferKind::Mission).unwrap();
        assert!(matches!(
            slots.claim(1, TransferKind::Mission),
            Err(Error::TransferBusy)
        ));

        // Other targets and kinds are independent.
        slots.claim(2, TransferKind::Mission).unwrap();
        slots.claim(1, TransferKind::Fence).unwrap();

        slots.release(1, TransferKind::Mission, generation);
        assert!(slots.claim(1, TransferKind::Mission).is_ok());
    }

    #[test]
    fn stale_generation_cannot_release() {
        let slots = Slots::new();

        let stale = slots.claim(1, TransferKind::Mission).unwrap();
        slots.release(1, TransferKind::Mission, stale);

        let current = slots.claim(1, TransferKind::Mission).unwrap();
        assert_ne!(stale, current);

        slots.release(1, TransferKind::Mission, stale);
        assert!(matches!(
            slots.claim(1, TransferKind::Mission),
            Err(Error::TransferBusy)
        ));

        slots.release(1, TransferKind::Mission, current);
        assert!(slots.claim(1, TransferKind::Mission).is_ok());
    }

    #[test]
    fn mission_type_round_trip() {
        for kind in [
            TransferKind::Mission,
            TransferKind::Fence,
            TransferKind::Rally,
        ] {
            assert_eq!(
                TransferKind::from_mission_type(kind.mission_type()),
                Some(kind)
            );
        }
        assert_eq!(TransferKind::from_mission_type(3), None);
    }
}
