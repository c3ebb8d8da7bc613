//! MAVLink-facing protocol types.
//!
//! Re-exports the `mavio` protocol entities used throughout the crate and adds
//! the small amount of domain vocabulary the protocol clients share: message
//! `ID` constants, the [`Autopilot`] flavor, and the wire-shaped
//! [`MissionItem`].

use mavio::dialects::common::enums::{MavAutopilot, MavCmd, MavFrame, MavMissionType};
use mavio::dialects::common::messages::MissionItemInt;

use crate::prelude::*;

pub use mavio::dialects::common;
pub use mavio::dialects::Common;
pub use mavio::protocol::{
    ComponentId, Endpoint, MavLinkId, MaybeVersioned, Message, MessageId, SystemId, Versionless,
    V2,
};

/// Message `ID`s of the common dialect handled by the crate.
///
/// Frame subscriptions are keyed by numeric message `ID`, same as the wire.
#[allow(missing_docs)]
pub mod msg_id {
    use super::MessageId;

    pub const HEARTBEAT: MessageId = 0;
    pub const MISSION_REQUEST: MessageId = 40;
    pub const MISSION_SET_CURRENT: MessageId = 41;
    pub const MISSION_CURRENT: MessageId = 42;
    pub const MISSION_REQUEST_LIST: MessageId = 43;
    pub const MISSION_COUNT: MessageId = 44;
    pub const MISSION_CLEAR_ALL: MessageId = 45;
    pub const MISSION_ACK: MessageId = 47;
    pub const MISSION_REQUEST_INT: MessageId = 51;
    pub const MISSION_ITEM_INT: MessageId = 73;
    pub const COMMAND_LONG: MessageId = 76;
    pub const COMMAND_ACK: MessageId = 77;
    pub const FILE_TRANSFER_PROTOCOL: MessageId = 110;
}

/// Autopilot flavor of a remote system.
///
/// Derived from the `autopilot` field of incoming heartbeats. The transfer
/// protocols use it to work around flavor-specific deviations from the
/// standard, such as ArduPilot answering MISSION_COUNT with a plain
/// MISSION_REQUEST.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Autopilot {
    /// No heartbeat seen yet.
    #[default]
    Unknown,
    /// Any flavor without special handling.
    Generic,
    /// ArduPilot family.
    ArduPilot,
    /// PX4.
    Px4,
}

impl From<MavAutopilot> for Autopilot {
    fn from(value: MavAutopilot) -> Self {
        match value {
            MavAutopilot::Ardupilotmega => Autopilot::ArduPilot,
            MavAutopilot::Px4 => Autopilot::Px4,
            _ => Autopilot::Generic,
        }
    }
}

/// Mission item in its integer wire shape.
///
/// Matches the MISSION_ITEM_INT layout: latitude and longitude are scaled
/// integers (degrees times `1e7`) except for frames that carry plain indices,
/// and `frame` / `command` / `mission_type` stay numeric so that items imported
/// from plan files round-trip without loss. Conversion to dialect enums happens
/// at the frame boundary and may fail for values the dialect does not know.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MissionItem {
    /// Sequence number, contiguous from zero within a mission.
    pub seq: u16,
    /// Coordinate frame (`MAV_FRAME`).
    pub frame: u8,
    /// Scheduled action (`MAV_CMD`).
    pub command: u16,
    /// `1` if this is the current item.
    pub current: u8,
    /// `1` to continue to the next item automatically.
    pub autocontinue: u8,
    /// Command-dependent parameter.
    pub param1: f32,
    /// Command-dependent parameter.
    pub param2: f32,
    /// Command-dependent parameter.
    pub param3: f32,
    /// Command-dependent parameter.
    pub param4: f32,
    /// Latitude times `1e7`, or a raw value for local frames.
    pub x: i32,
    /// Longitude times `1e7`, or a raw value for local frames.
    pub y: i32,
    /// Altitude in meters.
    pub z: f32,
    /// Mission type (`MAV_MISSION_TYPE`).
    pub mission_type: u8,
}

impl MissionItem {
    /// Converts into a MISSION_ITEM_INT message addressed to a target.
    pub(crate) fn to_message(
        &self,
        target_system: u8,
        target_component: u8,
    ) -> Result<MissionItemInt> {
        Ok(MissionItemInt {
            target_system,
            target_component,
            seq: self.seq,
            frame: MavFrame::try_from(self.frame)
                .map_err(|_| Error::InvalidMissionItem(format!("unknown frame {}", self.frame)))?,
            command: MavCmd::try_from(self.command).map_err(|_| {
                Error::InvalidMissionItem(format!("unknown command {}", self.command))
            })?,
            current: self.current,
            autocontinue: self.autocontinue,
            param1: self.param1,
            param2: self.param2,
            param3: self.param3,
            param4: self.param4,
            x: self.x,
            y: self.y,
            z: self.z,
            mission_type: MavMissionType::try_from(self.mission_type).map_err(|_| {
                Error::InvalidMissionItem(format!("unknown mission type {}", self.mission_type))
            })?,
            ..Default::default()
        })
    }
}

impl From<&MissionItemInt> for MissionItem {
    fn from(message: &MissionItemInt) -> Self {
        Self {
            seq: message.seq,
            frame: message.frame as u8,
            command: message.command as u16,
            current: message.current,
            autocontinue: message.autocontinue,
            param1: message.param1,
            param2: message.param2,
            param3: message.param3,
            param4: message.param4,
            x: message.x,
            y: message.y,
            z: message.z,
            mission_type: message.mission_type as u8,
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
//                                   Tests                                   //
///////////////////////////////////////////////////////////////////////////////
