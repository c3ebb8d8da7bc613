//! Mission plan file import.
//!
//! Translates external plan formats into wire [`MissionItem`] lists:
//!
//! * [`qgc`] — QGroundControl `.plan` (JSON);
//! * [`waypoints`] — Mission Planner `.waypoints` (tab-separated text).
//!
//! Malformed or version-mismatched input yields a typed [`PlanError`] rather
//! than a partial result.

pub mod qgc;
pub mod waypoints;

pub use qgc::import_qgc_plan;
pub use waypoints::import_mission_planner;

use crate::protocol::MissionItem;

/// Import failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PlanError {
    /// The input is not a well-formed, supported QGroundControl `.plan`.
    #[error("failed to parse QGroundControl plan")]
    FailedToParseQgcPlan,
    /// The input is not a well-formed Mission Planner `.waypoints` file.
    #[error("failed to parse Mission Planner plan")]
    FailedToParseMissionPlannerPlan,
}

/// Item lists imported from a plan file.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ImportedPlan {
    /// Waypoint mission items.
    pub mission: Vec<MissionItem>,
    /// Geofence items (polygon vertices and circles).
    pub geofence: Vec<MissionItem>,
    /// Rally point items.
    pub rally: Vec<MissionItem>,
}

// MAV_FRAME and MAV_CMD values the importers deal in.
pub(crate) mod ids {
    pub const FRAME_GLOBAL: u8 = 0;
    pub const FRAME_MISSION: u8 = 2;
    pub const FRAME_GLOBAL_RELATIVE_ALT: u8 = 3;
    pub const FRAME_GLOBAL_INT: u8 = 5;
    pub const FRAME_GLOBAL_RELATIVE_ALT_INT: u8 = 6;

    pub const CMD_NAV_WAYPOINT: u16 = 16;
    pub const CMD_NAV_TAKEOFF: u16 = 22;
    pub const CMD_FENCE_POLYGON_VERTEX_INCLUSION: u16 = 5001;
    pub const CMD_FENCE_POLYGON_VERTEX_EXCLUSION: u16 = 5002;
    pub const CMD_FENCE_CIRCLE_INCLUSION: u16 = 5003;
    pub const CMD_FENCE_CIRCLE_EXCLUSION: u16 = 5004;
    pub const CMD_NAV_RALLY_POINT: u16 = 5100;

    pub const MISSION_TYPE_MISSION: u8 = 0;
    pub const MISSION_TYPE_FENCE: u8 = 1;
    pub const MISSION_TYPE_RALLY: u8 = 2;
}

/// Scales latitude/longitude degrees to the integer wire representation.
///
/// `MAV_FRAME_MISSION` carries raw indices and is not scaled.
pub(crate) fn scale_coordinate(degrees: f64, frame: u8) -> i32 {
    if frame == ids::FRAME_MISSION {
        degrees as i32
    } else {
        (degrees * 1e7).round() as i32
    }
}
