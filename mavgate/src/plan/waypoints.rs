//! Mission Planner `.waypoints` import.
//!
//! The format starts with a `QGC WPL 110` header line followed by one
//! tab-separated line per mission item:
//!
//! ```text
//! seq  current  frame  command  param1  param2  param3  param4  x  y  z  autocontinue
//! ```

use crate::plan::{ids, ImportedPlan, PlanError};
use crate::protocol::{Autopilot, MissionItem};

/// Imports a Mission Planner `.waypoints` file.
///
/// The format only carries waypoint missions, so the geofence and rally lists
/// of the result are always empty. Latitude and longitude are scaled to
/// `degrees * 1e7` for the global frames. For ArduPilot flight stacks a home
/// item cloned from the first waypoint is prepended.
pub fn import_mission_planner(
    raw: &str,
    autopilot: Autopilot,
) -> Result<ImportedPlan, PlanError> {
    let mut lines = raw.lines();

    match lines.next() {
        Some(header) if header.trim_end() == "QGC WPL 110" => {}
        _ => {
            log::error!("invalid Mission Planner format");
            return Err(PlanError::FailedToParseMissionPlannerPlan);
        }
    }

    let mut mission_items = Vec::new();
    for line in lines {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some(item) = parse_line(line) else {
            log::error!("failed to parse Mission Planner line: {line}");
            return Err(PlanError::FailedToParseMissionPlannerPlan);
        };
        mission_items.push(item);
    }

    // ArduPilot expects a home position as item zero. The format has no
    // explicit home, so the first waypoint doubles as one.
    if autopilot == Autopilot::ArduPilot {
        if let Some(first) = mission_items.first() {
            if first.command == ids::CMD_NAV_WAYPOINT || first.command == ids::CMD_NAV_TAKEOFF {
                let home = MissionItem {
                    seq: 0,
                    frame: ids::FRAME_GLOBAL_INT,
                    command: ids::CMD_NAV_WAYPOINT,
                    current: 0,
                    autocontinue: 1,
                    x: first.x,
                    y: first.y,
                    z: first.z,
                    mission_type: ids::MISSION_TYPE_MISSION,
                    ..Default::default()
                };
                mission_items.insert(0, home);
            }
        }
    }

    for (seq, item) in mission_items.iter_mut().enumerate() {
        item.seq = seq as u16;
        item.current = u8::from(seq == 0);
    }

    Ok(ImportedPlan {
        mission: mission_items,
        geofence: Vec::new(),
        rally: Vec::new(),
    })
}

fn parse_line(line: &str) -> Option<MissionItem> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() != 12 {
        log::error!(
            "invalid Mission Planner line, expected 12 fields, got {}",
            fields.len()
        );
        return None;
    }

    let seq: u16 = fields[0].parse().ok()?;
    let current: u8 = fields[1].parse().ok()?;
    let frame: u8 = fields[2].parse().ok()?;
    let command: u16 = fields[3].parse().ok()?;

    let param1: f32 = fields[4].parse().ok()?;
    let param2: f32 = fields[5].parse().ok()?;
    let param3: f32 = fields[6].parse().ok()?;
    let param4: f32 = fields[7].parse().ok()?;

    let x_degrees: f64 = fields[8].parse().ok()?;
    let y_degrees: f64 = fields[9].parse().ok()?;
    let (x, y) = if is_global_frame(frame) {
        (
            (x_degrees * 1e7).round() as i32,
            (y_degrees * 1e7).round() as i32,
        )
    } else {
        (x_degrees.round() as i32, y_degrees.round() as i32)
    };

    let z: f32 = fields[10].parse().ok()?;
    let autocontinue: u8 = fields[11].parse().ok()?;

    Some(MissionItem {
        seq,
        frame,
        command,
        current,
        autocontinue,
        param1,
        param2,
        param3,
        param4,
        x,
        y,
        z,
        mission_type: ids::MISSION_TYPE_MISSION,
    })
}

fn is_global_frame(frame: u8) -> bool {
    matches!(
        frame,
        ids::FRAME_GLOBAL
            | ids::FRAME_GLOBAL_INT
            | ids::FRAME_GLOBAL_RELATIVE_ALT
            | ids::FRAME_GLOBAL_RELATIVE_ALT_INT
    )
}

///////////////////////////////////////////////////////////////////////////////
//                                   Tests                                   //
///////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod test_mission_planner_import {
    use super::*;

    const TAKEOFF_FILE: &str =
        "QGC WPL 110\n0\t1\t0\t22\t0\t0\t0\t0\t47.39781011\t8.54553801\t15\t1\n";

    #[test]
    fn takeoff_file_parses_to_one_item() {
        let plan = import_mission_planner(TAKEOFF_FILE, Autopilot::Px4).unwrap();

        assert!(plan.geofence.is_empty());
        assert!(plan.rally.is_empty());
        assert_eq!(plan.mission.len(), 1);

        let item = &plan.mission[0];
        assert_eq!(item.seq, 0);
        assert_eq!(item.current, 1);
        assert_eq!(item.frame, ids::FRAME_GLOBAL);
        assert_eq!(item.command, ids::CMD_NAV_TAKEOFF);
        assert_eq!(item.x, 473978101);
        assert_eq!(item.y, 85455380);
        assert_eq!(item.z, 15.0);
        assert_eq!(item.autocontinue, 1);
        assert_eq!(item.mission_type, ids::MISSION_TYPE_MISSION);
    }

    #[test]
    fn ardupilot_import_clones_first_waypoint_as_home() {
        let plan = import_mission_planner(TAKEOFF_FILE, Autopilot::ArduPilot).unwrap();

        assert_eq!(plan.mission.len(), 2);

        let home = &plan.mission[0];
        assert_eq!(home.seq, 0);
        assert_eq!(home.current, 1);
        assert_eq!(home.command, ids::CMD_NAV_WAYPOINT);
        assert_eq!(home.frame, ids::FRAME_GLOBAL_INT);
        assert_eq!(home.x, 473978101);
        assert_eq!(home.y, 85455380);
        assert_eq!(home.z, 15.0);

        let takeoff = &plan.mission[1];
        assert_eq!(takeoff.seq, 1);
        assert_eq!(takeoff.current, 0);
        assert_eq!(takeoff.command, ids::CMD_NAV_TAKEOFF);
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let file = "QGC WPL 110\n# a comment\n\n\
                    0\t1\t3\t16\t0\t0\t0\t0\t47.1\t8.1\t30\t1\n\
                    1\t0\t3\t16\t0\t0\t0\t0\t47.2\t8.2\t30\t1\n";
        let plan = import_mission_planner(file, Autopilot::Px4).unwrap();

        assert_eq!(plan.mission.len(), 2);
        assert_eq!(plan.mission[0].seq, 0);
        assert_eq!(plan.mission[0].current, 1);
        assert_eq!(plan.mission[1].seq, 1);
        assert_eq!(plan.mission[1].current, 0);
        assert_eq!(plan.mission[1].x, 472000000);
    }

    #[test]
    fn local_frames_are_not_scaled() {
        let file = "QGC WPL 110\n0\t1\t1\t16\t0\t0\t0\t0\t12.6\t-3.4\t5\t1\n";
        let plan = import_mission_planner(file, Autopilot::Px4).unwrap();

        assert_eq!(plan.mission[0].x, 13);
        assert_eq!(plan.mission[0].y, -3);
    }

    #[test]
    fn bad_header_is_rejected() {
        assert_eq!(
            import_mission_planner("QGC WPL 100\n", Autopilot::Px4),
            Err(PlanError::FailedToParseMissionPlannerPlan)
        );
        assert_eq!(
            import_mission_planner("", Autopilot::Px4),
            Err(PlanError::FailedToParseMissionPlannerPlan)
        );
    }

    #[test]
    fn malformed_lines_are_rejected() {
        let missing_field = "QGC WPL 110\n0\t1\t0\t22\t0\t0\t0\t0\t47.0\t8.0\t15\n";
        assert_eq!(
            import_mission_planner(missing_field, Autopilot::Px4),
            Err(PlanError::FailedToParseMissionPlannerPlan)
        );

        let not_a_number = "QGC WPL 110\n0\t1\t0\tNOPE\t0\t0\t0\t0\t47.0\t8.0\t15\t1\n";
        assert_eq!(
            import_mission_planner(not_a_number, Autopilot::Px4),
            Err(PlanError::FailedToParseMissionPlannerPlan)
        );
    }
}
