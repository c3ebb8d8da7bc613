//! QGroundControl `.plan` import.
//!
//! A `.plan` file is a JSON document with `mission`, `geoFence` and
//! `rallyPoints` sections. Only the format versions QGroundControl currently
//! writes are accepted: overall version 1, mission/geofence/rally version 2,
//! survey complex items version 5.

use serde_json::Value;

use crate::plan::{ids, scale_coordinate, ImportedPlan, PlanError};
use crate::protocol::{Autopilot, MissionItem};

/// Imports a QGroundControl `.plan` document.
///
/// Coordinates are scaled to `degrees * 1e7` except for items in
/// `MAV_FRAME_MISSION`. Missing floating-point parameters become `NAN`,
/// missing coordinates become `0`. For ArduPilot flight stacks the planned
/// home position is prepended to the mission as sequence number zero.
pub fn import_qgc_plan(raw_json: &str, autopilot: Autopilot) -> Result<ImportedPlan, PlanError> {
    let root: Value = serde_json::from_str(raw_json).map_err(|err| {
        log::error!("plan parse error: {err}");
        PlanError::FailedToParseQgcPlan
    })?;

    if !version_is(&root, 1) {
        log::error!("overall .plan version not supported, supported: 1");
        return Err(PlanError::FailedToParseQgcPlan);
    }

    Ok(ImportedPlan {
        mission: import_mission(&root, autopilot)?,
        geofence: import_geofence(&root)?,
        rally: import_rally_points(&root)?,
    })
}

fn version_is(section: &Value, expected: i64) -> bool {
    section.get("version").and_then(Value::as_i64) == Some(expected)
}

fn set_float(val: Option<&Value>) -> f32 {
    match val {
        Some(val) if !val.is_null() => val.as_f64().map(|val| val as f32).unwrap_or(f32::NAN),
        _ => f32::NAN,
    }
}

fn set_int32(val: Option<&Value>, frame: u8) -> i32 {
    let degrees = match val {
        Some(val) if !val.is_null() => val.as_f64().unwrap_or(0.0),
        _ => 0.0,
    };
    scale_coordinate(degrees, frame)
}

fn as_flag(val: Option<&Value>) -> bool {
    match val {
        Some(Value::Bool(flag)) => *flag,
        Some(val) => val.as_f64().map(|num| num != 0.0).unwrap_or(false),
        None => false,
    }
}

fn import_mission(root: &Value, autopilot: Autopilot) -> Result<Vec<MissionItem>, PlanError> {
    let Some(mission) = root.get("mission").filter(|val| !val.is_null()) else {
        log::error!("no mission found in .plan");
        return Err(PlanError::FailedToParseQgcPlan);
    };

    if !version_is(mission, 2) {
        log::error!("mission version for .plan not supported, supported: 2");
        return Err(PlanError::FailedToParseQgcPlan);
    }

    let mut mission_items = Vec::new();
    if let Some(items) = mission.get("items").and_then(Value::as_array) {
        for json_item in items {
            match json_item.get("type").and_then(Value::as_str) {
                Some("SimpleItem") => mission_items.push(import_simple_mission_item(json_item)?),
                Some("ComplexItem") => {
                    mission_items.extend(import_complex_mission_items(json_item)?)
                }
                other => {
                    log::error!("item type {other:?} not understood");
                    return Err(PlanError::FailedToParseQgcPlan);
                }
            }
        }
    }

    if let Some(first) = mission_items.first_mut() {
        first.current = 1;
    }

    // ArduPilot expects the home position as item zero.
    if autopilot == Autopilot::ArduPilot {
        match mission.get("plannedHomePosition") {
            Some(Value::Array(home)) if home.is_empty() => {}
            Some(Value::Array(home)) if home.len() == 3 => {
                mission_items.insert(
                    0,
                    MissionItem {
                        seq: 0,
                        frame: ids::FRAME_GLOBAL_INT,
                        command: ids::CMD_NAV_WAYPOINT,
                        current: 0,
                        autocontinue: 1,
                        param1: 0.0,
                        param2: 0.0,
                        param3: 0.0,
                        param4: 0.0,
                        x: set_int32(home.first(), ids::FRAME_GLOBAL_INT),
                        y: set_int32(home.get(1), ids::FRAME_GLOBAL_INT),
                        z: home.get(2).and_then(Value::as_f64).unwrap_or(0.0) as f32,
                        mission_type: ids::MISSION_TYPE_MISSION,
                    },
                );
            }
            Some(val) if !val.is_null() => {
                log::error!("unknown plannedHomePosition format");
                return Err(PlanError::FailedToParseQgcPlan);
            }
            _ => {}
        }
    }

    for (seq, item) in mission_items.iter_mut().enumerate() {
        item.seq = seq as u16;
    }

    Ok(mission_items)
}

fn import_simple_mission_item(json_item: &Value) -> Result<MissionItem, PlanError> {
    let missing = |key: &str| json_item.get(key).map(Value::is_null).unwrap_or(true);
    if missing("command") || missing("autoContinue") || missing("frame") || missing("params") {
        log::error!("missing mission item field");
        return Err(PlanError::FailedToParseQgcPlan);
    }

    let Some(params) = json_item.get("params").and_then(Value::as_array) else {
        log::error!("no param array found");
        return Err(PlanError::FailedToParseQgcPlan);
    };

    let frame = json_item
        .get("frame")
        .and_then(Value::as_i64)
        .unwrap_or_default() as u8;

    Ok(MissionItem {
        seq: 0,
        frame,
        command: json_item
            .get("command")
            .and_then(Value::as_i64)
            .unwrap_or_default() as u16,
        current: 0,
        autocontinue: u8::from(as_flag(json_item.get("autoContinue"))),
        param1: set_float(params.first()),
        param2: set_float(params.get(1)),
        param3: set_float(params.get(2)),
        param4: set_float(params.get(3)),
        x: set_int32(params.get(4), frame),
        y: set_int32(params.get(5), frame),
        z: set_float(params.get(6)),
        mission_type: ids::MISSION_TYPE_MISSION,
    })
}

fn import_complex_mission_items(json_item: &Value) -> Result<Vec<MissionItem>, PlanError> {
    match json_item.get("complexItemType").and_then(Value::as_str) {
        Some("survey") => {}
        other => {
            log::error!("complexItemType {other:?} not supported");
            return Err(PlanError::FailedToParseQgcPlan);
        }
    }

    if !version_is(json_item, 5) {
        log::error!("version of complexItem not supported, supported: 5");
        return Err(PlanError::FailedToParseQgcPlan);
    }

    let sub_items = json_item
        .get("TransectStyleComplexItem")
        .and_then(|transect| transect.get("Items"))
        .and_then(Value::as_array);
    let Some(sub_items) = sub_items.filter(|items| !items.is_empty()) else {
        log::error!("no survey items found");
        return Err(PlanError::FailedToParseQgcPlan);
    };

    // Survey sub-items that fail to parse are skipped rather than failing
    // the whole import.
    Ok(sub_items
        .iter()
        .filter_map(|sub_item| import_simple_mission_item(sub_item).ok())
        .collect())
}

fn import_geofence(root: &Value) -> Result<Vec<MissionItem>, PlanError> {
    let Some(geofence) = root.get("geoFence").filter(|val| !val.is_null()) else {
        log::error!("no geoFence section found in .plan");
        return Err(PlanError::FailedToParseQgcPlan);
    };

    if !version_is(geofence, 2) {
        log::error!("geofence version for .plan not supported, supported: 2");
        return Err(PlanError::FailedToParseQgcPlan);
    }

    let mut geofence_items = import_polygon_geofences(geofence.get("polygons"));
    geofence_items.extend(import_circular_geofences(geofence.get("circles")));

    if let Some(first) = geofence_items.first_mut() {
        first.current = 1;
    }
    for (seq, item) in geofence_items.iter_mut().enumerate() {
        item.seq = seq as u16;
    }

    Ok(geofence_items)
}

fn import_polygon_geofences(polygons: Option<&Value>) -> Vec<MissionItem> {
    let mut polygon_geofences = Vec::new();

    for polygon in polygons.and_then(Value::as_array).into_iter().flatten() {
        // Plans written before the inclusion flag existed imply inclusion.
        let inclusion = match polygon.get("inclusion") {
            None | Some(Value::Null) => true,
            val => as_flag(val),
        };
        let Some(points) = polygon.get("polygon").and_then(Value::as_array) else {
            continue;
        };
        for point in points {
            polygon_geofences.push(MissionItem {
                command: if inclusion {
                    ids::CMD_FENCE_POLYGON_VERTEX_INCLUSION
                } else {
                    ids::CMD_FENCE_POLYGON_VERTEX_EXCLUSION
                },
                frame: ids::FRAME_GLOBAL,
                param1: points.len() as f32,
                x: set_int32(point.get(0), ids::FRAME_GLOBAL),
                y: set_int32(point.get(1), ids::FRAME_GLOBAL),
                mission_type: ids::MISSION_TYPE_FENCE,
                ..Default::default()
            });
        }
    }

    polygon_geofences
}

fn import_circular_geofences(circles: Option<&Value>) -> Vec<MissionItem> {
    let mut circular_geofences = Vec::new();

    for circle in circles.and_then(Value::as_array).into_iter().flatten() {
        let inclusion = as_flag(circle.get("inclusion"));
        let center = circle
            .get("circle")
            .and_then(|inner| inner.get("center"))
            .and_then(Value::as_array);
        let radius = circle.get("circle").and_then(|inner| inner.get("radius"));

        circular_geofences.push(MissionItem {
            command: if inclusion {
                ids::CMD_FENCE_CIRCLE_INCLUSION
            } else {
                ids::CMD_FENCE_CIRCLE_EXCLUSION
            },
            frame: ids::FRAME_GLOBAL,
            param1: set_float(radius),
            x: set_int32(center.and_then(|point| point.first()), ids::FRAME_GLOBAL),
            y: set_int32(center.and_then(|point| point.get(1)), ids::FRAME_GLOBAL),
            mission_type: ids::MISSION_TYPE_FENCE,
            ..Default::default()
        });
    }

    circular_geofences
}

fn import_rally_points(root: &Value) -> Result<Vec<MissionItem>, PlanError> {
    let Some(rally_points) = root.get("rallyPoints").filter(|val| !val.is_null()) else {
        log::error!("no rallyPoints section found in .plan");
        return Err(PlanError::FailedToParseQgcPlan);
    };

    if !version_is(rally_points, 2) {
        log::error!("rally points version for .plan not supported, supported: 2");
        return Err(PlanError::FailedToParseQgcPlan);
    }

    let mut rally_items = Vec::new();
    for point in rally_points
        .get("points")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        rally_items.push(MissionItem {
            command: ids::CMD_NAV_RALLY_POINT,
            frame: ids::FRAME_GLOBAL_RELATIVE_ALT,
            x: set_int32(point.get(0), ids::FRAME_GLOBAL_RELATIVE_ALT),
            y: set_int32(point.get(1), ids::FRAME_GLOBAL_RELATIVE_ALT),
            z: set_float(point.get(2)),
            mission_type: ids::MISSION_TYPE_RALLY,
            ..Default::default()
        });
    }

    if let Some(first) = rally_items.first_mut() {
        first.current = 1;
    }
    for (seq, item) in rally_items.iter_mut().enumerate() {
        item.seq = seq as u16;
    }

    Ok(rally_items)
}

///////////////////////////////////////////////////////////////////////////////
//                                   Tests                                   //
///////////////////////////////////////////////////////////////////////////////
