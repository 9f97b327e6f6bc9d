// src/plan.rs
//
// Waypoint plans: loading, turn derivation and the dry-run summary.

use crate::types::{Config, Segment};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("plan has no 'wp' array")]
    NoWaypoints,

    #[error("dist_cm missing for segment {0}")]
    MissingDistance(usize),

    #[error("dist_cm is negative for segment {0}")]
    NegativeDistance(usize),

    #[error("no plan files found in {0}")]
    NoPlans(PathBuf),

    #[error("plan not found: {0}")]
    NotFound(PathBuf),

    #[error("invalid plan JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Mission metadata carried by a plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanMeta {
    #[serde(alias = "height_cm")]
    pub altitude_cm: Option<u32>,
    pub speed_cm_s: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub segments: Vec<Segment>,
    pub meta: PlanMeta,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    wp: Vec<RawWaypoint>,
    #[serde(default)]
    pos: Option<Vec<[f64; 2]>>,
    #[serde(default)]
    meta: PlanMeta,
}

#[derive(Debug, Deserialize)]
struct RawWaypoint {
    dist_cm: Option<f64>,
    turn_signed_deg: Option<f64>,
    angle_deg: Option<f64>,
}

// ============================================================================
// TURN DERIVATION
// ============================================================================

/// Wrap an integer turn into (-180, 180]
pub fn normalize_turn(deg: i32) -> i32 {
    let wrapped = deg.rem_euclid(360);
    if wrapped > 180 {
        wrapped - 360
    } else {
        wrapped
    }
}

fn vector(a: [f64; 2], b: [f64; 2]) -> [f64; 2] {
    [b[0] - a[0], b[1] - a[1]]
}

/// Signed angle from `u` to `v` in degrees, positive counter-clockwise
fn signed_angle(u: [f64; 2], v: [f64; 2]) -> f64 {
    let norm_u = u[0].hypot(u[1]);
    let norm_v = v[0].hypot(v[1]);
    if norm_u == 0.0 || norm_v == 0.0 {
        return 0.0;
    }
    let cos = ((u[0] * v[0] + u[1] * v[1]) / (norm_u * norm_v)).clamp(-1.0, 1.0);
    let angle = cos.acos().to_degrees();
    let cross = u[0] * v[1] - u[1] * v[0];
    if cross > 0.0 {
        angle
    } else if cross < 0.0 {
        -angle
    } else {
        0.0
    }
}

fn initial_heading(pos: &[[f64; 2]]) -> f64 {
    signed_angle([1.0, 0.0], vector(pos[0], pos[1]))
}

pub fn parse_plan(json: &str) -> Result<Plan, PlanError> {
    let raw: RawPlan = serde_json::from_str(json)?;
    if raw.wp.is_empty() {
        return Err(PlanError::NoWaypoints);
    }

    let mut dists = Vec::with_capacity(raw.wp.len());
    for (i, wp) in raw.wp.iter().enumerate() {
        let dist = wp.dist_cm.ok_or(PlanError::MissingDistance(i))?.round();
        if dist < 0.0 {
            return Err(PlanError::NegativeDistance(i));
        }
        dists.push(dist as u32);
    }

    let pos = raw.pos.as_deref().filter(|p| p.len() >= 2);
    let has_signed = raw.wp.iter().any(|w| w.turn_signed_deg.is_some());
    let mut turns = vec![0i32; dists.len()];

    if has_signed {
        for (turn, wp) in turns.iter_mut().zip(&raw.wp) {
            *turn = wp.turn_signed_deg.unwrap_or(0.0).round() as i32;
        }
        if let Some(pos) = pos {
            if turns[0] == 0 {
                turns[0] = initial_heading(pos).round() as i32;
            }
        }
    } else if let Some(pos) = pos {
        turns[0] = initial_heading(pos).round() as i32;
        for i in 1..dists.len() {
            if i + 1 < pos.len() {
                let incoming = vector(pos[i - 1], pos[i]);
                let outgoing = vector(pos[i], pos[i + 1]);
                turns[i] = signed_angle(incoming, outgoing).round() as i32;
            }
        }
    } else {
        for (turn, wp) in turns.iter_mut().zip(&raw.wp) {
            *turn = wp.angle_deg.unwrap_or(0.0).round() as i32;
        }
    }

    let segments = turns
        .into_iter()
        .zip(dists)
        .map(|(turn, dist_cm)| Segment {
            turn_signed_deg: normalize_turn(turn),
            dist_cm,
        })
        .collect();

    Ok(Plan {
        segments,
        meta: raw.meta,
    })
}

pub fn load_plan(path: &Path) -> Result<Plan> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    let plan = parse_plan(&contents)
        .with_context(|| format!("Failed to parse plan {}", path.display()))?;
    debug!("Loaded {} segments from {}", plan.segments.len(), path.display());
    Ok(plan)
}

/// Newest `*.json` directly inside `dir`
pub fn find_latest_plan(dir: &Path) -> Option<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
        .filter_map(|e| {
            let modified = e.metadata().ok()?.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            Some((modified, e.into_path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

/// Explicit path (relative paths live in `plans_dir`), or the newest plan
pub fn resolve_plan_path(
    plan: Option<&Path>,
    use_last: bool,
    plans_dir: &Path,
) -> Result<PathBuf, PlanError> {
    match plan {
        Some(path) if !use_last => {
            let candidate = if path.is_absolute() || path.exists() {
                path.to_path_buf()
            } else {
                plans_dir.join(path)
            };
            if candidate.exists() {
                Ok(candidate)
            } else {
                Err(PlanError::NotFound(candidate))
            }
        }
        _ => find_latest_plan(plans_dir).ok_or_else(|| PlanError::NoPlans(plans_dir.to_path_buf())),
    }
}

// ============================================================================
// DISTANCE SPLITTING
// ============================================================================

/// Forward sub-steps for one segment and the dropped leftover.
///
/// Steps are at most `min(step, max_move)`; splitting stops once the
/// remaining distance is below `min_move`.
pub fn split_distance(dist_cm: u32, min_move: u32, step: u32, max_move: u32) -> (Vec<u32>, u32) {
    let limit = step.min(max_move).max(1);
    let quantum = min_move.max(1);
    let mut remaining = dist_cm;
    let mut steps = Vec::new();
    while remaining >= quantum {
        let cm = limit.min(remaining);
        steps.push(cm);
        remaining -= cm;
    }
    (steps, remaining)
}

// ============================================================================
// DRY-RUN SUMMARY
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SegmentSummary {
    pub index: usize,
    pub turn_signed_deg: i32,
    pub turn_skipped: bool,
    pub dist_cm: u32,
    pub moves: usize,
    pub leftover_cm: u32,
    pub travel_s: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub altitude_cm: u32,
    pub speed_cm_s: u32,
    pub segments: Vec<SegmentSummary>,
    pub total_distance_cm: u64,
    pub climb_cm: u32,
    pub climb_s: Option<f64>,
    pub mission_s: f64,
}

/// What a flight of `plan` would send, with rough timing
pub fn summarize(plan: &Plan, config: &Config) -> PlanSummary {
    let altitude_cm = plan.meta.altitude_cm.unwrap_or(config.flight.altitude_cm);
    let speed_cm_s = plan.meta.speed_cm_s.unwrap_or(config.flight.speed_cm_s);
    let motion = &config.motion;
    let move_settle = motion.move_settle_ms as f64 / 1000.0;
    let turn_settle = motion.turn_settle_ms as f64 / 1000.0;
    let pause = config.flight.pause_per_segment_ms as f64 / 1000.0;
    let travel = |cm: u32| (speed_cm_s > 0).then(|| cm as f64 / speed_cm_s as f64);

    let mut total_distance_cm = 0u64;
    let mut total_s = 0.0;
    let mut segments = Vec::with_capacity(plan.segments.len());

    for (index, seg) in plan.segments.iter().enumerate() {
        let (steps, leftover_cm) = split_distance(
            seg.dist_cm,
            motion.min_move_cm,
            motion.forward_step_cm,
            motion.max_move_cm,
        );
        let travel_s = travel(seg.dist_cm);
        let mut seg_s = travel_s.unwrap_or(0.0) + steps.len() as f64 * move_settle + pause;
        if seg.turn_signed_deg != 0 {
            seg_s += turn_settle;
        }
        total_distance_cm += seg.dist_cm as u64;
        total_s += seg_s;

        segments.push(SegmentSummary {
            index,
            turn_signed_deg: seg.turn_signed_deg,
            turn_skipped: seg.turn_signed_deg != 0
                && (seg.turn_signed_deg.unsigned_abs() as f64) < config.heading.min_turn_deg,
            dist_cm: seg.dist_cm,
            moves: steps.len(),
            leftover_cm,
            travel_s,
        });
    }

    let climb_cm = altitude_cm
        .saturating_sub(config.flight.takeoff_height_cm)
        .min(motion.max_move_cm);
    let climb_s = travel(climb_cm);

    PlanSummary {
        altitude_cm,
        speed_cm_s,
        segments,
        total_distance_cm,
        climb_cm,
        climb_s,
        mission_s: total_s + climb_s.unwrap_or(0.0),
    }
}

pub fn format_seconds(seconds: Option<f64>) -> String {
    let Some(seconds) = seconds.filter(|s| *s >= 0.0) else {
        return "-".to_string();
    };
    let minutes = (seconds / 60.0).floor() as u64;
    let secs = seconds - minutes as f64 * 60.0;
    if minutes == 0 {
        format!("{:.1}s", secs)
    } else if minutes < 60 {
        format!("{}m {:04.1}s", minutes, secs)
    } else {
        format!("{}h {}m {:04.1}s", minutes / 60, minutes % 60, secs)
    }
}

impl SegmentSummary {
    pub fn describe(&self) -> String {
        let mut turn = format!("{:+4} deg", self.turn_signed_deg);
        if self.turn_skipped {
            turn.push_str(" (skip<min)");
        }
        format!(
            "[{:02}] turn {}, dist {:4} cm -> moves {:2}, leftover {:2} cm, travel {}",
            self.index,
            turn,
            self.dist_cm,
            self.moves,
            self.leftover_cm,
            format_seconds(self.travel_s)
        )
    }
}
