// src/types.rs

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub flight: FlightConfig,
    pub motion: MotionConfig,
    pub command: CommandConfig,
    pub connection: ConnectionConfig,
    pub heading: HeadingConfig,
    pub detection: DetectionConfig,
    pub engagement: EngagementConfig,
    /// Per-label calibration, looked up by detection label
    pub targets: HashMap<String, TargetSpec>,
    pub landing: LandingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlightConfig {
    /// Target altitude above the takeoff point
    pub altitude_cm: u32,
    pub speed_cm_s: u32,
    /// Abort the plan at or below this battery percentage
    pub low_battery_pct: u8,
    /// Height the vehicle settles at after takeoff; the climb covers the rest
    pub takeoff_height_cm: u32,
    pub takeoff_settle_ms: u64,
    /// Hover after takeoff so the IMU can settle (0 disables)
    pub imu_stabilize_ms: u64,
    pub pause_per_segment_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// Smallest distance the actuator accepts per move
    pub min_move_cm: u32,
    /// Largest distance the actuator accepts per move
    pub max_move_cm: u32,
    /// Forward sub-step while flying a segment
    pub forward_step_cm: u32,
    /// Split the post-takeoff climb into chunks of at most this size (0 disables)
    pub climb_chunk_cm: u32,
    pub turn_settle_ms: u64,
    pub move_settle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Retries per command on top of the first attempt
    pub retries: u32,
    pub retry_sleep_ms: u64,
    /// Extra attempts granted the first time the IMU reports not ready
    pub imu_extra_attempts: u32,
    pub imu_retry_sleep_ms: u64,
    /// Actuator response timeout before padding
    pub response_timeout_ms: u64,
    /// Tolerance when judging completion from telemetry
    pub success_tolerance_cm: f64,
    /// Height that counts as a completed takeoff
    pub takeoff_success_height_cm: f64,
    pub resync_settle_ms: u64,
    /// Extra response grace per command label
    pub timeout_pad: HashMap<String, TimeoutPad>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPad {
    pub base_s: f64,
    pub per_cm_s: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub attempts: u32,
    pub backoff_ms: u64,
    pub drone_addr: String,
    pub command_bind: String,
    pub state_bind: String,
    pub video_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadingConfig {
    /// Turns smaller than this are dropped
    pub min_turn_deg: f64,
    /// Split turns into chunks of at most this size (0 disables)
    pub turn_chunk_deg: u32,
    /// Correct drift once |actual - expected| reaches this (0 disables)
    pub drift_tolerance_deg: f64,
    /// Clamp for a single drift correction
    pub drift_correct_max_deg: f64,
    /// Yaw rate command used when the IMU rejects a turn (0 disables the fallback)
    pub open_loop_yaw_rate: i32,
    /// Approximate angular speed produced by `open_loop_yaw_rate`
    pub open_loop_deg_per_s: f64,
    pub open_loop_recover_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub enabled: bool,
    pub model_path: String,
    /// Class names in model output order
    pub class_names: Vec<String>,
    /// Labels that count as targets (empty = any class)
    pub classes: Vec<String>,
    pub confidence_threshold: f32,
    pub input_size: usize,
    pub intra_threads: usize,
    /// Background polling rate
    pub poll_hz: f64,
    /// Latest detection older than this is treated as no information
    pub max_age_ms: u64,
    pub frame_width: u32,
    pub frame_height: u32,
    pub hfov_deg: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldPolicy {
    /// Hold until the target has been unseen for the lost-target grace period
    UntilLost,
    /// Same, but never longer than `hold_max_ms`
    Timed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngagementConfig {
    /// Acceptable +/- band around the standoff distance
    pub distance_tolerance_cm: u32,
    /// Largest forward move while closing distance
    pub forward_step_cm: u32,
    pub approach_timeout_ms: u64,
    /// Grace period without detections during the approach
    pub approach_lost_ms: u64,
    /// Grace period without detections while holding
    pub target_lost_ms: u64,
    /// How long to re-poll for a seed detection without a bounding box
    pub confirm_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub hold_poll_ms: u64,
    pub keepalive_ms: u64,
    pub hold: HoldPolicy,
    pub hold_max_ms: u64,
    /// Fallback entry in `targets` for unknown labels
    pub generic_target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LandingConfig {
    /// Vertical velocity of the open-loop descent fallback
    pub descent_velocity: i32,
    pub descent_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub dir: String,
    /// Also log every structured mission event as JSON
    pub events: bool,
}

// ============================================================================
// MISSION DATA
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Signed turn in (-180, 180], positive = counter-clockwise
    pub turn_signed_deg: i32,
    pub dist_cm: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetSpec {
    pub real_width_m: f64,
    pub approach_distance_m: f64,
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub timestamp_ms: f64,
}

/// Best detection of one inferred frame
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub present: bool,
    /// Box centre offset from the frame centre (pixels, +x right, +y down)
    pub dx: f32,
    pub dy: f32,
    /// Box area / frame area
    pub area_frac: f32,
    pub confidence: f32,
    pub bbox: Option<[f32; 4]>, // [x1, y1, x2, y2]
    pub label: Option<String>,
    pub timestamp: Instant,
}

impl Detection {
    pub fn absent() -> Self {
        Self {
            present: false,
            dx: 0.0,
            dy: 0.0,
            area_frac: 0.0,
            confidence: 0.0,
            bbox: None,
            label: None,
            timestamp: Instant::now(),
        }
    }

    /// Build a detection from a box in frame coordinates
    pub fn from_bbox(
        bbox: [f32; 4],
        confidence: f32,
        label: Option<String>,
        frame_width: usize,
        frame_height: usize,
    ) -> Self {
        let [x1, y1, x2, y2] = bbox;
        let center_x = frame_width as f32 / 2.0;
        let center_y = frame_height as f32 / 2.0;
        let area = ((x2 - x1) * (y2 - y1)).max(1.0);
        let frame_area = (frame_width * frame_height).max(1) as f32;

        Self {
            present: true,
            dx: (x1 + x2) * 0.5 - center_x,
            dy: (y1 + y2) * 0.5 - center_y,
            area_frac: (area / frame_area).clamp(0.0, 1.0),
            confidence,
            bbox: Some(bbox),
            label,
            timestamp: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.timestamp.elapsed()
    }

    pub fn box_width(&self) -> Option<f32> {
        self.bbox.map(|[x1, _, x2, _]| (x2 - x1).max(1.0))
    }

    /// True when the detection is present and carries `label` (or no label at all)
    pub fn matches_label(&self, label: &str) -> bool {
        self.present
            && self
                .label
                .as_deref()
                .map_or(true, |l| l.eq_ignore_ascii_case(label))
    }
}

/// Terminal outcome of one engagement episode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngagementResult {
    pub standoff_reached: bool,
    pub target_visible_on_finish: bool,
    pub total_forward_cm: u32,
    pub heading_restored: bool,
    /// Forward travel that could not be retreated
    pub unretreated_cm: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Completed,
    AbortedLowBattery,
    AbortedError,
}

impl MissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::AbortedLowBattery => "aborted_low_battery",
            Self::AbortedError => "aborted_error",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::AbortedLowBattery => 4,
            Self::AbortedError => 1,
        }
    }
}
