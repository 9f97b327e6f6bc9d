// src/engagement/geometry.rs
//
// Pinhole-camera helpers for turning a bounding box into a bearing and a
// range.

use crate::types::DetectionConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub frame_width: f64,
    pub hfov_deg: f64,
}

impl Camera {
    pub fn from_config(config: &DetectionConfig) -> Self {
        Self {
            frame_width: config.frame_width as f64,
            hfov_deg: config.hfov_deg,
        }
    }

    /// Focal length in pixels: `(width / 2) / tan(hfov / 2)`
    pub fn focal_px(&self) -> f64 {
        (self.frame_width / 2.0) / (self.hfov_deg / 2.0).to_radians().tan()
    }

    /// Bearing of a horizontal pixel offset; positive means right of centre
    pub fn pixels_to_yaw_deg(&self, dx: f64) -> f64 {
        let half_width = self.frame_width / 2.0;
        if half_width <= 0.0 || self.hfov_deg <= 0.0 {
            return 0.0;
        }
        (dx / half_width) * (self.hfov_deg / 2.0)
    }

    /// Slant range to an object of known width
    pub fn estimate_distance_m(&self, box_width_px: f64, real_width_m: f64) -> Option<f64> {
        if real_width_m <= 0.0 || self.hfov_deg <= 0.0 {
            return None;
        }
        Some(real_width_m * self.focal_px() / box_width_px.max(1.0))
    }
}

/// Split a backward move into equal parts no larger than `max_move`
pub fn retreat_chunks(total_cm: u32, max_move: u32) -> Vec<u32> {
    if total_cm == 0 {
        return Vec::new();
    }
    let max_move = max_move.max(1);
    if total_cm <= max_move {
        return vec![total_cm];
    }
    let parts = total_cm.div_ceil(max_move);
    let base = total_cm / parts;
    let extra = total_cm % parts;
    (0..parts).map(|i| base + u32::from(i < extra)).collect()
}
