// src/detection/scripted.rs
//
// Replays a schedule of detections keyed by inference index. Drives dry
// flights against the simulator and stands in for the model in tests.

use super::{DetectionPort, FrameSource};
use crate::types::{Detection, Frame};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::info;

/// A target visible for inference indexes `from..=to`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptEntry {
    pub from: u64,
    #[serde(default = "open_end")]
    pub to: u64,
    /// Box centre offset from the frame centre (pixels)
    #[serde(default)]
    pub dx: f32,
    #[serde(default)]
    pub dy: f32,
    pub box_width: f32,
    #[serde(default)]
    pub box_height: Option<f32>,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub label: Option<String>,
}

fn open_end() -> u64 {
    u64::MAX
}

fn default_confidence() -> f32 {
    0.9
}

pub struct ScriptedDetector {
    entries: Vec<ScriptEntry>,
    index: u64,
}

impl ScriptedDetector {
    pub fn new(entries: Vec<ScriptEntry>) -> Self {
        Self { entries, index: 0 }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read detection script {}", path.display()))?;
        let entries: Vec<ScriptEntry> = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse detection script {}", path.display()))?;
        info!("✓ Loaded {} scripted detections", entries.len());
        Ok(Self::new(entries))
    }

    fn detection_at(&self, index: u64, width: usize, height: usize) -> Detection {
        let Some(entry) = self
            .entries
            .iter()
            .find(|e| index >= e.from && index <= e.to)
        else {
            return Detection::absent();
        };

        let cx = width as f32 / 2.0 + entry.dx;
        let cy = height as f32 / 2.0 + entry.dy;
        let half_w = entry.box_width.max(1.0) / 2.0;
        let half_h = entry.box_height.unwrap_or(entry.box_width).max(1.0) / 2.0;
        Detection::from_bbox(
            [cx - half_w, cy - half_h, cx + half_w, cy + half_h],
            entry.confidence,
            entry.label.clone(),
            width,
            height,
        )
    }
}

impl DetectionPort for ScriptedDetector {
    fn infer(&mut self, frame: &Frame) -> Result<Detection> {
        let det = self.detection_at(self.index, frame.width, frame.height);
        self.index += 1;
        Ok(det)
    }
}

/// Frames with geometry only; the scripted detector never looks at pixels
pub struct SyntheticFrames {
    width: usize,
    height: usize,
    started: Instant,
}

impl SyntheticFrames {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            started: Instant::now(),
        }
    }
}

impl FrameSource for SyntheticFrames {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        Ok(Some(Frame {
            data: Vec::new(),
            width: self.width,
            height: self.height,
            timestamp_ms: self.started.elapsed().as_secs_f64() * 1000.0,
        }))
    }
}
