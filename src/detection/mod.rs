// src/detection/mod.rs

pub mod capture;
pub mod feed;
pub mod scripted;
pub mod yolo;

// Re-export public APIs
pub use capture::VideoStream;
pub use feed::DetectionFeed;
pub use scripted::{ScriptedDetector, SyntheticFrames};
pub use yolo::YoloDetector;

use crate::types::{Detection, Frame};
use anyhow::Result;
use tracing::debug;

/// Best-detection inference over one frame
pub trait DetectionPort: Send {
    fn infer(&mut self, frame: &Frame) -> Result<Detection>;

    fn close(&mut self) {}
}

/// Supplier of frames; `Ok(None)` means no frame is ready yet
pub trait FrameSource: Send {
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn close(&mut self) {}
}

/// A frame source paired with the detector that consumes it
pub struct Sensor {
    frames: Box<dyn FrameSource>,
    detector: Box<dyn DetectionPort>,
}

impl Sensor {
    pub fn new(frames: Box<dyn FrameSource>, detector: Box<dyn DetectionPort>) -> Self {
        Self { frames, detector }
    }

    /// One frame through the detector. `None` when no frame was available;
    /// inference failures read as "nothing detected".
    pub fn sample(&mut self) -> Option<Detection> {
        let frame = match self.frames.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return None,
            Err(e) => {
                debug!("Frame read failed: {}", e);
                return None;
            }
        };
        match self.detector.infer(&frame) {
            Ok(det) => Some(det),
            Err(e) => {
                debug!("Inference failed: {}", e);
                Some(Detection::absent())
            }
        }
    }

    pub fn close(&mut self) {
        self.detector.close();
        self.frames.close();
    }
}
