// src/detection/yolo.rs
//
// Single-output YOLOv8 detector. Pre/post-processing is plain Rust; the
// ONNX Runtime session is only built with the `onnx` feature.

use super::DetectionPort;
use crate::types::{Detection, DetectionConfig, Frame};
use anyhow::Result;
use tracing::{debug, info};

#[cfg(feature = "onnx")]
use anyhow::Context;
#[cfg(feature = "onnx")]
use ort::session::{builder::GraphOptimizationLevel, Session};

/// Model input tensor plus the transform needed to map boxes back
#[derive(Debug, Clone)]
pub struct Letterbox {
    pub input: Vec<f32>,
    pub size: usize,
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

/// Candidate box in frame coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct BestBox {
    pub bbox: [f32; 4], // [x1, y1, x2, y2]
    pub confidence: f32,
    pub class_id: usize,
}

/// Fit an RGB frame into a square canvas (gray padding), normalized CHW
pub fn letterbox(src: &[u8], src_w: usize, src_h: usize, size: usize) -> Letterbox {
    let scale = (size as f32 / src_w as f32).min(size as f32 / src_h as f32);
    let scaled_w = ((src_w as f32 * scale) as usize).clamp(1, size);
    let scaled_h = ((src_h as f32 * scale) as usize).clamp(1, size);
    let pad_x = (size - scaled_w) as f32 / 2.0;
    let pad_y = (size - scaled_h) as f32 / 2.0;

    let resized = resize_bilinear(src, src_w, src_h, scaled_w, scaled_h);

    let mut canvas = vec![114u8; size * size * 3];
    for y in 0..scaled_h {
        let dst_y = y + pad_y as usize;
        let src_row = y * scaled_w * 3;
        let dst_row = (dst_y * size + pad_x as usize) * 3;
        canvas[dst_row..dst_row + scaled_w * 3]
            .copy_from_slice(&resized[src_row..src_row + scaled_w * 3]);
    }

    // HWC [0, 255] -> CHW [0, 1]
    let plane = size * size;
    let mut input = vec![0.0f32; 3 * plane];
    for (i, px) in canvas.chunks_exact(3).enumerate() {
        for c in 0..3 {
            input[c * plane + i] = px[c] as f32 / 255.0;
        }
    }

    Letterbox {
        input,
        size,
        scale,
        pad_x,
        pad_y,
    }
}

pub fn resize_bilinear(src: &[u8], src_w: usize, src_h: usize, dst_w: usize, dst_h: usize) -> Vec<u8> {
    let mut dst = vec![0u8; dst_h * dst_w * 3];
    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    for dy in 0..dst_h {
        let sy = dy as f32 * y_ratio;
        let sy0 = (sy.floor() as usize).min(src_h - 1);
        let sy1 = (sy0 + 1).min(src_h - 1);
        let fy = sy - sy0 as f32;

        for dx in 0..dst_w {
            let sx = dx as f32 * x_ratio;
            let sx0 = (sx.floor() as usize).min(src_w - 1);
            let sx1 = (sx0 + 1).min(src_w - 1);
            let fx = sx - sx0 as f32;

            for c in 0..3 {
                let p00 = src[(sy0 * src_w + sx0) * 3 + c] as f32;
                let p10 = src[(sy0 * src_w + sx1) * 3 + c] as f32;
                let p01 = src[(sy1 * src_w + sx0) * 3 + c] as f32;
                let p11 = src[(sy1 * src_w + sx1) * 3 + c] as f32;

                let val = p00 * (1.0 - fx) * (1.0 - fy)
                    + p10 * fx * (1.0 - fy)
                    + p01 * (1.0 - fx) * fy
                    + p11 * fx * fy;

                dst[(dy * dst_w + dx) * 3 + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    dst
}

/// Highest-confidence prediction of a `[1, 4 + classes, N]` output.
///
/// Only classes in `wanted` count (empty = all). Boxes come back in frame
/// coordinates.
pub fn decode_best(
    output: &[f32],
    num_classes: usize,
    wanted: &[usize],
    conf_thresh: f32,
    letterbox: &Letterbox,
) -> Option<BestBox> {
    let rows = 4 + num_classes;
    if num_classes == 0 || output.len() < rows {
        return None;
    }
    let n = output.len() / rows;
    let mut best: Option<BestBox> = None;

    for i in 0..n {
        let (class_id, confidence) = (0..num_classes)
            .filter(|c| wanted.is_empty() || wanted.contains(c))
            .map(|c| (c, output[n * (4 + c) + i]))
            .fold((0, f32::MIN), |acc, cur| if cur.1 > acc.1 { cur } else { acc });

        if confidence < conf_thresh || best.as_ref().is_some_and(|b| b.confidence >= confidence) {
            continue;
        }

        let cx = output[i];
        let cy = output[n + i];
        let w = output[n * 2 + i];
        let h = output[n * 3 + i];
        let unpad = |v: f32, pad: f32| (v - pad) / letterbox.scale;

        best = Some(BestBox {
            bbox: [
                unpad(cx - w / 2.0, letterbox.pad_x),
                unpad(cy - h / 2.0, letterbox.pad_y),
                unpad(cx + w / 2.0, letterbox.pad_x),
                unpad(cy + h / 2.0, letterbox.pad_y),
            ],
            confidence,
            class_id,
        });
    }

    best
}

/// Indexes of `class_names` that appear in `classes` (case-insensitive)
pub fn wanted_classes(class_names: &[String], classes: &[String]) -> Vec<usize> {
    class_names
        .iter()
        .enumerate()
        .filter(|(_, name)| classes.iter().any(|c| c.eq_ignore_ascii_case(name)))
        .map(|(i, _)| i)
        .collect()
}

pub struct YoloDetector {
    #[cfg(feature = "onnx")]
    session: Session,
    class_names: Vec<String>,
    wanted: Vec<usize>,
    confidence_threshold: f32,
    input_size: usize,
}

impl YoloDetector {
    pub fn new(config: &DetectionConfig) -> Result<Self> {
        info!("Loading YOLO model: {}", config.model_path);

        let wanted = wanted_classes(&config.class_names, &config.classes);
        if !config.classes.is_empty() && wanted.is_empty() {
            anyhow::bail!(
                "none of the target classes {:?} are in the model's class list",
                config.classes
            );
        }

        let session = Self::load_session(config)?;
        #[cfg(not(feature = "onnx"))]
        let _ = session;

        info!("✓ YOLO detector initialized ({} classes)", config.class_names.len());
        Ok(Self {
            #[cfg(feature = "onnx")]
            session,
            class_names: config.class_names.clone(),
            wanted,
            confidence_threshold: config.confidence_threshold,
            input_size: config.input_size,
        })
    }

    #[cfg(feature = "onnx")]
    fn load_session(config: &DetectionConfig) -> Result<Session> {
        Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.intra_threads.max(1))?
            .commit_from_file(&config.model_path)
            .context("Failed to load model")
    }

    #[cfg(not(feature = "onnx"))]
    fn load_session(config: &DetectionConfig) -> Result<()> {
        anyhow::bail!(
            "built without the `onnx` feature; cannot load {}",
            config.model_path
        )
    }

    #[cfg(feature = "onnx")]
    fn run(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let shape = [1, 3, self.input_size, self.input_size];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.to_vec().into_boxed_slice()))?;

        let outputs = self.session.run(ort::inputs!["images" => input_value])?;
        let output = &outputs[0];
        let (_, data) = output.try_extract_tensor::<f32>()?;

        Ok(data.to_vec())
    }

    #[cfg(not(feature = "onnx"))]
    fn run(&mut self, _input: &[f32]) -> Result<Vec<f32>> {
        anyhow::bail!("built without the `onnx` feature")
    }
}

impl DetectionPort for YoloDetector {
    fn infer(&mut self, frame: &Frame) -> Result<Detection> {
        if frame.data.len() != frame.width * frame.height * 3 {
            anyhow::bail!(
                "frame buffer is {} bytes, expected {}x{} RGB",
                frame.data.len(),
                frame.width,
                frame.height
            );
        }

        let boxed = letterbox(&frame.data, frame.width, frame.height, self.input_size);
        let output = self.run(&boxed.input)?;
        let best = decode_best(
            &output,
            self.class_names.len(),
            &self.wanted,
            self.confidence_threshold,
            &boxed,
        );

        Ok(match best {
            Some(b) => {
                debug!("Best box {:?} conf {:.2}", b.bbox, b.confidence);
                Detection::from_bbox(
                    b.bbox,
                    b.confidence,
                    self.class_names.get(b.class_id).cloned(),
                    frame.width,
                    frame.height,
                )
            }
            None => Detection::absent(),
        })
    }
}
