// src/detection/capture.rs
//
// Vehicle video stream as a frame source. Decoding goes through OpenCV
// (feature `capture`); the stream is opened on the first frame request so
// construction never blocks on the network.

use super::FrameSource;
use crate::types::Frame;
use anyhow::Result;
use tracing::info;

#[cfg(feature = "capture")]
use opencv::{
    core::{Mat, Size},
    imgproc,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
};
#[cfg(feature = "capture")]
use std::time::Instant;

pub struct VideoStream {
    url: String,
    width: usize,
    height: usize,
    #[cfg(feature = "capture")]
    cap: Option<VideoCapture>,
    #[cfg(feature = "capture")]
    started: Instant,
}

impl VideoStream {
    /// Frames are resized to `width` x `height` when the stream differs
    #[cfg(feature = "capture")]
    pub fn new(url: &str, width: u32, height: u32) -> Result<Self> {
        Ok(Self {
            url: url.to_string(),
            width: width as usize,
            height: height as usize,
            cap: None,
            started: Instant::now(),
        })
    }

    #[cfg(not(feature = "capture"))]
    pub fn new(url: &str, _width: u32, _height: u32) -> Result<Self> {
        anyhow::bail!("built without the `capture` feature; cannot read {}", url)
    }

    #[cfg(feature = "capture")]
    fn open(&mut self) -> Result<&mut VideoCapture> {
        if self.cap.is_none() {
            info!("Opening video stream: {}", self.url);
            let cap = VideoCapture::from_file(&self.url, videoio::CAP_FFMPEG)?;
            if !cap.is_opened()? {
                anyhow::bail!("Failed to open video stream {}", self.url);
            }
            let width = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH)? as i32;
            let height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)? as i32;
            info!("✓ Video stream open: {}x{}", width, height);
            self.cap = Some(cap);
        }
        self.cap
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("video stream not open"))
    }
}

impl FrameSource for VideoStream {
    #[cfg(feature = "capture")]
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let (width, height) = (self.width, self.height);
        let cap = self.open()?;

        let mut mat = Mat::default();
        if !VideoCaptureTrait::read(cap, &mut mat)? || mat.empty() {
            return Ok(None);
        }

        let mut rgb = Mat::default();
        imgproc::cvt_color(&mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0)?;

        if rgb.cols() as usize != width || rgb.rows() as usize != height {
            let mut resized = Mat::default();
            imgproc::resize(
                &rgb,
                &mut resized,
                Size::new(width as i32, height as i32),
                0.0,
                0.0,
                imgproc::INTER_LINEAR,
            )?;
            rgb = resized;
        }

        Ok(Some(Frame {
            data: rgb.data_bytes()?.to_vec(),
            width,
            height,
            timestamp_ms: self.started.elapsed().as_secs_f64() * 1000.0,
        }))
    }

    #[cfg(not(feature = "capture"))]
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let _ = (self.width, self.height);
        anyhow::bail!("built without the `capture` feature")
    }

    fn close(&mut self) {
        #[cfg(feature = "capture")]
        if let Some(mut cap) = self.cap.take() {
            let _ = VideoCaptureTrait::release(&mut cap);
        }
        info!("Video stream {} released", self.url);
    }
}
