// src/detection/feed.rs
//
// Background poller. One thread pulls frames, runs inference and replaces a
// single "latest detection" slot; readers take a copy. There is no queue:
// the newest result always wins.

use super::Sensor;
use crate::engagement::TargetSensor;
use crate::types::Detection;
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const STOP_CHECK: Duration = Duration::from_millis(10);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct DetectionFeed {
    sensor: Arc<Mutex<Sensor>>,
    slot: Arc<Mutex<Option<Detection>>>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    interval: Duration,
}

impl DetectionFeed {
    /// `interval` is clamped to [20ms, 500ms]
    pub fn new(sensor: Sensor, interval: Duration) -> Self {
        Self {
            sensor: Arc::new(Mutex::new(sensor)),
            slot: Arc::new(Mutex::new(None)),
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
            interval: interval.clamp(Duration::from_millis(20), Duration::from_millis(500)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        self.stop.store(false, Ordering::SeqCst);

        let sensor = Arc::clone(&self.sensor);
        let slot = Arc::clone(&self.slot);
        let stop = Arc::clone(&self.stop);
        let interval = self.interval;

        let handle = thread::Builder::new()
            .name("detection-feed".to_string())
            .spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    let started = Instant::now();
                    let sample = lock(&sensor).sample();
                    if let Some(det) = sample {
                        *lock(&slot) = Some(det);
                    }

                    // Sleep out the rest of the period in short slices so pause() stays quick
                    while started.elapsed() < interval && !stop.load(Ordering::SeqCst) {
                        thread::sleep(STOP_CHECK.min(interval.saturating_sub(started.elapsed())));
                    }
                }
            })
            .context("Failed to spawn detection feed")?;

        self.worker = Some(handle);
        info!("✓ Detection feed running every {:?}", self.interval);
        Ok(())
    }

    /// Stop polling; the sensor is kept for `resume`
    pub fn pause(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
            debug!("Detection feed paused");
        }
    }

    pub fn resume(&mut self) -> Result<()> {
        self.start()
    }

    /// Latest detection if it is no older than `max_age`; `None` means no information
    pub fn latest(&self, max_age: Duration) -> Option<Detection> {
        lock(&self.slot)
            .as_ref()
            .filter(|det| det.age() <= max_age)
            .cloned()
    }

    /// Sample synchronously, also refreshing the slot
    pub fn poll_now(&self) -> Detection {
        match lock(&self.sensor).sample() {
            Some(det) => {
                *lock(&self.slot) = Some(det.clone());
                det
            }
            None => Detection::absent(),
        }
    }

    pub fn close(&mut self) {
        self.pause();
        lock(&self.sensor).close();
        *lock(&self.slot) = None;
        info!("Detection feed closed");
    }
}

impl TargetSensor for DetectionFeed {
    fn poll(&mut self) -> Detection {
        self.poll_now()
    }
}

impl Drop for DetectionFeed {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::scripted::{ScriptEntry, ScriptedDetector, SyntheticFrames};
    use crate::detection::{DetectionPort, FrameSource};
    use crate::types::Frame;

    fn fire_from(from: u64) -> ScriptEntry {
        ScriptEntry {
            from,
            to: u64::MAX,
            dx: 0.0,
            dy: 0.0,
            box_width: 40.0,
            box_height: None,
            confidence: 0.9,
            label: Some("fire".to_string()),
        }
    }

    fn feed(entries: Vec<ScriptEntry>) -> DetectionFeed {
        let sensor = Sensor::new(
            Box::new(SyntheticFrames::new(960, 720)),
            Box::new(ScriptedDetector::new(entries)),
        );
        DetectionFeed::new(sensor, Duration::from_millis(20))
    }

    #[test]
    fn test_latest_respects_max_age() {
        let feed = feed(vec![fire_from(0)]);
        assert!(feed.latest(Duration::from_secs(1)).is_none());

        let det = feed.poll_now();
        assert!(det.present);
        assert!(feed.latest(Duration::from_secs(1)).is_some());

        thread::sleep(Duration::from_millis(30));
        assert!(feed.latest(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_background_polling_and_pause() {
        let mut feed = feed(vec![fire_from(3)]);
        feed.start().unwrap();
        assert!(feed.is_running());

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seen = None;
        while Instant::now() < deadline {
            if let Some(det) = feed.latest(Duration::from_millis(500)).filter(|d| d.present) {
                seen = Some(det);
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(seen.is_some());

        feed.pause();
        assert!(!feed.is_running());
        feed.resume().unwrap();
        assert!(feed.is_running());
        feed.close();
        assert!(!feed.is_running());
        assert!(feed.latest(Duration::from_secs(10)).is_none());
    }

    struct Broken;

    impl DetectionPort for Broken {
        fn infer(&mut self, _frame: &Frame) -> anyhow::Result<Detection> {
            anyhow::bail!("model exploded")
        }
    }

    struct NoFrames;

    impl FrameSource for NoFrames {
        fn next_frame(&mut self) -> anyhow::Result<Option<Frame>> {
            Ok(None)
        }
    }

    #[test]
    fn test_failures_read_as_no_detection() {
        let feed = DetectionFeed::new(
            Sensor::new(Box::new(SyntheticFrames::new(64, 48)), Box::new(Broken)),
            Duration::from_millis(20),
        );
        let det = feed.poll_now();
        assert!(!det.present);
        assert!(feed.latest(Duration::from_secs(1)).is_some_and(|d| !d.present));

        let feed = DetectionFeed::new(
            Sensor::new(Box::new(NoFrames), Box::new(ScriptedDetector::new(vec![]))),
            Duration::from_millis(20),
        );
        assert!(!feed.poll_now().present);
        assert!(feed.latest(Duration::from_secs(1)).is_none());
    }
}
