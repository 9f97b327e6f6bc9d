// src/mission/mod.rs
//
// Segment executor. Owns the vehicle for one run:
//   Idle -> Connecting -> Ascending -> (Turning -> Advancing)* -> Landing -> Done
//
// Only a failed connect or takeoff ends the run early with an error. Every
// path that got the vehicle airborne goes through the landing ladder.

pub mod landing;

pub use landing::{safe_land, LandingMethod};

use crate::actuator::{ActuatorError, ActuatorPort};
use crate::command::{Command, CommandError, CommandExecutor};
use crate::detection::DetectionFeed;
use crate::engagement::Engagement;
use crate::events::{EventSink, MissionEvent};
use crate::heading::{current_yaw, normalize_yaw, HeadingController};
use crate::plan::{split_distance, Plan};
use crate::types::{Config, Detection, DetectionConfig, EngagementResult, MissionStatus};
use serde::Serialize;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionState {
    Idle,
    Connecting,
    Ascending,
    Turning,
    Advancing,
    Landing,
    Done,
}

#[derive(Debug, thiserror::Error)]
pub enum MissionError {
    #[error("unable to connect after {attempts} attempts: {source}")]
    Connect {
        attempts: u32,
        #[source]
        source: ActuatorError,
    },

    #[error("takeoff failed: {0}")]
    Takeoff(#[source] CommandError),
}

impl MissionError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Connect { .. } => 3,
            Self::Takeoff(_) => 5,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MissionReport {
    pub status: MissionStatus,
    pub reason: Option<String>,
    pub segments_flown: usize,
    pub engagements: Vec<EngagementResult>,
    pub landing: &'static str,
    pub expected_yaw: f64,
}

/// Why the segment loop stopped
#[derive(Debug, Clone, Copy, PartialEq)]
enum Outcome {
    Completed,
    LowBattery(u8),
    Interrupted,
}

#[derive(Debug, Default)]
struct Progress {
    expected_yaw: f64,
    segments_flown: usize,
    engagements: Vec<EngagementResult>,
}

pub struct MissionRunner {
    config: Config,
    drone: Box<dyn ActuatorPort>,
    feed: Option<DetectionFeed>,
    executor: CommandExecutor,
    heading: HeadingController,
    engagement: Engagement,
    abort: Arc<AtomicBool>,
    state: MissionState,
    stream_active: bool,
    progress: Progress,
}

impl MissionRunner {
    /// `feed` is `None` when detection is disabled for this run
    pub fn new(
        config: Config,
        drone: Box<dyn ActuatorPort>,
        feed: Option<DetectionFeed>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let executor = CommandExecutor::new(config.command.clone(), events);
        let heading = HeadingController::new(
            config.heading.clone(),
            config.motion.turn_settle_ms,
            executor.clone(),
        );
        let engagement = Engagement::new(&config, executor.clone(), heading.clone());

        Self {
            config,
            drone,
            feed,
            executor,
            heading,
            engagement,
            abort: Arc::new(AtomicBool::new(false)),
            state: MissionState::Idle,
            stream_active: false,
            progress: Progress::default(),
        }
    }

    /// Share an externally owned interrupt flag
    pub fn with_abort(mut self, abort: Arc<AtomicBool>) -> Self {
        self.abort = abort;
        self
    }

    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn state(&self) -> MissionState {
        self.state
    }

    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn transition(&mut self, to: MissionState) {
        if self.state == to {
            return;
        }
        debug!("state {:?} -> {:?}", self.state, to);
        self.executor.events().emit(MissionEvent::StateChanged {
            from: self.state,
            to,
        });
        self.state = to;
    }

    fn sleep_ms(ms: u64) {
        if ms > 0 {
            thread::sleep(Duration::from_millis(ms));
        }
    }

    // ========================================================================
    // RUN
    // ========================================================================

    pub fn run(&mut self, plan: &Plan) -> Result<MissionReport, MissionError> {
        info!("🚁 Mission starting: {} segment(s)", plan.segments.len());

        self.transition(MissionState::Connecting);
        if let Err(e) = self.connect() {
            error!("Unable to connect. Check vehicle Wi-Fi / power / other controller apps.");
            self.release();
            self.transition(MissionState::Done);
            return Err(e);
        }

        self.progress = Progress {
            expected_yaw: current_yaw(self.drone.as_mut()).unwrap_or(0.0),
            ..Default::default()
        };

        self.start_stream();

        let speed = self.config.flight.speed_cm_s;
        if let Err(e) = self.drone.set_speed(speed) {
            warn!("set_speed error: {}", e);
        }

        self.transition(MissionState::Ascending);
        info!("Takeoff");
        if let Err(e) = self.executor.execute(self.drone.as_mut(), Command::TakeOff) {
            error!("Takeoff failed: {}", e);
            if self.airborne() {
                self.land();
            }
            self.release();
            self.transition(MissionState::Done);
            return Err(MissionError::Takeoff(e));
        }
        Self::sleep_ms(self.config.flight.takeoff_settle_ms);

        let stabilize = self.config.flight.imu_stabilize_ms;
        if stabilize > 0 {
            info!("Hovering for IMU stabilization ({:.1}s)", stabilize as f64 / 1000.0);
            Self::sleep_ms(stabilize);
        }

        self.climb();
        self.start_feed();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.fly_segments(plan)));
        let (status, reason) = match outcome {
            Ok(Outcome::Completed) => {
                info!("Mission complete. Landing.");
                (MissionStatus::Completed, None)
            }
            Ok(Outcome::LowBattery(pct)) => (
                MissionStatus::AbortedLowBattery,
                Some(format!("battery at {}%", pct)),
            ),
            Ok(Outcome::Interrupted) => {
                error!("Interrupted - landing");
                (MissionStatus::AbortedError, Some("interrupted".to_string()))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Runtime error: {} - landing", message);
                (MissionStatus::AbortedError, Some(message))
            }
        };

        let landing = self.land();
        self.release();
        self.transition(MissionState::Done);

        self.executor.events().emit(MissionEvent::MissionFinished {
            status,
            reason: reason.clone(),
        });
        info!("Done: {}", status.as_str());

        let progress = std::mem::take(&mut self.progress);
        Ok(MissionReport {
            status,
            reason,
            segments_flown: progress.segments_flown,
            engagements: progress.engagements,
            landing: landing.as_str(),
            expected_yaw: progress.expected_yaw,
        })
    }

    // ========================================================================
    // SETUP
    // ========================================================================

    fn connect(&mut self) -> Result<u8, MissionError> {
        let attempts = self.config.connection.attempts.max(1);
        let backoff = self.config.connection.backoff_ms;
        let mut last_err = ActuatorError::NotConnected;

        for attempt in 1..=attempts {
            info!("Connecting (attempt {}/{})...", attempt, attempts);
            let linked = self
                .drone
                .connect()
                .and_then(|_| self.drone.battery_percent());
            match linked {
                Ok(pct) => {
                    info!("✓ Connected, battery {}%", pct);
                    return Ok(pct);
                }
                Err(e) => {
                    warn!("connect error: {}", e);
                    last_err = e;
                    if attempt < attempts {
                        Self::sleep_ms(backoff);
                    }
                }
            }
        }

        Err(MissionError::Connect {
            attempts,
            source: last_err,
        })
    }

    /// Video has to be flowing before takeoff; without it detection is off for the run
    fn start_stream(&mut self) {
        if self.feed.is_none() {
            return;
        }
        match self.drone.set_video_stream(true) {
            Ok(()) => self.stream_active = true,
            Err(e) => {
                warn!("streamon error - disabling detection: {}", e);
                if let Some(mut feed) = self.feed.take() {
                    feed.close();
                }
            }
        }
    }

    fn start_feed(&mut self) {
        let Some(feed) = self.feed.as_mut() else {
            info!("Detection disabled; flying plan only");
            return;
        };
        if let Err(e) = feed.start() {
            warn!("Detection feed failed to start - disabling detection: {:#}", e);
            if let Some(mut feed) = self.feed.take() {
                feed.close();
            }
        }
    }

    fn climb(&mut self) {
        let flight = &self.config.flight;
        let motion = &self.config.motion;
        let climb = flight
            .altitude_cm
            .saturating_sub(flight.takeoff_height_cm)
            .min(motion.max_move_cm);
        if climb == 0 {
            return;
        }

        let chunk = motion.climb_chunk_cm;
        let settle = motion.move_settle_ms;
        let mut remaining = climb;
        let mut chunk_idx = 0;
        while remaining > 0 {
            let step = if chunk == 0 { remaining } else { remaining.min(chunk) };
            chunk_idx += 1;
            if remaining > step {
                info!("    climb chunk {}: {} cm (rem {})", chunk_idx, step, remaining - step);
            }
            if let Err(e) = self.executor.execute(self.drone.as_mut(), Command::MoveUp(step)) {
                warn!("move_up({}) failed; continuing without additional climb: {}", step, e);
                break;
            }
            remaining -= step;
            Self::sleep_ms(settle);
        }
    }

    // ========================================================================
    // SEGMENTS
    // ========================================================================

    fn fly_segments(&mut self, plan: &Plan) -> Outcome {
        for (index, segment) in plan.segments.iter().enumerate() {
            if self.aborted() {
                return Outcome::Interrupted;
            }
            if let Some(pct) = self.battery_low() {
                return Outcome::LowBattery(pct);
            }

            self.executor.events().emit(MissionEvent::SegmentStarted {
                index,
                turn_signed_deg: segment.turn_signed_deg,
                dist_cm: segment.dist_cm,
            });

            if segment.turn_signed_deg != 0 && !self.turn(index, segment.turn_signed_deg) {
                continue;
            }

            self.transition(MissionState::Advancing);
            let motion = &self.config.motion;
            let (steps, leftover) = split_distance(
                segment.dist_cm,
                motion.min_move_cm,
                motion.forward_step_cm,
                motion.max_move_cm,
            );
            info!("[{}] forward total {} cm", index, segment.dist_cm);
            if leftover > 0 {
                debug!("[{}] dropping {} cm below the minimum move", index, leftover);
            }

            for step in steps {
                if self.aborted() {
                    return Outcome::Interrupted;
                }
                if !self.forward(index, step) {
                    break;
                }
                self.progress.expected_yaw = self
                    .heading
                    .correct_heading_if_needed(self.drone.as_mut(), self.progress.expected_yaw);
                self.check_for_target();
            }

            self.progress.segments_flown += 1;
            Self::sleep_ms(self.config.flight.pause_per_segment_ms);
        }
        Outcome::Completed
    }

    fn battery_low(&mut self) -> Option<u8> {
        let threshold = self.config.flight.low_battery_pct;
        match self.drone.battery_percent() {
            Ok(pct) if pct <= threshold => {
                error!("Low battery {}% - stop mission", pct);
                self.executor
                    .events()
                    .emit(MissionEvent::LowBattery { pct, threshold });
                Some(pct)
            }
            Ok(_) => None,
            Err(e) => {
                warn!("get_battery error: {}", e);
                None
            }
        }
    }

    /// Returns false when the segment should be skipped
    fn turn(&mut self, index: usize, turn_deg: i32) -> bool {
        self.transition(MissionState::Turning);
        info!("[{}] turn {:+} deg", index, turn_deg);

        let result = self.heading.rotate_signed(self.drone.as_mut(), turn_deg as f64);
        if result.is_ok() {
            self.progress.expected_yaw = normalize_yaw(self.progress.expected_yaw + turn_deg as f64);
        }
        if let Some(actual) = current_yaw(self.drone.as_mut()) {
            self.progress.expected_yaw = actual;
        }

        match result {
            Ok(_) => true,
            Err(e) => {
                warn!("[{}] turn failed; skipping segment: {}", index, e);
                false
            }
        }
    }

    fn forward(&mut self, index: usize, cm: u32) -> bool {
        let result = self.executor.execute(self.drone.as_mut(), Command::MoveForward(cm));
        let ok = result.is_ok();
        self.executor.events().emit(MissionEvent::ForwardStep {
            segment: index,
            cm,
            ok,
        });
        match result {
            Ok(_) => {
                Self::sleep_ms(self.config.motion.move_settle_ms);
                true
            }
            Err(e) => {
                warn!("move_forward({}) failed; skipping remaining distance: {}", cm, e);
                false
            }
        }
    }

    /// Hand control to the engagement episode on a fresh, confident sighting
    fn check_for_target(&mut self) {
        let max_age = Duration::from_millis(self.config.detection.max_age_ms);
        let Some(feed) = self.feed.as_mut() else {
            return;
        };
        let Some(seed) = feed.latest(max_age) else {
            return;
        };
        if !is_engageable(&seed, &self.config.detection) {
            return;
        }

        info!(
            "🔥 Target sighted: {} conf={:.2} dx={:+.0}",
            seed.label.as_deref().unwrap_or("?"),
            seed.confidence,
            seed.dx
        );
        let events = self.executor.events();
        events.emit(MissionEvent::TargetSighted {
            label: seed.label.clone().unwrap_or_default(),
            confidence: seed.confidence,
            dx: seed.dx,
        });

        let pre_episode_yaw = self.progress.expected_yaw;
        feed.pause();
        let result = self
            .engagement
            .run(self.drone.as_mut(), &mut *feed, &seed, &self.abort);
        if let Err(e) = feed.resume() {
            warn!("Detection feed failed to resume: {:#}", e);
        }

        if result.unretreated_cm > 0 {
            warn!(
                "Engagement left {} cm of forward travel unretreated",
                result.unretreated_cm
            );
        }

        self.progress.expected_yaw = if result.heading_restored {
            pre_episode_yaw
        } else {
            current_yaw(self.drone.as_mut()).unwrap_or(pre_episode_yaw)
        };
        self.progress.engagements.push(result);
    }

    // ========================================================================
    // SHUTDOWN
    // ========================================================================

    fn airborne(&mut self) -> bool {
        let tol = self.config.command.success_tolerance_cm;
        self.drone
            .telemetry()
            .height_cm
            .is_some_and(|h| h > tol)
    }

    fn land(&mut self) -> LandingMethod {
        self.transition(MissionState::Landing);
        safe_land(self.drone.as_mut(), &self.executor, &self.config.landing)
    }

    /// Stop detection, drop the video stream and close the link
    fn release(&mut self) {
        if let Some(mut feed) = self.feed.take() {
            feed.close();
        }
        if self.stream_active {
            if let Err(e) = self.drone.set_video_stream(false) {
                debug!("streamoff error: {}", e);
            }
            self.stream_active = false;
        }
        self.drone.disconnect();
    }
}

/// Present, above threshold and one of the configured classes
pub fn is_engageable(det: &Detection, config: &DetectionConfig) -> bool {
    if !det.present || det.confidence < config.confidence_threshold {
        return false;
    }
    if config.classes.is_empty() {
        return true;
    }
    config.classes.iter().any(|class| det.matches_label(class))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{Fault, SimDrone};
    use crate::detection::{DetectionPort, Sensor, SyntheticFrames};
    use crate::events::EventBus;
    use crate::types::{Frame, HoldPolicy, Segment};

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.flight.takeoff_settle_ms = 0;
        config.flight.imu_stabilize_ms = 0;
        config.motion.turn_settle_ms = 0;
        config.motion.move_settle_ms = 0;
        config.command.retry_sleep_ms = 0;
        config.command.imu_retry_sleep_ms = 0;
        config.command.resync_settle_ms = 0;
        config.connection.backoff_ms = 0;
        config.heading.open_loop_recover_ms = 0;
        config.heading.turn_chunk_deg = 0;
        config.landing.descent_ms = 0;
        config.engagement.poll_interval_ms = 1;
        config.engagement.hold_poll_ms = 1;
        config.engagement.approach_lost_ms = 0;
        config.engagement.target_lost_ms = 10;
        config
    }

    fn plan(segments: &[(i32, u32)]) -> Plan {
        Plan {
            segments: segments
                .iter()
                .map(|&(turn_signed_deg, dist_cm)| Segment {
                    turn_signed_deg,
                    dist_cm,
                })
                .collect(),
            meta: Default::default(),
        }
    }

    fn runner(config: Config, drone: &SimDrone, feed: Option<DetectionFeed>) -> (MissionRunner, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(4096));
        let sink: Arc<dyn EventSink> = bus.clone();
        (
            MissionRunner::new(config, Box::new(drone.clone()), feed, sink),
            bus,
        )
    }

    fn motions(drone: &SimDrone) -> Vec<String> {
        drone
            .commands()
            .into_iter()
            .filter(|c| ["forward", "back", "cw", "ccw"].iter().any(|p| c.starts_with(p)))
            .collect()
    }

    #[test]
    fn test_nominal_mission() {
        let drone = SimDrone::new();
        let (mut runner, bus) = runner(fast_config(), &drone, None);

        let report = runner.run(&plan(&[(0, 100), (90, 50)])).unwrap();
        assert_eq!(report.status, MissionStatus::Completed);
        assert_eq!(report.segments_flown, 2);
        assert_eq!(report.expected_yaw, 90.0);
        assert_eq!(report.landing, "land");
        assert_eq!(
            motions(&drone),
            vec!["forward 60", "forward 40", "ccw 90", "forward 50"]
        );
        assert_eq!(drone.count("up"), 2);
        assert!(!drone.is_flying());
        assert!(!drone.is_connected());
        assert_eq!(runner.state(), MissionState::Done);

        let states: Vec<MissionState> = bus
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                MissionEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                MissionState::Connecting,
                MissionState::Ascending,
                MissionState::Advancing,
                MissionState::Turning,
                MissionState::Advancing,
                MissionState::Landing,
                MissionState::Done,
            ]
        );
    }

    #[test]
    fn test_low_battery_aborts_before_next_segment() {
        // connect, segment 1, segment 2
        let drone = SimDrone::new().with_battery_script([100, 50, 18]);
        let (mut runner, _) = runner(fast_config(), &drone, None);

        let report = runner.run(&plan(&[(0, 100), (90, 50)])).unwrap();
        assert_eq!(report.status, MissionStatus::AbortedLowBattery);
        assert_eq!(report.status.exit_code(), 4);
        assert_eq!(report.segments_flown, 1);
        assert_eq!(motions(&drone), vec!["forward 60", "forward 40"]);
        assert!(!drone.is_flying());
    }

    #[test]
    fn test_connect_failure() {
        let drone = SimDrone::new();
        drone.inject_times("connect", Fault::Fail("no route to host".to_string()), 4);
        let (mut runner, _) = runner(fast_config(), &drone, None);

        let err = runner.run(&plan(&[(0, 100)])).unwrap_err();
        assert!(matches!(err, MissionError::Connect { attempts: 4, .. }));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(drone.count("takeoff"), 0);
    }

    #[test]
    fn test_connect_retries_then_flies() {
        let drone = SimDrone::new();
        drone.inject_times("connect", Fault::Timeout, 2);
        let (mut runner, _) = runner(fast_config(), &drone, None);

        let report = runner.run(&plan(&[(0, 40)])).unwrap();
        assert_eq!(report.status, MissionStatus::Completed);
        assert_eq!(drone.count("connect"), 3);
    }

    #[test]
    fn test_takeoff_failure() {
        let drone = SimDrone::new();
        drone.inject_times("takeoff", Fault::Fail("error Motor stop".to_string()), 3);
        let (mut runner, _) = runner(fast_config(), &drone, None);

        let err = runner.run(&plan(&[(0, 100)])).unwrap_err();
        assert!(matches!(err, MissionError::Takeoff(_)));
        assert_eq!(err.exit_code(), 5);
        assert_eq!(drone.count("forward"), 0);
        assert_eq!(drone.count("land"), 0);
        assert!(!drone.is_connected());
    }

    #[test]
    fn test_forward_failure_skips_rest_of_segment() {
        let drone = SimDrone::new();
        drone.inject_times("move_forward", Fault::Fail("error Motor stop".to_string()), 3);
        let (mut runner, _) = runner(fast_config(), &drone, None);

        let report = runner.run(&plan(&[(0, 100), (90, 50)])).unwrap();
        assert_eq!(report.status, MissionStatus::Completed);
        // three failed attempts at 60, then segment two
        assert_eq!(drone.count("forward 60"), 3);
        assert_eq!(drone.count("forward 40"), 0);
        assert_eq!(drone.count("forward 50"), 1);
    }

    #[test]
    fn test_drift_is_corrected_between_steps() {
        let drone = SimDrone::new().with_yaw_drift_per_move(-6.0);
        let (mut runner, _) = runner(fast_config(), &drone, None);

        let report = runner.run(&plan(&[(0, 120)])).unwrap();
        assert_eq!(report.status, MissionStatus::Completed);
        assert_eq!(motions(&drone), vec!["forward 60", "ccw 6", "forward 60", "ccw 6"]);
        assert_eq!(drone.yaw(), 0.0);
        assert_eq!(report.expected_yaw, 0.0);
    }

    #[test]
    fn test_interrupt_lands() {
        let drone = SimDrone::new();
        let (mut runner, bus) = runner(fast_config(), &drone, None);
        runner.abort_handle().store(true, Ordering::SeqCst);

        let report = runner.run(&plan(&[(0, 100)])).unwrap();
        assert_eq!(report.status, MissionStatus::AbortedError);
        assert_eq!(report.reason.as_deref(), Some("interrupted"));
        assert_eq!(drone.count("forward"), 0);
        assert!(!drone.is_flying());
        assert!(bus.drain().iter().any(|e| matches!(
            e,
            MissionEvent::MissionFinished {
                status: MissionStatus::AbortedError,
                ..
            }
        )));
    }

    /// Sees the target only while the vehicle faces its starting heading
    /// and has made at most `max_forward` forward moves
    struct VisibleAtHeading {
        drone: SimDrone,
        yaw: f64,
        dx: f32,
        box_width: f32,
        max_forward: usize,
    }

    impl DetectionPort for VisibleAtHeading {
        fn infer(&mut self, frame: &Frame) -> anyhow::Result<Detection> {
            if (self.drone.yaw() - self.yaw).abs() > 1.0
                || self.drone.count("forward") > self.max_forward
            {
                return Ok(Detection::absent());
            }
            let cx = frame.width as f32 / 2.0 + self.dx;
            let cy = frame.height as f32 / 2.0;
            let half = self.box_width / 2.0;
            Ok(Detection::from_bbox(
                [cx - half, cy - half, cx + half, cy + half],
                0.9,
                Some("fire".to_string()),
                frame.width,
                frame.height,
            ))
        }
    }

    fn feed_for(drone: &SimDrone, dx: f32, box_width: f32) -> DetectionFeed {
        feed_until(drone, dx, box_width, usize::MAX)
    }

    fn feed_until(drone: &SimDrone, dx: f32, box_width: f32, max_forward: usize) -> DetectionFeed {
        let sensor = Sensor::new(
            Box::new(SyntheticFrames::new(960, 720)),
            Box::new(VisibleAtHeading {
                drone: drone.clone(),
                yaw: drone.yaw(),
                dx,
                box_width,
                max_forward,
            }),
        );
        DetectionFeed::new(sensor, Duration::from_millis(20))
    }

    #[test]
    fn test_lost_target_keeps_pre_episode_heading() {
        let mut config = fast_config();
        // Give the feed time to publish before the post-step check
        config.motion.move_settle_ms = 60;
        let drone = SimDrone::new();
        // Right of centre and already closer than the standoff
        let feed = feed_for(&drone, 240.0, 104.0);
        let (mut runner, _) = runner(config, &drone, Some(feed));

        let report = runner.run(&plan(&[(0, 60)])).unwrap();
        assert_eq!(report.status, MissionStatus::Completed);
        assert_eq!(report.engagements.len(), 1);
        let result = report.engagements[0];
        assert!(!result.standoff_reached);
        assert!(result.heading_restored);
        assert_eq!(result.total_forward_cm, 0);
        assert_eq!(report.expected_yaw, 0.0);
        assert_eq!(motions(&drone), vec!["forward 60", "cw 21", "ccw 21"]);
        assert!(drone.count("streamon") == 1 && drone.count("streamoff") == 1);
        assert!(!drone.video_on());
    }

    #[test]
    fn test_engagement_at_standoff_holds_then_resumes() {
        let mut config = fast_config();
        config.motion.move_settle_ms = 60;
        config.engagement.hold = HoldPolicy::Timed;
        config.engagement.hold_max_ms = 20;
        let drone = SimDrone::new();
        let feed = feed_for(&drone, 0.0, 52.0);
        let (mut runner, _) = runner(config, &drone, Some(feed));

        let report = runner.run(&plan(&[(0, 60), (90, 20)])).unwrap();
        assert_eq!(report.status, MissionStatus::Completed);
        assert_eq!(report.engagements.len(), 1);
        assert!(report.engagements[0].standoff_reached);
        assert_eq!(report.engagements[0].total_forward_cm, 0);
        assert_eq!(motions(&drone), vec!["forward 60", "ccw 90", "forward 20"]);
        assert_eq!(report.expected_yaw, 90.0);
    }

    #[test]
    fn test_segment_resumes_after_engagement() {
        let mut config = fast_config();
        config.motion.move_settle_ms = 60;
        let drone = SimDrone::new();
        // Off to the right and inside the standoff, seen after the first step only
        let feed = feed_until(&drone, 240.0, 104.0, 1);
        let (mut runner, _) = runner(config, &drone, Some(feed));

        let report = runner.run(&plan(&[(0, 180)])).unwrap();
        assert_eq!(report.status, MissionStatus::Completed);
        assert_eq!(report.segments_flown, 1);
        assert_eq!(report.engagements.len(), 1);
        assert!(report.engagements[0].heading_restored);
        assert_eq!(report.expected_yaw, 0.0);
        assert_eq!(
            motions(&drone),
            vec!["forward 60", "cw 21", "ccw 21", "forward 60", "forward 60"]
        );
    }

    #[test]
    fn test_expected_yaw_follows_commanded_turn_without_telemetry() {
        let drone = SimDrone::new().without_telemetry();
        let (mut runner, _) = runner(fast_config(), &drone, None);

        // Below the turn dead zone, so nothing is sent
        let report = runner.run(&plan(&[(1, 40)])).unwrap();
        assert_eq!(report.status, MissionStatus::Completed);
        assert_eq!(report.expected_yaw, 1.0);
        assert_eq!(motions(&drone), vec!["forward 40"]);
    }

    #[test]
    fn test_engageable_filter() {
        let config = DetectionConfig::default();
        let mut det = Detection::from_bbox([0.0, 0.0, 10.0, 10.0], 0.9, Some("fire".into()), 100, 100);
        assert!(is_engageable(&det, &config));
        det.confidence = 0.2;
        assert!(!is_engageable(&det, &config));
        det.confidence = 0.9;
        det.label = Some("smoke".into());
        assert!(!is_engageable(&det, &config));
        assert!(!is_engageable(&Detection::absent(), &config));
    }
}
