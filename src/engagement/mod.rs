// src/engagement/mod.rs
//
// Target engagement episode:
//   Plan -> YawCenter -> Approach -> Hold | SkipHold -> Retreat -> RestoreHeading -> Done
//
// An episode never fails upward. Every step failure ends the current phase
// early and the episode still retreats and restores heading.

pub mod geometry;

pub use geometry::Camera;

use crate::actuator::ActuatorPort;
use crate::command::{Command, CommandExecutor};
use crate::events::MissionEvent;
use crate::heading::{current_yaw, normalize_yaw, HeadingController};
use crate::types::{
    Config, Detection, EngagementConfig, EngagementResult, HoldPolicy, MotionConfig, TargetSpec,
};
use geometry::retreat_chunks;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Synchronous detection source used while the episode owns the camera
pub trait TargetSensor {
    fn poll(&mut self) -> Detection;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementPhase {
    Plan,
    YawCenter,
    Approach,
    Hold,
    SkipHold,
    Retreat,
    RestoreHeading,
    Done,
}

#[derive(Debug, Default, Clone, Copy)]
struct Approach {
    reached: bool,
    visible: bool,
    total_forward_cm: u32,
    last_seen: Option<Instant>,
}

pub struct Engagement {
    config: EngagementConfig,
    motion: MotionConfig,
    camera: Camera,
    targets: Config,
    executor: CommandExecutor,
    heading: HeadingController,
}

impl Engagement {
    pub fn new(config: &Config, executor: CommandExecutor, heading: HeadingController) -> Self {
        Self {
            config: config.engagement.clone(),
            motion: config.motion.clone(),
            camera: Camera::from_config(&config.detection),
            targets: config.clone(),
            executor,
            heading,
        }
    }

    fn enter(&self, phase: EngagementPhase) {
        info!(target: "engagement", "→ {:?}", phase);
        self.executor
            .events()
            .emit(MissionEvent::EngagementPhase { phase });
    }

    fn sleep_ms(ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    /// Run one episode seeded with `seed`
    pub fn run(
        &self,
        drone: &mut dyn ActuatorPort,
        sensor: &mut dyn TargetSensor,
        seed: &Detection,
        abort: &AtomicBool,
    ) -> EngagementResult {
        self.enter(EngagementPhase::Plan);

        let wanted = seed
            .label
            .as_deref()
            .unwrap_or(&self.config.generic_target)
            .to_lowercase();
        let Some((spec_label, spec)) = self.targets.target_spec(&wanted) else {
            info!(target: "engagement", "No calibration for target '{}'; skipping engagement", wanted);
            return self.finish(EngagementResult {
                heading_restored: true,
                ..Default::default()
            });
        };
        info!(
            target: "engagement",
            "Engaging target '{}' (calibration '{}', conf={:.2})",
            wanted, spec_label, seed.confidence
        );

        let plan_det = if seed.matches_label(&wanted) && seed.bbox.is_some() {
            Some(seed.clone())
        } else {
            self.confirm(sensor, &wanted)
        };
        let Some(plan_det) = plan_det else {
            info!(target: "engagement", "Unable to confirm target for planning; aborting engagement");
            return self.finish(EngagementResult {
                heading_restored: true,
                ..Default::default()
            });
        };

        let initial_yaw = current_yaw(drone);

        self.enter(EngagementPhase::YawCenter);
        self.yaw_to_center(drone, &plan_det);

        self.enter(EngagementPhase::Approach);
        let approach = self.approach(drone, sensor, &wanted, &plan_det, &spec, abort);

        let lost_grace = Duration::from_millis(self.config.approach_lost_ms);
        let still_visible = approach.visible
            || approach
                .last_seen
                .is_some_and(|seen| seen.elapsed() <= lost_grace);

        if abort.load(Ordering::SeqCst) {
            warn!(target: "engagement", "Interrupted; leaving {} cm unretreated", approach.total_forward_cm);
            return self.finish(EngagementResult {
                standoff_reached: approach.reached,
                target_visible_on_finish: approach.visible,
                total_forward_cm: approach.total_forward_cm,
                heading_restored: false,
                unretreated_cm: approach.total_forward_cm,
            });
        }

        if approach.reached && still_visible {
            self.enter(EngagementPhase::Hold);
            self.hold(drone, sensor, &wanted, abort);
        } else {
            self.enter(EngagementPhase::SkipHold);
            if approach.reached {
                info!(target: "engagement", "Standoff reached but target not visible; skipping hold");
            } else {
                info!(target: "engagement", "Unable to reach desired distance; skipping hold");
            }
        }

        self.enter(EngagementPhase::Retreat);
        let unretreated_cm = self.retreat(drone, approach.total_forward_cm);

        self.enter(EngagementPhase::RestoreHeading);
        let heading_restored = self.restore_heading(drone, initial_yaw);

        self.finish(EngagementResult {
            standoff_reached: approach.reached,
            target_visible_on_finish: approach.visible,
            total_forward_cm: approach.total_forward_cm,
            heading_restored,
            unretreated_cm,
        })
    }

    fn finish(&self, result: EngagementResult) -> EngagementResult {
        self.enter(EngagementPhase::Done);
        info!(
            target: "engagement",
            "Episode done: standoff={} visible={} forward={}cm restored={} unretreated={}cm",
            result.standoff_reached,
            result.target_visible_on_finish,
            result.total_forward_cm,
            result.heading_restored,
            result.unretreated_cm
        );
        self.executor
            .events()
            .emit(MissionEvent::EngagementFinished { result });
        result
    }

    /// Re-poll for an on-label detection with a box
    fn confirm(&self, sensor: &mut dyn TargetSensor, label: &str) -> Option<Detection> {
        let deadline = Instant::now() + Duration::from_millis(self.config.confirm_timeout_ms);
        loop {
            let det = sensor.poll();
            if det.matches_label(label) && det.bbox.is_some() {
                return Some(det);
            }
            if Instant::now() >= deadline {
                return None;
            }
            Self::sleep_ms(self.config.poll_interval_ms);
        }
    }

    fn yaw_to_center(&self, drone: &mut dyn ActuatorPort, det: &Detection) {
        let bearing = self.camera.pixels_to_yaw_deg(det.dx as f64);
        let threshold = self.heading.min_turn_deg().max(1.0);
        if bearing.round().abs() < threshold {
            return;
        }
        // Target right of centre means a clockwise (negative) turn
        info!(target: "engagement", "Yaw to center target by {:+.0} deg", -bearing);
        if let Err(e) = self.heading.rotate_signed(drone, -bearing) {
            warn!(target: "engagement", "Centering turn failed: {}", e);
        }
    }

    /// Forward step toward the standoff, bounded by the approach step and actuator limits
    fn approach_step(&self, remaining_cm: u32) -> u32 {
        let limit = self
            .config
            .forward_step_cm
            .min(self.motion.max_move_cm)
            .max(self.motion.min_move_cm);
        remaining_cm.min(limit).max(self.motion.min_move_cm)
    }

    fn forward(&self, drone: &mut dyn ActuatorPort, cm: u32) -> bool {
        match self.executor.execute(drone, Command::MoveForward(cm)) {
            Ok(_) => {
                Self::sleep_ms(self.motion.move_settle_ms);
                true
            }
            Err(e) => {
                warn!(target: "engagement", "Approach move failed: {}", e);
                false
            }
        }
    }

    fn approach(
        &self,
        drone: &mut dyn ActuatorPort,
        sensor: &mut dyn TargetSensor,
        label: &str,
        plan_det: &Detection,
        spec: &TargetSpec,
        abort: &AtomicBool,
    ) -> Approach {
        let standoff_m = spec.approach_distance_m;
        let tol_cm = self.config.distance_tolerance_cm;
        let tol_m = tol_cm as f64 / 100.0;
        let lost_grace = Duration::from_millis(self.config.approach_lost_ms);
        let deadline = Instant::now() + Duration::from_millis(self.config.approach_timeout_ms);

        let remaining_from = |distance_m: f64| ((distance_m - standoff_m).max(0.0) * 100.0).round() as u32;

        let mut result = Approach {
            last_seen: Some(Instant::now()),
            ..Default::default()
        };
        let mut remaining_cm = plan_det
            .box_width()
            .and_then(|w| self.camera.estimate_distance_m(w as f64, spec.real_width_m))
            .map(remaining_from)
            .unwrap_or(0);

        while Instant::now() < deadline {
            if abort.load(Ordering::SeqCst) {
                return result;
            }

            let det = sensor.poll();
            if det.matches_label(label) {
                result.last_seen = Some(Instant::now());
                self.yaw_to_center(drone, &det);

                let Some(distance_m) = det
                    .box_width()
                    .and_then(|w| self.camera.estimate_distance_m(w as f64, spec.real_width_m))
                else {
                    Self::sleep_ms(self.config.poll_interval_ms);
                    continue;
                };

                let delta_m = distance_m - standoff_m;
                remaining_cm = remaining_from(distance_m);
                // Inside the band, or already closer than the standoff
                if delta_m <= tol_m {
                    info!(target: "engagement", "Reached stand-off distance at {:.2} m", distance_m);
                    result.reached = true;
                    result.visible = true;
                    return result;
                }

                let step = self.approach_step(remaining_cm);
                info!(
                    target: "engagement",
                    "Forward {} cm towards target (distance {:.2} m)", step, distance_m
                );
                if !self.forward(drone, step) {
                    return result;
                }
                result.total_forward_cm += step;
                continue;
            }

            let unseen_for = result.last_seen.map(|t| t.elapsed()).unwrap_or(lost_grace);
            if unseen_for <= lost_grace {
                Self::sleep_ms(self.config.poll_interval_ms);
                continue;
            }

            if remaining_cm > tol_cm {
                let step = self.approach_step(remaining_cm);
                info!(target: "engagement", "Blind forward {} cm (resume toward standoff)", step);
                if !self.forward(drone, step) {
                    return result;
                }
                result.total_forward_cm += step;
                remaining_cm = remaining_cm.saturating_sub(step);
                if remaining_cm <= tol_cm {
                    result.reached = true;
                    result.visible = false;
                    return result;
                }
                continue;
            }

            info!(target: "engagement", "Target lost during approach");
            return result;
        }

        warn!(target: "engagement", "Approach timed out");
        result
    }

    fn hold(
        &self,
        drone: &mut dyn ActuatorPort,
        sensor: &mut dyn TargetSensor,
        label: &str,
        abort: &AtomicBool,
    ) {
        info!(target: "engagement", "Holding on target until lost");
        let lost_grace = Duration::from_millis(self.config.target_lost_ms);
        let keepalive = Duration::from_millis(self.config.keepalive_ms);
        let max_hold = Duration::from_millis(self.config.hold_max_ms);
        let started = Instant::now();
        let mut last_visible = Instant::now();
        let mut last_keepalive = Instant::now();

        loop {
            if abort.load(Ordering::SeqCst) {
                return;
            }
            Self::sleep_ms(self.config.hold_poll_ms);

            if last_keepalive.elapsed() > keepalive {
                if let Err(e) = drone.keepalive() {
                    warn!(target: "engagement", "Keepalive failed: {}", e);
                }
                last_keepalive = Instant::now();
            }

            if self.config.hold == HoldPolicy::Timed && started.elapsed() >= max_hold {
                info!(target: "engagement", "Hold time elapsed; exiting hold");
                return;
            }

            if sensor.poll().matches_label(label) {
                last_visible = Instant::now();
            } else if last_visible.elapsed() > lost_grace {
                info!(target: "engagement", "Target lost; exiting hold");
                return;
            }
        }
    }

    /// Back out the net forward travel; returns what could not be retreated
    fn retreat(&self, drone: &mut dyn ActuatorPort, total_forward_cm: u32) -> u32 {
        if total_forward_cm == 0 {
            return 0;
        }
        info!(target: "engagement", "Moving back {} cm to resume route", total_forward_cm);

        let mut outstanding = total_forward_cm;
        for chunk in retreat_chunks(total_forward_cm, self.motion.max_move_cm) {
            match self.executor.execute(drone, Command::MoveBack(chunk)) {
                Ok(_) => {
                    outstanding -= chunk;
                    Self::sleep_ms(self.motion.move_settle_ms);
                }
                Err(e) => {
                    warn!(
                        target: "engagement",
                        "Retreat failed with {} cm outstanding: {}", outstanding, e
                    );
                    break;
                }
            }
        }
        outstanding
    }

    fn restore_heading(&self, drone: &mut dyn ActuatorPort, initial_yaw: Option<f64>) -> bool {
        let (Some(initial), Some(current)) = (initial_yaw, current_yaw(drone)) else {
            warn!(target: "engagement", "No yaw telemetry; heading not verified");
            return false;
        };

        let correction = normalize_yaw(initial - current);
        if correction.abs() < self.heading.min_turn_deg().max(1.0) {
            return true;
        }

        info!(target: "engagement", "Restoring heading by {:+.1} deg", correction);
        match self.heading.rotate_signed(drone, correction) {
            Ok(applied) => applied == correction.round() as i32,
            Err(e) => {
                warn!(target: "engagement", "Heading restore failed: {}", e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{Fault, SimDrone};
    use crate::events::{EventBus, EventSink};
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// Replays detections in order, then reports nothing
    struct Replay(VecDeque<Detection>);

    impl TargetSensor for Replay {
        fn poll(&mut self) -> Detection {
            self.0.pop_front().unwrap_or_else(Detection::absent)
        }
    }

    fn fire(dx: f32, box_width: f32) -> Detection {
        let cx = 480.0 + dx;
        let half = box_width / 2.0;
        Detection::from_bbox(
            [cx - half, 340.0, cx + half, 380.0],
            0.9,
            Some("fire".to_string()),
            960,
            720,
        )
    }

    fn replay(dets: Vec<Detection>) -> Replay {
        Replay(dets.into())
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.command.retry_sleep_ms = 0;
        config.command.imu_retry_sleep_ms = 0;
        config.command.resync_settle_ms = 0;
        config.motion.move_settle_ms = 0;
        config.engagement.poll_interval_ms = 1;
        config.engagement.hold_poll_ms = 1;
        config.engagement.approach_lost_ms = 0;
        config.engagement.target_lost_ms = 10;
        config.engagement.confirm_timeout_ms = 20;
        config.engagement.approach_timeout_ms = 2000;
        config
    }

    fn engagement(config: &Config) -> (Engagement, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(512));
        let sink: Arc<dyn EventSink> = bus.clone();
        let exec = CommandExecutor::new(config.command.clone(), sink);
        let heading = HeadingController::new(config.heading.clone(), 0, exec.clone());
        (Engagement::new(config, exec, heading), bus)
    }

    fn motions(drone: &SimDrone) -> Vec<String> {
        drone
            .commands()
            .into_iter()
            .filter(|c| !c.starts_with("rc") && c != "keepalive")
            .collect()
    }

    // Box width that reads as the 0.70 m standoff for the default fire calibration
    const STANDOFF_PX: f32 = 52.0;

    #[test]
    fn test_seed_at_standoff_holds_without_moving() {
        let config = test_config();
        let (engage, bus) = engagement(&config);
        let mut drone = SimDrone::new().with_yaw(30.0);
        let seed = fire(0.0, STANDOFF_PX);
        let mut sensor = replay(vec![seed.clone(), seed.clone(), seed.clone()]);

        let result = engage.run(&mut drone, &mut sensor, &seed, &AtomicBool::new(false));
        assert_eq!(
            result,
            EngagementResult {
                standoff_reached: true,
                target_visible_on_finish: true,
                total_forward_cm: 0,
                heading_restored: true,
                unretreated_cm: 0,
            }
        );
        assert!(motions(&drone).is_empty());
        assert_eq!(drone.yaw(), 30.0);

        let phases: Vec<EngagementPhase> = bus
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                MissionEvent::EngagementPhase { phase } => Some(phase),
                _ => None,
            })
            .collect();
        assert_eq!(
            phases,
            vec![
                EngagementPhase::Plan,
                EngagementPhase::YawCenter,
                EngagementPhase::Approach,
                EngagementPhase::Hold,
                EngagementPhase::Retreat,
                EngagementPhase::RestoreHeading,
                EngagementPhase::Done,
            ]
        );
    }

    #[test]
    fn test_approach_then_retreat_same_distance() {
        let config = test_config();
        let (engage, _) = engagement(&config);
        let mut drone = SimDrone::new();
        let seed = fire(0.0, STANDOFF_PX / 2.0);
        let mut sensor = replay(vec![seed.clone(), fire(0.0, STANDOFF_PX)]);

        let result = engage.run(&mut drone, &mut sensor, &seed, &AtomicBool::new(false));
        assert!(result.standoff_reached);
        assert_eq!(result.total_forward_cm, 60);
        assert_eq!(result.unretreated_cm, 0);
        assert_eq!(motions(&drone), vec!["forward 60", "back 60"]);
    }

    #[test]
    fn test_blind_steps_after_losing_target() {
        let config = test_config();
        let (engage, _) = engagement(&config);
        let mut drone = SimDrone::new();
        // 0.70 m beyond the standoff, then never seen again
        let seed = fire(0.0, STANDOFF_PX / 2.0);
        let mut sensor = replay(vec![]);

        let result = engage.run(&mut drone, &mut sensor, &seed, &AtomicBool::new(false));
        assert!(result.standoff_reached);
        assert!(!result.target_visible_on_finish);
        assert_eq!(result.total_forward_cm, 80);
        assert_eq!(motions(&drone), vec!["forward 60", "forward 20", "back 80"]);
    }

    #[test]
    fn test_target_lost_restores_heading() {
        let config = test_config();
        let (engage, _) = engagement(&config);
        let mut drone = SimDrone::new().with_yaw(10.0);
        // Right of centre and already inside the standoff: nothing left to fly blind
        let seed = fire(240.0, STANDOFF_PX * 2.0);
        let mut sensor = replay(vec![]);

        let result = engage.run(&mut drone, &mut sensor, &seed, &AtomicBool::new(false));
        assert!(!result.standoff_reached);
        assert!(!result.target_visible_on_finish);
        assert_eq!(result.total_forward_cm, 0);
        assert!(result.heading_restored);
        assert_eq!(motions(&drone), vec!["cw 21", "ccw 21"]);
        assert_eq!(drone.yaw(), 10.0);
    }

    #[test]
    fn test_failed_retreat_is_reported() {
        let config = test_config();
        let (engage, _) = engagement(&config);
        let mut drone = SimDrone::new();
        drone.inject_times("move_back", Fault::Fail("error Motor stop".to_string()), 3);
        let seed = fire(0.0, STANDOFF_PX / 2.0);
        let mut sensor = replay(vec![seed.clone(), fire(0.0, STANDOFF_PX)]);

        let result = engage.run(&mut drone, &mut sensor, &seed, &AtomicBool::new(false));
        assert_eq!(result.total_forward_cm, 60);
        assert_eq!(result.unretreated_cm, 60);
    }

    #[test]
    fn test_failed_approach_move_ends_approach() {
        let config = test_config();
        let (engage, _) = engagement(&config);
        let mut drone = SimDrone::new();
        drone.inject_times("move_forward", Fault::Fail("error Motor stop".to_string()), 3);
        let seed = fire(0.0, STANDOFF_PX / 2.0);
        let mut sensor = replay(vec![seed.clone(), seed.clone()]);

        let result = engage.run(&mut drone, &mut sensor, &seed, &AtomicBool::new(false));
        assert!(!result.standoff_reached);
        assert_eq!(result.total_forward_cm, 0);
        assert_eq!(drone.count("back"), 0);
    }

    #[test]
    fn test_timed_hold_ends_while_visible() {
        let mut config = test_config();
        config.engagement.hold = HoldPolicy::Timed;
        config.engagement.hold_max_ms = 30;
        let (engage, _) = engagement(&config);
        let mut drone = SimDrone::new();
        let seed = fire(0.0, STANDOFF_PX);
        let mut sensor = replay(vec![seed.clone(); 100_000]);

        let started = Instant::now();
        let result = engage.run(&mut drone, &mut sensor, &seed, &AtomicBool::new(false));
        assert!(result.standoff_reached);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_hold_sends_keepalive() {
        let mut config = test_config();
        config.engagement.keepalive_ms = 5;
        config.engagement.hold = HoldPolicy::Timed;
        config.engagement.hold_max_ms = 60;
        let (engage, _) = engagement(&config);
        let mut drone = SimDrone::new();
        let seed = fire(0.0, STANDOFF_PX);
        let mut sensor = replay(vec![seed.clone(); 100_000]);

        engage.run(&mut drone, &mut sensor, &seed, &AtomicBool::new(false));
        assert!(drone.count("keepalive") >= 1);
    }

    #[test]
    fn test_target_without_calibration_is_skipped() {
        let mut config = test_config();
        config.targets.clear();
        let (engage, _) = engagement(&config);
        let mut drone = SimDrone::new();
        let seed = fire(200.0, STANDOFF_PX / 2.0);
        let mut sensor = replay(vec![]);

        let result = engage.run(&mut drone, &mut sensor, &seed, &AtomicBool::new(false));
        assert!(!result.standoff_reached);
        assert!(result.heading_restored);
        assert!(drone.commands().is_empty());
    }

    #[test]
    fn test_seed_without_box_is_confirmed_by_polling() {
        let config = test_config();
        let (engage, _) = engagement(&config);
        let mut drone = SimDrone::new();
        let mut seed = fire(0.0, STANDOFF_PX);
        seed.bbox = None;

        let mut sensor = replay(vec![]);
        let result = engage.run(&mut drone, &mut sensor, &seed, &AtomicBool::new(false));
        assert!(!result.standoff_reached);
        assert!(drone.commands().is_empty());

        let good = fire(0.0, STANDOFF_PX);
        let mut sensor = replay(vec![Detection::absent(), good.clone(), good]);
        let result = engage.run(&mut drone, &mut sensor, &seed, &AtomicBool::new(false));
        assert!(result.standoff_reached);
    }

    #[test]
    fn test_abort_leaves_forward_accounted() {
        let config = test_config();
        let (engage, _) = engagement(&config);
        let mut drone = SimDrone::new();
        let seed = fire(0.0, STANDOFF_PX / 2.0);
        let mut sensor = replay(vec![]);

        let result = engage.run(&mut drone, &mut sensor, &seed, &AtomicBool::new(true));
        assert_eq!(result.total_forward_cm, 0);
        assert_eq!(result.unretreated_cm, 0);
        assert!(!result.heading_restored);
        assert!(motions(&drone).is_empty());
    }
}
