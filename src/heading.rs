// src/heading.rs
//
// Signed turns and drift correction. Yaw is positive counter-clockwise and
// always kept in (-180, 180].

use crate::actuator::ActuatorPort;
use crate::command::{Command, CommandError, CommandExecutor, FailureKind};
use crate::events::MissionEvent;
use crate::types::HeadingConfig;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

pub fn normalize_yaw(deg: f64) -> f64 {
    let wrapped = (deg + 180.0).rem_euclid(360.0) - 180.0;
    if wrapped <= -180.0 {
        wrapped + 360.0
    } else {
        wrapped
    }
}

pub fn current_yaw(drone: &mut dyn ActuatorPort) -> Option<f64> {
    drone.telemetry().yaw_deg.map(normalize_yaw)
}

#[derive(Clone)]
pub struct HeadingController {
    config: HeadingConfig,
    turn_settle: Duration,
    executor: CommandExecutor,
}

impl HeadingController {
    pub fn new(config: HeadingConfig, turn_settle_ms: u64, executor: CommandExecutor) -> Self {
        Self {
            config,
            turn_settle: Duration::from_millis(turn_settle_ms),
            executor,
        }
    }

    pub fn min_turn_deg(&self) -> f64 {
        self.config.min_turn_deg
    }

    /// Turn by `angle` degrees (positive = counter-clockwise).
    ///
    /// Returns the turn actually issued: 0 inside the dead zone, less than
    /// requested when an IMU failure could not be bridged open-loop.
    pub fn rotate_signed(
        &self,
        drone: &mut dyn ActuatorPort,
        angle: f64,
    ) -> Result<i32, CommandError> {
        let target = angle.round() as i32;
        if target == 0 {
            return Ok(0);
        }
        if (target.unsigned_abs() as f64) < self.config.min_turn_deg {
            warn!(
                "turn {:+} deg below minimum ({}); skipping",
                target, self.config.min_turn_deg
            );
            return Ok(0);
        }

        let ccw = target > 0;
        let sign = if ccw { 1 } else { -1 };
        let chunk = self.config.turn_chunk_deg;
        let mut remaining = target.unsigned_abs();
        let mut applied = 0i32;

        // Stop any held velocity before a discrete turn
        if let Err(e) = drone.set_velocity(0, 0, 0, 0) {
            warn!("Failed to zero velocity before turn: {}", e);
        }
        thread::sleep(self.turn_settle);

        let mut chunk_idx = 0;
        while remaining > 0 {
            let step = if chunk == 0 { remaining } else { remaining.min(chunk) };
            chunk_idx += 1;
            if remaining > step {
                info!(
                    "    turn chunk {}: {} {} deg (rem {})",
                    chunk_idx,
                    if ccw { "CCW" } else { "CW" },
                    step,
                    remaining - step
                );
            }

            let command = if ccw {
                Command::RotateCounterClockwise(step)
            } else {
                Command::RotateClockwise(step)
            };
            match self.executor.execute(drone, command) {
                Ok(_) => {}
                Err(e) if e.kind == FailureKind::ImuNotReady => {
                    let fallback = sign * step as i32;
                    if self.open_loop_yaw(drone, fallback as f64) {
                        warn!("{} chunk used open-loop fallback for {:+} deg", e.label, fallback);
                    } else {
                        warn!("{} chunk aborted due to IMU error; skipping remaining turn", e.label);
                        return Ok(applied);
                    }
                }
                Err(e) => return Err(e),
            }

            applied += sign * step as i32;
            remaining -= step;
            thread::sleep(self.turn_settle);
        }

        Ok(applied)
    }

    /// Approximate a turn with a timed yaw-rate command
    pub fn open_loop_yaw(&self, drone: &mut dyn ActuatorPort, deg: f64) -> bool {
        let speed = self.config.open_loop_yaw_rate.abs();
        let rate = self.config.open_loop_deg_per_s;
        if speed == 0 || rate <= 0.0 || deg == 0.0 {
            return false;
        }

        let yaw_cmd = if deg > 0.0 { speed } else { -speed };
        let duration = Duration::from_secs_f64((deg.abs() / rate).max(0.1));
        warn!(
            "    open-loop yaw: rate {} for {:.2}s",
            yaw_cmd,
            duration.as_secs_f64()
        );

        let ok = match drone.set_velocity(0, 0, 0, yaw_cmd) {
            Ok(()) => {
                thread::sleep(duration);
                true
            }
            Err(e) => {
                error!("Open-loop yaw failed: {}", e);
                false
            }
        };
        if let Err(e) = drone.set_velocity(0, 0, 0, 0) {
            warn!("Failed to stop open-loop yaw: {}", e);
        }
        thread::sleep(Duration::from_millis(self.config.open_loop_recover_ms));

        self.executor.events().emit(MissionEvent::OpenLoopYaw {
            deg,
            duration_ms: duration.as_millis() as u64,
            ok,
        });
        ok
    }

    /// Pull the real heading back toward `expected`, bounded per call.
    ///
    /// Returns the heading to carry forward as the new expected yaw.
    pub fn correct_heading_if_needed(&self, drone: &mut dyn ActuatorPort, expected: f64) -> f64 {
        let tol = self.config.drift_tolerance_deg;
        if tol <= 0.0 {
            return expected;
        }
        let Some(actual) = current_yaw(drone) else {
            return expected;
        };

        let diff = normalize_yaw(actual - expected);
        if diff.abs() < tol {
            return expected;
        }

        let max = self.config.drift_correct_max_deg.max(tol);
        let correction = diff.clamp(-max, max);
        warn!(
            "Heading drift: actual {:.1}°, expected {:.1}° -> correcting {:.1}°",
            actual, expected, -correction
        );

        if let Err(e) = self.rotate_signed(drone, -correction) {
            error!("Heading correction failed: {}", e);
            return expected;
        }

        let updated = current_yaw(drone).unwrap_or_else(|| normalize_yaw(actual - correction));
        self.executor.events().emit(MissionEvent::HeadingCorrected {
            expected,
            actual,
            correction: -correction,
        });
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::{Fault, SimDrone};
    use crate::events::{EventBus, EventSink};
    use crate::types::CommandConfig;
    use std::sync::Arc;

    fn controller() -> (HeadingController, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new(256));
        let command = CommandConfig {
            retry_sleep_ms: 0,
            imu_retry_sleep_ms: 0,
            resync_settle_ms: 0,
            ..CommandConfig::default()
        };
        let heading = HeadingConfig {
            open_loop_deg_per_s: 900.0,
            open_loop_recover_ms: 0,
            ..HeadingConfig::default()
        };
        let sink: Arc<dyn EventSink> = bus.clone();
        let exec = CommandExecutor::new(command, sink);
        (HeadingController::new(heading, 0, exec), bus)
    }

    fn turns(drone: &SimDrone) -> Vec<String> {
        drone
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("cw") || c.starts_with("ccw"))
            .collect()
    }

    #[test]
    fn test_normalize_yaw_range() {
        assert_eq!(normalize_yaw(180.0), 180.0);
        assert_eq!(normalize_yaw(-180.0), 180.0);
        assert_eq!(normalize_yaw(540.0), 180.0);
        assert_eq!(normalize_yaw(190.0), -170.0);
        assert_eq!(normalize_yaw(-190.0), 170.0);
        assert_eq!(normalize_yaw(0.0), 0.0);

        let mut yaw = 0.0;
        for step in [90.0, 135.0, -400.0, 179.5, 720.0, -33.3, 181.0, -180.0] {
            yaw = normalize_yaw(yaw + step);
            assert!(yaw > -180.0 && yaw <= 180.0, "yaw {}", yaw);
            assert_eq!(normalize_yaw(yaw), yaw);
        }
    }

    #[test]
    fn test_dead_zone_issues_nothing() {
        let (heading, _) = controller();
        let mut drone = SimDrone::new();
        assert_eq!(heading.rotate_signed(&mut drone, 1.4).unwrap(), 0);
        assert_eq!(heading.rotate_signed(&mut drone, -0.2).unwrap(), 0);
        assert!(drone.commands().is_empty());
    }

    #[test]
    fn test_large_turn_is_chunked() {
        let (heading, _) = controller();
        let mut drone = SimDrone::new();
        assert_eq!(heading.rotate_signed(&mut drone, 100.0).unwrap(), 100);
        assert_eq!(turns(&drone), vec!["ccw 45", "ccw 45", "ccw 10"]);
        assert_eq!(drone.commands()[0], "rc 0 0 0 0");
        assert_eq!(drone.yaw(), 100.0);

        let mut drone = SimDrone::new();
        assert_eq!(heading.rotate_signed(&mut drone, -90.0).unwrap(), -90);
        assert_eq!(turns(&drone), vec!["cw 45", "cw 45"]);
        assert_eq!(drone.yaw(), -90.0);
    }

    #[test]
    fn test_imu_failure_falls_back_to_open_loop() {
        let (heading, bus) = controller();
        let mut drone = SimDrone::new();
        drone.inject_times("rotate_ccw", Fault::Fail("error No valid imu".to_string()), 7);

        assert_eq!(heading.rotate_signed(&mut drone, 90.0).unwrap(), 90);
        let commands = drone.commands();
        assert!(commands.contains(&"rc 0 0 0 60".to_string()));
        // Second chunk goes through the normal path again
        assert_eq!(commands.iter().filter(|c| *c == "ccw 45").count(), 8);
        assert!(bus
            .drain()
            .iter()
            .any(|e| matches!(e, MissionEvent::OpenLoopYaw { ok: true, .. })));
    }

    #[test]
    fn test_other_failure_propagates() {
        let (heading, _) = controller();
        let mut drone = SimDrone::new();
        drone.inject_times("rotate_cw", Fault::Fail("error Motor stop".to_string()), 3);
        let err = heading.rotate_signed(&mut drone, -30.0).unwrap_err();
        assert_eq!(err.kind, FailureKind::Other);
    }

    #[test]
    fn test_drift_correction_is_bounded() {
        let (heading, _) = controller();

        let mut drone = SimDrone::new().with_yaw(8.0);
        let updated = heading.correct_heading_if_needed(&mut drone, 0.0);
        assert_eq!(turns(&drone), vec!["cw 8"]);
        assert_eq!(updated, 0.0);

        let mut drone = SimDrone::new().with_yaw(30.0);
        let updated = heading.correct_heading_if_needed(&mut drone, 0.0);
        assert_eq!(turns(&drone), vec!["cw 10"]);
        assert_eq!(updated, 20.0);

        // Wraps through +/-180 the short way
        let mut drone = SimDrone::new().with_yaw(-176.0);
        let updated = heading.correct_heading_if_needed(&mut drone, 176.0);
        assert_eq!(turns(&drone), vec!["cw 8"]);
        assert_eq!(updated, 176.0);
    }

    #[test]
    fn test_no_correction_without_telemetry_or_below_tolerance() {
        let (heading, _) = controller();

        let mut drone = SimDrone::new().with_yaw(40.0).without_telemetry();
        assert_eq!(heading.correct_heading_if_needed(&mut drone, 0.0), 0.0);
        assert!(drone.commands().is_empty());

        let mut drone = SimDrone::new().with_yaw(3.0);
        assert_eq!(heading.correct_heading_if_needed(&mut drone, 0.0), 0.0);
        assert!(drone.commands().is_empty());
    }
}
