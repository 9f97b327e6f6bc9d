// src/command/mod.rs
//
// Command execution layer. Every discrete actuator command goes through
// `CommandExecutor::execute`, which retries, recovers the SDK channel and
// accepts a lost acknowledgement when telemetry shows the move happened.

pub mod classify;

pub use classify::FailureKind;

use crate::actuator::{ActuatorError, ActuatorPort};
use crate::events::{EventSink, MissionEvent};
use crate::types::CommandConfig;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    TakeOff,
    Land,
    SetSpeed(u32),
    RotateClockwise(u32),
    RotateCounterClockwise(u32),
    MoveForward(u32),
    MoveBack(u32),
    MoveUp(u32),
    MoveDown(u32),
}

impl Command {
    pub fn label(&self) -> &'static str {
        match self {
            Self::TakeOff => "takeoff",
            Self::Land => "land",
            Self::SetSpeed(_) => "set_speed",
            Self::RotateClockwise(_) => "rotate_cw",
            Self::RotateCounterClockwise(_) => "rotate_ccw",
            Self::MoveForward(_) => "move_forward",
            Self::MoveBack(_) => "move_back",
            Self::MoveUp(_) => "move_up",
            Self::MoveDown(_) => "move_down",
        }
    }

    /// Commanded distance, used to scale the timeout pad
    pub fn distance_cm(&self) -> Option<u32> {
        match self {
            Self::MoveForward(cm) | Self::MoveBack(cm) | Self::MoveUp(cm) | Self::MoveDown(cm) => {
                Some(*cm)
            }
            _ => None,
        }
    }

    /// Commands whose effect is visible in the height telemetry
    fn tracks_height(&self) -> bool {
        matches!(
            self,
            Self::TakeOff | Self::Land | Self::MoveUp(_) | Self::MoveDown(_)
        )
    }

    fn apply<A: ActuatorPort + ?Sized>(&self, drone: &mut A) -> Result<(), ActuatorError> {
        match *self {
            Self::TakeOff => drone.take_off(),
            Self::Land => drone.land(),
            Self::SetSpeed(v) => drone.set_speed(v),
            Self::RotateClockwise(deg) => drone.rotate_clockwise(deg),
            Self::RotateCounterClockwise(deg) => drone.rotate_counter_clockwise(deg),
            Self::MoveForward(cm) => drone.move_forward(cm),
            Self::MoveBack(cm) => drone.move_back(cm),
            Self::MoveUp(cm) => drone.move_up(cm),
            Self::MoveDown(cm) => drone.move_down(cm),
        }
    }
}

/// How a successful command was confirmed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Acknowledged,
    /// The reply was lost but telemetry shows the effect
    ConfirmedByTelemetry,
}

#[derive(Debug, thiserror::Error)]
#[error("{label} failed after {attempts} attempts ({kind}): {source}")]
pub struct CommandError {
    pub label: &'static str,
    pub kind: FailureKind,
    pub attempts: u32,
    pub source: ActuatorError,
}

/// Raises the actuator response timeout for one attempt and restores it on drop
struct PaddedTimeout<'a, A: ActuatorPort + ?Sized> {
    drone: &'a mut A,
    original: Option<Duration>,
}

impl<'a, A: ActuatorPort + ?Sized> PaddedTimeout<'a, A> {
    fn new(drone: &'a mut A, pad: Duration) -> Self {
        let original = (!pad.is_zero()).then(|| {
            let original = drone.response_timeout();
            drone.set_response_timeout(original + pad);
            original
        });
        Self { drone, original }
    }
}

impl<A: ActuatorPort + ?Sized> Deref for PaddedTimeout<'_, A> {
    type Target = A;

    fn deref(&self) -> &A {
        self.drone
    }
}

impl<A: ActuatorPort + ?Sized> DerefMut for PaddedTimeout<'_, A> {
    fn deref_mut(&mut self) -> &mut A {
        self.drone
    }
}

impl<A: ActuatorPort + ?Sized> Drop for PaddedTimeout<'_, A> {
    fn drop(&mut self) {
        if let Some(original) = self.original {
            self.drone.set_response_timeout(original);
        }
    }
}

#[derive(Clone)]
pub struct CommandExecutor {
    config: CommandConfig,
    events: Arc<dyn EventSink>,
}

impl CommandExecutor {
    pub fn new(config: CommandConfig, events: Arc<dyn EventSink>) -> Self {
        Self { config, events }
    }

    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }

    pub fn execute(
        &self,
        drone: &mut dyn ActuatorPort,
        command: Command,
    ) -> Result<Completion, CommandError> {
        let label = command.label();
        let base_budget = self.config.retries + 1;
        let mut budget = base_budget;
        let mut attempt = 0;
        let mut imu_extended = false;
        let mut desync_extended = false;
        let pad = self.config.pad_for(label, command.distance_cm());

        loop {
            attempt += 1;
            let height_before = command
                .tracks_height()
                .then(|| drone.telemetry().height_cm)
                .flatten();

            let result = {
                let mut padded = PaddedTimeout::new(drone, pad);
                command.apply(&mut *padded)
            };

            let err = match result {
                Ok(()) => {
                    self.emit_attempt(label, attempt, budget, None);
                    return Ok(Completion::Acknowledged);
                }
                Err(err) => err,
            };

            let kind = FailureKind::classify(&err.to_string());
            self.emit_attempt(label, attempt, budget, Some(kind));

            if kind == FailureKind::Timeout && self.effect_seen(drone, command, height_before) {
                warn!("{} timed out but state indicates completion; skipping retries", label);
                self.events.emit(MissionEvent::CommandConfirmed {
                    label: label.to_string(),
                    attempt,
                });
                return Ok(Completion::ConfirmedByTelemetry);
            }

            if kind.wants_resync() {
                let ok = self.resync(drone);
                self.events.emit(MissionEvent::Resync {
                    label: label.to_string(),
                    ok,
                });
                if ok && kind == FailureKind::ChannelDesync && !desync_extended {
                    budget += 1;
                    desync_extended = true;
                }
            }

            if kind == FailureKind::ImuNotReady && !imu_extended {
                budget += self.config.imu_extra_attempts;
                imu_extended = true;
            }

            if attempt < budget {
                let (wait, reason) = if kind == FailureKind::ImuNotReady {
                    (self.config.imu_retry_sleep_ms, " (IMU not ready)")
                } else {
                    (self.config.retry_sleep_ms, "")
                };
                warn!(
                    "{} failed ({}); retry {}/{}{}",
                    label,
                    err,
                    attempt,
                    budget - 1,
                    reason
                );
                thread::sleep(Duration::from_millis(wait));
                continue;
            }

            error!("{} failed after {} tries: {}", label, attempt, err);
            self.events.emit(MissionEvent::CommandFailed {
                label: label.to_string(),
                kind,
                attempts: attempt,
            });
            return Err(CommandError {
                label,
                kind,
                attempts: attempt,
                source: err,
            });
        }
    }

    /// Re-enter command mode after a lost or garbled reply
    pub fn resync(&self, drone: &mut dyn ActuatorPort) -> bool {
        match drone.enter_command_mode() {
            Ok(()) => {
                info!("Sent 'command' to re-sync SDK mode");
                thread::sleep(Duration::from_millis(self.config.resync_settle_ms));
                true
            }
            Err(e) => {
                warn!("Command-mode recovery failed: {}", e);
                false
            }
        }
    }

    fn effect_seen(
        &self,
        drone: &mut dyn ActuatorPort,
        command: Command,
        height_before: Option<f64>,
    ) -> bool {
        if !command.tracks_height() {
            return false;
        }
        let Some(after) = drone.telemetry().height_cm else {
            return false;
        };
        let tol = self.config.success_tolerance_cm;
        match command {
            Command::TakeOff => after >= self.config.takeoff_success_height_cm,
            Command::Land => after <= tol,
            Command::MoveUp(cm) | Command::MoveDown(cm) => {
                let Some(before) = height_before else {
                    return false;
                };
                let needed = (cm as f64 - tol).max(0.0);
                let delta = after - before;
                if matches!(command, Command::MoveUp(_)) {
                    delta >= needed
                } else {
                    delta <= -needed
                }
            }
            _ => false,
        }
    }

    fn emit_attempt(&self, label: &str, attempt: u32, budget: u32, failure: Option<FailureKind>) {
        self.events.emit(MissionEvent::CommandAttempt {
            label: label.to_string(),
            attempt,
            budget,
            failure,
        });
    }
}
