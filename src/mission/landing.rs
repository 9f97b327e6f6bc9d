// src/mission/landing.rs
//
// Landing ladder: commanded land, then a timed descent on the velocity
// channel, then an emergency motor stop.

use crate::actuator::ActuatorPort;
use crate::command::{Command, CommandExecutor};
use crate::events::MissionEvent;
use crate::types::LandingConfig;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

/// How the vehicle ended up on the ground
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandingMethod {
    Commanded,
    OpenLoopDescent,
    EmergencyStop,
    /// Every rung failed
    Failed,
}

impl LandingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commanded => "land",
            Self::OpenLoopDescent => "open_loop_descent",
            Self::EmergencyStop => "emergency",
            Self::Failed => "failed",
        }
    }
}

pub fn safe_land(
    drone: &mut dyn ActuatorPort,
    executor: &CommandExecutor,
    config: &LandingConfig,
) -> LandingMethod {
    let events = executor.events();

    match executor.execute(drone, Command::Land) {
        Ok(_) => {
            info!("✓ Landed");
            events.emit(MissionEvent::Landing {
                method: LandingMethod::Commanded.as_str(),
                ok: true,
            });
            return LandingMethod::Commanded;
        }
        Err(e) => {
            warn!("land error: {}", e);
            events.emit(MissionEvent::Landing {
                method: LandingMethod::Commanded.as_str(),
                ok: false,
            });
        }
    }

    if !executor.resync(drone) {
        warn!("Unable to re-enter command mode before descent fallback");
    }

    warn!("Attempting open-loop descent fallback");
    let descent = drone
        .set_velocity(0, 0, config.descent_velocity, 0)
        .and_then(|_| {
            thread::sleep(Duration::from_millis(config.descent_ms));
            drone.set_velocity(0, 0, 0, 0)
        });
    match descent {
        Ok(()) => {
            events.emit(MissionEvent::Landing {
                method: LandingMethod::OpenLoopDescent.as_str(),
                ok: true,
            });
            return LandingMethod::OpenLoopDescent;
        }
        Err(e) => {
            error!("Descent fallback failed: {}; issuing emergency stop", e);
            events.emit(MissionEvent::Landing {
                method: LandingMethod::OpenLoopDescent.as_str(),
                ok: false,
            });
        }
    }

    let ok = match drone.emergency_stop() {
        Ok(()) => true,
        Err(e) => {
            error!("Emergency command failed: {}", e);
            false
        }
    };
    events.emit(MissionEvent::Landing {
        method: LandingMethod::EmergencyStop.as_str(),
        ok,
    });
    if ok {
        LandingMethod::EmergencyStop
    } else {
        LandingMethod::Failed
    }
}
