// src/actuator/mod.rs
//
// Vehicle command and telemetry port. Every call blocks until the vehicle
// answers or the response timeout expires.

pub mod sim;
pub mod tello;

pub use sim::{Fault, SimDrone};
pub use tello::TelloDrone;

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ActuatorError {
    #[error("command '{command}' was unsuccessful: {response}")]
    Rejected { command: String, response: String },

    #[error("command '{command}' did not receive a response within {timeout:?}")]
    NoResponse { command: String, timeout: Duration },

    #[error("invalid utf-8 in response to '{0}'")]
    Decode(String),

    #[error("not connected")]
    NotConnected,

    #[error("unexpected response to '{command}': {response}")]
    Unexpected { command: String, response: String },

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ActuatorResult<T> = Result<T, ActuatorError>;

/// Latest vehicle state. Yaw is positive counter-clockwise.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Telemetry {
    pub yaw_deg: Option<f64>,
    pub height_cm: Option<f64>,
    pub battery_pct: Option<u8>,
}

/// Blocking vehicle interface.
///
/// Angles follow the plan convention: positive yaw is counter-clockwise,
/// including the `yaw_rate` passed to [`ActuatorPort::set_velocity`].
pub trait ActuatorPort: Send {
    fn connect(&mut self) -> ActuatorResult<()>;

    /// Re-enter SDK command mode; doubles as the resync handshake
    fn enter_command_mode(&mut self) -> ActuatorResult<()>;

    /// Cheap no-op that keeps the link from idling out
    fn keepalive(&mut self) -> ActuatorResult<()>;

    fn take_off(&mut self) -> ActuatorResult<()>;
    fn land(&mut self) -> ActuatorResult<()>;
    fn set_speed(&mut self, cm_s: u32) -> ActuatorResult<()>;
    fn rotate_clockwise(&mut self, deg: u32) -> ActuatorResult<()>;
    fn rotate_counter_clockwise(&mut self, deg: u32) -> ActuatorResult<()>;
    fn move_forward(&mut self, cm: u32) -> ActuatorResult<()>;
    fn move_back(&mut self, cm: u32) -> ActuatorResult<()>;
    fn move_up(&mut self, cm: u32) -> ActuatorResult<()>;
    fn move_down(&mut self, cm: u32) -> ActuatorResult<()>;

    /// Raw velocity command in [-100, 100]; held until the next one
    fn set_velocity(&mut self, forward: i32, strafe: i32, vertical: i32, yaw_rate: i32)
        -> ActuatorResult<()>;

    fn battery_percent(&mut self) -> ActuatorResult<u8>;
    fn telemetry(&mut self) -> Telemetry;
    fn emergency_stop(&mut self) -> ActuatorResult<()>;

    fn response_timeout(&self) -> Duration;
    fn set_response_timeout(&mut self, timeout: Duration);

    fn set_video_stream(&mut self, on: bool) -> ActuatorResult<()>;
    fn disconnect(&mut self);
}
