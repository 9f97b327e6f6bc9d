// src/actuator/sim.rs
//
// Kinematic stand-in for the vehicle. Used for dry flights and as the
// test double for everything above the actuator port.

use super::{ActuatorError, ActuatorPort, ActuatorResult, Telemetry};
use crate::heading::normalize_yaw;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Scripted failure for the next call with a given label
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// The call fails with this text and has no effect
    Fail(String),
    /// The call times out and has no effect
    Timeout,
    /// The effect happens but the acknowledgement is lost
    LostAck,
}

/// Degrees per second produced by one unit of yaw rate
const YAW_DEG_PER_UNIT: f64 = 1.5;

struct SimState {
    yaw: f64,
    height: f64,
    battery: f64,
    battery_drain: f64,
    battery_script: VecDeque<u8>,
    takeoff_height: f64,
    yaw_drift_per_move: f64,
    telemetry: bool,
    connected: bool,
    flying: bool,
    video: bool,
    timeout: Duration,
    faults: HashMap<String, VecDeque<Fault>>,
    commands: Vec<String>,
    timeouts_seen: Vec<(String, Duration)>,
    velocity: Option<(Instant, i32, i32)>, // (since, vertical, yaw_rate)
}

impl SimState {
    /// Apply the held velocity command up to now
    fn integrate_velocity(&mut self) {
        if let Some((since, vertical, yaw_rate)) = self.velocity {
            let secs = since.elapsed().as_secs_f64();
            self.yaw = normalize_yaw(self.yaw + yaw_rate as f64 * YAW_DEG_PER_UNIT * secs);
            if self.flying {
                self.height = (self.height + vertical as f64 * secs).max(0.0);
            }
            self.velocity = Some((Instant::now(), vertical, yaw_rate));
        }
    }
}

/// Shared handle: clones observe and control the same simulated vehicle
#[derive(Clone)]
pub struct SimDrone {
    inner: Arc<Mutex<SimState>>,
}

impl Default for SimDrone {
    fn default() -> Self {
        Self::new()
    }
}

impl SimDrone {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                yaw: 0.0,
                height: 0.0,
                battery: 100.0,
                battery_drain: 0.0,
                battery_script: VecDeque::new(),
                takeoff_height: 80.0,
                yaw_drift_per_move: 0.0,
                telemetry: true,
                connected: false,
                flying: false,
                video: false,
                timeout: Duration::from_secs(10),
                faults: HashMap::new(),
                commands: Vec::new(),
                timeouts_seen: Vec::new(),
                velocity: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn with_battery(self, pct: u8) -> Self {
        self.state().battery = pct as f64;
        self
    }

    /// Battery readings returned by successive queries before falling back to the model
    pub fn with_battery_script(self, readings: impl IntoIterator<Item = u8>) -> Self {
        self.state().battery_script.extend(readings);
        self
    }

    /// Percent lost per motion command
    pub fn with_battery_drain(self, pct: f64) -> Self {
        self.state().battery_drain = pct;
        self
    }

    pub fn with_yaw(self, yaw: f64) -> Self {
        self.state().yaw = normalize_yaw(yaw);
        self
    }

    pub fn with_takeoff_height(self, cm: f64) -> Self {
        self.state().takeoff_height = cm;
        self
    }

    /// Yaw error added by every forward/back move
    pub fn with_yaw_drift_per_move(self, deg: f64) -> Self {
        self.state().yaw_drift_per_move = deg;
        self
    }

    pub fn without_telemetry(self) -> Self {
        self.state().telemetry = false;
        self
    }

    /// Queue a fault for the next call labelled `label`
    pub fn inject(&self, label: &str, fault: Fault) {
        self.state()
            .faults
            .entry(label.to_string())
            .or_default()
            .push_back(fault);
    }

    pub fn inject_times(&self, label: &str, fault: Fault, times: usize) {
        for _ in 0..times {
            self.inject(label, fault.clone());
        }
    }

    /// Every command sent, failed attempts included
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.state()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn timeouts_seen(&self) -> Vec<(String, Duration)> {
        self.state().timeouts_seen.clone()
    }

    pub fn yaw(&self) -> f64 {
        self.state().yaw
    }

    pub fn height(&self) -> f64 {
        self.state().height
    }

    pub fn is_flying(&self) -> bool {
        self.state().flying
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn video_on(&self) -> bool {
        self.state().video
    }

    /// Shared bookkeeping for a labelled call; returns whether to apply the
    /// effect and the error to report afterwards
    fn begin(&self, label: &str, text: String) -> (bool, Option<ActuatorError>) {
        let mut state = self.state();
        state.integrate_velocity();
        let timeout = state.timeout;
        state.commands.push(text.clone());
        state.timeouts_seen.push((label.to_string(), timeout));

        let fault = state.faults.get_mut(label).and_then(|q| q.pop_front());
        match fault {
            None => (true, None),
            Some(Fault::Fail(response)) => (
                false,
                Some(ActuatorError::Rejected {
                    command: text,
                    response,
                }),
            ),
            Some(Fault::Timeout) => (
                false,
                Some(ActuatorError::NoResponse {
                    command: text,
                    timeout,
                }),
            ),
            Some(Fault::LostAck) => (
                true,
                Some(ActuatorError::NoResponse {
                    command: text,
                    timeout,
                }),
            ),
        }
    }

    fn run(
        &mut self,
        label: &str,
        text: String,
        effect: impl FnOnce(&mut SimState),
    ) -> ActuatorResult<()> {
        let (apply, error) = self.begin(label, text);
        if apply {
            let mut state = self.state();
            effect(&mut state);
            state.battery = (state.battery - state.battery_drain).max(0.0);
        }
        match error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn turn(&mut self, label: &str, text: String, delta: f64) -> ActuatorResult<()> {
        self.run(label, text, |s| {
            s.yaw = normalize_yaw(s.yaw + delta);
        })
    }

    fn translate(&mut self, label: &str, text: String) -> ActuatorResult<()> {
        self.run(label, text, |s| {
            s.yaw = normalize_yaw(s.yaw + s.yaw_drift_per_move);
        })
    }
}

impl ActuatorPort for SimDrone {
    fn connect(&mut self) -> ActuatorResult<()> {
        self.run("connect", "connect".to_string(), |s| s.connected = true)
    }

    fn enter_command_mode(&mut self) -> ActuatorResult<()> {
        self.run("command", "command".to_string(), |_| {})
    }

    fn keepalive(&mut self) -> ActuatorResult<()> {
        self.run("keepalive", "keepalive".to_string(), |_| {})
    }

    fn take_off(&mut self) -> ActuatorResult<()> {
        self.run("takeoff", "takeoff".to_string(), |s| {
            s.flying = true;
            s.height = s.takeoff_height;
        })
    }

    fn land(&mut self) -> ActuatorResult<()> {
        self.run("land", "land".to_string(), |s| {
            s.flying = false;
            s.height = 0.0;
            s.velocity = None;
        })
    }

    fn set_speed(&mut self, cm_s: u32) -> ActuatorResult<()> {
        self.run("set_speed", format!("speed {}", cm_s), |_| {})
    }

    fn rotate_clockwise(&mut self, deg: u32) -> ActuatorResult<()> {
        self.turn("rotate_cw", format!("cw {}", deg), -(deg as f64))
    }

    fn rotate_counter_clockwise(&mut self, deg: u32) -> ActuatorResult<()> {
        self.turn("rotate_ccw", format!("ccw {}", deg), deg as f64)
    }

    fn move_forward(&mut self, cm: u32) -> ActuatorResult<()> {
        self.translate("move_forward", format!("forward {}", cm))
    }

    fn move_back(&mut self, cm: u32) -> ActuatorResult<()> {
        self.translate("move_back", format!("back {}", cm))
    }

    fn move_up(&mut self, cm: u32) -> ActuatorResult<()> {
        self.run("move_up", format!("up {}", cm), |s| s.height += cm as f64)
    }

    fn move_down(&mut self, cm: u32) -> ActuatorResult<()> {
        self.run("move_down", format!("down {}", cm), |s| {
            s.height = (s.height - cm as f64).max(0.0);
        })
    }

    fn set_velocity(
        &mut self,
        forward: i32,
        strafe: i32,
        vertical: i32,
        yaw_rate: i32,
    ) -> ActuatorResult<()> {
        let text = format!("rc {} {} {} {}", forward, strafe, vertical, yaw_rate);
        self.run("rc", text, |s| {
            s.velocity = (vertical != 0 || yaw_rate != 0)
                .then(|| (Instant::now(), vertical.clamp(-100, 100), yaw_rate.clamp(-100, 100)));
        })
    }

    fn battery_percent(&mut self) -> ActuatorResult<u8> {
        let mut state = self.state();
        if !state.connected {
            return Err(ActuatorError::NotConnected);
        }
        if let Some(pct) = state.battery_script.pop_front() {
            state.battery = pct as f64;
        }
        Ok(state.battery.round().clamp(0.0, 100.0) as u8)
    }

    fn telemetry(&mut self) -> Telemetry {
        let mut state = self.state();
        state.integrate_velocity();
        if !state.telemetry {
            return Telemetry::default();
        }
        Telemetry {
            yaw_deg: Some(state.yaw),
            height_cm: Some(state.height),
            battery_pct: Some(state.battery.round().clamp(0.0, 100.0) as u8),
        }
    }

    fn emergency_stop(&mut self) -> ActuatorResult<()> {
        self.run("emergency", "emergency".to_string(), |s| {
            s.flying = false;
            s.height = 0.0;
            s.velocity = None;
        })
    }

    fn response_timeout(&self) -> Duration {
        self.state().timeout
    }

    fn set_response_timeout(&mut self, timeout: Duration) {
        self.state().timeout = timeout;
    }

    fn set_video_stream(&mut self, on: bool) -> ActuatorResult<()> {
        let text = if on { "streamon" } else { "streamoff" };
        self.run("stream", text.to_string(), |s| s.video = on)
    }

    fn disconnect(&mut self) {
        self.state().connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turns_follow_counter_clockwise_convention() {
        let mut drone = SimDrone::new().with_yaw(170.0);
        drone.rotate_counter_clockwise(20).unwrap();
        assert_eq!(drone.yaw(), -170.0);
        drone.rotate_clockwise(30).unwrap();
        assert_eq!(drone.yaw(), 160.0);
        assert_eq!(drone.commands(), vec!["ccw 20", "cw 30"]);
    }

    #[test]
    fn test_faults_apply_in_order() {
        let mut drone = SimDrone::new();
        drone.inject("move_up", Fault::Fail("error No valid imu".to_string()));
        drone.inject("move_up", Fault::LostAck);

        let err = drone.move_up(50).unwrap_err();
        assert!(err.to_string().contains("No valid imu"));
        assert_eq!(drone.height(), 0.0);

        let err = drone.move_up(50).unwrap_err();
        assert!(err.to_string().contains("did not receive a response"));
        assert_eq!(drone.height(), 50.0);

        drone.move_up(10).unwrap();
        assert_eq!(drone.height(), 60.0);
        assert_eq!(drone.count("up"), 3);
    }

    #[test]
    fn test_battery_script_then_model() {
        let mut drone = SimDrone::new()
            .with_battery(50)
            .with_battery_script([90, 18])
            .with_battery_drain(1.0);
        drone.connect().unwrap();
        assert_eq!(drone.battery_percent().unwrap(), 90);
        assert_eq!(drone.battery_percent().unwrap(), 18);
        drone.move_forward(20).unwrap();
        assert_eq!(drone.battery_percent().unwrap(), 17);
    }

    #[test]
    fn test_velocity_integrates_yaw_and_height() {
        let mut drone = SimDrone::new().with_takeoff_height(50.0);
        drone.take_off().unwrap();
        drone.set_velocity(0, 0, -20, 60).unwrap();
        std::thread::sleep(Duration::from_millis(100));
        drone.set_velocity(0, 0, 0, 0).unwrap();

        let yaw = drone.yaw();
        assert!(yaw > 5.0 && yaw < 30.0, "yaw {}", yaw);
        assert!(drone.height() < 50.0);
        let settled = drone.yaw();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(drone.telemetry().yaw_deg, Some(settled));
    }

    #[test]
    fn test_clones_share_state() {
        let observer = SimDrone::new();
        let mut drone = observer.clone();
        drone.take_off().unwrap();
        assert!(observer.is_flying());
        assert_eq!(observer.commands(), vec!["takeoff"]);
    }
}
