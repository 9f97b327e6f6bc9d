// src/actuator/tello.rs
//
// Tello text SDK over UDP. Commands go to port 8889 and are answered with
// "ok", "error ..." or a value; state datagrams ("key:value;...") arrive on
// port 8890 and are cached by a listener thread.

use super::{ActuatorError, ActuatorPort, ActuatorResult, Telemetry};
use crate::types::ConnectionConfig;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const STATE_POLL: Duration = Duration::from_millis(200);

pub struct TelloDrone {
    config: ConnectionConfig,
    socket: Option<UdpSocket>,
    timeout: Duration,
    state: Arc<Mutex<HashMap<String, String>>>,
    state_stop: Arc<AtomicBool>,
    state_thread: Option<JoinHandle<()>>,
}

impl TelloDrone {
    pub fn new(config: ConnectionConfig, response_timeout: Duration) -> Self {
        Self {
            config,
            socket: None,
            timeout: response_timeout,
            state: Arc::new(Mutex::new(HashMap::new())),
            state_stop: Arc::new(AtomicBool::new(false)),
            state_thread: None,
        }
    }

    fn drone_addr(&self) -> ActuatorResult<SocketAddr> {
        self.config
            .drone_addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                ActuatorError::Io(std::io::Error::new(
                    ErrorKind::AddrNotAvailable,
                    format!("cannot resolve {}", self.config.drone_addr),
                ))
            })
    }

    /// Send one command and wait for its reply
    fn send_read(&mut self, command: &str) -> ActuatorResult<String> {
        let addr = self.drone_addr()?;
        let socket = self.socket.as_ref().ok_or(ActuatorError::NotConnected)?;

        // Drop late replies to earlier commands so they are not read as ours
        socket.set_nonblocking(true)?;
        let mut buf = [0u8; 1024];
        while socket.recv_from(&mut buf).is_ok() {}
        socket.set_nonblocking(false)?;

        socket.set_read_timeout(Some(self.timeout.max(Duration::from_millis(1))))?;
        debug!("→ {}", command);
        socket.send_to(command.as_bytes(), addr)?;

        loop {
            match socket.recv_from(&mut buf) {
                Ok((len, from)) if from == addr => {
                    let text = std::str::from_utf8(&buf[..len])
                        .map_err(|_| ActuatorError::Decode(command.to_string()))?;
                    let text = text.trim().to_string();
                    debug!("← {}", text);
                    return Ok(text);
                }
                Ok(_) => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Err(ActuatorError::NoResponse {
                        command: command.to_string(),
                        timeout: self.timeout,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Send a command that must be answered with "ok"
    fn send_control(&mut self, command: &str) -> ActuatorResult<()> {
        let response = self.send_read(command)?;
        if response.eq_ignore_ascii_case("ok") {
            Ok(())
        } else {
            Err(ActuatorError::Rejected {
                command: command.to_string(),
                response,
            })
        }
    }

    /// Fire-and-forget command (the SDK never answers `rc`)
    fn send_no_reply(&mut self, command: &str) -> ActuatorResult<()> {
        let addr = self.drone_addr()?;
        let socket = self.socket.as_ref().ok_or(ActuatorError::NotConnected)?;
        debug!("→ {}", command);
        socket.send_to(command.as_bytes(), addr)?;
        Ok(())
    }

    fn start_state_listener(&mut self) {
        let socket = match UdpSocket::bind(&self.config.state_bind) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("State port {} unavailable, telemetry disabled: {}", self.config.state_bind, e);
                return;
            }
        };
        if let Err(e) = socket.set_read_timeout(Some(STATE_POLL)) {
            warn!("Failed to configure state socket: {}", e);
            return;
        }

        self.state_stop.store(false, Ordering::SeqCst);
        let stop = Arc::clone(&self.state_stop);
        let state = Arc::clone(&self.state);

        let spawned = std::thread::Builder::new()
            .name("tello-state".to_string())
            .spawn(move || {
                let mut buf = [0u8; 2048];
                while !stop.load(Ordering::SeqCst) {
                    let Ok((len, _)) = socket.recv_from(&mut buf) else {
                        continue;
                    };
                    if let Ok(text) = std::str::from_utf8(&buf[..len]) {
                        let parsed = parse_state(text);
                        if !parsed.is_empty() {
                            *state.lock().unwrap_or_else(PoisonError::into_inner) = parsed;
                        }
                    }
                }
            });

        match spawned {
            Ok(handle) => self.state_thread = Some(handle),
            Err(e) => warn!("Failed to start state listener: {}", e),
        }
    }
}

/// Parse a state datagram such as `pitch:0;roll:0;yaw:-12;h:80;bat:87;`
pub fn parse_state(text: &str) -> HashMap<String, String> {
    text.trim()
        .split(';')
        .filter_map(|pair| {
            let (key, value) = pair.split_once(':')?;
            let key = key.trim();
            (!key.is_empty()).then(|| (key.to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Convert SDK state into telemetry; SDK yaw is clockwise-positive
pub fn telemetry_from_state(state: &HashMap<String, String>) -> Telemetry {
    let number = |key: &str| state.get(key).and_then(|v| v.parse::<f64>().ok());
    Telemetry {
        yaw_deg: number("yaw").map(|yaw| -yaw),
        height_cm: number("h"),
        battery_pct: number("bat").map(|b| b.clamp(0.0, 100.0) as u8),
    }
}

/// `rc` takes (left/right, forward/back, up/down, yaw clockwise)
pub fn rc_command(forward: i32, strafe: i32, vertical: i32, yaw_rate: i32) -> String {
    let clamp = |v: i32| v.clamp(-100, 100);
    format!(
        "rc {} {} {} {}",
        clamp(strafe),
        clamp(forward),
        clamp(vertical),
        clamp(-yaw_rate)
    )
}

impl ActuatorPort for TelloDrone {
    fn connect(&mut self) -> ActuatorResult<()> {
        if self.socket.is_none() {
            let socket = UdpSocket::bind(&self.config.command_bind)?;
            self.socket = Some(socket);
        }
        self.send_control("command")?;
        if self.state_thread.is_none() {
            self.start_state_listener();
        }
        info!("✓ Connected to {}", self.config.drone_addr);
        Ok(())
    }

    fn enter_command_mode(&mut self) -> ActuatorResult<()> {
        self.send_control("command")
    }

    /// Re-sent `command` keeps the link alive; the late "ok" is drained
    /// by the next `send_read`
    fn keepalive(&mut self) -> ActuatorResult<()> {
        self.send_no_reply("command")
    }

    fn take_off(&mut self) -> ActuatorResult<()> {
        self.send_control("takeoff")
    }

    fn land(&mut self) -> ActuatorResult<()> {
        self.send_control("land")
    }

    fn set_speed(&mut self, cm_s: u32) -> ActuatorResult<()> {
        self.send_control(&format!("speed {}", cm_s))
    }

    fn rotate_clockwise(&mut self, deg: u32) -> ActuatorResult<()> {
        self.send_control(&format!("cw {}", deg))
    }

    fn rotate_counter_clockwise(&mut self, deg: u32) -> ActuatorResult<()> {
        self.send_control(&format!("ccw {}", deg))
    }

    fn move_forward(&mut self, cm: u32) -> ActuatorResult<()> {
        self.send_control(&format!("forward {}", cm))
    }

    fn move_back(&mut self, cm: u32) -> ActuatorResult<()> {
        self.send_control(&format!("back {}", cm))
    }

    fn move_up(&mut self, cm: u32) -> ActuatorResult<()> {
        self.send_control(&format!("up {}", cm))
    }

    fn move_down(&mut self, cm: u32) -> ActuatorResult<()> {
        self.send_control(&format!("down {}", cm))
    }

    fn set_velocity(
        &mut self,
        forward: i32,
        strafe: i32,
        vertical: i32,
        yaw_rate: i32,
    ) -> ActuatorResult<()> {
        self.send_no_reply(&rc_command(forward, strafe, vertical, yaw_rate))
    }

    fn battery_percent(&mut self) -> ActuatorResult<u8> {
        let response = self.send_read("battery?")?;
        response
            .parse::<u8>()
            .map_err(|_| ActuatorError::Unexpected {
                command: "battery?".to_string(),
                response,
            })
    }

    fn telemetry(&mut self) -> Telemetry {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        telemetry_from_state(&state)
    }

    fn emergency_stop(&mut self) -> ActuatorResult<()> {
        // The SDK may cut motors without answering
        self.send_no_reply("emergency")
    }

    fn response_timeout(&self) -> Duration {
        self.timeout
    }

    fn set_response_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn set_video_stream(&mut self, on: bool) -> ActuatorResult<()> {
        self.send_control(if on { "streamon" } else { "streamoff" })
    }

    fn disconnect(&mut self) {
        self.state_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.state_thread.take() {
            let _ = handle.join();
        }
        self.socket = None;
        info!("Disconnected from {}", self.config.drone_addr);
    }
}

impl Drop for TelloDrone {
    fn drop(&mut self) {
        self.state_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.state_thread.take() {
            let _ = handle.join();
        }
    }
}
