// src/config.rs
//
// YAML configuration. Every section has defaults tuned for a small indoor
// quadcopter; a partial file only overrides what it names.

use crate::plan::PlanMeta;
use crate::types::{
    CommandConfig, Config, ConnectionConfig, DetectionConfig, EngagementConfig, FlightConfig,
    HeadingConfig, HoldPolicy, LandingConfig, LoggingConfig, MotionConfig, TargetSpec,
    TimeoutPad,
};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("target '{0}' needs a positive real_width_m and approach_distance_m")]
    InvalidTarget(String),

    #[error("generic target '{0}' has no entry in targets")]
    MissingGenericTarget(String),

    #[error("forward_step_cm ({step}) must be >= min_move_cm ({min})")]
    StepBelowMinimum { step: u32, min: u32 },

    #[error("max_move_cm ({max}) must be >= min_move_cm ({min})")]
    InvalidMoveRange { min: u32, max: u32 },

    #[error("horizontal field of view {0} must be in (0, 180) degrees")]
    InvalidFov(f64),

    #[error("frame size must be non-zero")]
    InvalidFrame,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&contents)?;
        config.normalize_labels();
        Ok(config)
    }

    /// Target keys are matched against lowercased detection labels
    pub fn normalize_labels(&mut self) {
        self.targets = self
            .targets
            .drain()
            .map(|(label, spec)| (label.to_lowercase(), spec))
            .collect();
        self.engagement.generic_target = self.engagement.generic_target.to_lowercase();
    }

    /// Load `path`, falling back to defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let config = Self::load(&path.to_string_lossy())
                .with_context(|| format!("Failed to load config {}", path.display()))?;
            info!("✓ Configuration loaded from {}", path.display());
            config
        } else {
            warn!("Config {} not found, using defaults", path.display());
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (label, spec) in &self.targets {
            if !(spec.real_width_m > 0.0 && spec.approach_distance_m > 0.0) {
                return Err(ConfigError::InvalidTarget(label.clone()));
            }
        }
        if !self.targets.contains_key(&self.engagement.generic_target) {
            return Err(ConfigError::MissingGenericTarget(
                self.engagement.generic_target.clone(),
            ));
        }
        if self.motion.max_move_cm < self.motion.min_move_cm {
            return Err(ConfigError::InvalidMoveRange {
                min: self.motion.min_move_cm,
                max: self.motion.max_move_cm,
            });
        }
        if self.motion.forward_step_cm < self.motion.min_move_cm.max(1) {
            return Err(ConfigError::StepBelowMinimum {
                step: self.motion.forward_step_cm,
                min: self.motion.min_move_cm,
            });
        }
        let fov = self.detection.hfov_deg;
        if !(fov > 0.0 && fov < 180.0) {
            return Err(ConfigError::InvalidFov(fov));
        }
        if self.detection.frame_width == 0 || self.detection.frame_height == 0 {
            return Err(ConfigError::InvalidFrame);
        }
        Ok(())
    }

    /// Calibration for `label`, falling back to the generic entry
    pub fn target_spec(&self, label: &str) -> Option<(String, TargetSpec)> {
        let key = label.to_lowercase();
        if let Some(spec) = self.targets.get(&key) {
            return Some((key, *spec));
        }
        let generic = &self.engagement.generic_target;
        self.targets
            .get(generic)
            .map(|spec| (generic.clone(), *spec))
    }

    /// Plan metadata wins over the flight section for this run
    pub fn apply_plan_meta(&mut self, meta: &PlanMeta) {
        if let Some(alt) = meta.altitude_cm {
            self.flight.altitude_cm = alt;
        }
        if let Some(speed) = meta.speed_cm_s {
            self.flight.speed_cm_s = speed;
        }
    }
}

impl CommandConfig {
    /// Extra response grace for a command label, scaled by distance
    pub fn pad_for(&self, label: &str, distance_cm: Option<u32>) -> Duration {
        let Some(pad) = self.timeout_pad.get(label) else {
            return Duration::ZERO;
        };
        let dist = distance_cm.unwrap_or(0) as f64;
        let secs = (pad.base_s + pad.per_cm_s * dist).max(0.0);
        Duration::from_secs_f64(secs)
    }
}

impl DetectionConfig {
    /// Background poll period, bounded to [20ms, 500ms]
    pub fn poll_interval(&self) -> Duration {
        let hz = if self.poll_hz > 0.0 { self.poll_hz } else { 12.0 };
        Duration::from_secs_f64((1.0 / hz).clamp(0.02, 0.5))
    }
}

// ============================================================================
// DEFAULTS
// ============================================================================

impl Default for Config {
    fn default() -> Self {
        let mut targets = HashMap::new();
        let fire = TargetSpec {
            real_width_m: 0.066,
            approach_distance_m: 0.70,
        };
        targets.insert("fire".to_string(), fire);
        targets.insert("target".to_string(), fire);

        Self {
            flight: FlightConfig::default(),
            motion: MotionConfig::default(),
            command: CommandConfig::default(),
            connection: ConnectionConfig::default(),
            heading: HeadingConfig::default(),
            detection: DetectionConfig::default(),
            engagement: EngagementConfig::default(),
            targets,
            landing: LandingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            altitude_cm: 90,
            speed_cm_s: 30,
            low_battery_pct: 20,
            takeoff_height_cm: 20,
            takeoff_settle_ms: 500,
            imu_stabilize_ms: 3000,
            pause_per_segment_ms: 0,
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            min_move_cm: 20,
            max_move_cm: 500,
            forward_step_cm: 60,
            climb_chunk_cm: 40,
            turn_settle_ms: 200,
            move_settle_ms: 200,
        }
    }
}

impl Default for CommandConfig {
    fn default() -> Self {
        let pad = |base_s: f64, per_cm_s: f64| TimeoutPad { base_s, per_cm_s };
        let timeout_pad = HashMap::from([
            ("takeoff".to_string(), pad(12.0, 0.0)),
            ("land".to_string(), pad(6.0, 0.0)),
            ("move_up".to_string(), pad(1.0, 0.04)),
            ("move_down".to_string(), pad(1.0, 0.04)),
            ("move_forward".to_string(), pad(0.8, 0.03)),
            ("move_back".to_string(), pad(0.8, 0.03)),
        ]);

        Self {
            retries: 2,
            retry_sleep_ms: 200,
            imu_extra_attempts: 4,
            imu_retry_sleep_ms: 2500,
            response_timeout_ms: 10_000,
            success_tolerance_cm: 10.0,
            takeoff_success_height_cm: 30.0,
            resync_settle_ms: 200,
            timeout_pad,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            attempts: 4,
            backoff_ms: 1000,
            drone_addr: "192.168.10.1:8889".to_string(),
            command_bind: "0.0.0.0:8889".to_string(),
            state_bind: "0.0.0.0:8890".to_string(),
            video_url: "udp://0.0.0.0:11111".to_string(),
        }
    }
}

impl Default for HeadingConfig {
    fn default() -> Self {
        Self {
            min_turn_deg: 2.0,
            turn_chunk_deg: 45,
            drift_tolerance_deg: 5.0,
            drift_correct_max_deg: 10.0,
            open_loop_yaw_rate: 60,
            open_loop_deg_per_s: 90.0,
            open_loop_recover_ms: 300,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model_path: "models/fire.onnx".to_string(),
            class_names: vec!["fire".to_string()],
            classes: vec!["fire".to_string()],
            confidence_threshold: 0.40,
            input_size: 640,
            intra_threads: 4,
            poll_hz: 12.0,
            max_age_ms: 300,
            frame_width: 960,
            frame_height: 720,
            hfov_deg: 82.0,
        }
    }
}

impl Default for EngagementConfig {
    fn default() -> Self {
        Self {
            distance_tolerance_cm: 5,
            forward_step_cm: 60,
            approach_timeout_ms: 60_000,
            approach_lost_ms: 3000,
            target_lost_ms: 2000,
            confirm_timeout_ms: 1000,
            poll_interval_ms: 50,
            hold_poll_ms: 200,
            keepalive_ms: 8000,
            hold: HoldPolicy::UntilLost,
            hold_max_ms: 6000,
            generic_target: "target".to_string(),
        }
    }
}

impl Default for LandingConfig {
    fn default() -> Self {
        Self {
            descent_velocity: -20,
            descent_ms: 2500,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: "logs".to_string(),
            events: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "flight:\n  altitude_cm: 120\nengagement:\n  hold: timed\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.flight.altitude_cm, 120);
        assert_eq!(config.flight.low_battery_pct, 20);
        assert_eq!(config.engagement.hold, HoldPolicy::Timed);
        assert_eq!(config.motion.forward_step_cm, 60);
        assert!(config.targets.contains_key("fire"));
    }

    #[test]
    fn test_shipped_config_validates() {
        let config: Config = serde_yaml::from_str(include_str!("../mission.yaml")).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.detection.max_age_ms, 700);
    }

    #[test]
    fn test_load_or_default_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "motion:\n  forward_step_cm: 80").unwrap();
        let config = Config::load_or_default(file.path()).unwrap();
        assert_eq!(config.motion.forward_step_cm, 80);

        let missing = Config::load_or_default(Path::new("/nonexistent/mission.yaml")).unwrap();
        assert_eq!(missing.motion.forward_step_cm, 60);
    }

    #[test]
    fn test_target_keys_are_case_insensitive() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "engagement:\n  generic_target: Target\ntargets:\n  Fire:\n    real_width_m: 0.3\n    approach_distance_m: 2.0\n  Target:\n    real_width_m: 0.5\n    approach_distance_m: 1.5"
        )
        .unwrap();
        let config = Config::load_or_default(file.path()).unwrap();

        let (label, spec) = config.target_spec("fire").unwrap();
        assert_eq!(label, "fire");
        assert_eq!(spec.real_width_m, 0.3);
        let (label, _) = config.target_spec("person").unwrap();
        assert_eq!(label, "target");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.motion.forward_step_cm = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::StepBelowMinimum { .. })
        ));

        let mut config = Config::default();
        config.targets.insert(
            "smoke".to_string(),
            TargetSpec {
                real_width_m: 0.0,
                approach_distance_m: 1.0,
            },
        );
        assert!(matches!(config.validate(), Err(ConfigError::InvalidTarget(_))));

        let mut config = Config::default();
        config.detection.hfov_deg = 180.0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidFov(_))));
    }

    #[test]
    fn test_target_spec_falls_back_to_generic() {
        let mut config = Config::default();
        config.targets.insert(
            "target".to_string(),
            TargetSpec {
                real_width_m: 0.5,
                approach_distance_m: 1.5,
            },
        );
        let (label, spec) = config.target_spec("FIRE").unwrap();
        assert_eq!(label, "fire");
        assert_eq!(spec.real_width_m, 0.066);

        let (label, spec) = config.target_spec("person").unwrap();
        assert_eq!(label, "target");
        assert_eq!(spec.approach_distance_m, 1.5);
    }

    #[test]
    fn test_timeout_pad_scales_with_distance() {
        let config = CommandConfig::default();
        let pad = config.pad_for("move_forward", Some(100));
        assert!((pad.as_secs_f64() - 3.8).abs() < 1e-9);
        assert_eq!(config.pad_for("rotate_cw", Some(90)), Duration::ZERO);
        assert_eq!(config.pad_for("takeoff", None), Duration::from_secs(12));
    }

    #[test]
    fn test_poll_interval_is_bounded() {
        let mut config = DetectionConfig::default();
        config.poll_hz = 1000.0;
        assert_eq!(config.poll_interval(), Duration::from_millis(20));
        config.poll_hz = 0.5;
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
    }
}
