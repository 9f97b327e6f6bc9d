// src/command/classify.rs
//
// Maps raw actuator failure text onto the small set of recovery policies.
// The firmware reports errors only as free text, so matching is on text.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Firmware refuses motion until the IMU settles
    ImuNotReady,
    /// No acknowledgement; the action may still have happened
    Timeout,
    /// Replies no longer line up with commands
    ChannelDesync,
    Other,
}

const IMU_PATTERNS: &[&str] = &["no valid imu", "not joystick"];

const TIMEOUT_PATTERNS: &[&str] = &["did not receive a response", "max retries exceeded", "timed out"];

const DESYNC_PATTERNS: &[&str] = &[
    "unknown command",
    "invalid continuation byte",
    "utf-8",
    "utf8",
    "aborting command",
];

impl FailureKind {
    pub fn classify(text: &str) -> Self {
        let text = text.to_lowercase();
        let matches = |patterns: &[&str]| patterns.iter().any(|p| text.contains(p));

        if matches(IMU_PATTERNS) {
            Self::ImuNotReady
        } else if matches(TIMEOUT_PATTERNS) {
            Self::Timeout
        } else if matches(DESYNC_PATTERNS) {
            Self::ChannelDesync
        } else {
            Self::Other
        }
    }

    /// Whether to re-enter command mode before the next attempt
    pub fn wants_resync(&self) -> bool {
        matches!(self, Self::Timeout | Self::ChannelDesync)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ImuNotReady => "imu_not_ready",
            Self::Timeout => "timeout",
            Self::ChannelDesync => "channel_desync",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
