// src/events/mod.rs
//
// Structured mission events. Components publish to an injected sink
// instead of reaching for a global logger.

pub mod bus;
pub mod metrics;

pub use bus::EventBus;
pub use metrics::MissionMetrics;

use crate::command::FailureKind;
use crate::engagement::EngagementPhase;
use crate::mission::MissionState;
use crate::types::{EngagementResult, MissionStatus};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MissionEvent {
    StateChanged {
        from: MissionState,
        to: MissionState,
    },
    CommandAttempt {
        label: String,
        attempt: u32,
        budget: u32,
        /// None when the attempt succeeded
        failure: Option<FailureKind>,
    },
    /// A timed-out command whose effect was confirmed by telemetry
    CommandConfirmed {
        label: String,
        attempt: u32,
    },
    CommandFailed {
        label: String,
        kind: FailureKind,
        attempts: u32,
    },
    Resync {
        label: String,
        ok: bool,
    },
    OpenLoopYaw {
        deg: f64,
        duration_ms: u64,
        ok: bool,
    },
    HeadingCorrected {
        expected: f64,
        actual: f64,
        correction: f64,
    },
    SegmentStarted {
        index: usize,
        turn_signed_deg: i32,
        dist_cm: u32,
    },
    ForwardStep {
        segment: usize,
        cm: u32,
        ok: bool,
    },
    LowBattery {
        pct: u8,
        threshold: u8,
    },
    TargetSighted {
        label: String,
        confidence: f32,
        dx: f32,
    },
    EngagementPhase {
        phase: EngagementPhase,
    },
    EngagementFinished {
        result: EngagementResult,
    },
    Landing {
        method: &'static str,
        ok: bool,
    },
    MissionFinished {
        status: MissionStatus,
        reason: Option<String>,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: MissionEvent);
}

/// Logs every event; payloads go out as JSON on the `mission_events` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: MissionEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => info!(target: "mission_events", "{}", json),
            Err(e) => debug!("Failed to serialize event {:?}: {}", event, e),
        }
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: MissionEvent) {}
}

/// Forwards each event to several sinks
#[derive(Default, Clone)]
pub struct Fanout {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl EventSink for Fanout {
    fn emit(&self, event: MissionEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(event.clone());
            }
            last.emit(event);
        }
    }
}
