// src/events/metrics.rs
//
// Run counters fed from mission events. Summarised as JSON at the end of
// a flight.

use super::{EventSink, MissionEvent};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone)]
pub struct MissionMetrics {
    pub command_attempts: Arc<AtomicU64>,
    pub command_failures: Arc<AtomicU64>,
    pub confirmed_by_telemetry: Arc<AtomicU64>,
    pub resyncs: Arc<AtomicU64>,
    pub open_loop_yaws: Arc<AtomicU64>,
    pub heading_corrections: Arc<AtomicU64>,
    pub segments_started: Arc<AtomicU64>,
    pub forward_cm: Arc<AtomicU64>,
    pub forward_failures: Arc<AtomicU64>,
    pub engagements: Arc<AtomicU64>,
    pub standoffs_reached: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl Default for MissionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MissionMetrics {
    pub fn new() -> Self {
        let counter = || Arc::new(AtomicU64::new(0));
        Self {
            command_attempts: counter(),
            command_failures: counter(),
            confirmed_by_telemetry: counter(),
            resyncs: counter(),
            open_loop_yaws: counter(),
            heading_corrections: counter(),
            segments_started: counter(),
            forward_cm: counter(),
            forward_failures: counter(),
            engagements: counter(),
            standoffs_reached: counter(),
            started_at: Instant::now(),
        }
    }

    fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn summary(&self) -> MetricsSummary {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSummary {
            command_attempts: load(&self.command_attempts),
            command_failures: load(&self.command_failures),
            confirmed_by_telemetry: load(&self.confirmed_by_telemetry),
            resyncs: load(&self.resyncs),
            open_loop_yaws: load(&self.open_loop_yaws),
            heading_corrections: load(&self.heading_corrections),
            segments_started: load(&self.segments_started),
            forward_cm: load(&self.forward_cm),
            forward_failures: load(&self.forward_failures),
            engagements: load(&self.engagements),
            standoffs_reached: load(&self.standoffs_reached),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl EventSink for MissionMetrics {
    fn emit(&self, event: MissionEvent) {
        match event {
            MissionEvent::CommandAttempt { .. } => Self::inc(&self.command_attempts),
            MissionEvent::CommandFailed { .. } => Self::inc(&self.command_failures),
            MissionEvent::CommandConfirmed { .. } => Self::inc(&self.confirmed_by_telemetry),
            MissionEvent::Resync { .. } => Self::inc(&self.resyncs),
            MissionEvent::OpenLoopYaw { .. } => Self::inc(&self.open_loop_yaws),
            MissionEvent::HeadingCorrected { .. } => Self::inc(&self.heading_corrections),
            MissionEvent::SegmentStarted { .. } => Self::inc(&self.segments_started),
            MissionEvent::ForwardStep { cm, ok: true, .. } => {
                self.forward_cm.fetch_add(cm as u64, Ordering::Relaxed);
            }
            MissionEvent::ForwardStep { ok: false, .. } => Self::inc(&self.forward_failures),
            MissionEvent::EngagementFinished { result } => {
                Self::inc(&self.engagements);
                if result.standoff_reached {
                    Self::inc(&self.standoffs_reached);
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub command_attempts: u64,
    pub command_failures: u64,
    pub confirmed_by_telemetry: u64,
    pub resyncs: u64,
    pub open_loop_yaws: u64,
    pub heading_corrections: u64,
    pub segments_started: u64,
    pub forward_cm: u64,
    pub forward_failures: u64,
    pub engagements: u64,
    pub standoffs_reached: u64,
    pub elapsed_secs: f64,
}
