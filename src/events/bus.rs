// src/events/bus.rs
//
// Bounded in-memory queue of mission events. Drained by whoever wants a
// record of the run; the oldest events go first when it fills up.

use super::{EventSink, MissionEvent};
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

pub struct EventBus {
    events: Mutex<VecDeque<MissionEvent>>,
    max_pending: usize,
}

impl EventBus {
    pub fn new(max_pending: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_pending)),
            max_pending: max_pending.max(1),
        }
    }

    pub fn publish(&self, event: MissionEvent) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if events.len() >= self.max_pending {
            warn!("Event bus full ({} events), dropping oldest", self.max_pending);
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn drain(&self) -> Vec<MissionEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: MissionEvent) {
        self.publish(event);
    }
}
