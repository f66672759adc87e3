//! Event bus for sequence transitions.
//!
//! The scheduler and lifecycle manager accept an `Arc<dyn EventSink>` and emit
//! one event per state transition, after the transition is committed.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::types::{AnalyticsEvent, EventType};

pub trait EventSink: Send + Sync {
    fn emit(&self, event: AnalyticsEvent);
}

/// Drops every event.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: AnalyticsEvent) {}
}

/// Writes each event to the structured log at `info`.
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: AnalyticsEvent) {
        tracing::info!(
            event_type = %event.event_type,
            run_id = %event.run_id,
            template_id = ?event.template_id,
            recipient = ?event.recipient,
            step = ?event.step,
            detail = ?event.detail,
            node_id = %event.node_id,
            "Sequence event"
        );
    }
}

/// Keeps events in memory so tests can assert on them.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<AnalyticsEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AnalyticsEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().len()
    }

    pub fn count_type(&self, event_type: EventType) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    /// Events recorded for one run, in emission order.
    pub fn for_run(&self, run_id: &str) -> Vec<AnalyticsEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.run_id == run_id)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: AnalyticsEvent) {
        self.events.lock().push(event);
    }
}

/// Builds an event stamped with a fresh id and the current time. Callers
/// fill in `step`, `content_ref`, `detail` and `node_id` as needed.
pub fn make_event(
    event_type: EventType,
    run_id: impl Into<String>,
    template_id: Option<String>,
    recipient: Option<String>,
) -> AnalyticsEvent {
    AnalyticsEvent {
        event_id: Uuid::new_v4(),
        event_type,
        run_id: run_id.into(),
        template_id,
        recipient,
        step: None,
        content_ref: None,
        detail: None,
        node_id: "local".into(),
        timestamp: Utc::now(),
    }
}

pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

pub fn log_sink() -> Arc<dyn EventSink> {
    Arc::new(LogSink)
}

pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}
