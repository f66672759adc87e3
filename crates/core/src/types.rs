use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Analytics event emitted by the sequence engine for downstream rollups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyticsEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    /// Sequence run the event belongs to.
    pub run_id: String,
    pub template_id: Option<String>,
    pub recipient: Option<String>,
    /// Step index the event refers to, when step-scoped.
    pub step: Option<u32>,
    pub content_ref: Option<String>,
    pub detail: Option<String>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SequenceEnrolled,
    SequenceStepDispatched,
    SequenceStepSkipped,
    SequenceDispatchFailed,
    SequencePaused,
    SequenceResumed,
    SequenceCompleted,
    SequenceCancelled,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::SequenceEnrolled => "sequence_enrolled",
            EventType::SequenceStepDispatched => "sequence_step_dispatched",
            EventType::SequenceStepSkipped => "sequence_step_skipped",
            EventType::SequenceDispatchFailed => "sequence_dispatch_failed",
            EventType::SequencePaused => "sequence_paused",
            EventType::SequenceResumed => "sequence_resumed",
            EventType::SequenceCompleted => "sequence_completed",
            EventType::SequenceCancelled => "sequence_cancelled",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
