use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use drip_core::ErrorKind;

/// Behavioral signals that can cause a step to be skipped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkipConditionSet {
    #[serde(default)]
    pub skip_if_replied: bool,
    #[serde(default)]
    pub skip_if_clicked: bool,
    #[serde(default)]
    pub skip_if_meeting_booked: bool,
}

impl SkipConditionSet {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        !(self.skip_if_replied || self.skip_if_clicked || self.skip_if_meeting_booked)
    }

    /// Activity types whose presence triggers a skip, in evaluation order.
    pub fn enabled(&self) -> Vec<ActivityType> {
        let mut out = Vec::with_capacity(3);
        if self.skip_if_replied {
            out.push(ActivityType::Replied);
        }
        if self.skip_if_clicked {
            out.push(ActivityType::LinkClicked);
        }
        if self.skip_if_meeting_booked {
            out.push(ActivityType::MeetingBooked);
        }
        out
    }
}

/// One message step within a sequence template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDefinition {
    /// 0-based position, unique and strictly increasing within a template.
    pub step_number: u32,
    pub delay_days: u32,
    /// Opaque reference resolved by the content system at dispatch time.
    pub content_ref: String,
    #[serde(default)]
    pub conditions: SkipConditionSet,
}

impl StepDefinition {
    pub fn new(step_number: u32, delay_days: u32, content_ref: impl Into<String>) -> Self {
        Self {
            step_number,
            delay_days,
            content_ref: content_ref.into(),
            conditions: SkipConditionSet::none(),
        }
    }

    pub fn with_conditions(mut self, conditions: SkipConditionSet) -> Self {
        self.conditions = conditions;
        self
    }
}

/// Ordered list of steps shared by every recipient enrolled into it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceTemplate {
    pub id: Uuid,
    pub campaign_ref: String,
    pub name: String,
    pub steps: Vec<StepDefinition>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Bumped whenever the step list is replaced.
    pub version: u32,
}

impl SequenceTemplate {
    pub fn total_steps(&self) -> u32 {
        self.steps.len() as u32
    }
}

/// Lifecycle status of a sequence run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Active => "active",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recipient's progress through a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceRun {
    pub id: Uuid,
    pub template_ref: Uuid,
    pub recipient_ref: String,
    pub current_step: u32,
    /// Template length captured at enrollment; later template edits are not followed.
    pub total_steps: u32,
    pub status: RunStatus,
    pub steps_completed: u32,
    pub steps_skipped: u32,
    pub last_step_at: Option<DateTime<Utc>>,
    pub next_step_at: Option<DateTime<Utc>>,
    pub stop_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Consecutive failed dispatches of the current step.
    #[serde(default)]
    pub dispatch_attempts: u32,
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped by the store on every commit.
    #[serde(default)]
    pub version: u64,
}

impl SequenceRun {
    /// Earliest instant the run may be advanced, accounting for retry backoff.
    pub fn due_at(&self) -> Option<DateTime<Utc>> {
        match (self.next_step_at, self.next_retry_at) {
            (Some(step), Some(retry)) => Some(step.max(retry)),
            (step, _) => step,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == RunStatus::Active && self.due_at().is_some_and(|at| at <= now)
    }

    /// Skip conditions only consider activity after this instant.
    pub fn activity_window_start(&self) -> DateTime<Utc> {
        self.last_step_at.unwrap_or(self.started_at)
    }

    pub fn reset_retry(&mut self) {
        self.dispatch_attempts = 0;
        self.next_retry_at = None;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = RunStatus::Completed;
        self.completed_at = Some(now);
        self.next_step_at = None;
        self.reset_retry();
    }

    pub fn mark_cancelled(&mut self, reason: impl Into<String>, now: DateTime<Utc>) {
        self.status = RunStatus::Cancelled;
        self.stop_reason = Some(reason.into());
        self.completed_at = Some(now);
        self.next_step_at = None;
        self.reset_retry();
    }

    /// Checks the structural invariants every persisted run must satisfy.
    pub fn invariants_hold(&self) -> bool {
        let schedule_matches_status = self.next_step_at.is_some() == (self.status == RunStatus::Active);
        let counters_ordered =
            self.steps_completed <= self.current_step && self.current_step <= self.total_steps;
        let finished_means_completed =
            self.current_step < self.total_steps || self.status == RunStatus::Completed;
        let terminal_has_end = !self.status.is_terminal() || self.completed_at.is_some();
        schedule_matches_status && counters_ordered && finished_means_completed && terminal_has_end
    }
}

/// Kind of recipient behavior recorded in the activity feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    Replied,
    LinkClicked,
    MeetingBooked,
}

impl ActivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityType::Replied => "replied",
            ActivityType::LinkClicked => "link_clicked",
            ActivityType::MeetingBooked => "meeting_booked",
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub recipient_ref: String,
    pub activity_type: ActivityType,
    pub occurred_at: DateTime<Utc>,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Acknowledgement returned by the dispatch service for an accepted send.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchAck {
    pub message_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Aggregate counters for one scheduler tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub claimed: usize,
    pub advanced: usize,
    pub skipped: usize,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    /// A store error stopped the tick before every claimed run was processed.
    pub halted: bool,
}

/// A single recipient that could not be enrolled by a bulk operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrollFailure {
    pub recipient_ref: String,
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkEnrollReport {
    pub added: usize,
    /// Recipients that already had a non-terminal run.
    pub skipped: usize,
    pub errors: Vec<EnrollFailure>,
}

/// Aggregate statistics for a template, computed from all of its runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceAnalytics {
    pub template_id: Uuid,
    pub total_enrolled: u64,
    pub active: u64,
    pub paused: u64,
    pub completed: u64,
    pub cancelled: u64,
    pub steps_dispatched: u64,
    pub steps_skipped: u64,
    pub completion_rate: f64,
    pub avg_completion_secs: f64,
    pub stop_reasons: HashMap<String, u64>,
}
