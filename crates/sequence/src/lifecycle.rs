//! Run lifecycle manager: templates, enrollment and the
//! pause/resume/stop state machine.

use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use drip_core::config::LifecycleConfig;
use drip_core::event_bus::{make_event, EventSink};
use drip_core::types::EventType;
use drip_core::{DripError, DripResult, ErrorKind};

use crate::analytics;
use crate::state_machine::RunStateMachine;
use crate::steps;
use crate::store::{ClaimedRun, SequenceStore};
use crate::types::{
    BulkEnrollReport, EnrollFailure, RunStatus, SequenceAnalytics, SequenceRun, SequenceTemplate,
    StepDefinition,
};

#[derive(Clone)]
pub struct SequenceManager {
    store: Arc<dyn SequenceStore>,
    event_sink: Arc<dyn EventSink>,
    config: LifecycleConfig,
    node_id: String,
}

impl std::fmt::Debug for SequenceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceManager")
            .field("config", &self.config)
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl SequenceManager {
    pub fn new(store: Arc<dyn SequenceStore>, config: LifecycleConfig) -> Self {
        Self {
            store,
            event_sink: drip_core::event_bus::noop_sink(),
            config,
            node_id: "local".to_string(),
        }
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    // ─── Templates ─────────────────────────────────────────────────────────

    pub async fn create_template(
        &self,
        campaign_ref: &str,
        name: &str,
        steps: Vec<StepDefinition>,
        now: DateTime<Utc>,
    ) -> DripResult<SequenceTemplate> {
        steps::validate_steps(&steps)?;
        let template = SequenceTemplate {
            id: Uuid::new_v4(),
            campaign_ref: campaign_ref.to_string(),
            name: name.to_string(),
            steps,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        info!(
            template_id = %template.id,
            name = %template.name,
            steps = template.steps.len(),
            "Creating sequence template"
        );
        self.store.insert_template(template.clone()).await?;
        Ok(template)
    }

    pub async fn get_template(&self, template_id: Uuid) -> DripResult<SequenceTemplate> {
        self.store
            .get_template(template_id)
            .await?
            .ok_or_else(|| DripError::TemplateNotFound(template_id.to_string()))
    }

    pub async fn list_templates(&self) -> DripResult<Vec<SequenceTemplate>> {
        self.store.list_templates().await
    }

    /// Replaces a template's step list. Runs already enrolled keep the step
    /// count they started with.
    pub async fn replace_steps(
        &self,
        template_id: Uuid,
        steps: Vec<StepDefinition>,
        now: DateTime<Utc>,
    ) -> DripResult<SequenceTemplate> {
        steps::validate_steps(&steps)?;
        let mut template = self.get_template(template_id).await?;
        template.steps = steps;
        template.version += 1;
        template.updated_at = now;
        info!(
            template_id = %template_id,
            version = template.version,
            steps = template.steps.len(),
            "Replacing template steps"
        );
        self.store.update_template(template.clone()).await?;
        Ok(template)
    }

    /// Deep-copies a template's steps into a new, independent template. Runs
    /// are not copied.
    pub async fn clone_template(
        &self,
        template_id: Uuid,
        new_name: &str,
        now: DateTime<Utc>,
    ) -> DripResult<SequenceTemplate> {
        let source = self.get_template(template_id).await?;
        let copy = SequenceTemplate {
            id: Uuid::new_v4(),
            campaign_ref: source.campaign_ref.clone(),
            name: new_name.to_string(),
            steps: source.steps.clone(),
            created_at: now,
            updated_at: now,
            version: 1,
        };
        info!(source = %template_id, template_id = %copy.id, name = %new_name, "Cloned template");
        self.store.insert_template(copy.clone()).await?;
        Ok(copy)
    }

    // ─── Enrollment ────────────────────────────────────────────────────────

    /// Creates an Active run for `recipient` positioned at `start_step`.
    pub async fn enroll(
        &self,
        template_id: Uuid,
        recipient: &str,
        start_step: u32,
        now: DateTime<Utc>,
    ) -> DripResult<SequenceRun> {
        let template = self.get_template(template_id).await?;
        self.enroll_into(&template, recipient, start_step, now).await
    }

    /// Enrolls each recipient independently; one bad recipient never aborts
    /// the batch.
    pub async fn bulk_enroll(
        &self,
        template_id: Uuid,
        recipients: &[String],
        now: DateTime<Utc>,
    ) -> DripResult<BulkEnrollReport> {
        let template = self.get_template(template_id).await?;
        let mut report = BulkEnrollReport::default();

        for recipient in recipients {
            match self.enroll_into(&template, recipient, 0, now).await {
                Ok(_) => report.added += 1,
                Err(DripError::DuplicateActiveRun { .. }) => report.skipped += 1,
                Err(e) => report.errors.push(EnrollFailure {
                    recipient_ref: recipient.clone(),
                    kind: e.kind(),
                    message: e.to_string(),
                }),
            }
        }

        info!(
            template_id = %template_id,
            added = report.added,
            skipped = report.skipped,
            errors = report.errors.len(),
            "Bulk enrollment finished"
        );
        Ok(report)
    }

    async fn enroll_into(
        &self,
        template: &SequenceTemplate,
        recipient: &str,
        start_step: u32,
        now: DateTime<Utc>,
    ) -> DripResult<SequenceRun> {
        let recipient = recipient.trim();
        if recipient.is_empty() {
            return Err(DripError::InvalidRecipient(
                "recipient must not be blank".to_string(),
            ));
        }
        let total_steps = template.total_steps();
        if total_steps == 0 {
            return Err(DripError::EmptyTemplate(template.id.to_string()));
        }
        if start_step >= total_steps {
            return Err(DripError::InvalidStartStep {
                start_step,
                total_steps,
            });
        }

        let run = SequenceRun {
            id: Uuid::new_v4(),
            template_ref: template.id,
            recipient_ref: recipient.to_string(),
            current_step: start_step,
            total_steps,
            status: RunStatus::Active,
            steps_completed: 0,
            steps_skipped: 0,
            last_step_at: None,
            next_step_at: Some(now + steps::delay_before(template, start_step)),
            stop_reason: None,
            started_at: now,
            completed_at: None,
            dispatch_attempts: 0,
            next_retry_at: None,
            version: 0,
        };
        self.store.insert_run(run.clone()).await?;

        info!(
            run_id = %run.id,
            template_id = %template.id,
            recipient = %run.recipient_ref,
            start_step,
            "Recipient enrolled into sequence"
        );
        metrics::counter!("sequence.runs_enrolled").increment(1);
        self.emit(EventType::SequenceEnrolled, &run, None);
        Ok(run)
    }

    // ─── State transitions ─────────────────────────────────────────────────

    /// Pauses an Active run. The remaining wait is discarded: resuming
    /// schedules the current step a full `delay_days` from the resume time.
    pub async fn pause(&self, run_id: Uuid, now: DateTime<Utc>) -> DripResult<SequenceRun> {
        let run = self
            .transition(run_id, RunStatus::Paused, |run| {
                run.status = RunStatus::Paused;
                run.next_step_at = None;
                run.reset_retry();
            })
            .await?;
        info!(run_id = %run_id, "Sequence run paused");
        self.emit(EventType::SequencePaused, &run, None);
        Ok(run)
    }

    pub async fn resume(&self, run_id: Uuid, now: DateTime<Utc>) -> DripResult<SequenceRun> {
        let current = self.get_status(run_id).await?;
        let template = self.get_template(current.template_ref).await?;

        let run = self
            .transition(run_id, RunStatus::Active, |run| {
                run.status = RunStatus::Active;
                run.next_step_at = Some(now + steps::delay_before(&template, run.current_step));
                run.reset_retry();
            })
            .await?;
        info!(run_id = %run_id, next_step_at = ?run.next_step_at, "Sequence run resumed");
        self.emit(EventType::SequenceResumed, &run, None);
        Ok(run)
    }

    /// Cancels an Active or Paused run. Safe to call while a tick is
    /// advancing the same run: it waits for the tick's lease and applies on
    /// top of the committed result.
    pub async fn stop(
        &self,
        run_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DripResult<SequenceRun> {
        let run = self
            .transition(run_id, RunStatus::Cancelled, |run| {
                run.mark_cancelled(reason, now);
            })
            .await?;
        info!(run_id = %run_id, reason, "Sequence run stopped");
        metrics::counter!("sequence.runs_cancelled").increment(1);
        self.emit(EventType::SequenceCancelled, &run, Some(reason.to_string()));
        Ok(run)
    }

    /// Stops every non-terminal run of `template_id` belonging to one of
    /// `recipients`. Returns the number of runs stopped.
    pub async fn bulk_stop(
        &self,
        template_id: Uuid,
        recipients: &[String],
        reason: &str,
        now: DateTime<Utc>,
    ) -> DripResult<usize> {
        let mut stopped = 0;
        for recipient in recipients {
            if let Some(run) = self.store.find_open_run(template_id, recipient.trim()).await? {
                if self.stop_if_open(run.id, reason, now).await? {
                    stopped += 1;
                }
            }
        }
        info!(template_id = %template_id, stopped, reason, "Bulk stop finished");
        Ok(stopped)
    }

    /// Stops every non-terminal run of a recipient across all templates.
    pub async fn stop_recipient(
        &self,
        recipient: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> DripResult<usize> {
        let recipient = recipient.trim();
        let mut stopped = 0;
        for run in self.store.runs_for_recipient(recipient).await? {
            if run.status.is_terminal() {
                continue;
            }
            if self.stop_if_open(run.id, reason, now).await? {
                stopped += 1;
            }
        }
        info!(recipient, stopped, reason, "Stopped recipient runs");
        Ok(stopped)
    }

    /// Stops a run, treating "already terminal" as nothing to do. Store
    /// failures are returned; other per-run failures are logged.
    async fn stop_if_open(&self, run_id: Uuid, reason: &str, now: DateTime<Utc>) -> DripResult<bool> {
        match self.stop(run_id, reason, now).await {
            Ok(_) => Ok(true),
            Err(DripError::InvalidStateTransition { .. }) => Ok(false),
            Err(e) if e.kind() == ErrorKind::Store => Err(e),
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Could not stop sequence run");
                Ok(false)
            }
        }
    }

    // ─── Queries ───────────────────────────────────────────────────────────

    pub async fn get_status(&self, run_id: Uuid) -> DripResult<SequenceRun> {
        self.store
            .get_run(run_id)
            .await?
            .ok_or_else(|| DripError::RunNotFound(run_id.to_string()))
    }

    pub async fn list_runs(&self, template_id: Uuid) -> DripResult<Vec<SequenceRun>> {
        self.store.list_runs(template_id).await
    }

    pub async fn runs_for_recipient(&self, recipient: &str) -> DripResult<Vec<SequenceRun>> {
        self.store.runs_for_recipient(recipient).await
    }

    pub async fn get_analytics(&self, template_id: Uuid) -> DripResult<SequenceAnalytics> {
        self.get_template(template_id).await?;
        let runs = self.store.list_runs(template_id).await?;
        Ok(analytics::summarize(template_id, &runs))
    }

    // ─── Internal helpers ──────────────────────────────────────────────────

    /// Leases the run, validates `current -> requested`, applies `mutate` and
    /// commits, all under the same lease.
    async fn transition<F>(
        &self,
        run_id: Uuid,
        requested: RunStatus,
        mutate: F,
    ) -> DripResult<SequenceRun>
    where
        F: FnOnce(&mut SequenceRun),
    {
        let ClaimedRun { mut run, token } = self.lock_for_update(run_id).await?;

        if let Err(e) = RunStateMachine::ensure(run.status, requested) {
            self.store.release_run(run_id, token).await?;
            return Err(e);
        }

        mutate(&mut run);
        self.store.commit_run(run, token).await
    }

    /// Waits up to `lock_wait_ms` for any in-flight holder to release the run.
    async fn lock_for_update(&self, run_id: Uuid) -> DripResult<ClaimedRun> {
        let ttl = Duration::seconds(self.config.lease_secs as i64);
        let deadline = Instant::now() + StdDuration::from_millis(self.config.lock_wait_ms);
        loop {
            if let Some(claim) = self.store.lock_run(run_id, ttl).await? {
                return Ok(claim);
            }
            if Instant::now() >= deadline {
                return Err(DripError::RunLocked(run_id.to_string()));
            }
            tokio::time::sleep(StdDuration::from_millis(self.config.lock_poll_ms.max(1))).await;
        }
    }

    fn emit(&self, event_type: EventType, run: &SequenceRun, detail: Option<String>) {
        let mut event = make_event(
            event_type,
            run.id.to_string(),
            Some(run.template_ref.to_string()),
            Some(run.recipient_ref.clone()),
        );
        event.step = Some(run.current_step);
        event.detail = detail;
        event.node_id = self.node_id.clone();
        self.event_sink.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySequenceStore;
    use drip_core::event_bus::capture_sink;

    fn manager() -> (Arc<InMemorySequenceStore>, SequenceManager) {
        let store = Arc::new(InMemorySequenceStore::new());
        let manager = SequenceManager::new(store.clone(), LifecycleConfig::default());
        (store, manager)
    }

    fn three_steps() -> Vec<StepDefinition> {
        vec![
            StepDefinition::new(0, 0, "intro"),
            StepDefinition::new(1, 2, "follow-up"),
            StepDefinition::new(2, 5, "breakup"),
        ]
    }

    #[tokio::test]
    async fn test_enroll_validation() {
        let (_, mgr) = manager();
        let now = Utc::now();
        let empty = mgr.create_template("c1", "Empty", vec![], now).await.unwrap();
        let err = mgr.enroll(empty.id, "a@example.com", 0, now).await.unwrap_err();
        assert!(matches!(err, DripError::EmptyTemplate(_)));

        let tpl = mgr.create_template("c1", "Outreach", three_steps(), now).await.unwrap();
        let err = mgr.enroll(tpl.id, "a@example.com", 3, now).await.unwrap_err();
        assert!(matches!(
            err,
            DripError::InvalidStartStep {
                start_step: 3,
                total_steps: 3
            }
        ));
        assert_eq!(err.kind(), ErrorKind::Validation);

        let err = mgr.enroll(tpl.id, "   ", 0, now).await.unwrap_err();
        assert!(matches!(err, DripError::InvalidRecipient(_)));

        let err = mgr.enroll(Uuid::new_v4(), "a@example.com", 0, now).await.unwrap_err();
        assert!(matches!(err, DripError::TemplateNotFound(_)));
    }

    #[tokio::test]
    async fn test_enroll_at_start_step() {
        let (_, mgr) = manager();
        let now = Utc::now();
        let tpl = mgr.create_template("c1", "Outreach", three_steps(), now).await.unwrap();

        let run = mgr.enroll(tpl.id, "a@example.com", 1, now).await.unwrap();
        assert_eq!(run.current_step, 1);
        assert_eq!(run.total_steps, 3);
        assert_eq!(run.next_step_at, Some(now + Duration::days(2)));
        assert!(run.invariants_hold());
    }

    #[tokio::test]
    async fn test_pause_resume_recomputes_full_delay() {
        let (_, mgr) = manager();
        let t0 = Utc::now();
        let tpl = mgr.create_template("c1", "Outreach", three_steps(), t0).await.unwrap();
        let run = mgr.enroll(tpl.id, "a@example.com", 1, t0).await.unwrap();

        let paused = mgr.pause(run.id, t0 + Duration::days(1)).await.unwrap();
        assert_eq!(paused.status, RunStatus::Paused);
        assert_eq!(paused.next_step_at, None);
        assert!(paused.invariants_hold());

        let resumed_at = t0 + Duration::days(10);
        let resumed = mgr.resume(run.id, resumed_at).await.unwrap();
        assert_eq!(resumed.status, RunStatus::Active);
        assert_eq!(resumed.next_step_at, Some(resumed_at + Duration::days(2)));
    }

    #[tokio::test]
    async fn test_invalid_transitions() {
        let (_, mgr) = manager();
        let now = Utc::now();
        let tpl = mgr.create_template("c1", "Outreach", three_steps(), now).await.unwrap();
        let run = mgr.enroll(tpl.id, "a@example.com", 0, now).await.unwrap();

        let err = mgr.resume(run.id, now).await.unwrap_err();
        assert!(matches!(err, DripError::InvalidStateTransition { .. }));

        mgr.stop(run.id, "unsubscribed", now).await.unwrap();
        assert!(matches!(
            mgr.pause(run.id, now).await.unwrap_err(),
            DripError::InvalidStateTransition { .. }
        ));
        assert!(matches!(
            mgr.stop(run.id, "again", now).await.unwrap_err(),
            DripError::InvalidStateTransition { .. }
        ));

        // A rejected transition must not leave the run leased.
        let stopped = mgr.get_status(run.id).await.unwrap();
        assert_eq!(stopped.status, RunStatus::Cancelled);
        assert_eq!(stopped.stop_reason.as_deref(), Some("unsubscribed"));
        assert_eq!(stopped.completed_at, Some(now));
        assert!(stopped.invariants_hold());
    }

    #[tokio::test]
    async fn test_stop_paused_run() {
        let (_, mgr) = manager();
        let now = Utc::now();
        let tpl = mgr.create_template("c1", "Outreach", three_steps(), now).await.unwrap();
        let run = mgr.enroll(tpl.id, "a@example.com", 0, now).await.unwrap();
        mgr.pause(run.id, now).await.unwrap();
        let stopped = mgr.stop(run.id, "bounced", now).await.unwrap();
        assert_eq!(stopped.status, RunStatus::Cancelled);
        assert_eq!(stopped.next_step_at, None);
    }

    #[tokio::test]
    async fn test_stop_waits_for_lease() {
        let (store, mgr) = manager();
        let now = Utc::now();
        let tpl = mgr.create_template("c1", "Outreach", three_steps(), now).await.unwrap();
        let run = mgr.enroll(tpl.id, "a@example.com", 0, now).await.unwrap();

        let claim = store
            .lock_run(run.id, Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();
        let holder = store.clone();
        let release = tokio::spawn(async move {
            tokio::time::sleep(StdDuration::from_millis(50)).await;
            holder.release_run(claim.run.id, claim.token).await.unwrap();
        });

        let stopped = mgr.stop(run.id, "unsubscribed", now).await.unwrap();
        release.await.unwrap();
        assert_eq!(stopped.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_lock_wait_times_out() {
        let store = Arc::new(InMemorySequenceStore::new());
        let mgr = SequenceManager::new(
            store.clone(),
            LifecycleConfig {
                lock_wait_ms: 30,
                lock_poll_ms: 5,
                lease_secs: 30,
            },
        );
        let now = Utc::now();
        let tpl = mgr.create_template("c1", "Outreach", three_steps(), now).await.unwrap();
        let run = mgr.enroll(tpl.id, "a@example.com", 0, now).await.unwrap();
        let _held = store
            .lock_run(run.id, Duration::minutes(5))
            .await
            .unwrap()
            .unwrap();

        let err = mgr.pause(run.id, now).await.unwrap_err();
        assert!(matches!(err, DripError::RunLocked(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_bulk_enroll_partial_failures() {
        let (_, mgr) = manager();
        let now = Utc::now();
        let tpl = mgr.create_template("c1", "Outreach", three_steps(), now).await.unwrap();
        mgr.enroll(tpl.id, "existing@example.com", 0, now).await.unwrap();

        let recipients = vec![
            "a@example.com".to_string(),
            "existing@example.com".to_string(),
            "".to_string(),
            "b@example.com".to_string(),
            "a@example.com".to_string(),
        ];
        let report = mgr.bulk_enroll(tpl.id, &recipients, now).await.unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(report.skipped, 2);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_bulk_stop_and_stop_recipient() {
        let (_, mgr) = manager();
        let now = Utc::now();
        let tpl = mgr.create_template("c1", "Outreach", three_steps(), now).await.unwrap();
        let other = mgr.clone_template(tpl.id, "Outreach v2", now).await.unwrap();
        for r in ["a@example.com", "b@example.com", "c@example.com"] {
            mgr.enroll(tpl.id, r, 0, now).await.unwrap();
        }
        mgr.enroll(other.id, "a@example.com", 0, now).await.unwrap();

        let stopped = mgr
            .bulk_stop(
                tpl.id,
                &["a@example.com".to_string(), "z@example.com".to_string()],
                "campaign_ended",
                now,
            )
            .await
            .unwrap();
        assert_eq!(stopped, 1);

        let stopped = mgr.stop_recipient("a@example.com", "unsubscribed", now).await.unwrap();
        assert_eq!(stopped, 1);
        let runs = mgr.runs_for_recipient("a@example.com").await.unwrap();
        assert!(runs.iter().all(|r| r.status == RunStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_stop_recipient_trims_address() {
        let (_, mgr) = manager();
        let now = Utc::now();
        let tpl = mgr.create_template("c1", "Outreach", three_steps(), now).await.unwrap();
        let run = mgr.enroll(tpl.id, "a@example.com", 0, now).await.unwrap();

        let stopped = mgr.stop_recipient("  a@example.com \n", "unsubscribed", now).await.unwrap();
        assert_eq!(stopped, 1);
        assert_eq!(mgr.get_status(run.id).await.unwrap().status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_clone_template_is_independent() {
        let (_, mgr) = manager();
        let now = Utc::now();
        let tpl = mgr.create_template("c1", "Outreach", three_steps(), now).await.unwrap();
        mgr.enroll(tpl.id, "a@example.com", 0, now).await.unwrap();

        let copy = mgr.clone_template(tpl.id, "Outreach copy", now).await.unwrap();
        assert_ne!(copy.id, tpl.id);
        assert_eq!(copy.steps, tpl.steps);
        assert!(mgr.list_runs(copy.id).await.unwrap().is_empty());

        mgr.replace_steps(copy.id, vec![StepDefinition::new(0, 1, "solo")], now)
            .await
            .unwrap();
        assert_eq!(mgr.get_template(tpl.id).await.unwrap().steps.len(), 3);
        assert_eq!(mgr.list_templates().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_replace_steps_keeps_run_snapshot() {
        let (_, mgr) = manager();
        let now = Utc::now();
        let tpl = mgr.create_template("c1", "Outreach", three_steps(), now).await.unwrap();
        let run = mgr.enroll(tpl.id, "a@example.com", 0, now).await.unwrap();

        let updated = mgr
            .replace_steps(tpl.id, vec![StepDefinition::new(0, 0, "only")], now)
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(mgr.get_status(run.id).await.unwrap().total_steps, 3);

        let bad = vec![StepDefinition::new(1, 0, "x")];
        assert!(mgr.replace_steps(tpl.id, bad, now).await.is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let sink = capture_sink();
        let store = Arc::new(InMemorySequenceStore::new());
        let mgr = SequenceManager::new(store, LifecycleConfig::default())
            .with_event_sink(sink.clone())
            .with_node_id("node-7");
        let now = Utc::now();
        let tpl = mgr.create_template("c1", "Outreach", three_steps(), now).await.unwrap();
        let run = mgr.enroll(tpl.id, "a@example.com", 0, now).await.unwrap();
        mgr.pause(run.id, now).await.unwrap();
        mgr.resume(run.id, now).await.unwrap();
        mgr.stop(run.id, "manual", now).await.unwrap();

        assert_eq!(sink.count(), 4);
        assert_eq!(sink.count_type(EventType::SequenceCancelled), 1);
        assert!(sink.events().iter().all(|e| e.node_id == "node-7"));
    }

    #[tokio::test]
    async fn test_analytics_requires_template() {
        let (_, mgr) = manager();
        let now = Utc::now();
        assert!(matches!(
            mgr.get_analytics(Uuid::new_v4()).await.unwrap_err(),
            DripError::TemplateNotFound(_)
        ));
        let tpl = mgr.create_template("c1", "Outreach", three_steps(), now).await.unwrap();
        mgr.enroll(tpl.id, "a@example.com", 0, now).await.unwrap();
        let stats = mgr.get_analytics(tpl.id).await.unwrap();
        assert_eq!(stats.total_enrolled, 1);
        assert_eq!(stats.active, 1);
    }
}
