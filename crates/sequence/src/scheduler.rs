//! Scheduler / advancer: claims due runs and moves each one forward by
//! skipping, dispatching or completing steps.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use drip_core::config::{RetryConfig, SchedulerConfig};
use drip_core::event_bus::{make_event, EventSink};
use drip_core::types::{AnalyticsEvent, EventType};
use drip_core::{DripError, DripResult, ErrorKind};

use crate::conditions::ConditionEvaluator;
use crate::dispatch::{dispatch_with_timeout, Dispatcher};
use crate::steps;
use crate::store::{ClaimedRun, LockToken, SequenceStore};
use crate::types::{RunStatus, SequenceRun, SequenceTemplate, StepDefinition, TickReport};

/// Stop reason recorded when bounded retries run out.
pub const DISPATCH_EXHAUSTED: &str = "dispatch_exhausted";
/// Stop reason recorded when a template edit removed the run's current step.
pub const TEMPLATE_TRUNCATED: &str = "template_truncated";

/// What happened to one run during a tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    pub advanced: bool,
    pub skipped: u32,
    pub dispatched: u32,
    pub completed: bool,
    pub failed: bool,
}

impl RunOutcome {
    fn failure() -> Self {
        Self {
            failed: true,
            ..Self::default()
        }
    }
}

impl TickReport {
    fn absorb(&mut self, outcome: &RunOutcome) {
        if outcome.advanced {
            self.advanced += 1;
        }
        self.skipped += outcome.skipped as usize;
        self.dispatched += outcome.dispatched as usize;
        if outcome.completed {
            self.completed += 1;
        }
        if outcome.failed {
            self.failed += 1;
        }
    }
}

/// Result of stepping a leased run: a new state to commit, nothing to write,
/// or a lease that expired before dispatch.
enum Advance {
    Commit {
        run: SequenceRun,
        outcome: RunOutcome,
        events: Vec<AnalyticsEvent>,
    },
    Untouched {
        outcome: RunOutcome,
        events: Vec<AnalyticsEvent>,
    },
    LeaseLost {
        outcome: RunOutcome,
    },
}

/// Advances due sequence runs. Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct SequenceScheduler {
    store: Arc<dyn SequenceStore>,
    evaluator: ConditionEvaluator,
    dispatcher: Arc<dyn Dispatcher>,
    event_sink: Arc<dyn EventSink>,
    config: SchedulerConfig,
    retry: RetryConfig,
    node_id: String,
}

impl std::fmt::Debug for SequenceScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceScheduler")
            .field("config", &self.config)
            .field("retry", &self.retry)
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl SequenceScheduler {
    pub fn new(
        store: Arc<dyn SequenceStore>,
        evaluator: ConditionEvaluator,
        dispatcher: Arc<dyn Dispatcher>,
        config: SchedulerConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            evaluator,
            dispatcher,
            event_sink: drip_core::event_bus::noop_sink(),
            config,
            retry,
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

    /// Runs one tick: claims every run due at `now` (up to the batch size)
    /// and advances them in parallel, each under its own lease.
    ///
    /// Per-run dispatch failures are counted, never returned. A store error
    /// while claiming fails the tick; a store error while committing halts
    /// it, leaving runs already committed in place.
    pub async fn advance_due_runs(&self, now: DateTime<Utc>) -> DripResult<TickReport> {
        let claims = self
            .store
            .claim_due_runs(now, self.config.batch_size, self.lease_ttl())
            .await?;

        let mut report = TickReport {
            claimed: claims.len(),
            ..TickReport::default()
        };
        if claims.is_empty() {
            debug!("No sequence runs due");
            return Ok(report);
        }

        let permits = Arc::new(Semaphore::new(self.config.worker_concurrency.max(1)));
        let halted = Arc::new(AtomicBool::new(false));
        let mut tasks = JoinSet::new();

        for claim in claims {
            let this = self.clone();
            let permits = permits.clone();
            let halted = halted.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                if halted.load(Ordering::Acquire) {
                    this.abandon(&claim).await;
                    return RunOutcome::failure();
                }
                let run_id = claim.run.id;
                match this.advance_run(claim, now).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        if e.kind() == ErrorKind::Store {
                            error!(run_id = %run_id, error = %e, "Store failure, halting tick");
                            halted.store(true, Ordering::Release);
                        } else {
                            warn!(run_id = %run_id, error = %e, "Failed to advance sequence run");
                        }
                        RunOutcome::failure()
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.absorb(&outcome),
                Err(e) => {
                    error!(error = %e, "Sequence run task panicked");
                    report.failed += 1;
                }
            }
        }
        report.halted = halted.load(Ordering::Acquire);

        info!(
            claimed = report.claimed,
            advanced = report.advanced,
            skipped = report.skipped,
            dispatched = report.dispatched,
            completed = report.completed,
            failed = report.failed,
            halted = report.halted,
            "Sequence tick finished"
        );
        Ok(report)
    }

    /// Advances a single leased run and commits or releases it.
    pub async fn advance_run(&self, claim: ClaimedRun, now: DateTime<Utc>) -> DripResult<RunOutcome> {
        let ClaimedRun { run, token } = claim;
        let run_id = run.id;

        match self.step_run(run, token, now).await {
            Ok(Advance::Commit {
                run,
                outcome,
                events,
            }) => {
                if let Err(e) = self.store.commit_run(run, token).await {
                    self.release_quietly(run_id, token).await;
                    return Err(e);
                }
                self.emit_all(events);
                Ok(outcome)
            }
            Ok(Advance::Untouched { outcome, events }) => {
                self.store.release_run(run_id, token).await?;
                self.emit_all(events);
                Ok(outcome)
            }
            // The lease now belongs to another worker; nothing to release.
            Ok(Advance::LeaseLost { outcome }) => Ok(outcome),
            Err(e) => {
                self.release_quietly(run_id, token).await;
                Err(e)
            }
        }
    }

    /// The per-run procedure. Each iteration either moves `current_step`
    /// forward or exits, so the loop runs at most `total_steps + 1` times.
    async fn step_run(
        &self,
        mut run: SequenceRun,
        token: LockToken,
        now: DateTime<Utc>,
    ) -> DripResult<Advance> {
        let mut outcome = RunOutcome::default();
        let mut events = Vec::new();

        if run.status != RunStatus::Active {
            return Ok(Advance::Untouched { outcome, events });
        }

        let template = self
            .store
            .get_template(run.template_ref)
            .await?
            .ok_or_else(|| DripError::TemplateNotFound(run.template_ref.to_string()))?;

        for _ in 0..=run.total_steps {
            if run.current_step >= run.total_steps {
                run.mark_completed(now);
                outcome.completed = true;
                events.push(self.run_event(EventType::SequenceCompleted, &run, None));
                break;
            }

            let step = match steps::step_at(&template, run.current_step) {
                Ok(step) => step.clone(),
                Err(DripError::StepNotFound { .. }) => {
                    warn!(
                        run_id = %run.id,
                        step = run.current_step,
                        "Template no longer has the current step, completing run"
                    );
                    run.mark_completed(now);
                    run.stop_reason = Some(TEMPLATE_TRUNCATED.to_string());
                    outcome.completed = true;
                    events.push(self.run_event(EventType::SequenceCompleted, &run, None));
                    break;
                }
                Err(e) => return Err(e),
            };

            let skip = match self.evaluator.should_skip(&run, &step).await {
                Ok(skip) => skip,
                Err(e) => {
                    warn!(run_id = %run.id, error = %e, "Activity feed query failed");
                    outcome.failed = true;
                    if outcome.skipped == 0 {
                        return Ok(Advance::Untouched { outcome, events });
                    }
                    // Keep the skips already applied this tick.
                    break;
                }
            };

            if skip {
                self.apply_skip(&mut run, &template, &step, now, &mut events);
                outcome.skipped += 1;
                continue;
            }

            // Steps reached through a skip cascade wait out their own delay;
            // only their skip conditions are checked early.
            if !run.is_due(now) {
                break;
            }

            // Runs queued behind the worker semaphore may have outlived their
            // claim. Never send unless the lease is still ours.
            if !self.store.renew_lease(run.id, token, self.lease_ttl()).await? {
                warn!(
                    run_id = %run.id,
                    step = step.step_number,
                    "Lease expired before dispatch, abandoning run"
                );
                metrics::counter!("sequence.leases_lost").increment(1);
                return Ok(Advance::LeaseLost {
                    outcome: RunOutcome::failure(),
                });
            }

            match dispatch_with_timeout(
                self.dispatcher.as_ref(),
                &run.recipient_ref,
                &step.content_ref,
                StdDuration::from_millis(self.config.dispatch_timeout_ms),
            )
            .await
            {
                Ok(ack) => {
                    run.last_step_at = Some(now);
                    run.current_step += 1;
                    run.steps_completed += 1;
                    run.reset_retry();
                    outcome.dispatched += 1;
                    metrics::counter!("sequence.steps_dispatched").increment(1);

                    let mut event = self.step_event(EventType::SequenceStepDispatched, &run, &step);
                    event.detail = Some(ack.message_id);
                    events.push(event);

                    if run.current_step >= run.total_steps {
                        run.mark_completed(now);
                        outcome.completed = true;
                        events.push(self.run_event(EventType::SequenceCompleted, &run, None));
                    } else {
                        run.next_step_at = Some(now + steps::delay_before(&template, run.current_step));
                    }
                }
                Err(e) => {
                    warn!(
                        run_id = %run.id,
                        step = step.step_number,
                        error = %e,
                        "Dispatch failed, step will be retried"
                    );
                    metrics::counter!("sequence.dispatch_failures").increment(1);
                    outcome.failed = true;
                    let mut event = self.step_event(EventType::SequenceDispatchFailed, &run, &step);
                    event.detail = Some(e.to_string());
                    events.push(event);

                    if self.retry.is_bounded() {
                        self.apply_retry_policy(&mut run, now, &mut events);
                    } else if outcome.skipped == 0 {
                        return Ok(Advance::Untouched { outcome, events });
                    }
                }
            }
            break;
        }

        if outcome.completed {
            metrics::counter!("sequence.runs_completed").increment(1);
            info!(
                run_id = %run.id,
                steps_completed = run.steps_completed,
                steps_skipped = run.steps_skipped,
                "Sequence run completed"
            );
        }

        outcome.advanced = true;
        Ok(Advance::Commit {
            run,
            outcome,
            events,
        })
    }

    fn apply_skip(
        &self,
        run: &mut SequenceRun,
        template: &SequenceTemplate,
        step: &StepDefinition,
        now: DateTime<Utc>,
        events: &mut Vec<AnalyticsEvent>,
    ) {
        debug!(run_id = %run.id, step = step.step_number, "Skipping step");
        metrics::counter!("sequence.steps_skipped").increment(1);
        events.push(self.step_event(EventType::SequenceStepSkipped, run, step));

        run.current_step += 1;
        run.steps_skipped += 1;
        run.reset_retry();
        if run.current_step < run.total_steps {
            // Measured from now, not from when the skipped step was due.
            run.next_step_at = Some(now + steps::delay_before(template, run.current_step));
        }
    }

    fn apply_retry_policy(
        &self,
        run: &mut SequenceRun,
        now: DateTime<Utc>,
        events: &mut Vec<AnalyticsEvent>,
    ) {
        run.dispatch_attempts += 1;
        if run.dispatch_attempts >= self.retry.max_dispatch_attempts {
            warn!(
                run_id = %run.id,
                attempts = run.dispatch_attempts,
                "Dispatch attempts exhausted, cancelling run"
            );
            run.mark_cancelled(DISPATCH_EXHAUSTED, now);
            metrics::counter!("sequence.runs_cancelled").increment(1);
            events.push(self.run_event(
                EventType::SequenceCancelled,
                run,
                Some(DISPATCH_EXHAUSTED.to_string()),
            ));
        } else {
            let backoff = self.retry.backoff_secs(run.dispatch_attempts);
            run.next_retry_at = Some(now + Duration::seconds(backoff as i64));
        }
    }

    fn lease_ttl(&self) -> Duration {
        Duration::seconds(self.config.claim_ttl_secs as i64)
    }

    async fn release_quietly(&self, run_id: Uuid, token: LockToken) {
        if let Err(e) = self.store.release_run(run_id, token).await {
            warn!(run_id = %run_id, error = %e, "Failed to release run lease");
        }
    }

    async fn abandon(&self, claim: &ClaimedRun) {
        if let Err(e) = self.store.release_run(claim.run.id, claim.token).await {
            debug!(run_id = %claim.run.id, error = %e, "Could not release lease after halt");
        }
    }

    fn run_event(&self, event_type: EventType, run: &SequenceRun, detail: Option<String>) -> AnalyticsEvent {
        let mut event = make_event(
            event_type,
            run.id.to_string(),
            Some(run.template_ref.to_string()),
            Some(run.recipient_ref.clone()),
        );
        event.node_id = self.node_id.clone();
        event.detail = detail;
        event
    }

    fn step_event(&self, event_type: EventType, run: &SequenceRun, step: &StepDefinition) -> AnalyticsEvent {
        let mut event = self.run_event(event_type, run, None);
        event.step = Some(step.step_number);
        event.content_ref = Some(step.content_ref.clone());
        event
    }

    fn emit_all(&self, events: Vec<AnalyticsEvent>) {
        for event in events {
            self.event_sink.emit(event);
        }
    }
}
