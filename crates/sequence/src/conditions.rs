use std::sync::Arc;

use tracing::debug;

use drip_core::DripResult;

use crate::feed::ActivityFeed;
use crate::types::{SequenceRun, StepDefinition};

/// Decides whether a step should be bypassed based on the recipient's
/// activity since the last executed step.
#[derive(Clone)]
pub struct ConditionEvaluator {
    feed: Arc<dyn ActivityFeed>,
}

impl std::fmt::Debug for ConditionEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionEvaluator").finish_non_exhaustive()
    }
}

impl ConditionEvaluator {
    pub fn new(feed: Arc<dyn ActivityFeed>) -> Self {
        Self { feed }
    }

    /// Returns `true` when any enabled skip condition of `step` is matched by
    /// an activity recorded after the run's last executed step (or its start,
    /// if nothing has fired yet). Missing activity data means no match.
    pub async fn should_skip(&self, run: &SequenceRun, step: &StepDefinition) -> DripResult<bool> {
        if step.conditions.is_empty() {
            return Ok(false);
        }

        let since = run.activity_window_start();
        for activity in step.conditions.enabled() {
            if self
                .feed
                .has_event(&run.recipient_ref, activity, since)
                .await?
            {
                debug!(
                    run_id = %run.id,
                    step = step.step_number,
                    activity = %activity,
                    "Skip condition matched"
                );
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::InMemoryActivityFeed;
    use crate::types::{ActivityType, RunStatus, SkipConditionSet};
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn run_started(at: chrono::DateTime<Utc>) -> SequenceRun {
        SequenceRun {
            id: Uuid::new_v4(),
            template_ref: Uuid::new_v4(),
            recipient_ref: "lead@example.com".into(),
            current_step: 1,
            total_steps: 3,
            status: RunStatus::Active,
            steps_completed: 1,
            steps_skipped: 0,
            last_step_at: None,
            next_step_at: Some(at),
            stop_reason: None,
            started_at: at,
            completed_at: None,
            dispatch_attempts: 0,
            next_retry_at: None,
            version: 0,
        }
    }

    fn replied_step() -> StepDefinition {
        StepDefinition::new(1, 2, "follow-up").with_conditions(SkipConditionSet {
            skip_if_replied: true,
            ..SkipConditionSet::default()
        })
    }

    #[tokio::test]
    async fn test_skips_on_reply_after_last_step() {
        let feed = Arc::new(InMemoryActivityFeed::new());
        let t0 = Utc::now();
        let mut run = run_started(t0);
        run.last_step_at = Some(t0 + Duration::hours(1));
        feed.record_activity("lead@example.com", ActivityType::Replied, t0 + Duration::hours(3));

        let evaluator = ConditionEvaluator::new(feed);
        assert!(evaluator.should_skip(&run, &replied_step()).await.unwrap());
    }

    #[tokio::test]
    async fn test_ignores_activity_before_window() {
        let feed = Arc::new(InMemoryActivityFeed::new());
        let t0 = Utc::now();
        let mut run = run_started(t0);
        run.last_step_at = Some(t0 + Duration::days(1));
        feed.record_activity("lead@example.com", ActivityType::Replied, t0 + Duration::hours(2));

        let evaluator = ConditionEvaluator::new(feed);
        assert!(!evaluator.should_skip(&run, &replied_step()).await.unwrap());
    }

    #[tokio::test]
    async fn test_window_falls_back_to_start() {
        let feed = Arc::new(InMemoryActivityFeed::new());
        let t0 = Utc::now();
        let run = run_started(t0);
        feed.record_activity("lead@example.com", ActivityType::MeetingBooked, t0 - Duration::hours(1));
        feed.record_activity("lead@example.com", ActivityType::MeetingBooked, t0 + Duration::hours(1));

        let step = StepDefinition::new(1, 0, "nudge").with_conditions(SkipConditionSet {
            skip_if_meeting_booked: true,
            ..SkipConditionSet::default()
        });
        let evaluator = ConditionEvaluator::new(feed);
        assert!(evaluator.should_skip(&run, &step).await.unwrap());
    }

    #[tokio::test]
    async fn test_disabled_conditions_never_skip() {
        let feed = Arc::new(InMemoryActivityFeed::new());
        let t0 = Utc::now();
        let run = run_started(t0);
        feed.record_activity("lead@example.com", ActivityType::Replied, t0 + Duration::hours(1));
        feed.record_activity("lead@example.com", ActivityType::LinkClicked, t0 + Duration::hours(1));

        let step = StepDefinition::new(1, 0, "nudge").with_conditions(SkipConditionSet {
            skip_if_meeting_booked: true,
            ..SkipConditionSet::default()
        });
        let evaluator = ConditionEvaluator::new(feed);
        assert!(!evaluator.should_skip(&run, &step).await.unwrap());
        assert!(!evaluator
            .should_skip(&run, &StepDefinition::new(1, 0, "plain"))
            .await
            .unwrap());
    }
}
