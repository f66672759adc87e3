use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use drip_core::config::AppConfig;
use drip_core::event_bus::EventSink;
use drip_core::DripResult;

use crate::conditions::ConditionEvaluator;
use crate::dispatch::Dispatcher;
use crate::feed::ActivityFeed;
use crate::lifecycle::SequenceManager;
use crate::scheduler::SequenceScheduler;
use crate::store::SequenceStore;
use crate::types::{SequenceTemplate, SkipConditionSet, StepDefinition, TickReport};

/// Wires the lifecycle manager and the scheduler over one shared store.
#[derive(Clone)]
pub struct SequenceEngine {
    manager: SequenceManager,
    scheduler: SequenceScheduler,
}

impl std::fmt::Debug for SequenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceEngine")
            .field("manager", &self.manager)
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl SequenceEngine {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn SequenceStore>,
        feed: Arc<dyn ActivityFeed>,
        dispatcher: Arc<dyn Dispatcher>,
    ) -> Self {
        let manager = SequenceManager::new(store.clone(), config.lifecycle.clone())
            .with_node_id(config.node_id.clone());
        let scheduler = SequenceScheduler::new(
            store,
            ConditionEvaluator::new(feed),
            dispatcher,
            config.scheduler.clone(),
            config.retry.clone(),
        )
        .with_node_id(config.node_id.clone());
        Self { manager, scheduler }
    }

    /// Attach an event sink to both the manager and the scheduler.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.manager = self.manager.with_event_sink(sink.clone());
        self.scheduler = self.scheduler.with_event_sink(sink);
        self
    }

    pub fn manager(&self) -> &SequenceManager {
        &self.manager
    }

    pub fn scheduler(&self) -> &SequenceScheduler {
        &self.scheduler
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> DripResult<TickReport> {
        self.scheduler.advance_due_runs(now).await
    }

    /// Creates a pair of demo templates and enrolls a few recipients.
    pub async fn seed_demo(&self, now: DateTime<Utc>) -> DripResult<Vec<SequenceTemplate>> {
        info!("Seeding demo sequences");

        let reply_stops = SkipConditionSet {
            skip_if_replied: true,
            ..SkipConditionSet::none()
        };

        let outreach = self
            .manager
            .create_template(
                "demo-campaign",
                "Cold Outreach",
                vec![
                    StepDefinition::new(0, 0, "outreach/intro"),
                    StepDefinition::new(1, 2, "outreach/follow-up")
                        .with_conditions(reply_stops),
                    StepDefinition::new(2, 5, "outreach/breakup").with_conditions(
                        SkipConditionSet {
                            skip_if_meeting_booked: true,
                            ..reply_stops
                        },
                    ),
                ],
                now,
            )
            .await?;

        let onboarding = self
            .manager
            .create_template(
                "demo-campaign",
                "Trial Onboarding",
                vec![
                    StepDefinition::new(0, 0, "onboarding/welcome"),
                    StepDefinition::new(1, 1, "onboarding/tips").with_conditions(
                        SkipConditionSet {
                            skip_if_clicked: true,
                            ..SkipConditionSet::none()
                        },
                    ),
                    StepDefinition::new(2, 3, "onboarding/check-in"),
                ],
                now,
            )
            .await?;

        let recipients: Vec<String> = ["ada@example.com", "grace@example.com", "linus@example.com"]
            .iter()
            .map(|r| r.to_string())
            .collect();
        self.manager.bulk_enroll(outreach.id, &recipients, now).await?;
        self.manager
            .bulk_enroll(onboarding.id, &recipients[..1], now)
            .await?;

        info!(templates = 2, recipients = recipients.len(), "Demo sequences seeded");
        Ok(vec![outreach, onboarding])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::LoggingDispatcher;
    use crate::feed::InMemoryActivityFeed;
    use crate::store::InMemorySequenceStore;
    use drip_core::event_bus::capture_sink;
    use drip_core::types::EventType;

    fn engine() -> SequenceEngine {
        SequenceEngine::new(
            &AppConfig::default(),
            Arc::new(InMemorySequenceStore::new()),
            Arc::new(InMemoryActivityFeed::new()),
            Arc::new(LoggingDispatcher),
        )
    }

    #[tokio::test]
    async fn test_seed_demo_and_tick() {
        let sink = capture_sink();
        let engine = engine().with_event_sink(sink.clone());
        let now = Utc::now();
        let templates = engine.seed_demo(now).await.unwrap();
        assert_eq!(templates.len(), 2);
        assert_eq!(sink.count_type(EventType::SequenceEnrolled), 4);

        let report = engine.tick(now).await.unwrap();
        assert_eq!(report.claimed, 4);
        assert_eq!(report.dispatched, 4);
        assert_eq!(sink.count_type(EventType::SequenceStepDispatched), 4);

        // Nothing else is due until the follow-up delays elapse.
        let report = engine.tick(now).await.unwrap();
        assert_eq!(report, TickReport::default());
    }
}
