//! Activity feed interface: the record of recipient behavior consulted by
//! skip conditions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use drip_core::DripResult;

use crate::types::{ActivityEvent, ActivityType};

#[async_trait]
pub trait ActivityFeed: Send + Sync {
    /// Events of `activity_type` for `recipient` that occurred strictly after `since`.
    async fn query_events(
        &self,
        recipient: &str,
        activity_type: ActivityType,
        since: DateTime<Utc>,
    ) -> DripResult<Vec<ActivityEvent>>;

    async fn has_event(
        &self,
        recipient: &str,
        activity_type: ActivityType,
        since: DateTime<Utc>,
    ) -> DripResult<bool> {
        Ok(!self
            .query_events(recipient, activity_type, since)
            .await?
            .is_empty())
    }
}

/// Thread-safe in-memory feed keyed by recipient.
#[derive(Default)]
pub struct InMemoryActivityFeed {
    events: DashMap<String, Vec<ActivityEvent>>,
}

impl InMemoryActivityFeed {
    pub fn new() -> Self {
        Self {
            events: DashMap::new(),
        }
    }

    pub fn record(&self, event: ActivityEvent) {
        debug!(
            recipient = %event.recipient_ref,
            activity = %event.activity_type,
            "Recording recipient activity"
        );
        self.events
            .entry(event.recipient_ref.clone())
            .or_default()
            .push(event);
    }

    pub fn record_activity(
        &self,
        recipient: &str,
        activity_type: ActivityType,
        occurred_at: DateTime<Utc>,
    ) {
        self.record(ActivityEvent {
            recipient_ref: recipient.to_string(),
            activity_type,
            occurred_at,
            detail: None,
        });
    }

    pub fn len(&self) -> usize {
        self.events.iter().map(|r| r.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ActivityFeed for InMemoryActivityFeed {
    async fn query_events(
        &self,
        recipient: &str,
        activity_type: ActivityType,
        since: DateTime<Utc>,
    ) -> DripResult<Vec<ActivityEvent>> {
        let matches = self
            .events
            .get(recipient)
            .map(|list| {
                list.iter()
                    .filter(|e| e.activity_type == activity_type && e.occurred_at > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Ok(matches)
    }
}
