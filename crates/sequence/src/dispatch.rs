//! Message-dispatch boundary. The engine decides that and when a step is
//! sent; implementations of [`Dispatcher`] decide how.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use drip_core::DispatchError;

use crate::types::DispatchAck;

#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(
        &self,
        recipient: &str,
        content_ref: &str,
    ) -> Result<DispatchAck, DispatchError>;
}

/// Runs a dispatch under a caller-supplied timeout. An elapsed timeout is
/// reported as [`DispatchError::Timeout`], indistinguishable from any other
/// failed send.
pub async fn dispatch_with_timeout(
    dispatcher: &dyn Dispatcher,
    recipient: &str,
    content_ref: &str,
    timeout: Duration,
) -> Result<DispatchAck, DispatchError> {
    match tokio::time::timeout(timeout, dispatcher.dispatch(recipient, content_ref)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(recipient, content_ref, "Dispatch timed out");
            Err(DispatchError::Timeout(timeout.as_millis() as u64))
        }
    }
}

/// Dispatcher that only logs the send. Used by the worker binary, where
/// delivery channels are wired in by the host application.
#[derive(Debug, Clone, Default)]
pub struct LoggingDispatcher;

#[async_trait]
impl Dispatcher for LoggingDispatcher {
    async fn dispatch(
        &self,
        recipient: &str,
        content_ref: &str,
    ) -> Result<DispatchAck, DispatchError> {
        let message_id = Uuid::new_v4().to_string();
        info!(recipient, content_ref, message_id = %message_id, "Dispatching sequence step");
        Ok(DispatchAck {
            message_id,
            accepted_at: Utc::now(),
        })
    }
}
