//! Snapshot publisher.

use crate::error::StatusError;
use crate::models::StatusMessage;
use redis::aio::ConnectionManager;
use tracing::debug;

/// Publishes status snapshots on `machine:status:<machine_id>`.
///
/// Uses the shared command connection; the subscriber side runs on its own
/// dedicated pub/sub connection and the two are never cross-used.
#[derive(Clone)]
pub struct StatusPublisher {
    redis: ConnectionManager,
    channel: String,
}

impl StatusPublisher {
    pub fn new(redis: ConnectionManager, machine_id: &str) -> Self {
        Self {
            redis,
            channel: format!("machine:status:{}", machine_id),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub async fn publish(&self, message: &StatusMessage) -> Result<(), StatusError> {
        let payload = serde_json::to_string(message)?;
        let mut conn = self.redis.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(&self.channel)
            .arg(&payload)
            .query_async(&mut conn)
            .await?;
        debug!(
            channel = %self.channel,
            update_type = ?message.update_type,
            receivers = receivers,
            "Published status snapshot"
        );
        Ok(())
    }
}
