use thiserror::Error;

/// Errors inside the status aggregation pipeline.
///
/// Nothing here crashes the orchestrator: Redis errors are retried with
/// bounded backoff, malformed events are logged and dropped.
#[derive(Error, Debug)]
pub enum StatusError {
    /// Redis connection or command error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An event payload that could not be interpreted.
    #[error("Malformed event on '{channel}': {details}")]
    MalformedEvent { channel: String, details: String },

    /// The aggregator task is gone.
    #[error("Status aggregator channel closed")]
    ChannelClosed,
}

impl StatusError {
    /// Connection-shaped Redis failures are worth a reconnect + backoff;
    /// everything else is just logged.
    pub fn is_connection_error(&self) -> bool {
        match self {
            StatusError::Redis(e) => {
                let err = e.to_string().to_lowercase();
                err.contains("connection")
                    || err.contains("disconnected")
                    || err.contains("broken pipe")
                    || err.contains("reset by peer")
                    || err.contains("refused")
                    || err.contains("io error")
            }
            _ => false,
        }
    }
}
