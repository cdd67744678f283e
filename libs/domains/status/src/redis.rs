//! Redis connection helpers.

use redis::Client;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{info, warn};

/// Connect to Redis and return a ConnectionManager.
///
/// The ConnectionManager automatically handles connection failures and
/// reconnections after the initial connect succeeds.
pub async fn connect(url: &str) -> redis::RedisResult<ConnectionManager> {
    info!("Attempting to connect to Redis at {}", url);

    let client = Client::open(url)?;
    let manager = ConnectionManager::new(client).await?;

    // Verify connection with PING
    let mut conn = manager.clone();
    let _: String = redis::cmd("PING").query_async(&mut conn).await?;

    info!("Successfully connected to Redis");
    Ok(manager)
}

/// Connect with bounded exponential backoff.
///
/// Retries transient startup failures up to `max_retries` times, doubling
/// the delay each attempt (capped at 30 s).
pub async fn connect_with_retry(
    url: &str,
    max_retries: u32,
) -> redis::RedisResult<ConnectionManager> {
    let mut delay = Duration::from_millis(500);
    let mut attempt = 0;
    loop {
        match connect(url).await {
            Ok(manager) => return Ok(manager),
            Err(e) if attempt < max_retries => {
                attempt += 1;
                warn!(
                    error = %e,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Redis connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(30));
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused_errors() {
        // Nothing listens on this port
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = connect(&format!("redis://127.0.0.1:{}", port)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn test_connect() {
        let redis_url =
            std::env::var("HUB_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let result = connect(&redis_url).await;
        assert!(result.is_ok());
    }
}
