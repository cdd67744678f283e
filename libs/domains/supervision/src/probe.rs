//! HTTP readiness probing.
//!
//! Backends may not expose `/`, so any 2xx or 404 counts as "process is
//! listening and speaking HTTP". A TCP listener that never answers HTTP is
//! indistinguishable from a dead one and exhausts the budget.

use crate::error::SupervisorError;
use std::time::Duration;
use tracing::debug;

/// Per-probe request timeout.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);
/// Default readiness budget: 60 attempts at 1 s.
pub const READY_ATTEMPTS: u32 = 60;
/// Heavy backends (model loading) get a doubled budget.
pub const READY_ATTEMPTS_HEAVY: u32 = 120;
/// Pause between probe attempts.
pub const READY_INTERVAL: Duration = Duration::from_secs(1);

/// Result of a single probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The process answered HTTP with this status code.
    Responded(u16),
    /// Connection refused, reset, or timed out.
    Unreachable,
}

impl ProbeOutcome {
    /// Whether the outcome means "listening and speaking HTTP".
    pub fn is_listening(&self) -> bool {
        match self {
            ProbeOutcome::Responded(status) => {
                (200..300).contains(status) || *status == 404
            }
            ProbeOutcome::Unreachable => false,
        }
    }
}

/// A plain GET with a timeout.
pub async fn http_probe(client: &reqwest::Client, url: &str, timeout: Duration) -> ProbeOutcome {
    match client.get(url).timeout(timeout).send().await {
        Ok(response) => ProbeOutcome::Responded(response.status().as_u16()),
        Err(_) => ProbeOutcome::Unreachable,
    }
}

/// Poll `http_probe` until it reports a listening process.
///
/// Returns the number of attempts used, or [`SupervisorError::ReadyTimeout`]
/// once the budget (`max_attempts × interval`) is exhausted.
pub async fn ready_wait(
    client: &reqwest::Client,
    name: &str,
    url: &str,
    max_attempts: u32,
    interval: Duration,
) -> Result<u32, SupervisorError> {
    for attempt in 1..=max_attempts {
        let outcome = http_probe(client, url, PROBE_TIMEOUT).await;
        if outcome.is_listening() {
            debug!(name = %name, url = %url, attempt = attempt, "Readiness probe passed");
            return Ok(attempt);
        }
        debug!(name = %name, url = %url, attempt = attempt, outcome = ?outcome, "Not ready yet");
        if attempt < max_attempts {
            tokio::time::sleep(interval).await;
        }
    }
    Err(SupervisorError::ReadyTimeout {
        name: name.to_string(),
        attempts: max_attempts,
    })
}
