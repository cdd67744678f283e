//! Seams towards the supervisor and the probed backends.
//!
//! The aggregator reads the process table and backend health through these
//! traits; the supervisor remains the only writer of both.

use crate::models::Pm2Status;
use async_trait::async_trait;
use std::time::Duration;

/// One row of the supervisor's process table, in status vocabulary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessTableEntry {
    pub name: String,
    pub status: Pm2Status,
    pub pid: Option<u32>,
    pub port: Option<u16>,
}

/// Read access to the machine's process table.
#[async_trait]
pub trait ProcessTableSource: Send + Sync {
    async fn process_table(&self) -> Vec<ProcessTableEntry>;
}

/// A yes/no health probe against a URL.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, url: &str) -> bool;
}

/// HTTP GET probe; any 2xx or 404 counts as healthy (backends may not
/// expose `/`).
pub struct HttpHealthProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }
}

impl Default for HttpHealthProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, url: &str) -> bool {
        match self.client.get(url).timeout(self.timeout).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                (200..300).contains(&status) || status == 404
            }
            Err(_) => false,
        }
    }
}
