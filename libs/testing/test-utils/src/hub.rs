//! A disposable stand-in for the fleet's central hub.
//!
//! Integration tests that exercise the status channel need a real Redis to
//! publish and pattern-subscribe against; `TestHub` boots one in a
//! container and tears it down when the test's handle drops.

use redis::Client;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::redis::Redis;

/// One containerized hub per test. Connections are handed out on demand;
/// the container lives exactly as long as this value.
pub struct TestHub {
    #[allow(dead_code)]
    container: ContainerAsync<Redis>,
    url: String,
}

impl TestHub {
    /// Boot a hub container and wait until it accepts connections.
    pub async fn start() -> Self {
        let container = Redis::default()
            .with_tag("8-alpine")
            .start()
            .await
            .expect("hub container failed to start");

        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("hub container exposed no Redis port");
        let url = format!("redis://127.0.0.1:{}", port);

        tracing::info!(url = %url, "Test hub is up");
        Self { container, url }
    }

    /// Connection URL, in the same shape `HUB_REDIS_URL` would carry.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// A fresh multiplexed connection for publishing and key fiddling.
    pub async fn connection(&self) -> MultiplexedConnection {
        Client::open(self.url.clone())
            .expect("hub URL rejected by client")
            .get_multiplexed_async_connection()
            .await
            .expect("hub refused the connection")
    }

    /// A `ConnectionManager`, the connection shape the aggregator and
    /// publisher run on in production.
    pub async fn manager(&self) -> ConnectionManager {
        let client = Client::open(self.url.clone()).expect("hub URL rejected by client");
        ConnectionManager::new(client)
            .await
            .expect("hub refused the managed connection")
    }
}
