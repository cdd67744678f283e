//! Coordinated teardown for a fleet machine.
//!
//! Teardown has a strict order: the status aggregator must publish its
//! final `shutdown` snapshot before the supervisor starts killing backend
//! children, and the admin server drains last so the fleet controller can
//! still read the machine while it winds down. The coordinator hands every
//! subsystem its own receiver and guarantees the trigger fires at most
//! once no matter how many signals land.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

/// Why the machine is going down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownReason {
    /// SIGTERM (fleet controller) or SIGINT (operator at a terminal).
    Signal,
    /// A subsystem asked for teardown programmatically.
    Requested,
}

/// Single-fire teardown trigger shared by every long-running task.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    notify: broadcast::Sender<ShutdownReason>,
    fired: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(4);
        Self {
            notify,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A receiver for one subsystem. Subscribe before the trigger can
    /// fire; a receiver created afterwards misses the broadcast and must
    /// consult [`ShutdownCoordinator::is_triggered`].
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.notify.subscribe()
    }

    pub fn is_triggered(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Fire the teardown. Only the first call broadcasts; a second signal
    /// arriving mid-teardown is ignored rather than restarting it.
    pub fn trigger(&self, reason: ShutdownReason) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(reason = ?reason, "Beginning machine teardown");
        let _ = self.notify.send(reason);
    }

    /// Park until the host asks this machine to stop, then fire the
    /// trigger. Whichever of SIGTERM/SIGINT lands first wins.
    pub async fn wait_for_signal(&self) -> ShutdownReason {
        let interrupt = async {
            signal::ctrl_c().await.expect("SIGINT handler");
        };

        #[cfg(unix)]
        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("SIGTERM handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = interrupt => info!("SIGINT received"),
            _ = terminate => info!("SIGTERM received"),
        }

        self.trigger(ShutdownReason::Signal);
        ShutdownReason::Signal
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_reaches_every_subscriber() {
        let coordinator = ShutdownCoordinator::new();
        let mut aggregator_rx = coordinator.subscribe();
        let mut server_rx = coordinator.subscribe();

        coordinator.trigger(ShutdownReason::Requested);

        assert_eq!(aggregator_rx.recv().await.unwrap(), ShutdownReason::Requested);
        assert_eq!(server_rx.recv().await.unwrap(), ShutdownReason::Requested);
    }

    #[tokio::test]
    async fn test_second_trigger_does_not_rebroadcast() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();

        coordinator.trigger(ShutdownReason::Signal);
        coordinator.trigger(ShutdownReason::Requested);

        assert_eq!(rx.recv().await.unwrap(), ShutdownReason::Signal);
        assert!(rx.try_recv().is_err());
        assert!(coordinator.is_triggered());
    }

    #[tokio::test]
    async fn test_late_subscriber_consults_flag() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger(ShutdownReason::Requested);

        // Subscribed after the broadcast: the flag is the fallback
        let mut late_rx = coordinator.subscribe();
        assert!(late_rx.try_recv().is_err());
        assert!(coordinator.is_triggered());
    }

    #[tokio::test]
    async fn test_clones_share_the_trigger() {
        let coordinator = ShutdownCoordinator::new();
        let clone = coordinator.clone();

        coordinator.trigger(ShutdownReason::Signal);
        assert!(clone.is_triggered());
    }
}
