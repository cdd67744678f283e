use core_config::AppIdentity;
use domain_status::StatusMessage;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::watch;

/// Shared state for the admin read-view.
///
/// The read-view never touches the reducer; it renders the latest published
/// snapshot from the watch mirror.
#[derive(Clone)]
pub struct AppState {
    pub app: AppIdentity,
    pub snapshot: watch::Receiver<StatusMessage>,
    pub metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(
        app: AppIdentity,
        snapshot: watch::Receiver<StatusMessage>,
        metrics: PrometheusHandle,
    ) -> Self {
        Self {
            app,
            snapshot,
            metrics,
        }
    }

    /// Latest published snapshot.
    pub fn latest(&self) -> StatusMessage {
        self.snapshot.borrow().clone()
    }
}
