use crate::DeployMode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Wire up log output for this process.
///
/// On a fleet machine every line is a flattened JSON object so the log
/// shipper can index fields like `machine_id` and `worker` without parsing
/// human text; targets are dropped because the shipper adds the host.
/// On a workstation the same binary prints a compact format with targets,
/// which is what you want while poking at a supervisor bug.
///
/// `RUST_LOG` overrides the built-in filter in both modes. Calling this
/// more than once is harmless; the first subscriber wins (this happens
/// routinely under `cargo test`).
pub fn init(mode: DeployMode) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| baseline_filter(mode));

    let installed = if mode.log_json() {
        tracing_subscriber::fmt()
            .json()
            .flatten_event(true)
            .with_target(false)
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_target(true)
            .with_env_filter(filter)
            .try_init()
    };

    match installed {
        Ok(()) => tracing::info!(mode = ?mode, "Logging initialized"),
        Err(_) => debug!("Logging was already initialized, keeping the existing subscriber"),
    }
}

/// Noise control: this workspace's crates stay chatty, the HTTP and Redis
/// transports underneath them do not.
fn baseline_filter(mode: DeployMode) -> EnvFilter {
    let directives = if mode.log_json() {
        "info,hyper=warn,reqwest=warn,redis=warn"
    } else {
        "debug,hyper=info,reqwest=info,tower_http=debug"
    };
    EnvFilter::new(directives)
}
