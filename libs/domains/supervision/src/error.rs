use thiserror::Error;

/// Errors raised by the process supervisor and the startup orchestrator.
///
/// None of these are retried at this layer; the caller decides whether a
/// failure is fatal (startup) or reportable (runtime).
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// Installation prerequisite not satisfied.
    #[error("Backend for '{service}' is not installed: {message}")]
    InstallMissing { service: String, message: String },

    /// The target port stayed occupied after one cleanup cycle.
    #[error("Port {port} is still in use after cleanup")]
    PortBusy { port: u16 },

    /// The child process could not be spawned.
    #[error("Failed to spawn '{name}': {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The readiness probe budget was exhausted.
    #[error("'{name}' did not become ready after {attempts} probe attempts")]
    ReadyTimeout { name: String, attempts: u32 },

    /// A supervised process exited while startup was still in progress.
    #[error("'{name}' exited during startup (exit code {exit_code:?})")]
    ExitedDuringStartup {
        name: String,
        exit_code: Option<i32>,
    },

    /// One or more backend services failed in the parallel start phase.
    #[error("Service start phase failed for: {}", .failed.join(", "))]
    ServicePhaseFailed { failed: Vec<String> },

    /// Operation on a name the supervisor has never started.
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    /// Filesystem error (run directory, pidfiles, log files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
