//! Per-service process supervisor.
//!
//! Owns the child handles, pidfiles and log files for every process it
//! spawns. The process table it exposes is the only mutation surface; the
//! status aggregator reads snapshots of it and never writes.
//!
//! State machine per service:
//!
//! ```text
//! STARTING → READY → RUNNING → STOPPING → STOPPED
//!     └────────┴──────────────────────────→ FAILED
//! ```
//!
//! `READY → RUNNING` is implicit once the readiness probe passes. An exit
//! before readiness transitions to `FAILED`.

use chrono::{DateTime, Utc};
use domain_machine::descriptor::{self, AppKind, AppRecord};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::error::SupervisorError;
use crate::install::InstallCheck;
use crate::ports;
use crate::probe::{self, PROBE_TIMEOUT};

/// Lifecycle state of one supervised process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Ready,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// On-demand probe verdict.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeHealth {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Read-only view of one supervised process.
#[derive(Clone, Debug)]
pub struct ProcessTableEntry {
    pub name: String,
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub exit_code: Option<i32>,
}

/// Event emitted when a supervised child exits on its own.
#[derive(Clone, Debug)]
pub enum SupervisorEvent {
    ChildExited {
        name: String,
        exit_code: Option<i32>,
        at: DateTime<Utc>,
    },
}

#[derive(Clone, Debug)]
struct Managed {
    record: AppRecord,
    state: ServiceState,
    pid: Option<u32>,
    port: Option<u16>,
    exit_code: Option<i32>,
}

#[derive(Default)]
struct Inner {
    entries: BTreeMap<String, Managed>,
    start_order: Vec<String>,
}

pub struct ProcessSupervisor {
    run_dir: PathBuf,
    install: Arc<dyn InstallCheck>,
    client: reqwest::Client,
    inner: Arc<Mutex<Inner>>,
    events_tx: mpsc::UnboundedSender<SupervisorEvent>,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<SupervisorEvent>>>,
}

impl ProcessSupervisor {
    /// Create a supervisor rooted at `run_dir` (pidfiles and log files).
    pub fn new(run_dir: PathBuf, install: Arc<dyn InstallCheck>) -> Result<Self, SupervisorError> {
        std::fs::create_dir_all(&run_dir)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            run_dir,
            install,
            client: reqwest::Client::new(),
            inner: Arc::new(Mutex::new(Inner::default())),
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
        })
    }

    /// Take the child-exit event stream. Yields `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SupervisorEvent>> {
        self.events_rx.lock().expect("lock poisoned").take()
    }

    fn pid_path(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{}.pid", name))
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{}.log", name))
    }

    async fn install_gate(&self, record: &AppRecord) -> Result<(), SupervisorError> {
        match record.kind() {
            AppKind::Service => {
                let service_type = descriptor::parse_service_name(&record.name)
                    .map(|(t, _)| t)
                    .unwrap_or_else(|| record.name.clone());
                let status = self.install.ensure_backend_installed(&service_type).await;
                if !status.installed {
                    return Err(SupervisorError::InstallMissing {
                        service: service_type,
                        message: status.message,
                    });
                }
            }
            AppKind::Worker => {
                if !self.install.ensure_worker_bundle_present().await {
                    return Err(SupervisorError::InstallMissing {
                        service: record.name.clone(),
                        message: "worker bundle is not present".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Free the target port, killing one orphaned owner if necessary.
    async fn claim_port(&self, port: u16) -> Result<(), SupervisorError> {
        if !ports::is_port_in_use(port) {
            return Ok(());
        }
        warn!(port = port, "Target port in use, attempting cleanup");
        if let Some(pid) = ports::find_pid_by_port(port) {
            ports::kill_process(pid, ports::T_GRACE, ports::T_KILL).await;
        }
        if ports::is_port_in_use(port) {
            return Err(SupervisorError::PortBusy { port });
        }
        Ok(())
    }

    /// Spawn a descriptor entry as a supervised child.
    pub async fn start(&self, record: &AppRecord) -> Result<(), SupervisorError> {
        let name = record.name.clone();
        self.install_gate(record).await?;

        let port = record.declared_port();
        if let Some(port) = port {
            self.claim_port(port).await?;
        }

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path(&name))?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&record.script);
        cmd.args(&record.args)
            .envs(&record.env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        if let Some(cwd) = &record.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| SupervisorError::SpawnFailed {
            name: name.clone(),
            source: e,
        })?;
        let pid = child.id();

        if let Some(pid) = pid {
            if let Err(e) = tokio::fs::write(self.pid_path(&name), format!("{}\n", pid)).await {
                warn!(name = %name, error = %e, "Failed to write pidfile");
            }
        }

        {
            let mut inner = self.inner.lock().await;
            inner.entries.insert(
                name.clone(),
                Managed {
                    record: record.clone(),
                    state: ServiceState::Starting,
                    pid,
                    port,
                    exit_code: None,
                },
            );
            inner.start_order.retain(|n| n != &name);
            inner.start_order.push(name.clone());
        }

        // Exit watcher: reaps the child and records its fate. State changes
        // flow through the shared table so the aggregator sees them on the
        // next poll.
        let inner = Arc::clone(&self.inner);
        let events = self.events_tx.clone();
        let watcher_name = name.clone();
        tokio::spawn(async move {
            let status = child.wait().await;
            let exit_code = status.as_ref().ok().and_then(|s| s.code());
            {
                let mut inner = inner.lock().await;
                if let Some(entry) = inner.entries.get_mut(&watcher_name) {
                    entry.exit_code = exit_code;
                    entry.pid = None;
                    entry.state = match entry.state {
                        ServiceState::Stopping | ServiceState::Stopped => ServiceState::Stopped,
                        // Exit before readiness passed
                        ServiceState::Starting | ServiceState::Ready => ServiceState::Failed,
                        _ => {
                            if exit_code == Some(0) {
                                ServiceState::Stopped
                            } else {
                                ServiceState::Failed
                            }
                        }
                    };
                    debug!(name = %watcher_name, exit_code = ?exit_code, state = ?entry.state, "Child exited");
                }
            }
            let _ = events.send(SupervisorEvent::ChildExited {
                name: watcher_name,
                exit_code,
                at: Utc::now(),
            });
        });

        info!(name = %name, pid = ?pid, port = ?port, "Spawned process");
        Ok(())
    }

    /// Poll the service's probe URL until it answers HTTP.
    ///
    /// Passing transitions the service to `Running`. On budget expiry the
    /// service is stopped before `ReadyTimeout` is surfaced. Services
    /// without a declared port pass trivially.
    pub async fn ready_wait(
        &self,
        name: &str,
        max_attempts: u32,
        interval: Duration,
    ) -> Result<u32, SupervisorError> {
        let port = {
            let inner = self.inner.lock().await;
            let entry = inner
                .entries
                .get(name)
                .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))?;
            entry.port
        };

        let Some(port) = port else {
            debug!(name = %name, "No declared port, readiness passes trivially");
            self.mark_running(name).await;
            return Ok(0);
        };

        let url = descriptor::probe_url(port);
        for attempt in 1..=max_attempts {
            // A child that already died will never answer
            if let Some(entry) = self.entry(name).await {
                if entry.state == ServiceState::Failed {
                    return Err(SupervisorError::ExitedDuringStartup {
                        name: name.to_string(),
                        exit_code: entry.exit_code,
                    });
                }
            }
            let outcome = probe::http_probe(&self.client, &url, PROBE_TIMEOUT).await;
            if outcome.is_listening() {
                debug!(name = %name, attempt = attempt, "Readiness probe passed");
                self.mark_running(name).await;
                return Ok(attempt);
            }
            if attempt < max_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        warn!(name = %name, attempts = max_attempts, "Readiness budget exhausted, stopping");
        let _ = self.stop(name).await;
        Err(SupervisorError::ReadyTimeout {
            name: name.to_string(),
            attempts: max_attempts,
        })
    }

    /// Transition a starting service to `Running` (readiness passed, or the
    /// process has no probe surface).
    pub async fn mark_running(&self, name: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(name) {
            if matches!(entry.state, ServiceState::Starting | ServiceState::Ready) {
                entry.state = ServiceState::Running;
            }
        }
    }

    /// On-demand health probe.
    pub async fn health(&self, name: &str) -> ProbeHealth {
        let port = {
            let inner = self.inner.lock().await;
            inner.entries.get(name).and_then(|e| e.port)
        };
        let Some(port) = port else {
            return ProbeHealth::Unknown;
        };
        let url = descriptor::probe_url(port);
        match probe::http_probe(&self.client, &url, PROBE_TIMEOUT).await {
            outcome if outcome.is_listening() => ProbeHealth::Healthy,
            _ => ProbeHealth::Unhealthy,
        }
    }

    /// Graceful stop: pidfile first, port lookup as fallback, forced kill
    /// after the grace period, then pidfile cleanup.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let (pid, port) = {
            let mut inner = self.inner.lock().await;
            let entry = inner
                .entries
                .get_mut(name)
                .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))?;
            if !matches!(entry.state, ServiceState::Stopped | ServiceState::Failed) {
                entry.state = ServiceState::Stopping;
            }
            (entry.pid, entry.port)
        };

        let pid = match pid {
            Some(pid) => Some(pid),
            None => match tokio::fs::read_to_string(self.pid_path(name)).await {
                Ok(raw) => raw.lines().next().and_then(|l| l.trim().parse().ok()),
                Err(_) => port.and_then(ports::find_pid_by_port),
            },
        };

        if let Some(pid) = pid {
            if !ports::kill_process(pid, ports::T_GRACE, ports::T_KILL).await {
                warn!(name = %name, pid = pid, "Process survived SIGKILL escalation");
            }
        }

        let _ = tokio::fs::remove_file(self.pid_path(name)).await;

        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.get_mut(name) {
            entry.pid = None;
            if entry.state != ServiceState::Failed {
                entry.state = ServiceState::Stopped;
            }
        }
        info!(name = %name, "Stopped process");
        Ok(())
    }

    /// Stop then start with the stored descriptor entry.
    pub async fn restart(&self, name: &str) -> Result<(), SupervisorError> {
        let record = {
            let inner = self.inner.lock().await;
            inner
                .entries
                .get(name)
                .map(|e| e.record.clone())
                .ok_or_else(|| SupervisorError::UnknownService(name.to_string()))?
        };
        self.stop(name).await?;
        self.start(&record).await
    }

    /// Stop every supervised process in reverse start order.
    pub async fn stop_all(&self) {
        let order = {
            let inner = self.inner.lock().await;
            inner.start_order.clone()
        };
        for name in order.iter().rev() {
            if let Err(e) = self.stop(name).await {
                warn!(name = %name, error = %e, "Failed to stop process during teardown");
            }
        }
    }

    /// Read-only snapshot of one entry.
    pub async fn entry(&self, name: &str) -> Option<ProcessTableEntry> {
        let inner = self.inner.lock().await;
        inner.entries.get(name).map(|e| ProcessTableEntry {
            name: name.to_string(),
            state: e.state,
            pid: e.pid,
            port: e.port,
            exit_code: e.exit_code,
        })
    }

    /// Read-only snapshot of the whole process table.
    pub async fn process_table(&self) -> Vec<ProcessTableEntry> {
        let inner = self.inner.lock().await;
        inner
            .entries
            .iter()
            .map(|(name, e)| ProcessTableEntry {
                name: name.clone(),
                state: e.state,
                pid: e.pid,
                port: e.port,
                exit_code: e.exit_code,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install::PermissiveInstallCheck;
    use std::collections::BTreeMap;

    fn supervisor() -> (ProcessSupervisor, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let supervisor =
            ProcessSupervisor::new(dir.path().to_path_buf(), Arc::new(PermissiveInstallCheck))
                .unwrap();
        (supervisor, dir)
    }

    fn shell_record(name: &str, command: &str) -> AppRecord {
        AppRecord {
            name: name.to_string(),
            script: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), command.to_string()],
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    #[tokio::test]
    async fn test_start_and_stop_long_running_child() {
        let (supervisor, _dir) = supervisor();
        let record = shell_record("sim-svc", "sleep 30");

        supervisor.start(&record).await.unwrap();
        let entry = supervisor.entry("sim-svc").await.unwrap();
        assert_eq!(entry.state, ServiceState::Starting);
        assert!(entry.pid.is_some());
        assert!(supervisor.pid_path("sim-svc").exists());

        supervisor.stop("sim-svc").await.unwrap();
        let entry = supervisor.entry("sim-svc").await.unwrap();
        assert_eq!(entry.state, ServiceState::Stopped);
        assert!(entry.pid.is_none());
        assert!(!supervisor.pid_path("sim-svc").exists());
    }

    #[tokio::test]
    async fn test_exit_before_ready_is_failure() {
        let (supervisor, _dir) = supervisor();
        let mut events = supervisor.take_events().unwrap();
        let record = shell_record("flaky", "exit 0");

        supervisor.start(&record).await.unwrap();
        let event = events.recv().await.unwrap();
        let SupervisorEvent::ChildExited {
            name, exit_code, ..
        } = event;
        assert_eq!(name, "flaky");
        assert_eq!(exit_code, Some(0));

        let entry = supervisor.entry("flaky").await.unwrap();
        // Exit before readiness passed, even with code 0
        assert_eq!(entry.state, ServiceState::Failed);
    }

    #[tokio::test]
    async fn test_running_child_exit_zero_becomes_stopped() {
        let (supervisor, _dir) = supervisor();
        let mut events = supervisor.take_events().unwrap();
        let record = shell_record("oneshot", "sleep 0.2");

        supervisor.start(&record).await.unwrap();
        supervisor.mark_running("oneshot").await;
        let _ = events.recv().await.unwrap();

        let entry = supervisor.entry("oneshot").await.unwrap();
        assert_eq!(entry.state, ServiceState::Stopped);
        assert_eq!(entry.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_spawn_failure_surfaces() {
        let (supervisor, _dir) = supervisor();
        let record = AppRecord {
            name: "ghost".to_string(),
            script: "/nonexistent/binary".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
        };
        let err = supervisor.start(&record).await.unwrap_err();
        assert!(matches!(err, SupervisorError::SpawnFailed { .. }));
    }

    #[tokio::test]
    async fn test_install_gate_blocks_start() {
        let dir = tempfile::tempdir().unwrap();
        // ScriptPresenceCheck built over a descriptor whose script is absent
        let mut record = shell_record("comfyui-gpu0", "sleep 30");
        record.script = "/nonexistent/main.py".to_string();
        let install = Arc::new(crate::install::ScriptPresenceCheck::from_records(
            std::slice::from_ref(&record),
        ));
        let supervisor = ProcessSupervisor::new(dir.path().to_path_buf(), install).unwrap();

        let err = supervisor.start(&record).await.unwrap_err();
        assert!(matches!(err, SupervisorError::InstallMissing { .. }));
    }

    #[tokio::test]
    async fn test_ready_wait_without_port_passes_trivially() {
        let (supervisor, _dir) = supervisor();
        let record = shell_record("portless", "sleep 30");
        supervisor.start(&record).await.unwrap();

        let attempts = supervisor
            .ready_wait("portless", 3, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(attempts, 0);
        assert_eq!(
            supervisor.entry("portless").await.unwrap().state,
            ServiceState::Running
        );
        supervisor.stop("portless").await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_wait_against_listening_child() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (supervisor, _dir) = supervisor();
        // Reserve a port, then release it so the supervisor sees it free
        // at spawn time
        let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let mut record = shell_record("sim-http", "sleep 30");
        record
            .env
            .insert("SIMULATION_PORT".to_string(), port.to_string());
        supervisor.start(&record).await.unwrap();

        // Stand-in backend: the test process answers HTTP on the port the
        // descriptor entry declares
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                    .await;
            }
        });

        let attempts = supervisor
            .ready_wait("sim-http", 5, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(attempts >= 1);
        assert_eq!(
            supervisor.entry("sim-http").await.unwrap().state,
            ServiceState::Running
        );
        supervisor.stop("sim-http").await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_wait_timeout_stops_service() {
        let (supervisor, _dir) = supervisor();
        // Child never listens on the declared port
        let mut record = shell_record("deaf", "sleep 30");
        record.env.insert("DEAF_PORT".to_string(), "1".to_string());
        // Port 1 is never claimable by the child, but also never answers;
        // use an ephemeral free port instead so the probe gets refused.
        let free = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = free.local_addr().unwrap().port();
        drop(free);
        record
            .env
            .insert("DEAF_PORT".to_string(), port.to_string());

        supervisor.start(&record).await.unwrap();
        let err = supervisor
            .ready_wait("deaf", 2, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ReadyTimeout { .. }));
        assert_eq!(
            supervisor.entry("deaf").await.unwrap().state,
            ServiceState::Stopped
        );
    }

    #[tokio::test]
    async fn test_stop_unknown_service() {
        let (supervisor, _dir) = supervisor();
        let err = supervisor.stop("nope").await.unwrap_err();
        assert!(matches!(err, SupervisorError::UnknownService(_)));
    }

    #[tokio::test]
    async fn test_stop_all_is_lifo() {
        let (supervisor, _dir) = supervisor();
        supervisor
            .start(&shell_record("first", "sleep 30"))
            .await
            .unwrap();
        supervisor
            .start(&shell_record("second", "sleep 30"))
            .await
            .unwrap();

        supervisor.stop_all().await;
        for name in ["first", "second"] {
            assert_eq!(
                supervisor.entry(name).await.unwrap().state,
                ServiceState::Stopped
            );
        }
    }

    #[tokio::test]
    async fn test_restart_reuses_record() {
        let (supervisor, _dir) = supervisor();
        supervisor
            .start(&shell_record("svc", "sleep 30"))
            .await
            .unwrap();
        let first_pid = supervisor.entry("svc").await.unwrap().pid;

        supervisor.restart("svc").await.unwrap();
        let entry = supervisor.entry("svc").await.unwrap();
        assert_eq!(entry.state, ServiceState::Starting);
        assert!(entry.pid.is_some());
        assert_ne!(entry.pid, first_pid);
        supervisor.stop("svc").await.unwrap();
    }

    #[tokio::test]
    async fn test_process_table_snapshot() {
        let (supervisor, _dir) = supervisor();
        supervisor
            .start(&shell_record("a", "sleep 30"))
            .await
            .unwrap();
        supervisor
            .start(&shell_record("b", "sleep 30"))
            .await
            .unwrap();

        let table = supervisor.process_table().await;
        assert_eq!(table.len(), 2);
        assert!(table.iter().all(|e| e.state == ServiceState::Starting));
        supervisor.stop_all().await;
    }
}
