//! Port and PID helpers.
//!
//! The supervisor owns every mutation of the process table; these helpers are
//! the low-level primitives it uses to claim ports and retire children.

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid as NixPid;
use std::net::TcpListener;
use std::process::Command;
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::debug;

/// Grace period between SIGTERM and SIGKILL.
pub const T_GRACE: Duration = Duration::from_secs(3);
/// Wait after SIGKILL before giving up.
pub const T_KILL: Duration = Duration::from_secs(1);

/// A port is considered in use when a local bind on 0.0.0.0 fails.
pub fn is_port_in_use(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_err()
}

/// Find the PID of the process listening on a TCP port.
#[cfg(unix)]
pub fn find_pid_by_port(port: u16) -> Option<u32> {
    let output = Command::new("lsof")
        .args(["-t", &format!("-iTCP:{}", port), "-sTCP:LISTEN"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()?
        .trim()
        .parse()
        .ok()
}

#[cfg(not(unix))]
pub fn find_pid_by_port(_port: u16) -> Option<u32> {
    None
}

/// Whether the PID refers to a live process. Zombies count as dead; they
/// keep their table slot until reaped but can no longer hold a port.
pub fn is_pid_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    match system.process(Pid::from_u32(pid)) {
        None => false,
        Some(process) => !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead),
    }
}

async fn wait_for_exit(pid: u32, budget: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if !is_pid_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Graceful-then-forced kill.
///
/// Sends SIGTERM and waits up to `grace`; escalates to SIGKILL and waits up
/// to `kill_wait`. Returns whether the process is gone.
pub async fn kill_process(pid: u32, grace: Duration, kill_wait: Duration) -> bool {
    if !is_pid_alive(pid) {
        return true;
    }
    let target = NixPid::from_raw(pid as i32);

    debug!(pid = pid, "Sending SIGTERM");
    let _ = kill(target, Signal::SIGTERM);
    if wait_for_exit(pid, grace).await {
        return true;
    }

    debug!(pid = pid, "Escalating to SIGKILL");
    let _ = kill(target, Signal::SIGKILL);
    wait_for_exit(pid, kill_wait).await
}

/// Attempt a TCP connection within a timeout.
pub async fn tcp_dial(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_port_in_use_detects_bound_listener() {
        let listener = TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_port_in_use(port));
        drop(listener);
        assert!(!is_port_in_use(port));
    }

    #[test]
    fn test_is_pid_alive_for_current_process() {
        assert!(is_pid_alive(std::process::id()));
    }

    #[test]
    fn test_is_pid_alive_for_bogus_pid() {
        // PIDs this large do not exist on any sane system
        assert!(!is_pid_alive(u32::MAX - 1));
    }

    #[tokio::test]
    async fn test_kill_process_terminates_child() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(is_pid_alive(pid));

        // Reap concurrently like the supervisor's exit watcher does
        let reaper = std::thread::spawn(move || {
            let _ = child.wait();
        });

        let killed = kill_process(pid, Duration::from_secs(2), Duration::from_secs(1)).await;
        reaper.join().unwrap();
        assert!(killed);
        assert!(!is_pid_alive(pid));
    }

    #[tokio::test]
    async fn test_kill_process_on_dead_pid_is_ok() {
        assert!(kill_process(u32::MAX - 1, Duration::from_millis(10), Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_tcp_dial() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(tcp_dial("127.0.0.1", port, Duration::from_secs(1)).await);
        drop(listener);
        assert!(!tcp_dial("127.0.0.1", port, Duration::from_millis(200)).await);
    }

    #[test]
    #[ignore = "requires lsof"]
    fn test_find_pid_by_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert_eq!(find_pid_by_port(port), Some(std::process::id()));
    }
}
