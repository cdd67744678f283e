//! Runtime status model.
//!
//! These are the sum types behind the published status document. Every enum
//! serializes as snake_case strings so subscribers see the wire vocabulary
//! (`idle`, `event_driven`, `not_found`, ...).

use domain_machine::Structure;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Machine lifecycle phase; transitions are monotone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachinePhase {
    Starting,
    Ready,
    Shutdown,
}

/// Worker status as reported by events and reconciliation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Unknown,
    Initializing,
    Idle,
    Busy,
    Offline,
}

/// Whether a backend service is actively serving its worker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceActivity {
    Unknown,
    Active,
    Inactive,
}

/// HTTP health of a backend service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceHealth {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Process-table status of a supervised entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pm2Status {
    Unknown,
    Online,
    Stopped,
    Errored,
    NotFound,
}

/// Why a snapshot was published.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateType {
    Initial,
    Periodic,
    EventDriven,
    Shutdown,
    MachineReady,
}

/// Live view of one worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRuntime {
    pub is_connected: bool,
    pub status: WorkerState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_job_id: Option<String>,
    pub last_activity_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_info: Option<String>,
}

impl WorkerRuntime {
    pub fn unknown() -> Self {
        Self {
            is_connected: false,
            status: WorkerState::Unknown,
            current_job_id: None,
            last_activity_ms: 0,
            version: None,
            build_info: None,
        }
    }

    /// Set the worker status, clearing or keeping the job id so that
    /// `busy ⇒ job id present` and `idle/offline ⇒ job id absent` hold.
    pub fn set_status(&mut self, status: WorkerState, job_id: Option<String>) {
        self.status = status;
        match status {
            WorkerState::Busy => {
                if let Some(job_id) = job_id {
                    self.current_job_id = Some(job_id);
                }
            }
            WorkerState::Idle | WorkerState::Offline => {
                self.current_job_id = None;
            }
            _ => {
                if let Some(job_id) = job_id {
                    self.current_job_id = Some(job_id);
                }
            }
        }
    }
}

/// Live view of one backend service instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRuntime {
    pub status: ServiceActivity,
    pub health: ServiceHealth,
    pub pm2_status: Pm2Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl ServiceRuntime {
    pub fn unknown(port: Option<u16>) -> Self {
        Self {
            status: ServiceActivity::Unknown,
            health: ServiceHealth::Unknown,
            pm2_status: Pm2Status::Unknown,
            port,
        }
    }
}

/// Machine-level slice of the runtime status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRuntime {
    pub phase: MachinePhase,
    pub uptime_ms: i64,
}

/// The authoritative live view of this machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub machine: MachineRuntime,
    pub workers: BTreeMap<String, WorkerRuntime>,
    pub services: BTreeMap<String, ServiceRuntime>,
}

/// One published snapshot on `machine:status:<machine_id>`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub machine_id: String,
    pub timestamp: i64,
    pub update_type: UpdateType,
    pub structure: Structure,
    pub status: RuntimeStatus,
    pub health_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_wire_vocabulary() {
        assert_eq!(
            serde_json::to_string(&UpdateType::EventDriven).unwrap(),
            "\"event_driven\""
        );
        assert_eq!(
            serde_json::to_string(&UpdateType::MachineReady).unwrap(),
            "\"machine_ready\""
        );
        assert_eq!(
            serde_json::to_string(&Pm2Status::NotFound).unwrap(),
            "\"not_found\""
        );
        assert_eq!(
            serde_json::to_string(&WorkerState::Idle).unwrap(),
            "\"idle\""
        );
    }

    #[test]
    fn test_phase_ordering_is_monotone() {
        assert!(MachinePhase::Starting < MachinePhase::Ready);
        assert!(MachinePhase::Ready < MachinePhase::Shutdown);
    }

    #[test]
    fn test_set_status_enforces_job_invariants() {
        let mut worker = WorkerRuntime::unknown();
        worker.set_status(WorkerState::Busy, Some("job-1".to_string()));
        assert_eq!(worker.current_job_id.as_deref(), Some("job-1"));

        worker.set_status(WorkerState::Idle, None);
        assert!(worker.current_job_id.is_none());

        worker.set_status(WorkerState::Busy, Some("job-2".to_string()));
        worker.set_status(WorkerState::Offline, None);
        assert!(worker.current_job_id.is_none());
    }

    #[test]
    fn test_status_message_round_trip() {
        let message = StatusMessage {
            machine_id: "m1".to_string(),
            timestamp: 1_700_000_000_000,
            update_type: UpdateType::Periodic,
            structure: Structure {
                gpu_count: 1,
                capabilities: Default::default(),
                workers: Default::default(),
                services: Default::default(),
            },
            status: RuntimeStatus {
                machine: MachineRuntime {
                    phase: MachinePhase::Ready,
                    uptime_ms: 1234,
                },
                workers: Default::default(),
                services: Default::default(),
            },
            health_url: "http://localhost:9200/health".to_string(),
        };

        let json = serde_json::to_string(&message).unwrap();
        let back: StatusMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(message, back);
    }
}
