//! Worker event grammar.
//!
//! Workers publish JSON events on `machine:<machine_id>:worker:<worker_id>`.
//! The envelope names the event kind; `data` carries the kind-specific
//! payload. A missing `worker_id` falls back to the channel suffix.
//! Anything unparseable is reported as [`StatusError::MalformedEvent`] and
//! dropped without affecting other events.

use crate::error::StatusError;
use crate::models::{ServiceActivity, ServiceHealth, WorkerState};
use chrono::Utc;
use serde::Deserialize;

/// Registration payload (`worker_registered` / `worker_connected`).
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct RegistrationData {
    #[serde(default)]
    pub status: Option<WorkerState>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub build_info: Option<String>,
}

/// `worker_status_changed` payload.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct StatusChangeData {
    pub status: WorkerState,
    #[serde(default)]
    pub current_job_id: Option<String>,
    #[serde(default)]
    pub is_connected: Option<bool>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub build_info: Option<String>,
}

/// `connector_status_changed` payload.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ConnectorChangeData {
    pub service_type: String,
    pub status: ServiceActivity,
    #[serde(default)]
    pub health: Option<ServiceHealth>,
}

/// The event kinds the reducer understands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerEvent {
    Registered(RegistrationData),
    StatusChanged(StatusChangeData),
    ConnectorStatusChanged(ConnectorChangeData),
    JobStarted { job_id: String },
    JobCompleted { job_id: Option<String> },
    JobFailed { job_id: Option<String> },
}

/// A parsed event with its addressing metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventEnvelope {
    pub worker_id: String,
    pub timestamp_ms: i64,
    pub event: WorkerEvent,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(default)]
    event_type: Option<String>,
    // Some workers publish the kind under "event"
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    worker_id: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct JobData {
    #[serde(default)]
    job_id: Option<String>,
}

fn malformed(channel: &str, details: impl Into<String>) -> StatusError {
    StatusError::MalformedEvent {
        channel: channel.to_string(),
        details: details.into(),
    }
}

/// Parse one pub/sub message into an [`EventEnvelope`].
pub fn parse_event(channel: &str, payload: &str) -> Result<EventEnvelope, StatusError> {
    let raw: RawEnvelope =
        serde_json::from_str(payload).map_err(|e| malformed(channel, e.to_string()))?;

    let worker_id = raw
        .worker_id
        .or_else(|| channel.rsplit(':').next().map(|s| s.to_string()))
        .filter(|id| !id.is_empty())
        .ok_or_else(|| malformed(channel, "no worker id in payload or channel"))?;

    let kind = raw
        .event_type
        .or(raw.event)
        .ok_or_else(|| malformed(channel, "missing event_type"))?;

    let data = raw.data;
    let event = match kind.as_str() {
        "worker_registered" | "worker_connected" => {
            let data: RegistrationData = serde_json::from_value(data)
                .map_err(|e| malformed(channel, format!("{}: {}", kind, e)))?;
            WorkerEvent::Registered(data)
        }
        "worker_status_changed" => {
            let data: StatusChangeData = serde_json::from_value(data)
                .map_err(|e| malformed(channel, format!("{}: {}", kind, e)))?;
            WorkerEvent::StatusChanged(data)
        }
        "connector_status_changed" => {
            let data: ConnectorChangeData = serde_json::from_value(data)
                .map_err(|e| malformed(channel, format!("{}: {}", kind, e)))?;
            WorkerEvent::ConnectorStatusChanged(data)
        }
        "job_started" => {
            let data: JobData = serde_json::from_value(data)
                .map_err(|e| malformed(channel, format!("{}: {}", kind, e)))?;
            let job_id = data
                .job_id
                .ok_or_else(|| malformed(channel, "job_started without job_id"))?;
            WorkerEvent::JobStarted { job_id }
        }
        "job_completed" => {
            let data: JobData = serde_json::from_value(data)
                .map_err(|e| malformed(channel, format!("{}: {}", kind, e)))?;
            WorkerEvent::JobCompleted {
                job_id: data.job_id,
            }
        }
        "job_failed" => {
            let data: JobData = serde_json::from_value(data)
                .map_err(|e| malformed(channel, format!("{}: {}", kind, e)))?;
            WorkerEvent::JobFailed {
                job_id: data.job_id,
            }
        }
        other => return Err(malformed(channel, format!("unknown event kind '{}'", other))),
    };

    Ok(EventEnvelope {
        worker_id,
        timestamp_ms: raw.timestamp.unwrap_or_else(|| Utc::now().timestamp_millis()),
        event,
    })
}
