//! Machine status aggregation.
//!
//! Maintains the authoritative `RuntimeStatus` for this machine by merging
//! two sources through a single reducer task:
//! - real-time worker events from `machine:<machine_id>:worker:*`
//! - periodic polls of the process table and per-service HTTP health
//!
//! Every transition publishes a unified snapshot on
//! `machine:status:<machine_id>`.
//!
//! # Architecture
//!
//! ```text
//! Redis pub/sub (worker events)     ProcessSupervisor + HTTP probes
//!            ↓                                   ↓
//!      run_subscriber                       run_poller
//!            └──────────→ AggregatorMsg ←────────┘
//!                              ↓
//!                        StatusReducer  (single task, totally ordered)
//!                              ↓
//!            PUBLISH machine:status:<machine_id>  +  watch mirror
//! ```

pub mod aggregator;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod publisher;
pub mod redis;
pub mod reducer;
pub mod sources;

pub use aggregator::{
    AggregatorHandle, AggregatorMsg, PollReport, StatusAggregator, run_poller, run_subscriber,
};
pub use error::StatusError;
pub use events::{EventEnvelope, WorkerEvent, parse_event};
pub use models::{
    MachinePhase, MachineRuntime, Pm2Status, RuntimeStatus, ServiceActivity, ServiceHealth,
    ServiceRuntime, StatusMessage, UpdateType, WorkerRuntime, WorkerState,
};
pub use publisher::StatusPublisher;
pub use reducer::StatusReducer;
pub use sources::{HealthProbe, HttpHealthProbe, ProcessTableEntry, ProcessTableSource};

/// Result type alias for status operations.
pub type StatusResult<T> = Result<T, StatusError>;
