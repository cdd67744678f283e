//! Process supervision for fleet machines.
//!
//! This crate provides:
//! - Port/PID primitives (`ports`)
//! - HTTP readiness probing (`probe`)
//! - Installation prerequisite hooks (`install`)
//! - The per-service [`ProcessSupervisor`]
//! - The two-phase [`StartupOrchestrator`]

pub mod error;
pub mod install;
pub mod ports;
pub mod probe;
pub mod startup;
pub mod supervisor;

pub use error::SupervisorError;
pub use install::{InstallCheck, InstallStatus, PermissiveInstallCheck, ScriptPresenceCheck};
pub use probe::{ProbeOutcome, http_probe, ready_wait};
pub use startup::{ServicePair, StartupOrchestrator, StartupPlan};
pub use supervisor::{
    ProbeHealth, ProcessSupervisor, ProcessTableEntry, ServiceState, SupervisorEvent,
};
