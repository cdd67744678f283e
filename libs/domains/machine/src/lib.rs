//! Machine structure derivation.
//!
//! Resolves what this machine must run from three inputs:
//! - the `WORKERS` environment string (`type:count,...`)
//! - the bundled service mapping (worker type → backend services + capabilities)
//! - the generated process descriptor (the concrete processes and their ports)
//!
//! The result is an immutable [`Structure`] shared read-only with the
//! startup orchestrator and the status aggregator.

pub mod descriptor;
pub mod error;
pub mod mapping;
pub mod models;
pub mod structure;

pub use descriptor::{
    AppKind, AppRecord, apply_cpu_fallback, inject_worker_auth_token, parse_service_name,
    parse_worker_name, probe_url,
};
pub use error::MachineError;
pub use mapping::{ServiceMapping, WorkerMapping};
pub use models::{
    ResourceBinding, ServiceDef, ServiceInstance, Structure, WorkerDef, WorkerSpec,
};
pub use structure::parse_workers_env;
