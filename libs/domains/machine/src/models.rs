//! Data model for the machine structure.
//!
//! `Structure` is built once at startup and treated as read-only afterwards;
//! the status layer may *add* workers discovered through registration events
//! but never removes anything. All collections are `BTreeMap`/`BTreeSet` so
//! that serializing the same inputs always yields byte-identical output.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// How a backend service binds to machine resources.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceBinding {
    /// One instance per GPU, ports assigned per GPU index.
    Gpu,
    /// Same topology as `Gpu` but backed by a CPU fallback.
    MockGpu,
    /// A single instance shared by all workers of the type.
    Shared,
    /// CPU-only service.
    Cpu,
}

impl ResourceBinding {
    /// Gpu-bound bindings participate in gpu-index naming, port arithmetic
    /// and the machine's `gpu_count`.
    pub fn is_gpu_bound(&self) -> bool {
        matches!(self, ResourceBinding::Gpu | ResourceBinding::MockGpu)
    }
}

/// One `type:count` entry parsed from the `WORKERS` environment variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerSpec {
    pub worker_type: String,
    pub count: usize,
}

/// A backend service definition from the bundled service mapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceDef {
    pub name: String,
    pub job_types: BTreeSet<String>,
    pub resource_binding: ResourceBinding,
    /// Default first port; gpu-bound instances listen on `base_port + index`.
    pub base_port: u16,
    /// Heavy backends (model loading) get a larger readiness budget.
    pub heavy: bool,
}

/// A materialized worker instance on this machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDef {
    pub worker_id: String,
    pub pm2_name: String,
    pub index: usize,
    pub worker_type: String,
    pub resource_binding: ResourceBinding,
    pub services: Vec<String>,
    pub connectors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpu_id: Option<usize>,
}

/// A backend service instance paired with a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// `<worker_id>.<service_name>`
    pub service_key: String,
    pub worker_id: String,
    pub service_type: String,
    pub pm2_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    pub expected_host: String,
}

/// The immutable catalog of workers, services and capabilities for this machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Structure {
    pub gpu_count: usize,
    pub capabilities: BTreeSet<String>,
    pub workers: BTreeMap<String, WorkerDef>,
    pub services: BTreeMap<String, ServiceInstance>,
}

impl Structure {
    /// Compose the key under which a worker/service pair is tracked.
    pub fn service_key(worker_id: &str, service_name: &str) -> String {
        format!("{}.{}", worker_id, service_name)
    }
}
