//! Static service mapping.
//!
//! The mapping is the single source of truth for which backend services a
//! worker type runs and which job capabilities it advertises. Worker
//! `services`/`connectors` are always materialized from here; a raw
//! `CONNECTORS` variable in the descriptor is ignored.

use crate::error::MachineError;
use crate::models::{ResourceBinding, ServiceDef};
use std::collections::{BTreeMap, BTreeSet};

/// Mapping entry for one worker type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerMapping {
    pub services: Vec<String>,
    pub resource_binding: ResourceBinding,
}

/// The bundled worker-type → services table plus per-service definitions.
#[derive(Clone, Debug)]
pub struct ServiceMapping {
    workers: BTreeMap<String, WorkerMapping>,
    services: BTreeMap<String, ServiceDef>,
}

fn service_def(
    name: &str,
    binding: ResourceBinding,
    base_port: u16,
    heavy: bool,
    job_types: &[&str],
) -> ServiceDef {
    ServiceDef {
        name: name.to_string(),
        job_types: job_types.iter().map(|j| j.to_string()).collect(),
        resource_binding: binding,
        base_port,
        heavy,
    }
}

impl ServiceMapping {
    /// The table shipped with the orchestrator.
    pub fn bundled() -> Self {
        let mut workers = BTreeMap::new();
        let mut services = BTreeMap::new();

        workers.insert(
            "comfyui".to_string(),
            WorkerMapping {
                services: vec!["comfyui".to_string()],
                resource_binding: ResourceBinding::Gpu,
            },
        );
        services.insert(
            "comfyui".to_string(),
            service_def("comfyui", ResourceBinding::Gpu, 8188, true, &["comfyui"]),
        );

        workers.insert(
            "a1111".to_string(),
            WorkerMapping {
                services: vec!["a1111".to_string()],
                resource_binding: ResourceBinding::Gpu,
            },
        );
        services.insert(
            "a1111".to_string(),
            service_def("a1111", ResourceBinding::Gpu, 7860, true, &["a1111"]),
        );

        workers.insert(
            "ollama".to_string(),
            WorkerMapping {
                services: vec!["ollama".to_string()],
                resource_binding: ResourceBinding::Shared,
            },
        );
        services.insert(
            "ollama".to_string(),
            service_def("ollama", ResourceBinding::Shared, 11434, true, &["ollama"]),
        );

        workers.insert(
            "simulation".to_string(),
            WorkerMapping {
                services: vec!["simulation".to_string()],
                resource_binding: ResourceBinding::MockGpu,
            },
        );
        services.insert(
            "simulation".to_string(),
            service_def(
                "simulation",
                ResourceBinding::MockGpu,
                8299,
                false,
                &["simulation"],
            ),
        );

        Self { workers, services }
    }

    /// Apply `<SERVICE>_PORT_START` environment overrides (e.g.
    /// `COMFYUI_PORT_START=8288`) on top of the bundled base ports.
    pub fn with_env_port_overrides(mut self) -> Self {
        for (name, def) in self.services.iter_mut() {
            let key = format!("{}_PORT_START", name.to_uppercase());
            if let Ok(raw) = std::env::var(&key) {
                match raw.parse::<u16>() {
                    Ok(port) => def.base_port = port,
                    Err(_) => {
                        tracing::warn!(key = %key, value = %raw, "Ignoring unparseable port override")
                    }
                }
            }
        }
        self
    }

    /// Look up the mapping entry for a worker type.
    pub fn get_worker(&self, worker_type: &str) -> Result<&WorkerMapping, MachineError> {
        self.workers
            .get(worker_type)
            .ok_or_else(|| MachineError::UnknownWorkerType {
                requested: worker_type.to_string(),
                available: self.worker_types(),
            })
    }

    /// Look up a service definition by name.
    pub fn get_service(&self, name: &str) -> Option<&ServiceDef> {
        self.services.get(name)
    }

    /// All known worker types, sorted.
    pub fn worker_types(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    /// Union of job capabilities advertised by a worker type.
    pub fn capabilities_of(&self, worker_type: &str) -> Result<BTreeSet<String>, MachineError> {
        let worker = self.get_worker(worker_type)?;
        let mut caps = BTreeSet::new();
        for service in &worker.services {
            if let Some(def) = self.get_service(service) {
                caps.extend(def.job_types.iter().cloned());
            }
        }
        Ok(caps)
    }
}

impl Default for ServiceMapping {
    fn default() -> Self {
        Self::bundled()
    }
}
