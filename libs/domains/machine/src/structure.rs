//! Structure builder.
//!
//! Resolves the `WORKERS` environment string, the bundled service mapping and
//! the process descriptor into the immutable [`Structure`]. Given identical
//! inputs the output is byte-identical when serialized.

use crate::descriptor::{self, AppKind, AppRecord};
use crate::error::MachineError;
use crate::mapping::ServiceMapping;
use crate::models::{ServiceInstance, Structure, WorkerDef, WorkerSpec};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Parse the comma-separated `WORKERS` string (`type:count,...`).
pub fn parse_workers_env(
    raw: &str,
    mapping: &ServiceMapping,
) -> Result<Vec<WorkerSpec>, MachineError> {
    let mut specs = Vec::new();
    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let (worker_type, count) =
            entry
                .split_once(':')
                .ok_or_else(|| MachineError::InvalidWorkerSpec {
                    entry: entry.to_string(),
                    details: "expected 'type:count'".to_string(),
                })?;
        let worker_type = worker_type.trim();
        let count: usize =
            count
                .trim()
                .parse()
                .map_err(|_| MachineError::InvalidWorkerSpec {
                    entry: entry.to_string(),
                    details: format!("'{}' is not a valid count", count.trim()),
                })?;
        if count == 0 {
            return Err(MachineError::InvalidWorkerSpec {
                entry: entry.to_string(),
                details: "count must be at least 1".to_string(),
            });
        }
        // Validates the type against the mapping
        mapping.get_worker(worker_type)?;
        specs.push(WorkerSpec {
            worker_type: worker_type.to_string(),
            count,
        });
    }
    if specs.is_empty() {
        return Err(MachineError::MissingWorkers);
    }
    Ok(specs)
}

fn gpu_count_of(workers: &BTreeMap<String, WorkerDef>) -> usize {
    workers
        .values()
        .filter(|w| w.resource_binding.is_gpu_bound())
        .map(|w| w.index + 1)
        .max()
        .unwrap_or(1)
        .max(1)
}

impl Structure {
    /// Descriptor-driven build: workers come from `redis-worker-*` records,
    /// their services and capabilities from the mapping.
    pub fn build(
        machine_id: &str,
        workers_env: &str,
        records: &[AppRecord],
        mapping: &ServiceMapping,
    ) -> Result<Structure, MachineError> {
        let specs = parse_workers_env(workers_env, mapping)?;

        let mut capabilities = BTreeSet::new();
        for spec in &specs {
            capabilities.extend(mapping.capabilities_of(&spec.worker_type)?);
        }

        // Index backend-service records by (type, gpu index); services without
        // a -gpuN suffix are shared instances keyed by name.
        let mut indexed_services: BTreeMap<(String, usize), &AppRecord> = BTreeMap::new();
        let mut shared_services: BTreeMap<String, &AppRecord> = BTreeMap::new();
        for record in records.iter().filter(|r| r.kind() == AppKind::Service) {
            match descriptor::parse_service_name(&record.name) {
                Some((service_type, index)) => {
                    indexed_services.insert((service_type, index), record);
                }
                None => {
                    shared_services.insert(record.name.clone(), record);
                }
            }
        }

        let mut workers = BTreeMap::new();
        let mut services = BTreeMap::new();

        for record in records.iter().filter(|r| r.kind() == AppKind::Worker) {
            let Some((worker_type, index)) = descriptor::parse_worker_name(&record.name) else {
                warn!(name = %record.name, "Worker entry violates the naming convention, skipping");
                continue;
            };
            let worker_mapping = mapping.get_worker(&worker_type)?;
            let gpu_bound = worker_mapping.resource_binding.is_gpu_bound();
            let worker_id = format!("{}-{}-{}", machine_id, worker_type, index);

            // Services/connectors always come from the mapping; a CONNECTORS
            // variable in the descriptor entry is deliberately not consulted.
            let worker = WorkerDef {
                worker_id: worker_id.clone(),
                pm2_name: record.name.clone(),
                index,
                worker_type: worker_type.clone(),
                resource_binding: worker_mapping.resource_binding,
                services: worker_mapping.services.clone(),
                connectors: worker_mapping.services.clone(),
                gpu_id: gpu_bound.then_some(index),
            };

            for service_name in &worker.services {
                let service_record = if gpu_bound {
                    indexed_services
                        .get(&(service_name.clone(), index))
                        .copied()
                } else {
                    shared_services.get(service_name).copied()
                };

                let fallback_pm2 = if gpu_bound {
                    format!("{}-gpu{}", service_name, index)
                } else {
                    service_name.clone()
                };
                let pm2_name = service_record
                    .map(|r| r.name.clone())
                    .unwrap_or(fallback_pm2);

                let base_port = mapping.get_service(service_name).map(|d| d.base_port);
                let port = service_record
                    .and_then(|r| r.declared_port())
                    .or_else(|| {
                        base_port.map(|base| {
                            if gpu_bound {
                                base + index as u16
                            } else {
                                base
                            }
                        })
                    });

                let service_key = Structure::service_key(&worker_id, service_name);
                services.insert(
                    service_key.clone(),
                    ServiceInstance {
                        service_key,
                        worker_id: worker_id.clone(),
                        service_type: service_name.clone(),
                        pm2_name,
                        port,
                        expected_host: "localhost".to_string(),
                    },
                );
            }

            workers.insert(worker_id, worker);
        }

        Ok(Structure {
            gpu_count: gpu_count_of(&workers),
            capabilities,
            workers,
            services,
        })
    }

    /// Mapping-only fallback for machines without a descriptor: synthesizes
    /// one worker per `WORKERS` count slot using the naming conventions.
    pub fn build_from_mapping(
        machine_id: &str,
        workers_env: &str,
        mapping: &ServiceMapping,
    ) -> Result<Structure, MachineError> {
        let specs = parse_workers_env(workers_env, mapping)?;

        let mut capabilities = BTreeSet::new();
        let mut workers = BTreeMap::new();
        let mut services = BTreeMap::new();

        for spec in &specs {
            capabilities.extend(mapping.capabilities_of(&spec.worker_type)?);
            let worker_mapping = mapping.get_worker(&spec.worker_type)?;
            let gpu_bound = worker_mapping.resource_binding.is_gpu_bound();

            for index in 0..spec.count {
                let worker_id = format!("{}-{}-{}", machine_id, spec.worker_type, index);
                let worker = WorkerDef {
                    worker_id: worker_id.clone(),
                    pm2_name: format!(
                        "{}{}-{}",
                        descriptor::WORKER_NAME_PREFIX,
                        spec.worker_type,
                        index
                    ),
                    index,
                    worker_type: spec.worker_type.clone(),
                    resource_binding: worker_mapping.resource_binding,
                    services: worker_mapping.services.clone(),
                    connectors: worker_mapping.services.clone(),
                    gpu_id: gpu_bound.then_some(index),
                };

                for service_name in &worker.services {
                    let (pm2_name, port) = match mapping.get_service(service_name) {
                        Some(def) if gpu_bound => (
                            format!("{}-gpu{}", service_name, index),
                            Some(def.base_port + index as u16),
                        ),
                        Some(def) => (service_name.clone(), Some(def.base_port)),
                        None => (service_name.clone(), None),
                    };
                    let service_key = Structure::service_key(&worker_id, service_name);
                    services.insert(
                        service_key.clone(),
                        ServiceInstance {
                            service_key,
                            worker_id: worker_id.clone(),
                            service_type: service_name.clone(),
                            pm2_name,
                            port,
                            expected_host: "localhost".to_string(),
                        },
                    );
                }

                workers.insert(worker_id, worker);
            }
        }

        Ok(Structure {
            gpu_count: gpu_count_of(&workers),
            capabilities,
            workers,
            services,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceBinding;
    use std::collections::BTreeMap;

    fn record(name: &str, args: &[&str], env: &[(&str, &str)]) -> AppRecord {
        AppRecord {
            name: name.to_string(),
            script: "/usr/bin/true".to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
            cwd: None,
        }
    }

    #[test]
    fn test_parse_workers_env_happy() {
        let mapping = ServiceMapping::bundled();
        let specs = parse_workers_env("comfyui:2, ollama:1", &mapping).unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].worker_type, "comfyui");
        assert_eq!(specs[0].count, 2);
        assert_eq!(specs[1].worker_type, "ollama");
        assert_eq!(specs[1].count, 1);
    }

    #[test]
    fn test_parse_workers_env_empty_is_missing() {
        let mapping = ServiceMapping::bundled();
        assert!(matches!(
            parse_workers_env("", &mapping),
            Err(MachineError::MissingWorkers)
        ));
        assert!(matches!(
            parse_workers_env(" , ,", &mapping),
            Err(MachineError::MissingWorkers)
        ));
    }

    #[test]
    fn test_parse_workers_env_unknown_type() {
        let mapping = ServiceMapping::bundled();
        let err = parse_workers_env("flux:1", &mapping).unwrap_err();
        assert!(matches!(err, MachineError::UnknownWorkerType { .. }));
    }

    #[test]
    fn test_parse_workers_env_rejects_zero_count() {
        let mapping = ServiceMapping::bundled();
        let err = parse_workers_env("comfyui:0", &mapping).unwrap_err();
        assert!(matches!(err, MachineError::InvalidWorkerSpec { .. }));
    }

    #[test]
    fn test_parse_workers_env_rejects_garbage() {
        let mapping = ServiceMapping::bundled();
        assert!(matches!(
            parse_workers_env("comfyui", &mapping),
            Err(MachineError::InvalidWorkerSpec { .. })
        ));
        assert!(matches!(
            parse_workers_env("comfyui:lots", &mapping),
            Err(MachineError::InvalidWorkerSpec { .. })
        ));
    }

    #[test]
    fn test_build_minimal_simulation_machine() {
        let mapping = ServiceMapping::bundled();
        let records = vec![
            record("simulation-gpu0", &["--port=8299"], &[]),
            record("redis-worker-simulation-0", &[], &[]),
        ];
        let structure = Structure::build("m1", "simulation:1", &records, &mapping).unwrap();

        assert_eq!(structure.gpu_count, 1);
        assert!(structure.capabilities.contains("simulation"));

        let worker = structure.workers.get("m1-simulation-0").unwrap();
        assert_eq!(worker.pm2_name, "redis-worker-simulation-0");
        assert_eq!(worker.index, 0);
        assert_eq!(worker.services, vec!["simulation".to_string()]);
        assert_eq!(worker.gpu_id, Some(0));

        let service = structure.services.get("m1-simulation-0.simulation").unwrap();
        assert_eq!(service.pm2_name, "simulation-gpu0");
        assert_eq!(service.port, Some(8299));
        assert_eq!(service.expected_host, "localhost");
    }

    #[test]
    fn test_build_multi_gpu_ports_and_count() {
        let mapping = ServiceMapping::bundled();
        let records = vec![
            record("comfyui-gpu0", &[], &[]),
            record("comfyui-gpu1", &[], &[]),
            record("redis-worker-comfyui-0", &[], &[]),
            record("redis-worker-comfyui-1", &[], &[]),
        ];
        let structure = Structure::build("m1", "comfyui:2", &records, &mapping).unwrap();

        assert_eq!(structure.gpu_count, 2);
        assert_eq!(structure.workers.len(), 2);
        assert_eq!(
            structure
                .services
                .get("m1-comfyui-0.comfyui")
                .unwrap()
                .port,
            Some(8188)
        );
        assert_eq!(
            structure
                .services
                .get("m1-comfyui-1.comfyui")
                .unwrap()
                .port,
            Some(8189)
        );
        assert_eq!(
            structure.workers.get("m1-comfyui-0").unwrap().gpu_id,
            Some(0)
        );
        assert_eq!(
            structure.workers.get("m1-comfyui-1").unwrap().gpu_id,
            Some(1)
        );
    }

    #[test]
    fn test_build_shared_service_has_no_gpu_suffix() {
        let mapping = ServiceMapping::bundled();
        let records = vec![
            record("ollama", &[], &[]),
            record("redis-worker-ollama-0", &[], &[]),
        ];
        let structure = Structure::build("m1", "ollama:1", &records, &mapping).unwrap();

        let worker = structure.workers.get("m1-ollama-0").unwrap();
        assert_eq!(worker.resource_binding, ResourceBinding::Shared);
        assert_eq!(worker.gpu_id, None);

        let service = structure.services.get("m1-ollama-0.ollama").unwrap();
        assert_eq!(service.pm2_name, "ollama");
        assert_eq!(service.port, Some(11434));
        // Shared workers never raise the gpu count
        assert_eq!(structure.gpu_count, 1);
    }

    #[test]
    fn test_build_ignores_connectors_env() {
        let mapping = ServiceMapping::bundled();
        let records = vec![
            record("simulation-gpu0", &["--port=8299"], &[]),
            record(
                "redis-worker-simulation-0",
                &[],
                &[("CONNECTORS", "weird,legacy")],
            ),
        ];
        let structure = Structure::build("m1", "simulation:1", &records, &mapping).unwrap();
        let worker = structure.workers.get("m1-simulation-0").unwrap();
        // Mapping wins over the raw CONNECTORS variable
        assert_eq!(worker.services, vec!["simulation".to_string()]);
        assert_eq!(worker.connectors, vec!["simulation".to_string()]);
    }

    #[test]
    fn test_build_unknown_descriptor_worker_type() {
        let mapping = ServiceMapping::bundled();
        let records = vec![record("redis-worker-flux-0", &[], &[])];
        let err = Structure::build("m1", "simulation:1", &records, &mapping).unwrap_err();
        assert!(matches!(err, MachineError::UnknownWorkerType { .. }));
    }

    #[test]
    fn test_build_is_deterministic() {
        let mapping = ServiceMapping::bundled();
        let records = vec![
            record("comfyui-gpu0", &["--port=8188"], &[]),
            record("comfyui-gpu1", &["--port=8189"], &[]),
            record("ollama", &[], &[]),
            record("redis-worker-comfyui-0", &[], &[]),
            record("redis-worker-comfyui-1", &[], &[]),
            record("redis-worker-ollama-0", &[], &[]),
        ];
        let a = Structure::build("m1", "comfyui:2,ollama:1", &records, &mapping).unwrap();
        let b = Structure::build("m1", "comfyui:2,ollama:1", &records, &mapping).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            serde_json::to_vec(&a).unwrap(),
            serde_json::to_vec(&b).unwrap()
        );
    }

    #[test]
    fn test_structure_serde_round_trip() {
        let mapping = ServiceMapping::bundled();
        let records = vec![
            record("simulation-gpu0", &["--port=8299"], &[]),
            record("redis-worker-simulation-0", &[], &[]),
        ];
        let structure = Structure::build("m1", "simulation:1", &records, &mapping).unwrap();
        let json = serde_json::to_string(&structure).unwrap();
        let back: Structure = serde_json::from_str(&json).unwrap();
        assert_eq!(structure, back);
    }

    #[test]
    fn test_build_from_mapping_fallback() {
        let mapping = ServiceMapping::bundled();
        let structure = Structure::build_from_mapping("m1", "comfyui:2", &mapping).unwrap();

        assert_eq!(structure.gpu_count, 2);
        let worker = structure.workers.get("m1-comfyui-1").unwrap();
        assert_eq!(worker.pm2_name, "redis-worker-comfyui-1");
        let service = structure.services.get("m1-comfyui-1.comfyui").unwrap();
        assert_eq!(service.pm2_name, "comfyui-gpu1");
        assert_eq!(service.port, Some(8189));
    }

    #[test]
    fn test_every_service_key_belongs_to_a_worker() {
        let mapping = ServiceMapping::bundled();
        let structure =
            Structure::build_from_mapping("m1", "comfyui:2,ollama:1", &mapping).unwrap();
        for service in structure.services.values() {
            let worker = structure.workers.get(&service.worker_id).unwrap();
            assert!(worker.services.contains(&service.service_type));
        }
    }
}
