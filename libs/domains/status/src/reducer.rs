//! The status reducer.
//!
//! A single task owns an instance of [`StatusReducer`]; every mutation of
//! the runtime status flows through it, so event application and periodic
//! reconciliation are totally ordered. All reducers are idempotent on
//! identical payloads.

use crate::events::{EventEnvelope, WorkerEvent};
use crate::models::{
    MachinePhase, MachineRuntime, Pm2Status, RuntimeStatus, ServiceActivity, ServiceHealth,
    ServiceRuntime, StatusMessage, UpdateType, WorkerRuntime, WorkerState,
};
use crate::sources::ProcessTableEntry;
use chrono::Utc;
use domain_machine::descriptor::WORKER_NAME_PREFIX;
use domain_machine::{ResourceBinding, ServiceInstance, Structure, WorkerDef};
use std::collections::BTreeMap;
use tracing::debug;

impl WorkerState {
    /// Parse the wire form used in worker hashes and events.
    pub fn parse(raw: &str) -> Option<WorkerState> {
        match raw {
            "unknown" => Some(WorkerState::Unknown),
            "initializing" => Some(WorkerState::Initializing),
            "idle" => Some(WorkerState::Idle),
            "busy" => Some(WorkerState::Busy),
            "offline" => Some(WorkerState::Offline),
            _ => None,
        }
    }
}

/// Builds a stand-in [`WorkerDef`] for a worker that announced itself via
/// an event before (or without) appearing in the descriptor.
fn synthesize_worker_def(worker_id: &str, capabilities: &[String]) -> WorkerDef {
    let index = worker_id
        .rsplit('-')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let worker_type = capabilities
        .first()
        .cloned()
        .unwrap_or_else(|| "unknown".to_string());
    WorkerDef {
        worker_id: worker_id.to_string(),
        pm2_name: worker_id.to_string(),
        index,
        worker_type,
        resource_binding: ResourceBinding::Shared,
        services: capabilities.to_vec(),
        connectors: capabilities.to_vec(),
        gpu_id: None,
    }
}

pub struct StatusReducer {
    machine_id: String,
    started_at_ms: i64,
    health_url: String,
    structure: Structure,
    status: RuntimeStatus,
}

impl StatusReducer {
    /// Seed the runtime status from the machine structure: every known
    /// worker and service starts out `unknown`.
    pub fn new(machine_id: impl Into<String>, structure: Structure, health_url: String) -> Self {
        let workers = structure
            .workers
            .keys()
            .map(|id| (id.clone(), WorkerRuntime::unknown()))
            .collect::<BTreeMap<_, _>>();
        let services = structure
            .services
            .iter()
            .map(|(key, instance)| (key.clone(), ServiceRuntime::unknown(instance.port)))
            .collect::<BTreeMap<_, _>>();

        Self {
            machine_id: machine_id.into(),
            started_at_ms: Utc::now().timestamp_millis(),
            health_url,
            structure,
            status: RuntimeStatus {
                machine: MachineRuntime {
                    phase: MachinePhase::Starting,
                    uptime_ms: 0,
                },
                workers,
                services,
            },
        }
    }

    pub fn structure(&self) -> &Structure {
        &self.structure
    }

    pub fn status(&self) -> &RuntimeStatus {
        &self.status
    }

    pub fn phase(&self) -> MachinePhase {
        self.status.machine.phase
    }

    /// Phase transitions are monotone; attempts to move backwards are ignored.
    pub fn set_phase(&mut self, phase: MachinePhase) -> bool {
        if phase > self.status.machine.phase {
            self.status.machine.phase = phase;
            true
        } else {
            false
        }
    }

    /// Materialize a service entry for `worker_id.capability` if it is new,
    /// both in the runtime status and (additively) in the structure.
    fn materialize_service(&mut self, worker_id: &str, capability: &str) {
        let key = Structure::service_key(worker_id, capability);
        self.status
            .services
            .entry(key.clone())
            .or_insert_with(|| ServiceRuntime::unknown(None));
        self.structure
            .services
            .entry(key.clone())
            .or_insert_with(|| ServiceInstance {
                service_key: key,
                worker_id: worker_id.to_string(),
                service_type: capability.to_string(),
                pm2_name: capability.to_string(),
                port: None,
                expected_host: "localhost".to_string(),
            });
    }

    /// Create or overwrite a worker from a registration.
    fn register_worker(
        &mut self,
        worker_id: &str,
        status: Option<WorkerState>,
        capabilities: &[String],
        version: Option<String>,
        build_info: Option<String>,
        timestamp_ms: i64,
    ) {
        let worker = self
            .status
            .workers
            .entry(worker_id.to_string())
            .or_insert_with(WorkerRuntime::unknown);
        worker.is_connected = true;
        worker.status = status.unwrap_or(WorkerState::Idle);
        if worker.status != WorkerState::Busy {
            worker.current_job_id = None;
        }
        worker.last_activity_ms = timestamp_ms;
        if version.is_some() {
            worker.version = version;
        }
        if build_info.is_some() {
            worker.build_info = build_info;
        }

        // Structure grows, never shrinks
        match self.structure.workers.get_mut(worker_id) {
            Some(def) => {
                for capability in capabilities {
                    if !def.services.contains(capability) {
                        def.services.push(capability.clone());
                    }
                    if !def.connectors.contains(capability) {
                        def.connectors.push(capability.clone());
                    }
                }
            }
            None => {
                self.structure.workers.insert(
                    worker_id.to_string(),
                    synthesize_worker_def(worker_id, capabilities),
                );
            }
        }
        self.structure
            .capabilities
            .extend(capabilities.iter().cloned());

        for capability in capabilities {
            self.materialize_service(worker_id, capability);
        }
    }

    fn ensure_worker(&mut self, worker_id: &str, timestamp_ms: i64) {
        if !self.status.workers.contains_key(worker_id) {
            debug!(worker_id = %worker_id, "Event for unknown worker, synthesizing registration");
            self.register_worker(worker_id, None, &[], None, None, timestamp_ms);
        }
    }

    /// Set every service of a worker to the given activity.
    fn set_worker_services_activity(&mut self, worker_id: &str, activity: ServiceActivity) {
        let service_names = self
            .structure
            .workers
            .get(worker_id)
            .map(|def| def.services.clone())
            .unwrap_or_default();
        for name in service_names {
            let key = Structure::service_key(worker_id, &name);
            if let Some(service) = self.status.services.get_mut(&key) {
                service.status = activity;
                // An actively serving process is necessarily online
                if activity == ServiceActivity::Active
                    && matches!(service.pm2_status, Pm2Status::Unknown | Pm2Status::NotFound)
                {
                    service.pm2_status = Pm2Status::Online;
                }
            }
        }
    }

    /// Apply one worker event.
    pub fn apply_event(&mut self, envelope: &EventEnvelope) {
        let worker_id = envelope.worker_id.clone();
        let ts = envelope.timestamp_ms;
        match &envelope.event {
            WorkerEvent::Registered(data) => {
                self.register_worker(
                    &worker_id,
                    data.status,
                    &data.capabilities,
                    data.version.clone(),
                    data.build_info.clone(),
                    ts,
                );
            }
            WorkerEvent::StatusChanged(data) => {
                self.ensure_worker(&worker_id, ts);
                let worker = self.status.workers.get_mut(&worker_id).expect("just ensured");
                worker.set_status(data.status, data.current_job_id.clone());
                if let Some(is_connected) = data.is_connected {
                    worker.is_connected = is_connected;
                }
                if data.version.is_some() {
                    worker.version = data.version.clone();
                }
                if data.build_info.is_some() {
                    worker.build_info = data.build_info.clone();
                }
                worker.last_activity_ms = ts;
            }
            WorkerEvent::ConnectorStatusChanged(data) => {
                self.ensure_worker(&worker_id, ts);
                self.materialize_service(&worker_id, &data.service_type);
                let key = Structure::service_key(&worker_id, &data.service_type);
                let service = self.status.services.get_mut(&key).expect("just materialized");
                service.status = data.status;
                if data.status == ServiceActivity::Active
                    && matches!(service.pm2_status, Pm2Status::Unknown | Pm2Status::NotFound)
                {
                    service.pm2_status = Pm2Status::Online;
                }
                if let Some(health) = data.health {
                    service.health = health;
                }
            }
            WorkerEvent::JobStarted { job_id } => {
                self.ensure_worker(&worker_id, ts);
                let worker = self.status.workers.get_mut(&worker_id).expect("just ensured");
                worker.set_status(WorkerState::Busy, Some(job_id.clone()));
                worker.is_connected = true;
                worker.last_activity_ms = ts;
                self.set_worker_services_activity(&worker_id, ServiceActivity::Active);
            }
            WorkerEvent::JobCompleted { .. } | WorkerEvent::JobFailed { .. } => {
                self.ensure_worker(&worker_id, ts);
                let worker = self.status.workers.get_mut(&worker_id).expect("just ensured");
                worker.set_status(WorkerState::Idle, None);
                worker.last_activity_ms = ts;
                self.set_worker_services_activity(&worker_id, ServiceActivity::Inactive);
            }
        }
    }

    /// Reconcile with the supervisor's process table.
    pub fn apply_process_table(&mut self, entries: &[ProcessTableEntry]) {
        let table: BTreeMap<&str, &ProcessTableEntry> =
            entries.iter().map(|e| (e.name.as_str(), e)).collect();

        let structure = &self.structure;
        let status = &mut self.status;

        for (key, instance) in &structure.services {
            let Some(service) = status.services.get_mut(key) else {
                continue;
            };
            match table.get(instance.pm2_name.as_str()) {
                Some(entry) => {
                    service.pm2_status = entry.status;
                    service.status = if entry.status == Pm2Status::Online {
                        ServiceActivity::Active
                    } else {
                        ServiceActivity::Inactive
                    };
                    if service.port.is_none() {
                        service.port = entry.port.or(instance.port);
                    }
                }
                None => {
                    service.pm2_status = Pm2Status::NotFound;
                    service.status = ServiceActivity::Inactive;
                }
            }
            // Services with no probe surface inherit health from the
            // process table.
            if service.port.is_none() {
                service.health = if service.pm2_status == Pm2Status::Online {
                    ServiceHealth::Healthy
                } else {
                    ServiceHealth::Unhealthy
                };
            }
        }

        for (worker_id, def) in &structure.workers {
            let Some(worker) = status.workers.get_mut(worker_id) else {
                continue;
            };
            match table.get(def.pm2_name.as_str()) {
                Some(entry) => {
                    let online = entry.status == Pm2Status::Online;
                    worker.is_connected = online;
                    if worker.status == WorkerState::Unknown {
                        worker.status = if online {
                            WorkerState::Idle
                        } else {
                            WorkerState::Offline
                        };
                    }
                }
                // Only workers supervised on this machine (naming contract)
                // are marked offline when their process disappears; workers
                // known purely through events keep their event-driven state.
                None if def.pm2_name.starts_with(WORKER_NAME_PREFIX) => {
                    worker.is_connected = false;
                    if worker.status == WorkerState::Unknown {
                        worker.status = WorkerState::Offline;
                    }
                }
                None => {}
            }
        }
    }

    /// Record a per-service HTTP health verdict.
    pub fn apply_service_health(&mut self, service_key: &str, healthy: bool) {
        if let Some(service) = self.status.services.get_mut(service_key) {
            service.health = if healthy {
                ServiceHealth::Healthy
            } else {
                ServiceHealth::Unhealthy
            };
        }
    }

    /// Apply the authoritative worker hash read back from the queue
    /// (`HGETALL worker:<worker_id>`).
    ///
    /// Events win by recency: the hash only overwrites workers whose last
    /// activity predates this poll cycle.
    pub fn apply_worker_hash(
        &mut self,
        worker_id: &str,
        fields: &BTreeMap<String, String>,
        as_of_ms: i64,
    ) {
        let Some(worker) = self.status.workers.get_mut(worker_id) else {
            return;
        };
        if worker.last_activity_ms > as_of_ms {
            return;
        }
        if let Some(status) = fields.get("status").and_then(|s| WorkerState::parse(s)) {
            worker.set_status(status, fields.get("current_job_id").cloned());
        }
    }

    /// Produce the published snapshot.
    pub fn snapshot(&self, update_type: UpdateType) -> StatusMessage {
        let now = Utc::now().timestamp_millis();
        let mut status = self.status.clone();
        status.machine.uptime_ms = now - self.started_at_ms;
        StatusMessage {
            machine_id: self.machine_id.clone(),
            timestamp: now,
            update_type,
            structure: self.structure.clone(),
            status,
            health_url: self.health_url.clone(),
        }
    }
}
