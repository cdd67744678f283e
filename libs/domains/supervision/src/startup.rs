//! Two-phase startup orchestrator.
//!
//! Phase 1 starts every backend service in parallel. Phase 2 waits out the
//! configured warm-up so backends can load models before being probed.
//! Phase 3 walks the service/worker pairs in index order: gate on the
//! backend's readiness probe, attach the worker, give it a moment to
//! connect. The contract is all-or-nothing; any failure tears down every
//! already-started process in reverse start order.

use domain_machine::descriptor::{self, AppKind, AppRecord};
use domain_machine::mapping::ServiceMapping;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::error::SupervisorError;
use crate::probe::{READY_ATTEMPTS, READY_ATTEMPTS_HEAVY, READY_INTERVAL};
use crate::supervisor::{ProcessSupervisor, ServiceState};

/// A backend service and the worker attached to it, bound by port and index.
#[derive(Clone, Debug)]
pub struct ServicePair {
    pub index: usize,
    pub service: AppRecord,
    pub worker: AppRecord,
    pub probe_attempts: u32,
}

/// Partitioned and paired view of the descriptor.
#[derive(Clone, Debug, Default)]
pub struct StartupPlan {
    /// Pairs sorted by worker index; the unit of sequential attach.
    pub pairs: Vec<ServicePair>,
    /// Backend services no worker claimed (still started in phase 1).
    pub extra_services: Vec<AppRecord>,
    /// Workers that matched no backend service (started last, ungated).
    pub unpaired_workers: Vec<AppRecord>,
}

fn resolved_service_port(record: &AppRecord, mapping: &ServiceMapping) -> Option<u16> {
    if let Some(port) = record.declared_port() {
        return Some(port);
    }
    let (service_type, index) = match descriptor::parse_service_name(&record.name) {
        Some((t, i)) => (t, i),
        None => (record.name.clone(), 0),
    };
    mapping
        .get_service(&service_type)
        .map(|def| def.base_port + index as u16)
}

fn service_type_of(record: &AppRecord) -> String {
    descriptor::parse_service_name(&record.name)
        .map(|(t, _)| t)
        .unwrap_or_else(|| record.name.clone())
}

impl StartupPlan {
    /// Pair workers with backend services: port equality first, GPU index
    /// second, name match third.
    pub fn from_records(records: &[AppRecord], mapping: &ServiceMapping) -> StartupPlan {
        let services: Vec<&AppRecord> = records
            .iter()
            .filter(|r| r.kind() == AppKind::Service)
            .collect();

        let mut workers: Vec<(usize, String, &AppRecord)> = records
            .iter()
            .filter(|r| r.kind() == AppKind::Worker)
            .filter_map(|r| {
                descriptor::parse_worker_name(&r.name).map(|(t, i)| (i, t, r))
            })
            .collect();
        workers.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.2.name.cmp(&b.2.name)));

        let mut unclaimed: Vec<usize> = (0..services.len()).collect();
        let mut pairs = Vec::new();
        let mut unpaired_workers = Vec::new();

        for (index, worker_type, worker) in &workers {
            let mapped_services = mapping
                .get_worker(worker_type)
                .map(|m| m.services.clone())
                .unwrap_or_default();
            let worker_port = worker.declared_port();

            let position = unclaimed
                .iter()
                .position(|&i| {
                    worker_port.is_some()
                        && resolved_service_port(services[i], mapping) == worker_port
                })
                .or_else(|| {
                    unclaimed.iter().position(|&i| {
                        matches!(
                            descriptor::parse_service_name(&services[i].name),
                            Some((ref t, i_gpu)) if i_gpu == *index && mapped_services.contains(t)
                        )
                    })
                })
                .or_else(|| {
                    unclaimed.iter().position(|&i| {
                        mapped_services.iter().any(|s| {
                            services[i].name == *s
                                || services[i].name.starts_with(&format!("{}-", s))
                        })
                    })
                });

            match position {
                Some(pos) => {
                    let service = services[unclaimed.remove(pos)];
                    let heavy = mapping
                        .get_service(&service_type_of(service))
                        .map(|d| d.heavy)
                        .unwrap_or(false);
                    pairs.push(ServicePair {
                        index: *index,
                        service: service.clone(),
                        worker: (*worker).clone(),
                        probe_attempts: if heavy {
                            READY_ATTEMPTS_HEAVY
                        } else {
                            READY_ATTEMPTS
                        },
                    });
                }
                None => {
                    warn!(worker = %worker.name, "No backend service matched this worker");
                    unpaired_workers.push((*worker).clone());
                }
            }
        }

        pairs.sort_by_key(|p| p.index);
        let extra_services = unclaimed
            .into_iter()
            .map(|i| services[i].clone())
            .collect();

        StartupPlan {
            pairs,
            extra_services,
            unpaired_workers,
        }
    }
}

pub struct StartupOrchestrator {
    supervisor: Arc<ProcessSupervisor>,
    plan: StartupPlan,
    warmup: Duration,
    validate_delay: Duration,
    ready_interval: Duration,
    started: Vec<String>,
}

impl StartupOrchestrator {
    pub fn new(
        supervisor: Arc<ProcessSupervisor>,
        plan: StartupPlan,
        warmup: Duration,
        validate_delay: Duration,
    ) -> Self {
        Self {
            supervisor,
            plan,
            warmup,
            validate_delay,
            ready_interval: READY_INTERVAL,
            started: Vec::new(),
        }
    }

    /// Shorten the probe interval (tests).
    pub fn with_ready_interval(mut self, interval: Duration) -> Self {
        self.ready_interval = interval;
        self
    }

    /// Names of every process started so far, in start order.
    pub fn started_services(&self) -> &[String] {
        &self.started
    }

    async fn teardown(&self) {
        for name in self.started.iter().rev() {
            if let Err(e) = self.supervisor.stop(name).await {
                warn!(name = %name, error = %e, "Teardown stop failed");
            }
        }
    }

    /// Run the full startup sequence.
    pub async fn run(&mut self) -> Result<(), SupervisorError> {
        // Phase 1: parallel service start
        let mut service_records: Vec<AppRecord> =
            self.plan.pairs.iter().map(|p| p.service.clone()).collect();
        service_records.extend(self.plan.extra_services.iter().cloned());

        info!(services = service_records.len(), "Phase 1: starting backend services");
        let mut join_set = JoinSet::new();
        for record in service_records {
            let supervisor = Arc::clone(&self.supervisor);
            join_set.spawn(async move {
                let name = record.name.clone();
                (name, supervisor.start(&record).await)
            });
        }

        let mut failed = Vec::new();
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok((name, Ok(()))) => self.started.push(name),
                Ok((name, Err(e))) => {
                    error!(name = %name, error = %e, "Service failed to start");
                    failed.push(name);
                }
                Err(e) => {
                    error!(error = %e, "Service start task panicked");
                    failed.push("<start task>".to_string());
                }
            }
        }
        if !failed.is_empty() {
            self.teardown().await;
            failed.sort();
            return Err(SupervisorError::ServicePhaseFailed { failed });
        }

        // Phase 2: let backends load models before probing
        if !self.warmup.is_zero() {
            info!(seconds = self.warmup.as_secs(), "Phase 2: warm-up");
            tokio::time::sleep(self.warmup).await;
        }

        // Phase 3: sequential worker attach in index order
        info!(pairs = self.plan.pairs.len(), "Phase 3: attaching workers");
        let pairs = self.plan.pairs.clone();
        for pair in &pairs {
            if let Err(e) = self
                .supervisor
                .ready_wait(&pair.service.name, pair.probe_attempts, self.ready_interval)
                .await
            {
                error!(service = %pair.service.name, error = %e, "Readiness gate failed");
                self.teardown().await;
                return Err(e);
            }

            if let Err(e) = self.supervisor.start(&pair.worker).await {
                self.teardown().await;
                return Err(e);
            }
            self.started.push(pair.worker.name.clone());

            tokio::time::sleep(self.validate_delay).await;

            // The worker must have survived its connection window
            if let Some(entry) = self.supervisor.entry(&pair.worker.name).await {
                if matches!(entry.state, ServiceState::Failed | ServiceState::Stopped) {
                    let err = SupervisorError::ExitedDuringStartup {
                        name: pair.worker.name.clone(),
                        exit_code: entry.exit_code,
                    };
                    error!(worker = %pair.worker.name, error = %err, "Worker died during attach");
                    self.teardown().await;
                    return Err(err);
                }
            }
            self.supervisor.mark_running(&pair.worker.name).await;
            info!(service = %pair.service.name, worker = %pair.worker.name, index = pair.index, "Pair started");
        }

        // Workers without a backend start last, without a readiness gate
        let stragglers = self.plan.unpaired_workers.clone();
        for worker in &stragglers {
            if let Err(e) = self.supervisor.start(worker).await {
                self.teardown().await;
                return Err(e);
            }
            self.started.push(worker.name.clone());
            self.supervisor.mark_running(&worker.name).await;
        }

        info!(started = self.started.len(), "Startup complete");
        Ok(())
    }
}
