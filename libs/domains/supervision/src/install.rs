//! Installation prerequisite hooks.
//!
//! Package download and model provisioning live outside the orchestrator;
//! these hooks are what it calls before spawning anything.

use async_trait::async_trait;
use domain_machine::descriptor::{AppKind, AppRecord, parse_service_name};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Outcome of an installation check.
#[derive(Clone, Debug)]
pub struct InstallStatus {
    pub installed: bool,
    pub message: String,
}

impl InstallStatus {
    pub fn ok() -> Self {
        Self {
            installed: true,
            message: String::new(),
        }
    }

    pub fn missing(message: impl Into<String>) -> Self {
        Self {
            installed: false,
            message: message.into(),
        }
    }
}

/// Hooks the orchestrator calls but does not implement.
#[async_trait]
pub trait InstallCheck: Send + Sync {
    async fn ensure_backend_installed(&self, service_type: &str) -> InstallStatus;
    async fn ensure_worker_bundle_present(&self) -> bool;
}

/// Default check: the script each descriptor entry points at must exist.
pub struct ScriptPresenceCheck {
    service_scripts: BTreeMap<String, PathBuf>,
    worker_scripts: Vec<PathBuf>,
}

impl ScriptPresenceCheck {
    pub fn from_records(records: &[AppRecord]) -> Self {
        let mut service_scripts = BTreeMap::new();
        let mut worker_scripts = Vec::new();
        for record in records {
            match record.kind() {
                AppKind::Service => {
                    let service_type = parse_service_name(&record.name)
                        .map(|(t, _)| t)
                        .unwrap_or_else(|| record.name.clone());
                    service_scripts.insert(service_type, PathBuf::from(&record.script));
                }
                AppKind::Worker => {
                    worker_scripts.push(PathBuf::from(&record.script));
                }
            }
        }
        Self {
            service_scripts,
            worker_scripts,
        }
    }
}

#[async_trait]
impl InstallCheck for ScriptPresenceCheck {
    async fn ensure_backend_installed(&self, service_type: &str) -> InstallStatus {
        match self.service_scripts.get(service_type) {
            Some(script) if script.exists() => InstallStatus::ok(),
            Some(script) => InstallStatus::missing(format!(
                "script {} does not exist",
                script.display()
            )),
            None => InstallStatus::missing(format!(
                "no descriptor entry provides a script for '{}'",
                service_type
            )),
        }
    }

    async fn ensure_worker_bundle_present(&self) -> bool {
        !self.worker_scripts.is_empty() && self.worker_scripts.iter().all(|s| s.exists())
    }
}

/// Check that approves everything; used by tests and mock deployments.
pub struct PermissiveInstallCheck;

#[async_trait]
impl InstallCheck for PermissiveInstallCheck {
    async fn ensure_backend_installed(&self, _service_type: &str) -> InstallStatus {
        InstallStatus::ok()
    }

    async fn ensure_worker_bundle_present(&self) -> bool {
        true
    }
}
