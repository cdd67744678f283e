//! Process descriptor loader.
//!
//! The descriptor is a JSON file produced by an upstream generator and
//! enumerates every process this machine must run. The loader is a pure
//! parser; nothing in the file is evaluated. Two shapes are accepted:
//! a bare array of app records, or a `{ "apps": [...] }` wrapper.
//!
//! Naming conventions are contractual:
//! - worker processes are named `redis-worker-<worker_type>-<index>`
//! - gpu-bound backend services encode their resource index, e.g.
//!   `comfyui-gpu0`

use crate::error::MachineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Prefix that marks a descriptor entry as a queue worker process.
pub const WORKER_NAME_PREFIX: &str = "redis-worker-";

/// What kind of process a descriptor entry describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppKind {
    /// A backend inference service listening on a local port.
    Service,
    /// A job-pulling worker process.
    Worker,
}

/// One application entry from the descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRecord {
    pub name: String,
    pub script: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DescriptorFile {
    Wrapped { apps: Vec<AppRecord> },
    Bare(Vec<AppRecord>),
}

/// Load the descriptor from disk.
pub fn load(path: &Path) -> Result<Vec<AppRecord>, MachineError> {
    if !path.exists() {
        return Err(MachineError::DescriptorMissing(path.to_path_buf()));
    }
    let raw = std::fs::read_to_string(path).map_err(MachineError::DescriptorUnreadable)?;
    let parsed: DescriptorFile =
        serde_json::from_str(&raw).map_err(MachineError::DescriptorMalformed)?;
    let apps = match parsed {
        DescriptorFile::Wrapped { apps } => apps,
        DescriptorFile::Bare(apps) => apps,
    };
    tracing::debug!(path = %path.display(), apps = apps.len(), "Loaded process descriptor");
    Ok(apps)
}

impl AppRecord {
    pub fn kind(&self) -> AppKind {
        if self.name.starts_with(WORKER_NAME_PREFIX) {
            AppKind::Worker
        } else {
            AppKind::Service
        }
    }

    /// Port declared by the entry itself: `--port=N` / `--port N` arguments
    /// first, then any environment key ending in `_PORT`.
    pub fn declared_port(&self) -> Option<u16> {
        let mut args = self.args.iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--port=") {
                if let Ok(port) = value.parse() {
                    return Some(port);
                }
            } else if arg == "--port" {
                if let Some(port) = args.next().and_then(|v| v.parse().ok()) {
                    return Some(port);
                }
            }
        }
        // BTreeMap iteration keeps this deterministic when several *_PORT
        // variables are present.
        for (key, value) in &self.env {
            if key.ends_with("_PORT") {
                if let Ok(port) = value.parse() {
                    return Some(port);
                }
            }
        }
        None
    }
}

/// Parse `redis-worker-<worker_type>-<index>`.
pub fn parse_worker_name(name: &str) -> Option<(String, usize)> {
    let rest = name.strip_prefix(WORKER_NAME_PREFIX)?;
    let (worker_type, index) = rest.rsplit_once('-')?;
    if worker_type.is_empty() {
        return None;
    }
    let index = index.parse().ok()?;
    Some((worker_type.to_string(), index))
}

/// Parse `<service>-gpu<N>`.
pub fn parse_service_name(name: &str) -> Option<(String, usize)> {
    let (service, suffix) = name.rsplit_once("-gpu")?;
    if service.is_empty() {
        return None;
    }
    let index = suffix.parse().ok()?;
    Some((service.to_string(), index))
}

/// Probe URL for a service listening on a local port.
pub fn probe_url(port: u16) -> String {
    format!("http://localhost:{}", port)
}

/// In mock GPU mode, gpu-bound backends run with a CPU fallback flag.
pub fn apply_cpu_fallback(records: &mut [AppRecord], mapping: &crate::mapping::ServiceMapping) {
    for record in records.iter_mut() {
        if record.kind() != AppKind::Service {
            continue;
        }
        let service_type = parse_service_name(&record.name)
            .map(|(t, _)| t)
            .unwrap_or_else(|| record.name.clone());
        let gpu_bound = mapping
            .get_service(&service_type)
            .map(|def| def.resource_binding.is_gpu_bound())
            .unwrap_or(false);
        if gpu_bound && !record.args.iter().any(|a| a == "--cpu") {
            record.args.push("--cpu".to_string());
        }
    }
}

/// Hand the shared websocket auth token to worker entries that do not
/// already carry one.
pub fn inject_worker_auth_token(records: &mut [AppRecord], token: &str) {
    for record in records.iter_mut() {
        if record.kind() == AppKind::Worker {
            record
                .env
                .entry("WORKER_WEBSOCKET_AUTH_TOKEN".to_string())
                .or_insert_with(|| token.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn record(name: &str) -> AppRecord {
        AppRecord {
            name: name.to_string(),
            script: "/usr/bin/true".to_string(),
            args: vec![],
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    #[test]
    fn test_kind_by_prefix() {
        assert_eq!(record("redis-worker-comfyui-0").kind(), AppKind::Worker);
        assert_eq!(record("comfyui-gpu0").kind(), AppKind::Service);
        assert_eq!(record("health-server").kind(), AppKind::Service);
    }

    #[test]
    fn test_parse_worker_name() {
        assert_eq!(
            parse_worker_name("redis-worker-comfyui-0"),
            Some(("comfyui".to_string(), 0))
        );
        assert_eq!(
            parse_worker_name("redis-worker-simulation-12"),
            Some(("simulation".to_string(), 12))
        );
        assert_eq!(parse_worker_name("comfyui-gpu0"), None);
        assert_eq!(parse_worker_name("redis-worker-"), None);
        assert_eq!(parse_worker_name("redis-worker-comfyui-x"), None);
    }

    #[test]
    fn test_parse_service_name() {
        assert_eq!(
            parse_service_name("comfyui-gpu0"),
            Some(("comfyui".to_string(), 0))
        );
        assert_eq!(
            parse_service_name("a1111-gpu3"),
            Some(("a1111".to_string(), 3))
        );
        assert_eq!(parse_service_name("ollama"), None);
        assert_eq!(parse_service_name("comfyui-gpuX"), None);
    }

    #[test]
    fn test_declared_port_from_args() {
        let mut rec = record("comfyui-gpu0");
        rec.args = vec!["--listen".to_string(), "--port=8188".to_string()];
        assert_eq!(rec.declared_port(), Some(8188));

        rec.args = vec!["--port".to_string(), "8189".to_string()];
        assert_eq!(rec.declared_port(), Some(8189));
    }

    #[test]
    fn test_declared_port_from_env() {
        let mut rec = record("simulation-gpu0");
        rec.env
            .insert("SIMULATION_PORT".to_string(), "8299".to_string());
        assert_eq!(rec.declared_port(), Some(8299));
    }

    #[test]
    fn test_declared_port_args_win_over_env() {
        let mut rec = record("comfyui-gpu0");
        rec.args = vec!["--port=8188".to_string()];
        rec.env.insert("COMFYUI_PORT".to_string(), "9999".to_string());
        assert_eq!(rec.declared_port(), Some(8188));
    }

    #[test]
    fn test_declared_port_none() {
        assert_eq!(record("ollama").declared_port(), None);
    }

    #[test]
    fn test_load_missing_file() {
        let err = load(Path::new("/nonexistent/ecosystem.config.json")).unwrap_err();
        assert!(matches!(err, MachineError::DescriptorMissing(_)));
    }

    #[test]
    fn test_load_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "module.exports = {{ apps: [] }}").unwrap();
        let err = load(file.path()).unwrap_err();
        assert!(matches!(err, MachineError::DescriptorMalformed(_)));
    }

    #[test]
    fn test_load_bare_array() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"name": "simulation-gpu0", "script": "sim.py", "args": ["--port=8299"]}}]"#
        )
        .unwrap();
        let apps = load(file.path()).unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name, "simulation-gpu0");
        assert_eq!(apps[0].declared_port(), Some(8299));
    }

    #[test]
    fn test_load_wrapped_object() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"apps": [
                {{"name": "redis-worker-simulation-0", "script": "worker.js",
                  "env": {{"WORKER_ID": "sim-0"}}, "cwd": "/opt/worker"}}
            ]}}"#
        )
        .unwrap();
        let apps = load(file.path()).unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].kind(), AppKind::Worker);
        assert_eq!(apps[0].env.get("WORKER_ID").unwrap(), "sim-0");
        assert_eq!(apps[0].cwd.as_deref(), Some(Path::new("/opt/worker")));
    }

    #[test]
    fn test_probe_url() {
        assert_eq!(probe_url(8299), "http://localhost:8299");
    }

    #[test]
    fn test_apply_cpu_fallback_touches_only_gpu_bound_services() {
        let mapping = crate::mapping::ServiceMapping::bundled();
        let mut records = vec![
            record("comfyui-gpu0"),
            record("ollama"),
            record("redis-worker-comfyui-0"),
        ];
        apply_cpu_fallback(&mut records, &mapping);

        assert!(records[0].args.contains(&"--cpu".to_string()));
        assert!(records[1].args.is_empty());
        assert!(records[2].args.is_empty());

        // Applying twice does not duplicate the flag
        apply_cpu_fallback(&mut records, &mapping);
        assert_eq!(
            records[0].args.iter().filter(|a| *a == "--cpu").count(),
            1
        );
    }

    #[test]
    fn test_inject_worker_auth_token() {
        let mut records = vec![record("redis-worker-comfyui-0"), record("comfyui-gpu0")];
        records[0]
            .env
            .insert("HUB_REDIS_URL".to_string(), "redis://hub".to_string());
        inject_worker_auth_token(&mut records, "s3cret");

        assert_eq!(
            records[0].env.get("WORKER_WEBSOCKET_AUTH_TOKEN").unwrap(),
            "s3cret"
        );
        // Services are untouched
        assert!(!records[1].env.contains_key("WORKER_WEBSOCKET_AUTH_TOKEN"));

        // A token already present in the descriptor wins
        records[0].env.insert(
            "WORKER_WEBSOCKET_AUTH_TOKEN".to_string(),
            "original".to_string(),
        );
        inject_worker_auth_token(&mut records, "s3cret");
        assert_eq!(
            records[0].env.get("WORKER_WEBSOCKET_AUTH_TOKEN").unwrap(),
            "original"
        );
    }
}
