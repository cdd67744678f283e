use crate::{ConfigError, EnvConfig, lookup, parse_or, require};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Whether backends run against real GPUs or in mock (CPU-fallback) mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GpuMode {
    Actual,
    Mock,
}

impl GpuMode {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.to_ascii_lowercase().as_str() {
            "actual" => Ok(GpuMode::Actual),
            "mock" => Ok(GpuMode::Mock),
            _ => Err(ConfigError::Invalid {
                key: "GPU_MODE".to_string(),
                value: raw.to_string(),
                expected: "actual or mock".to_string(),
            }),
        }
    }

    pub fn is_mock(&self) -> bool {
        matches!(self, GpuMode::Mock)
    }
}

/// Machine-level configuration for the orchestrator.
///
/// `WORKERS` is the only required knob here (the hub URL lives in
/// [`crate::hub::HubConfig`]); everything else has a fleet-wide default so a
/// minimally provisioned machine still boots.
#[derive(Clone, Debug)]
pub struct MachineConfig {
    /// Raw `WORKERS` spec, e.g. "comfyui:2,ollama:1"
    pub workers: String,
    /// Identifier used in the status channel names
    pub machine_id: String,
    /// Periodic status poll interval
    pub status_interval: Duration,
    /// GPU mode (actual hardware or mock)
    pub gpu_mode: GpuMode,
    /// Auth token handed to spawned workers
    pub worker_auth_token: Option<String>,
    /// Path to the generated process descriptor
    pub ecosystem_path: PathBuf,
    /// Delay between starting backends and probing them
    pub warmup: Duration,
    /// Delay after attaching a worker before moving to the next pair
    pub validate_delay: Duration,
}

fn secs_or(key: &str, default: u64) -> Result<Duration, ConfigError> {
    parse_or(key, default).map(Duration::from_secs)
}

impl EnvConfig for MachineConfig {
    fn load() -> Result<Self, ConfigError> {
        let workers = require("WORKERS")?;
        let machine_id =
            lookup("MACHINE_ID").unwrap_or_else(|| format!("machine-{}", Uuid::new_v4()));
        let status_interval = secs_or("MACHINE_STATUS_UPDATE_INTERVAL_SECONDS", 10)?;
        let gpu_mode = match lookup("GPU_MODE") {
            Some(raw) => GpuMode::parse(&raw)?,
            None => GpuMode::Actual,
        };
        let worker_auth_token = lookup("WORKER_WEBSOCKET_AUTH_TOKEN");
        let ecosystem_path = lookup("ECOSYSTEM_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("ecosystem.config.json"));
        let warmup = secs_or("SERVICE_WARMUP_SECONDS", 30)?;
        let validate_delay = secs_or("WORKER_VALIDATE_SECONDS", 3)?;

        Ok(Self {
            workers,
            machine_id,
            status_interval,
            gpu_mode,
            worker_auth_token,
            ecosystem_path,
            warmup,
            validate_delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_config_requires_workers() {
        temp_env::with_var_unset("WORKERS", || {
            let result = MachineConfig::load();
            assert!(result.is_err());
            assert!(result.unwrap_err().to_string().contains("WORKERS"));
        });
    }

    #[test]
    fn test_machine_config_defaults() {
        temp_env::with_vars(
            [
                ("WORKERS", Some("simulation:1")),
                ("MACHINE_ID", None),
                ("MACHINE_STATUS_UPDATE_INTERVAL_SECONDS", None),
                ("GPU_MODE", None),
                ("WORKER_WEBSOCKET_AUTH_TOKEN", None),
                ("ECOSYSTEM_CONFIG_PATH", None),
                ("SERVICE_WARMUP_SECONDS", None),
                ("WORKER_VALIDATE_SECONDS", None),
            ],
            || {
                let config = MachineConfig::load().unwrap();
                assert_eq!(config.workers, "simulation:1");
                assert!(config.machine_id.starts_with("machine-"));
                assert_eq!(config.status_interval, Duration::from_secs(10));
                assert_eq!(config.gpu_mode, GpuMode::Actual);
                assert!(config.worker_auth_token.is_none());
                assert_eq!(
                    config.ecosystem_path,
                    PathBuf::from("ecosystem.config.json")
                );
                assert_eq!(config.warmup, Duration::from_secs(30));
                assert_eq!(config.validate_delay, Duration::from_secs(3));
            },
        );
    }

    #[test]
    fn test_machine_config_overrides() {
        temp_env::with_vars(
            [
                ("WORKERS", Some("comfyui:2")),
                ("MACHINE_ID", Some("gpu-box-7")),
                ("MACHINE_STATUS_UPDATE_INTERVAL_SECONDS", Some("5")),
                ("GPU_MODE", Some("mock")),
                ("WORKER_WEBSOCKET_AUTH_TOKEN", Some("s3cret")),
                ("ECOSYSTEM_CONFIG_PATH", Some("/srv/ecosystem.json")),
                ("SERVICE_WARMUP_SECONDS", Some("0")),
                ("WORKER_VALIDATE_SECONDS", Some("1")),
            ],
            || {
                let config = MachineConfig::load().unwrap();
                assert_eq!(config.machine_id, "gpu-box-7");
                assert_eq!(config.status_interval, Duration::from_secs(5));
                assert!(config.gpu_mode.is_mock());
                assert_eq!(config.worker_auth_token.as_deref(), Some("s3cret"));
                assert_eq!(config.ecosystem_path, PathBuf::from("/srv/ecosystem.json"));
                assert_eq!(config.warmup, Duration::ZERO);
                assert_eq!(config.validate_delay, Duration::from_secs(1));
            },
        );
    }

    #[test]
    fn test_gpu_mode_rejects_unknown_values() {
        let err = GpuMode::parse("maybe").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("GPU_MODE"));
        assert!(message.contains("actual or mock"));
    }

    #[test]
    fn test_gpu_mode_case_insensitive() {
        assert_eq!(GpuMode::parse("MOCK").unwrap(), GpuMode::Mock);
        assert_eq!(GpuMode::parse("Actual").unwrap(), GpuMode::Actual);
    }

    #[test]
    fn test_machine_config_invalid_interval() {
        temp_env::with_vars(
            [
                ("WORKERS", Some("simulation:1")),
                ("MACHINE_STATUS_UPDATE_INTERVAL_SECONDS", Some("soon")),
            ],
            || {
                let result = MachineConfig::load();
                assert!(result.is_err());
                assert!(result
                    .unwrap_err()
                    .to_string()
                    .contains("MACHINE_STATUS_UPDATE_INTERVAL_SECONDS"));
            },
        );
    }
}
