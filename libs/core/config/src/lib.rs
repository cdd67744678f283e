//! Configuration surface for fleet machines.
//!
//! Everything a machine needs to know arrives through environment variables
//! written by provisioning: which workers to run (`WORKERS`), where the hub
//! queue lives (`HUB_REDIS_URL`), how to identify itself (`MACHINE_ID`).
//! There are no config files; a machine that boots with the wrong
//! environment should fail loudly before it spawns anything.

pub mod admin;
pub mod hub;
pub mod machine;
pub mod tracing;

use std::env;
use thiserror::Error;

/// A provisioning problem. Both variants are fatal at startup and name the
/// offending variable so the diagnostic is actionable on the machine.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Required environment variable {key} is not set")]
    Missing { key: String },

    #[error("{key}={value} is invalid: expected {expected}")]
    Invalid {
        key: String,
        value: String,
        expected: String,
    },
}

/// Where this process is running.
///
/// Fleet machines ship their logs, so they emit JSON; on a workstation the
/// same binary prints a compact human format. Detected from `FLEET_ENV`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeployMode {
    /// Developer workstation.
    Dev,
    /// Provisioned machine in the fleet.
    Machine,
}

impl DeployMode {
    /// `FLEET_ENV=machine` (or the legacy value `production`) marks a fleet
    /// machine; anything else, including unset, is a workstation.
    pub fn detect() -> Self {
        match env::var("FLEET_ENV") {
            Ok(value)
                if value.eq_ignore_ascii_case("machine")
                    || value.eq_ignore_ascii_case("production") =>
            {
                DeployMode::Machine
            }
            _ => DeployMode::Dev,
        }
    }

    pub fn is_machine(self) -> bool {
        matches!(self, DeployMode::Machine)
    }

    /// Whether logs should be machine-readable.
    pub fn log_json(self) -> bool {
        self.is_machine()
    }
}

/// Compile-time identity of this process plus the detected deploy mode.
///
/// Shows up in the liveness endpoint and in every startup log line, so a
/// fleet operator can tell at a glance which build a machine is running.
#[derive(Clone, Copy, Debug)]
pub struct AppIdentity {
    pub name: &'static str,
    pub version: &'static str,
    pub mode: DeployMode,
}

/// Build the [`AppIdentity`] of the calling crate.
#[macro_export]
macro_rules! identity {
    () => {
        $crate::AppIdentity {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
            mode: $crate::DeployMode::detect(),
        }
    };
}

/// A config section loaded from the provisioning environment.
pub trait EnvConfig: Sized {
    fn load() -> Result<Self, ConfigError>;
}

/// Read a variable, `None` when unset.
pub fn lookup(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Read a variable the machine cannot start without.
pub fn require(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::Missing {
        key: key.to_string(),
    })
}

/// Read and parse a typed knob, falling back to `default` when unset.
///
/// A variable that is set but unparseable is an error, not a silent
/// fallback; a machine running with a half-applied override is worse than
/// one that refuses to boot.
pub fn parse_or<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
            expected: std::any::type_name::<T>().to_string(),
        }),
    }
}
