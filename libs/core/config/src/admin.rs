use crate::{ConfigError, EnvConfig, lookup, parse_or};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Bind address of the machine's admin read-view.
///
/// The admin server only exposes JSON status snapshots and probes, so it
/// listens on all interfaces by default: the fleet controller scrapes
/// `/health` from outside the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdminConfig {
    pub bind: IpAddr,
    pub port: u16,
}

impl AdminConfig {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 9200,
        }
    }
}

impl EnvConfig for AdminConfig {
    /// `ADMIN_BIND` (default `0.0.0.0`) and `ADMIN_PORT` (default 9200).
    fn load() -> Result<Self, ConfigError> {
        let defaults = AdminConfig::default();

        let bind = match lookup("ADMIN_BIND") {
            None => defaults.bind,
            Some(raw) => raw.parse::<IpAddr>().map_err(|_| ConfigError::Invalid {
                key: "ADMIN_BIND".to_string(),
                value: raw,
                expected: "an IP address".to_string(),
            })?,
        };

        Ok(Self {
            bind,
            port: parse_or("ADMIN_PORT", defaults.port)?,
        })
    }
}
