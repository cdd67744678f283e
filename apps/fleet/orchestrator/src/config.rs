use core_config::admin::AdminConfig;
use core_config::hub::HubConfig;
use core_config::machine::MachineConfig;
use core_config::{AppIdentity, EnvConfig, identity};

/// Everything the orchestrator needs from the provisioning environment,
/// loaded in one shot so a misconfigured machine fails before spawning
/// anything.
#[derive(Clone, Debug)]
pub struct Config {
    pub identity: AppIdentity,
    pub machine: MachineConfig,
    pub hub: HubConfig,
    pub admin: AdminConfig,
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(Self {
            identity: identity!(),
            machine: MachineConfig::load()?, // Requires WORKERS
            hub: HubConfig::load()?,         // Requires HUB_REDIS_URL
            admin: AdminConfig::load()?,     // Defaults: 0.0.0.0:9200
        })
    }
}
