use config::{builder::DefaultState, Config as ConfigLib, ConfigBuilder, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::network::health::HealthSettings;
use crate::plugins::supervisor::SupervisorSettings;
use crate::utils::error::{AgentError, Result};

pub const DEFAULT_PORT: u16 = 35580;
pub const DEFAULT_API_ENDPOINT: &str = "http://127.0.0.1:9000";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub plugins: PluginConfig,
    pub health: HealthConfig,
    pub supervisor: SupervisorConfig,
    pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub namespace: String,
    pub log_level: String,
    pub log_dir: Option<String>,
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginConfig {
    pub directory: String,
    pub api_endpoint: String,
    pub allowed_origins: Vec<String>,
    pub version_cache_ttl_secs: u64,
    pub app_version: i64,
    pub connect_timeout_ms: u64,
    /// Longest wait for the next chunk of a bundle download.
    pub download_stall_secs: u64,
    pub api_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    pub check_interval_secs: u64,
    pub auto_exit_idle_secs: u64,
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    pub drain_attempts: u32,
    pub drain_interval_ms: u64,
    pub uninstall_settle_ms: u64,
    pub restart_delay_ms: u64,
    pub confirm_attempts: u32,
    pub confirm_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub max_body_bytes: usize,
    pub forward_timeout_secs: u64,
}

impl Config {
    /// Loads defaults, then `config/default` and `config/local`, then
    /// `FLEETGATE__SECTION__KEY` environment variables.
    pub fn new() -> Result<Self> {
        let config = Self::defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("FLEETGATE")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("plugins.allowed_origins")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    /// Built-in defaults only, with no files or environment applied.
    pub fn from_defaults() -> Result<Self> {
        let config: Self = Self::defaults()?.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        Ok(ConfigLib::builder()
            .set_default("node.host", "127.0.0.1")?
            .set_default("node.port", i64::from(DEFAULT_PORT))?
            .set_default("node.namespace", "default")?
            .set_default("node.log_level", "info")?
            .set_default("node.debug", false)?
            .set_default("plugins.directory", "plugins")?
            .set_default("plugins.api_endpoint", DEFAULT_API_ENDPOINT)?
            .set_default("plugins.allowed_origins", Vec::<String>::new())?
            .set_default("plugins.version_cache_ttl_secs", 300)?
            .set_default("plugins.app_version", 0)?
            .set_default("plugins.connect_timeout_ms", 5000)?
            .set_default("plugins.download_stall_secs", 30)?
            .set_default("plugins.api_timeout_secs", 30)?
            .set_default("health.check_interval_secs", 60)?
            .set_default("health.auto_exit_idle_secs", 300)?
            .set_default("health.probe_timeout_ms", 2000)?
            .set_default("supervisor.drain_attempts", 25)?
            .set_default("supervisor.drain_interval_ms", 100)?
            .set_default("supervisor.uninstall_settle_ms", 500)?
            .set_default("supervisor.restart_delay_ms", 250)?
            .set_default("supervisor.confirm_attempts", 10)?
            .set_default("supervisor.confirm_interval_ms", 250)?
            .set_default("gateway.max_body_bytes", 64 * 1024 * 1024)?
            .set_default("gateway.forward_timeout_secs", 300)?)
    }

    fn validate(&self) -> Result<()> {
        if self.node.port == 0 {
            return Err(AgentError::Config("Invalid port number".into()));
        }
        if self.plugins.directory.trim().is_empty() {
            return Err(AgentError::Config("plugins.directory must be set".into()));
        }
        if self.health.check_interval_secs == 0 {
            return Err(AgentError::Config(
                "health.check_interval_secs must be greater than 0".into(),
            ));
        }
        if self.supervisor.drain_attempts == 0 {
            return Err(AgentError::Config(
                "supervisor.drain_attempts must be greater than 0".into(),
            ));
        }
        if self.plugins.connect_timeout_ms == 0
            || self.plugins.download_stall_secs == 0
            || self.plugins.api_timeout_secs == 0
        {
            return Err(AgentError::Config(
                "plugins timeouts must be greater than 0".into(),
            ));
        }
        if self.supervisor.drain_interval_ms == 0 || self.supervisor.confirm_interval_ms == 0 {
            return Err(AgentError::Config(
                "supervisor intervals must be greater than 0".into(),
            ));
        }
        if self.supervisor.confirm_attempts == 0 {
            return Err(AgentError::Config(
                "supervisor.confirm_attempts must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn plugins_dir(&self) -> PathBuf {
        PathBuf::from(&self.plugins.directory)
    }

    pub fn get_version_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.plugins.version_cache_ttl_secs)
    }

    pub fn get_forward_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway.forward_timeout_secs)
    }

    pub fn supervisor_settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            drain_attempts: self.supervisor.drain_attempts,
            drain_interval: Duration::from_millis(self.supervisor.drain_interval_ms),
            uninstall_settle: Duration::from_millis(self.supervisor.uninstall_settle_ms),
            restart_delay: Duration::from_millis(self.supervisor.restart_delay_ms),
            version_cache_ttl: self.get_version_cache_ttl(),
        }
    }

    pub fn health_settings(&self) -> HealthSettings {
        HealthSettings {
            check_interval: Duration::from_secs(self.health.check_interval_secs),
            auto_exit_idle: Duration::from_secs(self.health.auto_exit_idle_secs),
        }
    }

    pub fn get_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health.probe_timeout_ms)
    }

    pub fn get_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.plugins.connect_timeout_ms)
    }

    pub fn get_download_stall_timeout(&self) -> Duration {
        Duration::from_secs(self.plugins.download_stall_secs)
    }

    pub fn get_api_timeout(&self) -> Duration {
        Duration::from_secs(self.plugins.api_timeout_secs)
    }

    pub fn get_confirm_interval(&self) -> Duration {
        Duration::from_millis(self.supervisor.confirm_interval_ms)
    }
}
