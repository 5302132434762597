//! fleetd.toml configuration parser.
//!
//! Every section and field is optional; missing values fall back to the
//! defaults below.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name of the state database inside `storage.data_dir`.
pub const DATABASE_FILE: &str = "fleet.redb";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub server: ServerConfig,
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub partition: PartitionConfig,
    pub logging: LoggingConfig,
}

/// This server instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub affinity_group: Option<String>,
    pub compute_power: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: std::env::var("HOSTNAME").unwrap_or_else(|_| "fleetd".to_string()),
            address: "127.0.0.1".to_string(),
            port: 7080,
            affinity_group: None,
            compute_power: 1,
        }
    }
}

/// Admin API. `fleetd run` serves it; admin subcommands and `fleetd join`
/// are its clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen: SocketAddr,
    /// `host:port` clients connect to. Derived from `listen` when unset.
    pub endpoint: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 7081)),
            endpoint: None,
        }
    }
}

impl ApiConfig {
    /// Where a client on this host reaches the daemon.
    pub fn client_endpoint(&self) -> String {
        if let Some(endpoint) = &self.endpoint {
            return endpoint.clone();
        }
        let mut addr = self.listen;
        if addr.ip().is_unspecified() {
            addr.set_ip(Ipv4Addr::LOCALHOST.into());
        }
        addr.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/fleetd"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionConfig {
    /// Seconds without a heartbeat before a NORMAL server is forced DOWN.
    pub stale_interval_secs: u64,
    pub sweep_interval_secs: u64,
    /// 0 disables periodic rebalancing.
    pub rebalance_interval_secs: u64,
    pub event_retention_secs: u64,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            stale_interval_secs: 120,
            sweep_interval_secs: 30,
            rebalance_interval_secs: 0,
            event_retention_secs: 7 * 24 * 3600,
        }
    }
}

impl PartitionConfig {
    pub fn stale_interval(&self) -> Duration {
        Duration::from_secs(self.stale_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn rebalance_interval(&self) -> Option<Duration> {
        (self.rebalance_interval_secs > 0).then(|| Duration::from_secs(self.rebalance_interval_secs))
    }

    pub fn event_retention(&self) -> Duration {
        Duration::from_secs(self.event_retention_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,fleetd=debug,fleet=debug".to_string(),
            format: LogFormat::Text,
        }
    }
}

impl FleetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FleetConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Read `path` if it exists, otherwise use defaults.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) if path.exists() => Self::from_file(path),
            Some(path) => anyhow::bail!("config file not found: {}", path.display()),
            None => Ok(Self::default()),
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject values the daemon cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.name.trim().is_empty() {
            anyhow::bail!("server.name must not be empty");
        }
        if self.server.compute_power == 0 {
            anyhow::bail!("server.compute_power must be at least 1");
        }
        if self.partition.stale_interval_secs == 0 {
            anyhow::bail!("partition.stale_interval_secs must be positive");
        }
        if self.partition.sweep_interval_secs == 0 {
            anyhow::bail!("partition.sweep_interval_secs must be positive");
        }
        Ok(())
    }

    /// Path of the state database.
    pub fn database_path(&self) -> PathBuf {
        self.storage.data_dir.join(DATABASE_FILE)
    }
}
