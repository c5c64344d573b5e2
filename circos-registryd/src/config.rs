use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::{CIRCOS_SERVICE_TYPE, DEFAULT_CONTROL_PORT};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub wol: WolConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Entries unseen for longer than this get a reachability probe and are dropped if it fails
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: u64,
    /// Delay before the follow-up pass scheduled by a shutdown notification
    #[serde(default = "default_shutdown_refresh_delay")]
    pub shutdown_refresh_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// Bound on each network step: ping, metadata, status, name resolution
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_control_port")]
    pub default_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_service_types")]
    pub service_types: Vec<String>,
    /// Restrict mDNS to a single interface; all interfaces when unset
    #[serde(default)]
    pub interface: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WolConfig {
    #[serde(default = "default_broadcast")]
    pub broadcast: String,
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("/var/lib/circos/machine_cache.json")
}

fn default_poll_interval() -> u64 {
    30
}

fn default_stale_timeout() -> u64 {
    600
}

fn default_shutdown_refresh_delay() -> u64 {
    1500
}

fn default_probe_timeout() -> u64 {
    1500
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_service_types() -> Vec<String> {
    vec![CIRCOS_SERVICE_TYPE.to_string()]
}

fn default_listen() -> String {
    "0.0.0.0:8800".to_string()
}

fn default_broadcast() -> String {
    "255.255.255.255:9".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
            poll_interval_secs: default_poll_interval(),
            stale_timeout_secs: default_stale_timeout(),
            shutdown_refresh_delay_ms: default_shutdown_refresh_delay(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_probe_timeout(),
            default_port: default_control_port(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            service_types: default_service_types(),
            interface: None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for WolConfig {
    fn default() -> Self {
        Self {
            broadcast: default_broadcast(),
        }
    }
}

impl RegistryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    pub fn shutdown_refresh_delay(&self) -> Duration {
        Duration::from_millis(self.shutdown_refresh_delay_ms)
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Like `load`, but a missing file yields the defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        anyhow::ensure!(
            config.registry.poll_interval_secs > 0,
            "registry.poll_interval_secs must be at least 1"
        );
        Ok(config)
    }
}
