use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::Deserialize;
use anyhow::{Context, Result};
use shared::protocol::DEFAULT_SEP;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub mdns: MdnsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Name peers are issued hostnames under
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_sep")]
    pub sep: String,
    /// Scheme written into issued origins
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Lifetime of a resolved address before it is refreshed
    #[serde(default = "default_refresh")]
    pub refresh_secs: u64,
    #[serde(default = "default_high_water")]
    pub high_water: usize,
    #[serde(default = "default_low_water")]
    pub low_water: usize,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MdnsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_membership_refresh")]
    pub membership_refresh_secs: u64,
    #[serde(default = "default_rebroadcast")]
    pub rebroadcast_secs: u64,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub health_timeout_ms: u64,
    /// Announce the gateway API itself over mDNS
    #[serde(default = "default_true")]
    pub advertise: bool,
}

fn default_hostname() -> String {
    "gw.local".to_string()
}

fn default_sep() -> String {
    DEFAULT_SEP.to_string()
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/dweb/records.db")
}

fn default_refresh() -> u64 {
    3600
}

fn default_high_water() -> usize {
    800
}

fn default_low_water() -> usize {
    600
}

fn default_cleanup_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_membership_refresh() -> u64 {
    5
}

fn default_rebroadcast() -> u64 {
    60
}

fn default_health_interval() -> u64 {
    30
}

fn default_health_timeout() -> u64 {
    5000
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            sep: default_sep(),
            scheme: default_scheme(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            db_path: default_db_path(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            refresh_secs: default_refresh(),
            high_water: default_high_water(),
            low_water: default_low_water(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            membership_refresh_secs: default_membership_refresh(),
            rebroadcast_secs: default_rebroadcast(),
            health_interval_secs: default_health_interval(),
            health_timeout_ms: default_health_timeout(),
            advertise: true,
        }
    }
}

impl GatewayConfig {
    /// Suffix every issued peer hostname ends with
    pub fn peer_suffix(&self) -> String {
        format!("{}{}", self.sep, self.hostname)
    }
}

impl CacheConfig {
    pub fn refresh(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
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

    pub fn parse(contents: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.gateway.hostname = config
            .gateway
            .hostname
            .trim_end_matches('.')
            .to_ascii_lowercase();

        if config.api.tls_cert.is_some() != config.api.tls_key.is_some() {
            anyhow::bail!("tls_cert and tls_key must be set together");
        }
        if config.cache.low_water > config.cache.high_water {
            anyhow::bail!("cache.low_water must not exceed cache.high_water");
        }
        for (name, value) in [
            ("cache.cleanup_interval_secs", config.cache.cleanup_interval_secs),
            ("mdns.membership_refresh_secs", config.mdns.membership_refresh_secs),
            ("mdns.rebroadcast_secs", config.mdns.rebroadcast_secs),
            ("mdns.health_interval_secs", config.mdns.health_interval_secs),
        ] {
            if value == 0 {
                anyhow::bail!("{} must be greater than zero", name);
            }
        }
        Ok(config)
    }
}
