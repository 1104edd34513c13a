use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use crate::codec::safe_buffer;

/// How a registered peer is reached. Only plain HTTP forwarding is served;
/// `vm` is recognised so it can be rejected explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    Http,
    Vm,
}

impl FromStr for ServiceMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(ServiceMode::Http),
            "vm" => Ok(ServiceMode::Vm),
            other => Err(other.to_string()),
        }
    }
}

/// Signature schemes a registry request may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAlgorithm {
    Bioforestchain,
    Web3,
}

impl FromStr for AuthAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "bioforestchain" => Ok(AuthAlgorithm::Bioforestchain),
            "web3" => Ok(AuthAlgorithm::Web3),
            other => Err(other.to_string()),
        }
    }
}

/// Resolved network address for a peer hostname.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupResult {
    pub address: IpAddr,

    /// 4 or 6
    pub family: u8,

    /// Absolute expiry; `None` means the address never goes stale
    pub ttl: Option<DateTime<Utc>>,
}

impl LookupResult {
    pub fn new(address: IpAddr, ttl: Option<DateTime<Utc>>) -> Self {
        let family = if address.is_ipv4() { 4 } else { 6 };
        Self { address, family, ttl }
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        matches!(self.ttl, Some(expiry) if expiry <= now)
    }
}

/// One registered peer hostname.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecord {
    pub mode: ServiceMode,

    /// `scheme://hostname:port` as issued by the gateway
    pub origin: String,

    /// Canonical, gateway-assigned hostname
    pub hostname: String,

    /// Name or IP literal resolved when forwarding
    pub lookup_hostname: String,

    /// Peer's service port
    pub port: u16,

    #[serde(with = "safe_buffer")]
    pub public_key: Vec<u8>,

    /// Derived from `public_key`
    pub peer_address: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookup: Option<LookupResult>,
}

/// Derived peer address pointing at its current hostname.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressRecord {
    pub address: String,
    pub hostname: String,
}

/// JSON body of `POST /registry`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryInfo {
    pub auth: RegistryAuth,
    pub service: RegistryService,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryAuth {
    pub algorithm: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryService {
    pub mode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub port: u16,
}

/// Kinds of service announced over mDNS. Types seen on the network that are
/// not in the known set are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ServiceType {
    Http,
    Https,
    Tcp,
    Udp,
    Dns,
    Ssh,
    Ftp,
    Smtp,
    Database,
    Vm,
    Script,
    Other(String),
}

impl ServiceType {
    pub fn as_str(&self) -> &str {
        match self {
            ServiceType::Http => "http",
            ServiceType::Https => "https",
            ServiceType::Tcp => "tcp",
            ServiceType::Udp => "udp",
            ServiceType::Dns => "dns",
            ServiceType::Ssh => "ssh",
            ServiceType::Ftp => "ftp",
            ServiceType::Smtp => "smtp",
            ServiceType::Database => "database",
            ServiceType::Vm => "vm",
            ServiceType::Script => "script",
            ServiceType::Other(name) => name,
        }
    }
}

impl From<&str> for ServiceType {
    fn from(value: &str) -> Self {
        match value.trim_start_matches('_').to_ascii_lowercase().as_str() {
            "http" => ServiceType::Http,
            "https" => ServiceType::Https,
            "tcp" => ServiceType::Tcp,
            "udp" => ServiceType::Udp,
            "dns" => ServiceType::Dns,
            "ssh" => ServiceType::Ssh,
            "ftp" => ServiceType::Ftp,
            "smtp" => ServiceType::Smtp,
            "database" => ServiceType::Database,
            "vm" => ServiceType::Vm,
            "script" => ServiceType::Script,
            other => ServiceType::Other(other.to_string()),
        }
    }
}

impl From<String> for ServiceType {
    fn from(value: String) -> Self {
        ServiceType::from(value.as_str())
    }
}

impl From<ServiceType> for String {
    fn from(value: ServiceType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A service announced or discovered over mDNS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    pub service_name: String,
    pub service_type: ServiceType,
    pub port: u16,

    /// Transport label, e.g. "tcp"
    pub protocol: String,

    /// TXT metadata; may include `hostname`, `healthEndpoint`, `peerId`
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,

    /// SRV target of a discovered service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// A records seen for `host`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<IpAddr>,

    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl ServiceRecord {
    pub fn new(
        service_name: impl Into<String>,
        service_type: ServiceType,
        port: u16,
        protocol: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            service_name: service_name.into(),
            service_type,
            port,
            protocol: protocol.into(),
            metadata: BTreeMap::new(),
            host: None,
            addresses: Vec::new(),
            first_seen: now,
            last_seen: now,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Metadata value as a string, if present and textual
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthMetrics {
    pub response_time_ms: u64,
    pub success_rate: f64,
}

/// Latest health probe outcome for one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub status: HealthStatus,
    pub last_check: Option<DateTime<Utc>>,

    /// Seconds the service has been continuously healthy
    pub uptime_secs: u64,

    pub metrics: HealthMetrics,
}

impl Default for ServiceHealth {
    fn default() -> Self {
        Self {
            status: HealthStatus::Unknown,
            last_check: None,
            uptime_secs: 0,
            metrics: HealthMetrics {
                response_time_ms: 0,
                success_rate: 0.0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_record_json_shape() {
        let record = DnsRecord {
            mode: ServiceMode::Http,
            origin: "http://peer-gw.local:8080".to_string(),
            hostname: "peer-gw.local".to_string(),
            lookup_hostname: "peer-gw.local".to_string(),
            port: 9001,
            public_key: vec![1, 2, 3],
            peer_address: "b00".to_string(),
            lookup: None,
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["mode"], "http");
        assert_eq!(json["lookupHostname"], "peer-gw.local");
        assert_eq!(json["publicKey"], "hex:010203");
        assert!(json.get("lookup").is_none());

        let back: DnsRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_infinite_lookup_never_stale() {
        let lookup = LookupResult::new("127.0.0.1".parse().unwrap(), None);
        assert_eq!(lookup.family, 4);
        assert!(!lookup.is_stale(Utc::now() + chrono::Duration::days(365)));

        let expiring = LookupResult::new("::1".parse().unwrap(), Some(Utc::now()));
        assert_eq!(expiring.family, 6);
        assert!(expiring.is_stale(Utc::now() + chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_service_type_parsing() {
        assert_eq!(ServiceType::from("_http"), ServiceType::Http);
        assert_eq!(ServiceType::from("Database"), ServiceType::Database);
        assert_eq!(ServiceType::from("ipp"), ServiceType::Other("ipp".to_string()));
        assert_eq!(ServiceType::Ssh.to_string(), "ssh");
    }

    #[test]
    fn test_unknown_mode_and_algorithm() {
        assert_eq!("http".parse::<ServiceMode>(), Ok(ServiceMode::Http));
        assert_eq!("ws".parse::<ServiceMode>(), Err("ws".to_string()));
        assert_eq!("web3".parse::<AuthAlgorithm>(), Ok(AuthAlgorithm::Web3));
        assert!("rsa".parse::<AuthAlgorithm>().is_err());
    }
}
