use std::net::IpAddr;
use std::sync::Arc;
use anyhow::{Context, Result};
use serde_json::json;
use shared::protocol::TXT_HOSTNAME;
use shared::types::{ServiceRecord, ServiceType};
use crate::mdns::discovery::ServiceDiscovery;
use crate::mdns::interfaces::{self, LanInterface};
use crate::mdns::wire::normalize_name;

type InterfaceSource = Arc<dyn Fn() -> Vec<LanInterface> + Send + Sync>;

/// Names the gateway answers A queries for: its own hostname and every peer
/// name issued under it.
#[derive(Clone)]
pub struct LocalNames {
    hostname: String,
    sep: String,
    interfaces: InterfaceSource,
}

impl LocalNames {
    pub fn new(hostname: &str, sep: &str) -> Self {
        Self::with_interfaces(hostname, sep, Arc::new(interfaces::lan_ipv4_interfaces))
    }

    pub fn with_interfaces(hostname: &str, sep: &str, interfaces: InterfaceSource) -> Self {
        Self {
            hostname: normalize_name(hostname),
            sep: sep.to_string(),
            interfaces,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Whether `name` is the gateway itself or a peer under it. Only `.local`
    /// names are answered over mDNS.
    pub fn matches(&self, name: &str) -> bool {
        let name = normalize_name(name);
        if !name.ends_with(".local") {
            return false;
        }
        name == self.hostname
            || name.ends_with(&format!("{}{}", self.sep, self.hostname))
            || name.ends_with(&format!(".{}", self.hostname))
    }

    /// Gateway addresses visible to a querier at `querier`
    pub fn addresses_for(&self, querier: IpAddr) -> Vec<std::net::Ipv4Addr> {
        interfaces::addresses_for_querier(&(self.interfaces)(), querier)
    }
}

/// Announce the gateway itself as a discoverable service.
pub async fn register_gateway(
    discovery: &ServiceDiscovery,
    gateway_hostname: &str,
    api_port: u16,
) -> Result<ServiceRecord> {
    let host = hostname::get()
        .context("Failed to get system hostname")?
        .to_string_lossy()
        .to_string();

    let service_name = format!("dweb-gateway-{}", host.replace('.', "-"));
    let record = ServiceRecord::new(&service_name, ServiceType::Tcp, api_port, "tcp")
        .with_metadata(TXT_HOSTNAME, json!(gateway_hostname));

    discovery.register_service(record.clone()).await;

    tracing::info!(
        "Advertised gateway {} as {} on port {}",
        gateway_hostname,
        service_name,
        api_port
    );

    Ok(record)
}

pub async fn unregister_gateway(discovery: &ServiceDiscovery, record: &ServiceRecord) {
    if discovery.unregister_service(&record.service_name).await {
        tracing::info!("Withdrew gateway advertisement {}", record.service_name);
    }
}
