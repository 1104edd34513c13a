//! Persistent tables behind the registry: hostname to [`DnsRecord`] and
//! derived peer address to hostname.

pub mod sqlite;

use std::collections::HashMap;
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::RwLock;
use shared::types::{AddressRecord, DnsRecord};

pub use sqlite::SqliteStore;

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_record(&self, hostname: &str) -> Result<Option<DnsRecord>>;

    /// Insert or replace the record stored under `record.hostname`.
    async fn put_record(&self, record: DnsRecord) -> Result<()>;

    async fn has_record(&self, hostname: &str) -> Result<bool> {
        Ok(self.get_record(hostname).await?.is_some())
    }

    async fn get_hostname_by_address(&self, address: &str) -> Result<Option<String>>;

    async fn put_address(&self, record: AddressRecord) -> Result<()>;
}

/// Process-local store; contents are lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, DnsRecord>>,
    addresses: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get_record(&self, hostname: &str) -> Result<Option<DnsRecord>> {
        Ok(self.records.read().await.get(hostname).cloned())
    }

    async fn put_record(&self, record: DnsRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.hostname.clone(), record);
        Ok(())
    }

    async fn has_record(&self, hostname: &str) -> Result<bool> {
        Ok(self.records.read().await.contains_key(hostname))
    }

    async fn get_hostname_by_address(&self, address: &str) -> Result<Option<String>> {
        Ok(self.addresses.read().await.get(address).cloned())
    }

    async fn put_address(&self, record: AddressRecord) -> Result<()> {
        self.addresses
            .write()
            .await
            .insert(record.address, record.hostname);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_record(hostname: &str) -> DnsRecord {
    use shared::types::ServiceMode;
    DnsRecord {
        mode: ServiceMode::Http,
        origin: format!("http://{hostname}:8080"),
        hostname: hostname.to_string(),
        lookup_hostname: "127.0.0.1".to_string(),
        port: 9001,
        public_key: vec![7; 32],
        peer_address: "b01".to_string(),
        lookup: None,
    }
}
