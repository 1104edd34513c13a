//! Peer-side client for a gateway's registry endpoints.

use anyhow::{bail, Context, Result};
use http::Uri;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use shared::codec;
use shared::protocol::{ALGORITHM, DEFAULT_SEP, QUERY_PATH, REGISTRY_PATH};
use shared::signing::{sign_request, Keypair};
use shared::types::{DnsRecord, RegistryAuth, RegistryInfo, RegistryService};

pub struct RegistryClient {
    http: reqwest::Client,
    gateway_url: String,
    gateway_host: String,
    keypair: Keypair,
    sep: String,
}

impl RegistryClient {
    /// Client for the gateway at `gateway_url`, e.g. `http://gw.local:8080`.
    pub fn new(gateway_url: &str, keypair: Keypair) -> Result<Self> {
        let uri: Uri = gateway_url
            .parse()
            .with_context(|| format!("Invalid gateway URL: {}", gateway_url))?;
        let gateway_host = uri
            .host()
            .with_context(|| format!("Gateway URL has no host: {}", gateway_url))?
            .to_ascii_lowercase();

        Ok(Self {
            http: reqwest::Client::new(),
            gateway_url: gateway_url.trim_end_matches('/').to_string(),
            gateway_host,
            keypair,
            sep: DEFAULT_SEP.to_string(),
        })
    }

    /// Use a preconfigured HTTP client, e.g. one with DNS overrides.
    pub fn with_http(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn with_sep(mut self, sep: &str) -> Self {
        self.sep = sep.to_string();
        self
    }

    pub fn address(&self) -> String {
        self.keypair.address()
    }

    /// Hostname the gateway issues to this key
    pub fn peer_hostname(&self) -> String {
        format!("{}{}{}", self.keypair.address(), self.sep, self.gateway_host)
    }

    /// Register this peer's HTTP service on `port`. `hostname` overrides the
    /// name the gateway resolves when forwarding.
    pub async fn register(&self, port: u16, hostname: Option<&str>) -> Result<DnsRecord> {
        let info = RegistryInfo {
            auth: RegistryAuth {
                algorithm: ALGORITHM.to_string(),
                public_key: codec::encode(&self.keypair.public_key()),
            },
            service: RegistryService {
                mode: "http".to_string(),
                hostname: hostname.map(str::to_string),
                port,
            },
        };
        let body = serde_json::to_vec(&info).context("Failed to serialize registry info")?;

        let url = format!("{}{}", self.gateway_url, REGISTRY_PATH);
        let from_hostname = self.peer_hostname();
        let headers = sign_request(&self.keypair, &from_hostname, &url, "POST", Some(&body))
            .context("Failed to sign registry request")?;

        let response = self
            .http
            .post(&url)
            .headers(headers)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to reach gateway at {}", url))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Registry rejected {}: {} {}", from_hostname, status, text);
        }

        let record: DnsRecord = response
            .json()
            .await
            .context("Failed to parse registry response")?;
        tracing::info!("Registered as {}", record.hostname);
        Ok(record)
    }

    pub async fn query(&self, hostname: &str) -> Result<Option<DnsRecord>> {
        self.query_by("hostname", hostname).await
    }

    pub async fn query_address(&self, address: &str) -> Result<Option<DnsRecord>> {
        self.query_by("address", address).await
    }

    async fn query_by(&self, key: &str, value: &str) -> Result<Option<DnsRecord>> {
        let url = format!("{}{}", self.gateway_url, QUERY_PATH);
        let response = self
            .http
            .get(&url)
            .query(&[(key, value)])
            .send()
            .await
            .with_context(|| format!("Failed to reach gateway at {}", url))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(
                response
                    .json()
                    .await
                    .context("Failed to parse query response")?,
            )),
            status => bail!("Query for {}={} failed: {}", key, value, status),
        }
    }
}
