use std::time::{Duration, Instant};
use chrono::Utc;
use tokio::net::{TcpStream, UdpSocket};
use shared::protocol::{DEFAULT_HEALTH_ENDPOINT, TXT_HEALTH_ENDPOINT};
use shared::types::{HealthMetrics, HealthStatus, ServiceHealth, ServiceRecord, ServiceType};

/// Running health of one service.
#[derive(Debug, Clone, Default)]
pub struct HealthState {
    pub health: ServiceHealth,
    healthy_since: Option<Instant>,
}

impl HealthState {
    /// Fold one probe outcome into the state.
    pub fn record(&mut self, healthy: bool, elapsed: Duration) {
        let now = Instant::now();
        if healthy {
            let since = *self.healthy_since.get_or_insert(now);
            self.health.uptime_secs = now.duration_since(since).as_secs();
        } else {
            self.healthy_since = None;
            self.health.uptime_secs = 0;
        }

        self.health.status = if healthy {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        };
        self.health.last_check = Some(Utc::now());
        self.health.metrics = HealthMetrics {
            response_time_ms: elapsed.as_millis() as u64,
            success_rate: if healthy { 1.0 } else { 0.0 },
        };
    }
}

/// Connectivity probes by service type.
#[derive(Clone)]
pub struct Prober {
    http: reqwest::Client,
    timeout: Duration,
}

impl Prober {
    pub fn new(timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build health check client: {}", e);
                reqwest::Client::new()
            });
        Self { http, timeout }
    }

    /// Probe `record` at `host`. Types without a probe count as healthy.
    pub async fn probe(&self, record: &ServiceRecord, host: &str) -> bool {
        match &record.service_type {
            ServiceType::Http | ServiceType::Https => self.probe_http(record, host).await,
            ServiceType::Tcp | ServiceType::Ssh => self.probe_tcp(host, record.port).await,
            ServiceType::Udp => probe_udp(host, record.port).await,
            _ => true,
        }
    }

    async fn probe_http(&self, record: &ServiceRecord, host: &str) -> bool {
        let url = health_url(record, host);
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                tracing::debug!("Health check {} failed: {}", url, e);
                false
            }
        }
    }

    async fn probe_tcp(&self, host: &str, port: u16) -> bool {
        matches!(
            tokio::time::timeout(self.timeout, TcpStream::connect((host, port))).await,
            Ok(Ok(_))
        )
    }
}

async fn probe_udp(host: &str, port: u16) -> bool {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(socket) => socket,
        Err(_) => return false,
    };
    socket.connect((host, port)).await.is_ok()
}

fn health_url(record: &ServiceRecord, host: &str) -> String {
    let scheme = match record.service_type {
        ServiceType::Https => "https",
        _ => "http",
    };
    let endpoint = record
        .metadata_str(TXT_HEALTH_ENDPOINT)
        .unwrap_or(DEFAULT_HEALTH_ENDPOINT);
    format!("{}://{}:{}{}", scheme, host, record.port, endpoint)
}
