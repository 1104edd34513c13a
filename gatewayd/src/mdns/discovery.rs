//! Service discovery on top of the multicast transport.
//!
//! Local services are announced as a PTR/SRV/TXT triple and re-announced on a
//! fixed interval until they are withdrawn. Responses from the network are
//! folded into a table of discovered services, and A answers into a small host
//! table used to resolve `*.local` names.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};
use anyhow::Result;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use shared::protocol::{HOST_TTL, META_QUERY_NAME, SERVICE_TTL, TXT_HOSTNAME};
use shared::types::{ServiceHealth, ServiceRecord, ServiceType};
use crate::mdns::advertise::LocalNames;
use crate::mdns::health::{HealthState, Prober};
use crate::mdns::transport::{PacketSender, TransportEvent};
use crate::mdns::txt;
use crate::mdns::wire::{normalize_name, Packet, Question, Record, RecordData, RecordType};

/// Signals raised by discovery, delivered to every subscriber.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    ServiceDiscovered(ServiceRecord),
    ServiceLost(String),
    HealthCheck { name: String, health: ServiceHealth },
    Query { packet: Packet, from: SocketAddr },
    Response { packet: Packet, from: SocketAddr },
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub rebroadcast_interval: Duration,
    pub health_interval: Duration,
    pub health_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            rebroadcast_interval: Duration::from_secs(60),
            health_interval: Duration::from_secs(30),
            health_timeout: Duration::from_millis(5000),
        }
    }
}

struct LocalService {
    record: ServiceRecord,
    rebroadcast: JoinHandle<()>,
}

struct HostEntry {
    addresses: Vec<Ipv4Addr>,
    expires: Instant,
}

struct Inner {
    sender: Arc<dyn PacketSender>,
    config: DiscoveryConfig,
    names: LocalNames,
    local: Mutex<HashMap<String, LocalService>>,
    discovered: Mutex<HashMap<String, ServiceRecord>>,
    hosts: Mutex<HashMap<String, HostEntry>>,
    health: Mutex<HashMap<String, HealthState>>,
    events: broadcast::Sender<DiscoveryEvent>,
    prober: Prober,
}

#[derive(Clone)]
pub struct ServiceDiscovery {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// `_<type>._<protocol>.local`
pub fn service_type_name(record: &ServiceRecord) -> String {
    format!("_{}._{}.local", record.service_type, record.protocol)
}

/// `<name>._<type>._<protocol>.local`
pub fn instance_name(record: &ServiceRecord) -> String {
    format!("{}.{}", record.service_name, service_type_name(record))
}

/// Split an instance name into `(service name, service type, protocol)`.
pub fn parse_instance_name(name: &str) -> Option<(String, ServiceType, String)> {
    let name = normalize_name(name);
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 4 || labels[labels.len() - 1] != "local" {
        return None;
    }
    let protocol = labels[labels.len() - 2].strip_prefix('_')?;
    let service_type = labels[labels.len() - 3].strip_prefix('_')?;
    let service_name = labels[..labels.len() - 3].join(".");
    if service_name.is_empty() || service_type.is_empty() || protocol.is_empty() {
        return None;
    }
    Some((service_name, ServiceType::from(service_type), protocol.to_string()))
}

fn normalize_record(mut record: ServiceRecord) -> ServiceRecord {
    record.service_name = record.service_name.trim_start_matches('_').to_string();
    record.protocol = record.protocol.trim_start_matches('_').to_ascii_lowercase();
    if record.protocol.is_empty() {
        record.protocol = "tcp".to_string();
    }
    record
}

impl ServiceDiscovery {
    pub fn new(sender: Arc<dyn PacketSender>, names: LocalNames, config: DiscoveryConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        let prober = Prober::new(config.health_timeout);
        Self {
            inner: Arc::new(Inner {
                sender,
                config,
                names,
                local: Mutex::new(HashMap::new()),
                discovered: Mutex::new(HashMap::new()),
                hosts: Mutex::new(HashMap::new()),
                health: Mutex::new(HashMap::new()),
                events,
                prober,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: DiscoveryEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Store a local service, announce it now and keep re-announcing it until
    /// it is unregistered.
    pub async fn register_service(&self, record: ServiceRecord) {
        let record = normalize_record(record);
        let key = record.service_name.clone();

        let rebroadcast = spawn_rebroadcast(
            Arc::downgrade(&self.inner),
            key.clone(),
            self.inner.config.rebroadcast_interval,
        );

        let previous = lock(&self.inner.local).insert(
            key.clone(),
            LocalService {
                record: record.clone(),
                rebroadcast,
            },
        );
        if let Some(previous) = previous {
            previous.rebroadcast.abort();
        }

        tracing::info!("Registered service {}", instance_name(&record));
        self.announce(&record, SERVICE_TTL).await;
    }

    /// Withdraw a local service and announce its departure. Returns false if
    /// no such service was registered.
    pub async fn unregister_service(&self, service_name: &str) -> bool {
        let key = service_name.trim_start_matches('_');
        let removed = lock(&self.inner.local).remove(key);
        let Some(service) = removed else {
            return false;
        };
        service.rebroadcast.abort();
        lock(&self.inner.health).remove(key);
        self.announce(&service.record, 0).await;
        tracing::info!("Unregistered service {}", instance_name(&service.record));
        true
    }

    async fn announce(&self, record: &ServiceRecord, ttl: u32) {
        let answers = service_answers(record, self.inner.names.hostname(), ttl);
        if let Err(e) = self.inner.sender.respond(answers, None).await {
            tracing::warn!("Failed to announce {}: {}", record.service_name, e);
        }
    }

    pub fn local_services(&self) -> Vec<ServiceRecord> {
        lock(&self.inner.local)
            .values()
            .map(|service| service.record.clone())
            .collect()
    }

    pub fn discovered_services(&self) -> Vec<ServiceRecord> {
        lock(&self.inner.discovered).values().cloned().collect()
    }

    /// Build the answers this node gives to an incoming query.
    pub fn answer_query(&self, packet: &Packet, from: SocketAddr) -> Vec<Record> {
        let mut answers: Vec<Record> = Vec::new();
        let mut push = |record: Record| {
            if !answers.contains(&record) {
                answers.push(record);
            }
        };

        let local = lock(&self.inner.local);
        for question in &packet.questions {
            let name = normalize_name(&question.name);

            if matches!(question.record_type, RecordType::A | RecordType::Any)
                && self.inner.names.matches(&name)
            {
                for addr in self.inner.names.addresses_for(from.ip()) {
                    push(Record::new(question.name.clone(), HOST_TTL, RecordData::A(addr)));
                }
            }

            if !matches!(
                question.record_type,
                RecordType::Ptr | RecordType::Srv | RecordType::Txt | RecordType::Any
            ) {
                continue;
            }

            if name == META_QUERY_NAME {
                for service in local.values() {
                    push(Record::new(
                        META_QUERY_NAME,
                        SERVICE_TTL,
                        RecordData::Ptr(service_type_name(&service.record)),
                    ));
                }
                continue;
            }

            for service in local.values() {
                let record = &service.record;
                let by_type = service_type_name(record);
                let by_name = format!("_{}._{}.local", record.service_name, record.protocol);
                let instance = instance_name(record);
                if name == by_type || name == by_name.to_ascii_lowercase() {
                    let mut triple =
                        service_answers(record, self.inner.names.hostname(), SERVICE_TTL);
                    // PTR owner echoes the question
                    triple[0].name = question.name.clone();
                    triple.into_iter().for_each(&mut push);
                } else if name == instance.to_ascii_lowercase() {
                    service_answers(record, self.inner.names.hostname(), SERVICE_TTL)
                        .into_iter()
                        .skip(1)
                        .for_each(&mut push);
                }
            }
        }

        answers
    }

    /// Fold a response into the discovered-service and host tables, returning
    /// the services seen for the first time.
    pub fn handle_response(&self, packet: &Packet) -> Vec<ServiceRecord> {
        self.record_hosts(packet);

        let local_instances: Vec<String> = lock(&self.inner.local)
            .values()
            .map(|s| instance_name(&s.record).to_ascii_lowercase())
            .collect();

        let mut instances: Vec<(String, u32)> = Vec::new();
        for answer in &packet.answers {
            let candidate = match &answer.data {
                RecordData::Ptr(target) => Some(target.as_str()),
                RecordData::Srv { .. } => Some(answer.name.as_str()),
                _ => None,
            };
            if let Some(instance) = candidate {
                let instance = normalize_name(instance);
                if !instances.iter().any(|(seen, _)| *seen == instance) {
                    instances.push((instance, answer.ttl));
                }
            }
        }

        let mut new_services = Vec::new();
        for (instance, ttl) in instances {
            if local_instances.contains(&instance) {
                continue;
            }
            let Some((service_name, service_type, protocol)) = parse_instance_name(&instance)
            else {
                continue;
            };

            if ttl == 0 {
                if lock(&self.inner.discovered).remove(&instance).is_some() {
                    tracing::info!("Service lost: {}", instance);
                    lock(&self.inner.health).remove(&instance);
                    self.emit(DiscoveryEvent::ServiceLost(instance));
                }
                continue;
            }

            let srv = packet.answers.iter().find_map(|a| match &a.data {
                RecordData::Srv { port, target, .. } if normalize_name(&a.name) == instance => {
                    Some((*port, normalize_name(target)))
                }
                _ => None,
            });
            let metadata = packet
                .answers
                .iter()
                .filter(|a| normalize_name(&a.name) == instance)
                .filter_map(|a| match &a.data {
                    RecordData::Txt(strings) => Some(txt::decode(strings)),
                    _ => None,
                })
                .fold(Default::default(), |mut acc: std::collections::BTreeMap<_, _>, m| {
                    acc.extend(m);
                    acc
                });

            let mut discovered = lock(&self.inner.discovered);
            match discovered.get_mut(&instance) {
                Some(existing) => {
                    existing.last_seen = Utc::now();
                    existing.metadata.extend(metadata);
                    if let Some((port, target)) = srv {
                        existing.port = port;
                        existing.addresses = self.host_addresses(&target);
                        existing.host = Some(target);
                    }
                }
                None => {
                    let mut record = ServiceRecord::new(service_name, service_type, 0, protocol);
                    record.metadata = metadata;
                    if let Some((port, target)) = srv {
                        record.port = port;
                        record.addresses = self.host_addresses(&target);
                        record.host = Some(target);
                    }
                    tracing::info!("Discovered service {}", instance);
                    discovered.insert(instance, record.clone());
                    new_services.push(record);
                }
            }
        }

        for record in &new_services {
            self.emit(DiscoveryEvent::ServiceDiscovered(record.clone()));
        }
        new_services
    }

    fn record_hosts(&self, packet: &Packet) {
        let now = Instant::now();
        let mut hosts = lock(&self.inner.hosts);
        let mut seen: HashMap<String, (Vec<Ipv4Addr>, u32)> = HashMap::new();
        for answer in &packet.answers {
            if let RecordData::A(addr) = answer.data {
                let entry = seen.entry(normalize_name(&answer.name)).or_default();
                entry.0.push(addr);
                entry.1 = entry.1.max(answer.ttl);
            }
        }
        for (name, (addresses, ttl)) in seen {
            if ttl == 0 {
                hosts.remove(&name);
            } else {
                hosts.insert(
                    name,
                    HostEntry {
                        addresses,
                        expires: now + Duration::from_secs(ttl as u64),
                    },
                );
            }
        }
    }

    fn host_addresses(&self, host: &str) -> Vec<IpAddr> {
        lock(&self.inner.hosts)
            .get(host)
            .map(|entry| entry.addresses.iter().map(|a| IpAddr::V4(*a)).collect())
            .unwrap_or_default()
    }

    fn cached_host(&self, host: &str) -> Option<IpAddr> {
        let hosts = lock(&self.inner.hosts);
        let entry = hosts.get(host)?;
        if entry.expires <= Instant::now() {
            return None;
        }
        entry.addresses.first().map(|a| IpAddr::V4(*a))
    }

    /// Resolve a `*.local` hostname over mDNS, asking the network if no fresh
    /// answer has been seen. Returns `None` after `timeout`.
    pub async fn resolve_local(&self, host: &str, timeout: Duration) -> Option<IpAddr> {
        let host = normalize_name(host);
        if let Some(addr) = self.cached_host(&host) {
            return Some(addr);
        }

        let mut events = self.subscribe();
        if let Err(e) = self.inner.sender.query(&host, RecordType::A).await {
            tracing::debug!("Failed to query {}: {}", host, e);
            return None;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Ok(DiscoveryEvent::Response { .. })) => {
                    if let Some(addr) = self.cached_host(&host) {
                        return Some(addr);
                    }
                }
                Ok(Ok(_)) | Ok(Err(broadcast::error::RecvError::Lagged(_))) => {}
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return None,
            }
        }
    }

    /// Ask the network for every instance of a service type. Answers arrive
    /// through the event loop like any other response.
    pub async fn browse(&self, service_type: &ServiceType, protocol: &str) {
        let query = Packet::query(vec![browse_question(service_type, protocol)]);
        if let Err(e) = self.inner.sender.send(&query, None).await {
            tracing::warn!("Failed to browse for _{}._{}: {}", service_type, protocol, e);
        }
    }

    async fn on_query(&self, packet: Packet, from: SocketAddr) {
        let answers = self.answer_query(&packet, from);
        let unicast = !packet.questions.is_empty()
            && packet.questions.iter().all(|q| q.unicast_response);
        self.emit(DiscoveryEvent::Query { packet, from });

        if answers.is_empty() {
            return;
        }
        let destination = unicast.then_some(from);
        if let Err(e) = self.inner.sender.respond(answers, destination).await {
            tracing::warn!("Failed to answer mDNS query from {}: {}", from, e);
        }
    }

    fn on_response(&self, packet: Packet, from: SocketAddr) {
        self.handle_response(&packet);
        self.emit(DiscoveryEvent::Response { packet, from });
    }

    /// Probe every known service once and record the outcome.
    pub async fn check_health(&self) {
        let mut targets: Vec<(String, ServiceRecord, String)> = lock(&self.inner.local)
            .iter()
            .map(|(key, s)| (key.clone(), s.record.clone(), "127.0.0.1".to_string()))
            .collect();
        targets.extend(lock(&self.inner.discovered).iter().filter_map(|(key, record)| {
            let host = record
                .addresses
                .first()
                .map(|a| a.to_string())
                .or_else(|| record.metadata_str(TXT_HOSTNAME).map(str::to_string))
                .or_else(|| record.host.clone())?;
            Some((key.clone(), record.clone(), host))
        }));

        let probes = targets.into_iter().map(|(key, record, host)| {
            let prober = self.inner.prober.clone();
            async move {
                let started = Instant::now();
                let healthy = prober.probe(&record, &host).await;
                (key, healthy, started.elapsed())
            }
        });

        for (key, healthy, elapsed) in futures::future::join_all(probes).await {
            let health = {
                let mut states = lock(&self.inner.health);
                let state = states.entry(key.clone()).or_default();
                state.record(healthy, elapsed);
                state.health.clone()
            };
            tracing::debug!("Health check {}: {:?}", key, health.status);
            self.emit(DiscoveryEvent::HealthCheck { name: key, health });
        }
    }

    /// Event loop: answer queries, absorb responses and run health checks
    /// until cancelled.
    pub async fn run(
        self,
        events: flume::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) -> Result<()> {
        tracing::info!("Starting mDNS service discovery");

        let mut health_interval = tokio::time::interval(self.inner.config.health_interval);
        health_interval.tick().await;

        loop {
            tokio::select! {
                event = events.recv_async() => {
                    match event {
                        Ok(TransportEvent::Query { packet, from }) => self.on_query(packet, from).await,
                        Ok(TransportEvent::Response { packet, from }) => self.on_response(packet, from),
                        Err(e) => {
                            tracing::warn!("mDNS transport channel closed: {}", e);
                            break;
                        }
                    }
                }
                _ = health_interval.tick() => {
                    let discovery = self.clone();
                    tokio::spawn(async move { discovery.check_health().await });
                }
                _ = cancel.cancelled() => {
                    tracing::info!("mDNS service discovery shutting down");
                    break;
                }
            }
        }

        self.shutdown();
        Ok(())
    }

    /// Stop every rebroadcast loop.
    pub fn shutdown(&self) {
        for (_, service) in lock(&self.inner.local).drain() {
            service.rebroadcast.abort();
        }
    }
}

/// PTR, SRV and TXT answers describing `record`, in that order.
fn service_answers(record: &ServiceRecord, default_host: &str, ttl: u32) -> Vec<Record> {
    let instance = instance_name(record);
    let target = record
        .metadata_str(TXT_HOSTNAME)
        .unwrap_or(default_host)
        .to_string();
    vec![
        Record::new(service_type_name(record), ttl, RecordData::Ptr(instance.clone())),
        Record::new(
            instance.clone(),
            ttl,
            RecordData::Srv {
                priority: 0,
                weight: 0,
                port: record.port,
                target,
            },
        ),
        Record::new(instance, ttl, RecordData::Txt(txt::encode(&record.metadata))),
    ]
}

fn spawn_rebroadcast(inner: Weak<Inner>, key: String, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let record = match lock(&inner.local).get(&key) {
                Some(service) => service.record.clone(),
                None => break,
            };
            let answers = service_answers(&record, inner.names.hostname(), SERVICE_TTL);
            if let Err(e) = inner.sender.respond(answers, None).await {
                tracing::warn!("Failed to rebroadcast {}: {}", key, e);
            }
        }
    })
}

/// Question asking the network for every instance of a service type
pub fn browse_question(service_type: &ServiceType, protocol: &str) -> Question {
    Question::new(format!("_{}._{}.local", service_type, protocol), RecordType::Ptr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdns::interfaces::LanInterface;
    use crate::mdns::wire::PacketKind;
    use async_trait::async_trait;
    use serde_json::json;

    #[derive(Default)]
    struct RecordingSender {
        sent: Mutex<Vec<(Packet, Option<SocketAddr>)>>,
    }

    impl RecordingSender {
        fn sent(&self) -> Vec<(Packet, Option<SocketAddr>)> {
            lock(&self.sent).clone()
        }
    }

    #[async_trait]
    impl PacketSender for RecordingSender {
        async fn send(&self, packet: &Packet, destination: Option<SocketAddr>) -> Result<()> {
            lock(&self.sent).push((packet.clone(), destination));
            Ok(())
        }
    }

    fn discovery() -> (ServiceDiscovery, Arc<RecordingSender>) {
        let sender = Arc::new(RecordingSender::default());
        let names = LocalNames::with_interfaces(
            "gw.local",
            "-",
            Arc::new(|| {
                vec![LanInterface {
                    ip: Ipv4Addr::new(192, 168, 1, 5),
                    netmask: Ipv4Addr::new(255, 255, 255, 0),
                }]
            }),
        );
        let discovery = ServiceDiscovery::new(sender.clone(), names, DiscoveryConfig::default());
        (discovery, sender)
    }

    fn web_service() -> ServiceRecord {
        ServiceRecord::new("_web", ServiceType::Http, 9001, "_tcp")
            .with_metadata("peerId", json!("babc"))
            .with_metadata("limits", json!({"rps": 5}))
    }

    fn querier() -> SocketAddr {
        "192.168.1.40:5353".parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_broadcasts_triple() {
        let (discovery, sender) = discovery();
        discovery.register_service(web_service()).await;

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        let (packet, destination) = &sent[0];
        assert_eq!(packet.kind, PacketKind::Response);
        assert!(packet.authoritative);
        assert!(destination.is_none());
        assert_eq!(packet.answers[0].name, "_http._tcp.local");
        assert_eq!(
            packet.answers[0].data,
            RecordData::Ptr("web._http._tcp.local".to_string())
        );

        let local = discovery.local_services();
        assert_eq!(local[0].service_name, "web");
        assert_eq!(local[0].protocol, "tcp");
    }

    #[tokio::test]
    async fn test_ptr_query_answered_with_metadata() {
        let (discovery, _) = discovery();
        let service = web_service();
        discovery.register_service(service.clone()).await;

        let query = Packet::query(vec![Question::new("_http._tcp.local", RecordType::Ptr)]);
        let answers = discovery.answer_query(&query, querier());

        let count = |t: RecordType| answers.iter().filter(|a| a.record_type() == t).count();
        assert_eq!(count(RecordType::Ptr), 1);
        assert_eq!(count(RecordType::Srv), 1);
        assert_eq!(count(RecordType::Txt), 1);
        assert!(answers.iter().all(|a| a.ttl == SERVICE_TTL));

        let txt = answers
            .iter()
            .find_map(|a| match &a.data {
                RecordData::Txt(strings) => Some(txt::decode(strings)),
                _ => None,
            })
            .unwrap();
        assert_eq!(txt, service.metadata);

        let srv = answers.iter().find(|a| a.record_type() == RecordType::Srv).unwrap();
        assert_eq!(
            srv.data,
            RecordData::Srv {
                priority: 0,
                weight: 0,
                port: 9001,
                target: "gw.local".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_name_based_question_matches() {
        let (discovery, _) = discovery();
        discovery.register_service(web_service()).await;

        let query = Packet::query(vec![Question::new("_web._tcp.local", RecordType::Ptr)]);
        assert_eq!(discovery.answer_query(&query, querier()).len(), 3);

        let query = Packet::query(vec![Question::new("_ssh._tcp.local", RecordType::Ptr)]);
        assert!(discovery.answer_query(&query, querier()).is_empty());
    }

    #[tokio::test]
    async fn test_meta_query_lists_types() {
        let (discovery, _) = discovery();
        discovery.register_service(web_service()).await;

        let query = Packet::query(vec![Question::new(META_QUERY_NAME, RecordType::Ptr)]);
        let answers = discovery.answer_query(&query, querier());
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].data, RecordData::Ptr("_http._tcp.local".to_string()));
    }

    #[test]
    fn test_a_query_for_peer_name() {
        let (discovery, _) = discovery();
        let query = Packet::query(vec![
            Question::new("babc-gw.local", RecordType::A),
            Question::new("printer.local", RecordType::A),
        ]);

        let answers = discovery.answer_query(&query, querier());
        assert_eq!(answers.len(), 1);
        assert_eq!(answers[0].name, "babc-gw.local");
        assert_eq!(answers[0].ttl, HOST_TTL);
        assert_eq!(answers[0].data, RecordData::A(Ipv4Addr::new(192, 168, 1, 5)));

        let foreign: SocketAddr = "10.9.9.9:5353".parse().unwrap();
        assert!(discovery.answer_query(&query, foreign).is_empty());
    }

    fn remote_announcement(ttl: u32) -> Packet {
        let mut remote = ServiceRecord::new("printer", ServiceType::Other("ipp".into()), 631, "tcp")
            .with_metadata("hostname", json!("printer.local"))
            .with_metadata("pages", json!(12));
        remote.metadata.insert("note".into(), json!("hello"));
        let mut answers = service_answers(&remote, "unused.local", ttl);
        answers.push(Record::new("printer.local", ttl, RecordData::A(Ipv4Addr::new(192, 168, 1, 9))));
        Packet::response(answers)
    }

    #[tokio::test]
    async fn test_response_discovers_once() {
        let (discovery, _) = discovery();
        let mut events = discovery.subscribe();

        let first = discovery.handle_response(&remote_announcement(120));
        assert_eq!(first.len(), 1);
        let service = &first[0];
        assert_eq!(service.service_name, "printer");
        assert_eq!(service.service_type, ServiceType::Other("ipp".into()));
        assert_eq!(service.port, 631);
        assert_eq!(service.metadata["pages"], json!(12));
        assert_eq!(service.addresses, vec![IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9))]);

        assert!(discovery.handle_response(&remote_announcement(120)).is_empty());
        assert_eq!(discovery.discovered_services().len(), 1);

        assert!(matches!(events.try_recv(), Ok(DiscoveryEvent::ServiceDiscovered(_))));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_goodbye_removes_service() {
        let (discovery, _) = discovery();
        discovery.handle_response(&remote_announcement(120));
        let mut events = discovery.subscribe();

        discovery.handle_response(&remote_announcement(0));
        assert!(discovery.discovered_services().is_empty());
        assert!(matches!(events.try_recv(), Ok(DiscoveryEvent::ServiceLost(name)) if name == "printer._ipp._tcp.local"));
    }

    #[tokio::test]
    async fn test_own_announcements_ignored() {
        let (discovery, sender) = discovery();
        discovery.register_service(web_service()).await;
        let (own, _) = sender.sent().remove(0);

        assert!(discovery.handle_response(&own).is_empty());
        assert!(discovery.discovered_services().is_empty());
    }

    #[tokio::test]
    async fn test_unregister_sends_goodbye() {
        let (discovery, sender) = discovery();
        discovery.register_service(web_service()).await;

        assert!(discovery.unregister_service("web").await);
        assert!(!discovery.unregister_service("web").await);
        assert!(discovery.local_services().is_empty());

        let sent = sender.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[1].0.answers.iter().all(|a| a.ttl == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebroadcast_until_removed() {
        let (discovery, sender) = discovery();
        discovery.register_service(web_service()).await;

        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(sender.sent().len(), 3);

        discovery.unregister_service("web").await;
        tokio::time::sleep(Duration::from_secs(300)).await;
        // initial + two rebroadcasts + goodbye
        assert_eq!(sender.sent().len(), 4);
    }

    #[tokio::test]
    async fn test_resolve_local_from_seen_answers() {
        let (discovery, sender) = discovery();
        discovery.handle_response(&remote_announcement(120));

        let addr = discovery
            .resolve_local("printer.local", Duration::from_millis(10))
            .await;
        assert_eq!(addr, Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 9))));
        assert!(sender.sent().is_empty());

        let missing = discovery
            .resolve_local("nobody.local", Duration::from_millis(10))
            .await;
        assert!(missing.is_none());
        assert_eq!(sender.sent()[0].0.questions[0].name, "nobody.local");
    }

    #[test]
    fn test_parse_instance_name() {
        assert_eq!(
            parse_instance_name("web._http._tcp.local."),
            Some(("web".to_string(), ServiceType::Http, "tcp".to_string()))
        );
        assert!(parse_instance_name("_http._tcp.local").is_none());
        assert!(parse_instance_name("web.http.tcp.local").is_none());
        assert!(parse_instance_name("web._http._tcp.example").is_none());
    }

    #[test]
    fn test_browse_question() {
        let q = browse_question(&ServiceType::Ssh, "tcp");
        assert_eq!(q.name, "_ssh._tcp.local");
        assert_eq!(q.record_type, RecordType::Ptr);
    }

    #[tokio::test]
    async fn test_browse_sends_multicast_ptr_query() {
        let (discovery, sender) = discovery();
        discovery.browse(&ServiceType::Http, "tcp").await;

        let sent = sender.sent();
        assert_eq!(sent.len(), 1);
        let (packet, destination) = &sent[0];
        assert_eq!(packet.kind, PacketKind::Query);
        assert!(destination.is_none());
        assert_eq!(packet.questions.len(), 1);
        assert_eq!(packet.questions[0].name, "_http._tcp.local");
        assert_eq!(packet.questions[0].record_type, RecordType::Ptr);
    }
}
