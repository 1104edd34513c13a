use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use shared::protocol::{MDNS_GROUP_V4, MDNS_PORT};
use crate::mdns::interfaces;
use crate::mdns::wire::{self, Packet, PacketKind, Question, Record, RecordType};

const RECV_BUFFER_SIZE: usize = 9_000;
const MULTICAST_TTL: u32 = 255;

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub group: Ipv4Addr,
    pub port: u16,
    pub membership_refresh: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            group: Ipv4Addr::from(MDNS_GROUP_V4),
            port: MDNS_PORT,
            membership_refresh: Duration::from_secs(5),
        }
    }
}

/// Decoded packets coming off the socket
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Query { packet: Packet, from: SocketAddr },
    Response { packet: Packet, from: SocketAddr },
}

/// Outbound side of an mDNS transport.
#[async_trait]
pub trait PacketSender: Send + Sync {
    /// Send to `destination`, or to the multicast group when `None`.
    async fn send(&self, packet: &Packet, destination: Option<SocketAddr>) -> Result<()>;

    async fn query(&self, name: &str, record_type: RecordType) -> Result<()> {
        self.send(&Packet::query(vec![Question::new(name, record_type)]), None)
            .await
    }

    async fn respond(&self, answers: Vec<Record>, destination: Option<SocketAddr>) -> Result<()> {
        self.send(&Packet::response(answers), destination).await
    }
}

/// UDP multicast socket joined to the mDNS group on every LAN interface.
pub struct MulticastTransport {
    socket: Arc<UdpSocket>,
    group: SocketAddrV4,
    memberships: Arc<Mutex<HashSet<Ipv4Addr>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl MulticastTransport {
    /// Bind the socket and start the receive and membership loops. Decoded
    /// packets are delivered on the returned channel.
    pub async fn bind(
        config: &TransportConfig,
    ) -> Result<(Arc<Self>, flume::Receiver<TransportEvent>)> {
        let socket = bind_reusable(config.port)
            .with_context(|| format!("Failed to bind mDNS socket on port {}", config.port))?;
        socket
            .set_multicast_loop_v4(true)
            .context("Failed to enable multicast loopback")?;
        socket
            .set_multicast_ttl_v4(MULTICAST_TTL)
            .context("Failed to set multicast TTL")?;

        let transport = Arc::new(Self {
            socket: Arc::new(socket),
            group: SocketAddrV4::new(config.group, config.port),
            memberships: Arc::new(Mutex::new(HashSet::new())),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let (tx, rx) = flume::bounded(256);
        tokio::spawn(recv_loop(
            transport.socket.clone(),
            tx,
            transport.cancel.clone(),
        ));

        transport.refresh_memberships();
        let weak = Arc::downgrade(&transport);
        let cancel = transport.cancel.clone();
        let period = config.membership_refresh;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match weak.upgrade() {
                            Some(transport) => transport.refresh_memberships(),
                            None => break,
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });

        tracing::info!("mDNS transport listening on {}", transport.local_addr()?);
        Ok((transport, rx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("Failed to read mDNS socket address")
    }

    /// Interfaces currently joined to the group
    pub fn memberships(&self) -> Vec<Ipv4Addr> {
        lock(&self.memberships).iter().copied().collect()
    }

    /// Join the group on new interfaces and leave it on vanished ones.
    pub fn refresh_memberships(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let wanted: HashSet<Ipv4Addr> = interfaces::lan_ipv4_interfaces()
            .into_iter()
            .map(|iface| iface.ip)
            .collect();

        let mut current = lock(&self.memberships);
        let (join, leave) = plan_membership(&current, &wanted);

        for iface in leave {
            if let Err(e) = self.socket.leave_multicast_v4(*self.group.ip(), iface) {
                tracing::debug!("Failed to leave mDNS group on {}: {}", iface, e);
            }
            current.remove(&iface);
        }
        for iface in join {
            match self.socket.join_multicast_v4(*self.group.ip(), iface) {
                Ok(()) => {
                    tracing::debug!("Joined mDNS group on {}", iface);
                    current.insert(iface);
                }
                Err(e) => tracing::debug!("Failed to join mDNS group on {}: {}", iface, e),
            }
        }
    }

    /// Leave every group membership and stop the background loops. Safe to
    /// call more than once.
    pub fn destroy(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut current = lock(&self.memberships);
        for iface in current.drain() {
            if let Err(e) = self.socket.leave_multicast_v4(*self.group.ip(), iface) {
                tracing::debug!("Failed to leave mDNS group on {}: {}", iface, e);
            }
        }
        self.cancel.cancel();
        tracing::info!("mDNS transport closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PacketSender for MulticastTransport {
    async fn send(&self, packet: &Packet, destination: Option<SocketAddr>) -> Result<()> {
        if self.is_closed() {
            bail!("mDNS transport is closed");
        }
        let bytes = wire::encode(packet).context("Failed to encode mDNS packet")?;
        let target = destination.unwrap_or(SocketAddr::V4(self.group));
        self.socket
            .send_to(&bytes, target)
            .await
            .with_context(|| format!("Failed to send mDNS packet to {}", target))?;
        Ok(())
    }
}

impl Drop for MulticastTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn bind_reusable(port: u16) -> std::io::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::IPV4,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Interfaces to join and to leave to move from `current` to `wanted`.
fn plan_membership(
    current: &HashSet<Ipv4Addr>,
    wanted: &HashSet<Ipv4Addr>,
) -> (Vec<Ipv4Addr>, Vec<Ipv4Addr>) {
    let join = wanted.difference(current).copied().collect();
    let leave = current.difference(wanted).copied().collect();
    (join, leave)
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    tx: flume::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                let (len, from) = match result {
                    Ok(received) => received,
                    Err(e) => {
                        tracing::debug!("mDNS receive error: {}", e);
                        continue;
                    }
                };
                let packet = match wire::decode(&buf[..len]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        tracing::warn!("Dropping malformed mDNS packet from {}: {}", from, e);
                        continue;
                    }
                };
                let event = match packet.kind {
                    PacketKind::Query => TransportEvent::Query { packet, from },
                    PacketKind::Response => TransportEvent::Response { packet, from },
                };
                if tx.send_async(event).await.is_err() {
                    tracing::debug!("mDNS event receiver dropped");
                    break;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdns::wire::RecordData;

    fn test_config() -> TransportConfig {
        TransportConfig {
            port: 0,
            ..TransportConfig::default()
        }
    }

    #[test]
    fn test_plan_membership() {
        let a = Ipv4Addr::new(192, 168, 1, 2);
        let b = Ipv4Addr::new(10, 0, 0, 2);
        let c = Ipv4Addr::new(172, 16, 0, 2);

        let current = HashSet::from([a, b]);
        let wanted = HashSet::from([b, c]);
        let (join, leave) = plan_membership(&current, &wanted);

        assert_eq!(join, vec![c]);
        assert_eq!(leave, vec![a]);
    }

    #[tokio::test]
    async fn test_unicast_packet_becomes_event() {
        let (transport, rx) = MulticastTransport::bind(&test_config()).await.unwrap();
        let port = transport.local_addr().unwrap().port();
        let dest = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        transport
            .respond(
                vec![Record::new("gw.local", 300, RecordData::A(Ipv4Addr::new(10, 0, 0, 1)))],
                Some(dest),
            )
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        match event {
            TransportEvent::Response { packet, .. } => {
                assert!(packet.authoritative);
                assert_eq!(packet.answers[0].name, "gw.local");
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_packet_is_dropped() {
        let (transport, rx) = MulticastTransport::bind(&test_config()).await.unwrap();
        let port = transport.local_addr().unwrap().port();
        let dest = SocketAddr::from((Ipv4Addr::LOCALHOST, port));

        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        probe.send_to(&[1, 2, 3], dest).await.unwrap();
        transport
            .send(&Packet::query(vec![Question::new("gw.local", RecordType::A)]), Some(dest))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv_async())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, TransportEvent::Query { .. }));
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (transport, _rx) = MulticastTransport::bind(&test_config()).await.unwrap();
        transport.destroy();
        transport.destroy();

        assert!(transport.is_closed());
        assert!(transport.memberships().is_empty());
        assert!(transport.query("gw.local", RecordType::A).await.is_err());
    }
}
