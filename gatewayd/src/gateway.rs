//! Assembles the gateway from its configuration and owns its lifetime.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use shared::types::{ServiceRecord, ServiceType};
use crate::api::routes::{self, AppState};
use crate::config::{Config, StoreBackend};
use crate::lookup_cache::{AddressResolver, LocalFirstResolver, LookupCache, SystemResolver};
use crate::mdns::advertise::{self, LocalNames};
use crate::mdns::discovery::{DiscoveryConfig, ServiceDiscovery};
use crate::mdns::transport::{MulticastTransport, PacketSender, TransportConfig};
use crate::store::{MemoryStore, RecordStore, SqliteStore};
use crate::{proxy, server};

const LOCAL_RESOLVE_TIMEOUT: Duration = Duration::from_secs(2);

struct MdnsRuntime {
    transport: Arc<MulticastTransport>,
    discovery: ServiceDiscovery,
    advertisement: Option<ServiceRecord>,
}

/// A running gateway. Dropping it leaves background tasks running; call
/// [`GatewayHandle::shutdown`] to stop them.
pub struct GatewayHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    server: JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
    mdns: Option<MdnsRuntime>,
    sqlite: Option<SqliteStore>,
}

/// Open the store, start mDNS, bind the API listener and begin serving.
pub async fn start(config: Config) -> Result<GatewayHandle> {
    let cancel = CancellationToken::new();
    let mut tasks = Vec::new();

    let (store, sqlite): (Arc<dyn RecordStore>, Option<SqliteStore>) = match config.store.backend {
        StoreBackend::Memory => (Arc::new(MemoryStore::new()), None),
        StoreBackend::Sqlite => {
            let sqlite = SqliteStore::open(&config.store.db_path)?;
            tracing::info!("Opened record store at {:?}", config.store.db_path);
            (Arc::new(sqlite.clone()), Some(sqlite))
        }
    };

    let tls = match (&config.api.tls_cert, &config.api.tls_key) {
        (Some(cert), Some(key)) => Some(server::load_tls(cert, key)?),
        _ => None,
    };

    let listener = TcpListener::bind(&config.api.listen)
        .await
        .with_context(|| format!("Failed to bind to {}", config.api.listen))?;
    let local_addr = listener
        .local_addr()
        .context("Failed to read listener address")?;

    let mdns = if config.mdns.enabled {
        match start_mdns(&config, local_addr.port(), &cancel, &mut tasks).await {
            Ok(runtime) => Some(runtime),
            Err(e) => {
                tracing::warn!("mDNS disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let resolver: Arc<dyn AddressResolver> = match &mdns {
        Some(runtime) => Arc::new(LocalFirstResolver::new(
            runtime.discovery.clone(),
            LOCAL_RESOLVE_TIMEOUT,
        )),
        None => Arc::new(SystemResolver),
    };
    let cache = LookupCache::new(
        resolver,
        &config.gateway.hostname,
        &config.gateway.sep,
        config.cache.clone(),
    );
    tasks.push(tokio::spawn(cache.clone().run_cleanup(cancel.clone())));

    let app = routes::router(AppState {
        store,
        cache,
        gateway: Arc::new(config.gateway.clone()),
        port: local_addr.port(),
        proxy: proxy::client(),
    });

    tracing::info!(
        "Gateway {} listening on {}{}",
        config.gateway.hostname,
        local_addr,
        if tls.is_some() { " (tls)" } else { "" }
    );

    let server_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = server::serve(listener, app, tls, server_cancel).await {
            tracing::error!("Server error: {:#}", e);
        }
    });

    Ok(GatewayHandle {
        local_addr,
        cancel,
        server,
        tasks,
        mdns,
        sqlite,
    })
}

async fn start_mdns(
    config: &Config,
    api_port: u16,
    cancel: &CancellationToken,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Result<MdnsRuntime> {
    let (transport, events) = MulticastTransport::bind(&TransportConfig {
        membership_refresh: Duration::from_secs(config.mdns.membership_refresh_secs),
        ..TransportConfig::default()
    })
    .await?;

    let sender: Arc<dyn PacketSender> = transport.clone();
    let discovery = ServiceDiscovery::new(
        sender,
        LocalNames::new(&config.gateway.hostname, &config.gateway.sep),
        DiscoveryConfig {
            rebroadcast_interval: Duration::from_secs(config.mdns.rebroadcast_secs),
            health_interval: Duration::from_secs(config.mdns.health_interval_secs),
            health_timeout: Duration::from_millis(config.mdns.health_timeout_ms),
        },
    );

    let run_discovery = discovery.clone();
    let run_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = run_discovery.run(events, run_cancel).await {
            tracing::error!("mDNS discovery error: {}", e);
        }
    }));

    let advertisement = if config.mdns.advertise {
        match advertise::register_gateway(&discovery, &config.gateway.hostname, api_port).await {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!("Failed to advertise gateway: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    // Pick up peers announced before this gateway started
    discovery.browse(&ServiceType::Http, "tcp").await;

    Ok(MdnsRuntime {
        transport,
        discovery,
        advertisement,
    })
}

impl GatewayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn discovery(&self) -> Option<&ServiceDiscovery> {
        self.mdns.as_ref().map(|runtime| &runtime.discovery)
    }

    /// Withdraw the mDNS advertisement, stop serving and wait for background
    /// tasks to finish.
    pub async fn shutdown(self) -> Result<()> {
        if let Some(runtime) = &self.mdns {
            if let Some(record) = &runtime.advertisement {
                advertise::unregister_gateway(&runtime.discovery, record).await;
            }
        }

        self.cancel.cancel();
        let _ = self.server.await;
        for task in self.tasks {
            let _ = task.await;
        }

        if let Some(runtime) = self.mdns {
            runtime.discovery.shutdown();
            runtime.transport.destroy();
        }

        if let Some(sqlite) = self.sqlite {
            sqlite.shutdown().await?;
        }

        tracing::info!("Gateway stopped");
        Ok(())
    }
}
