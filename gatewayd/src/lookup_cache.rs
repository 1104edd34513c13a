//! Hostname to address cache used when forwarding to peers.
//!
//! At most one resolution runs per hostname; concurrent callers share it.
//! Entries with a finite lifetime carry a refresh timer that re-resolves the
//! address at expiry only if someone read it since the last refresh, and
//! drops it otherwise. Invalidating a hostname bumps its generation; lookups
//! started under an older generation finish without touching the cache.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use shared::types::LookupResult;
use crate::config::CacheConfig;
use crate::mdns::discovery::ServiceDiscovery;

/// Turns a hostname into an address.
#[async_trait]
pub trait AddressResolver: Send + Sync {
    async fn lookup(&self, host: &str) -> anyhow::Result<IpAddr>;
}

/// Resolver backed by the operating system
pub struct SystemResolver;

#[async_trait]
impl AddressResolver for SystemResolver {
    async fn lookup(&self, host: &str) -> anyhow::Result<IpAddr> {
        let mut addrs = tokio::net::lookup_host((host, 0))
            .await
            .with_context(|| format!("Failed to resolve {}", host))?;
        addrs
            .next()
            .map(|addr| addr.ip())
            .ok_or_else(|| anyhow!("No addresses for {}", host))
    }
}

/// Asks the LAN over mDNS for `*.local` names before falling back to the
/// system resolver.
pub struct LocalFirstResolver {
    discovery: ServiceDiscovery,
    timeout: Duration,
}

impl LocalFirstResolver {
    pub fn new(discovery: ServiceDiscovery, timeout: Duration) -> Self {
        Self { discovery, timeout }
    }
}

#[async_trait]
impl AddressResolver for LocalFirstResolver {
    async fn lookup(&self, host: &str) -> anyhow::Result<IpAddr> {
        if host.ends_with(".local") {
            if let Some(addr) = self.discovery.resolve_local(host, self.timeout).await {
                return Ok(addr);
            }
            tracing::debug!("No mDNS answer for {}, trying system resolver", host);
        }
        SystemResolver.lookup(host).await
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("Failed to resolve {host}: {message}")]
pub struct LookupError {
    pub host: String,
    pub message: String,
}

type PendingLookup = Shared<BoxFuture<'static, Result<LookupResult, LookupError>>>;

struct Entry {
    result: LookupResult,
    lookup_hostname: String,
    read_since_refresh: bool,
    seq: u64,
    refresh: Option<AbortHandle>,
}

impl Drop for Entry {
    fn drop(&mut self) {
        if let Some(refresh) = self.refresh.take() {
            refresh.abort();
        }
    }
}

struct Inner {
    resolver: Arc<dyn AddressResolver>,
    gateway_hostname: String,
    peer_suffix: String,
    config: CacheConfig,
    // Lock order: pending, then generations, then entries
    entries: Mutex<HashMap<String, Entry>>,
    pending: Mutex<HashMap<String, PendingLookup>>,
    generations: Mutex<HashMap<String, u64>>,
    next_seq: AtomicU64,
}

impl Inner {
    fn generation(generations: &HashMap<String, u64>, hostname: &str) -> u64 {
        generations.get(hostname).copied().unwrap_or(0)
    }
}

#[derive(Clone)]
pub struct LookupCache {
    inner: Arc<Inner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl LookupCache {
    pub fn new(
        resolver: Arc<dyn AddressResolver>,
        gateway_hostname: &str,
        sep: &str,
        config: CacheConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver,
                gateway_hostname: gateway_hostname.to_ascii_lowercase(),
                peer_suffix: format!("{sep}{gateway_hostname}").to_ascii_lowercase(),
                config,
                entries: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                generations: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Address for `hostname`, resolving `lookup_hostname` on a miss.
    pub async fn resolve(
        &self,
        hostname: &str,
        lookup_hostname: &str,
    ) -> Result<LookupResult, LookupError> {
        let pending = {
            let mut pending = lock(&self.inner.pending);
            if let Some(entry) = lock(&self.inner.entries).get_mut(hostname) {
                entry.read_since_refresh = true;
                return Ok(entry.result.clone());
            }
            match pending.get(hostname) {
                Some(shared) => shared.clone(),
                None => {
                    let generation =
                        Inner::generation(&lock(&self.inner.generations), hostname);
                    let shared = self
                        .clone()
                        .resolve_and_store(
                            hostname.to_string(),
                            lookup_hostname.to_string(),
                            generation,
                        )
                        .boxed()
                        .shared();
                    pending.insert(hostname.to_string(), shared.clone());
                    shared
                }
            }
        };
        pending.await
    }

    async fn resolve_and_store(
        self,
        hostname: String,
        lookup_hostname: String,
        generation: u64,
    ) -> Result<LookupResult, LookupError> {
        let result = self.lookup(&lookup_hostname).await;

        let mut pending = lock(&self.inner.pending);
        let generations = lock(&self.inner.generations);
        if Inner::generation(&generations, &hostname) == generation {
            if let Ok(resolved) = &result {
                self.store(&hostname, &lookup_hostname, resolved.clone());
            }
            pending.remove(&hostname);
        } else {
            tracing::debug!("Discarding lookup of {} for invalidated {}", lookup_hostname, hostname);
        }
        result
    }

    async fn lookup(&self, lookup_hostname: &str) -> Result<LookupResult, LookupError> {
        if let Ok(v4) = lookup_hostname.parse::<Ipv4Addr>() {
            return Ok(LookupResult::new(IpAddr::V4(v4), None));
        }
        if lookup_hostname == self.inner.gateway_hostname
            || lookup_hostname.ends_with(&self.inner.peer_suffix)
        {
            return Ok(LookupResult::new(IpAddr::V4(Ipv4Addr::LOCALHOST), None));
        }

        let address = self
            .inner
            .resolver
            .lookup(lookup_hostname)
            .await
            .map_err(|e| LookupError {
                host: lookup_hostname.to_string(),
                message: format!("{:#}", e),
            })?;
        let expiry = chrono::Duration::from_std(self.inner.config.refresh())
            .unwrap_or_else(|_| chrono::Duration::days(1));
        Ok(LookupResult::new(address, Some(Utc::now() + expiry)))
    }

    fn store(&self, hostname: &str, lookup_hostname: &str, result: LookupResult) {
        let refresh = result.ttl.map(|_| {
            spawn_refresh(
                Arc::downgrade(&self.inner),
                hostname.to_string(),
                Instant::now() + self.inner.config.refresh(),
            )
        });

        {
            let mut entries = lock(&self.inner.entries);
            let seq = entries
                .get(hostname)
                .map(|entry| entry.seq)
                .unwrap_or_else(|| self.inner.next_seq.fetch_add(1, Ordering::Relaxed));
            // Replacing an entry drops it, which aborts its old timer
            entries.insert(
                hostname.to_string(),
                Entry {
                    result,
                    lookup_hostname: lookup_hostname.to_string(),
                    read_since_refresh: false,
                    seq,
                    refresh,
                },
            );
        }
        self.evict_if_needed();
    }

    async fn on_expiry(&self, hostname: &str) {
        let (lookup_hostname, generation) = {
            let generations = lock(&self.inner.generations);
            let generation = Inner::generation(&generations, hostname);
            let mut entries = lock(&self.inner.entries);
            let Some(entry) = entries.get_mut(hostname) else {
                return;
            };
            if !entry.read_since_refresh {
                tracing::debug!("Dropping idle lookup for {}", hostname);
                // The running timer is this task
                entry.refresh = None;
                entries.remove(hostname);
                return;
            }
            entry.refresh = None;
            (entry.lookup_hostname.clone(), generation)
        };

        let result = self.lookup(&lookup_hostname).await;

        let generations = lock(&self.inner.generations);
        if Inner::generation(&generations, hostname) != generation {
            tracing::debug!("Discarding refresh of invalidated {}", hostname);
            return;
        }
        match result {
            Ok(result) => {
                if lock(&self.inner.entries).contains_key(hostname) {
                    tracing::debug!("Refreshed {} -> {}", hostname, result.address);
                    self.store(hostname, &lookup_hostname, result);
                }
            }
            Err(e) => {
                tracing::warn!("{}", e);
                lock(&self.inner.entries).remove(hostname);
            }
        }
    }

    /// Forget `hostname`, cancelling its refresh timer. A lookup still in
    /// flight for it is detached and its result discarded.
    pub fn invalidate(&self, hostname: &str) {
        let mut pending = lock(&self.inner.pending);
        let mut generations = lock(&self.inner.generations);
        pending.remove(hostname);
        *generations.entry(hostname.to_string()).or_default() += 1;
        lock(&self.inner.entries).remove(hostname);
    }

    /// Current entry without marking it as read
    pub fn peek(&self, hostname: &str) -> Option<LookupResult> {
        lock(&self.inner.entries)
            .get(hostname)
            .map(|entry| entry.result.clone())
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn has_refresh_timer(&self, hostname: &str) -> bool {
        lock(&self.inner.entries)
            .get(hostname)
            .is_some_and(|entry| entry.refresh.is_some())
    }

    /// Above the high-water mark, drop the oldest-inserted entries down to
    /// the low-water mark.
    pub fn evict_if_needed(&self) -> usize {
        let mut entries = lock(&self.inner.entries);
        if entries.len() <= self.inner.config.high_water {
            return 0;
        }
        let mut by_age: Vec<(u64, String)> = entries
            .iter()
            .map(|(host, entry)| (entry.seq, host.clone()))
            .collect();
        by_age.sort_unstable();

        let excess = entries.len() - self.inner.config.low_water;
        for (_, host) in by_age.into_iter().take(excess) {
            entries.remove(&host);
        }
        tracing::debug!("Evicted {} lookup entries", excess);
        excess
    }

    /// Drop entries whose address has gone stale, then apply eviction.
    pub fn cleanup(&self) {
        let now = Utc::now();
        lock(&self.inner.entries).retain(|_, entry| !entry.result.is_stale(now));
        self.evict_if_needed();
    }

    /// Run [`cleanup`](Self::cleanup) on the configured interval until
    /// cancelled.
    pub async fn run_cleanup(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.inner.config.cleanup_interval());
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => self.cleanup(),
                _ = cancel.cancelled() => break,
            }
        }
    }
}

fn spawn_refresh(inner: Weak<Inner>, hostname: String, at: Instant) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep_until(at).await;
        if let Some(inner) = inner.upgrade() {
            LookupCache { inner }.on_expiry(&hostname).await;
        }
    })
    .abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CountingResolver {
        calls: AtomicU64,
    }

    impl CountingResolver {
        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AddressResolver for CountingResolver {
        async fn lookup(&self, host: &str) -> anyhow::Result<IpAddr> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if host.starts_with("missing") {
                anyhow::bail!("NXDOMAIN");
            }
            Ok("10.1.2.3".parse().unwrap())
        }
    }

    fn cache_with(config: CacheConfig) -> (LookupCache, Arc<CountingResolver>) {
        let resolver = Arc::new(CountingResolver::default());
        let cache = LookupCache::new(resolver.clone(), "gw.local", "-", config);
        (cache, resolver)
    }

    fn cache() -> (LookupCache, Arc<CountingResolver>) {
        cache_with(CacheConfig {
            refresh_secs: 10,
            ..CacheConfig::default()
        })
    }

    #[tokio::test]
    async fn test_concurrent_resolutions_share_one_lookup() {
        let (cache, resolver) = cache();
        let (a, b) = tokio::join!(
            cache.resolve("peer-gw.local", "peer.example"),
            cache.resolve("peer-gw.local", "peer.example"),
        );
        assert_eq!(a.unwrap().address, b.unwrap().address);
        assert_eq!(resolver.calls(), 1);

        cache.resolve("peer-gw.local", "peer.example").await.unwrap();
        assert_eq!(resolver.calls(), 1);
    }

    #[tokio::test]
    async fn test_literals_and_own_names_never_refresh() {
        let (cache, resolver) = cache();

        let literal = cache.resolve("a-gw.local", "192.168.1.7").await.unwrap();
        assert_eq!(literal.address, "192.168.1.7".parse::<IpAddr>().unwrap());
        assert!(literal.ttl.is_none());
        assert!(!cache.has_refresh_timer("a-gw.local"));

        let own = cache.resolve("b-gw.local", "b-gw.local").await.unwrap();
        assert_eq!(own.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert!(own.ttl.is_none());
        assert!(!cache.has_refresh_timer("b-gw.local"));

        assert_eq!(resolver.calls(), 0);
    }

    #[tokio::test]
    async fn test_failed_lookup_not_cached() {
        let (cache, resolver) = cache();
        let err = cache.resolve("x-gw.local", "missing.example").await.unwrap_err();
        assert_eq!(err.host, "missing.example");
        assert!(cache.peek("x-gw.local").is_none());

        cache.resolve("x-gw.local", "missing.example").await.unwrap_err();
        assert_eq!(resolver.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_only_when_read() {
        let (cache, resolver) = cache();
        let first = cache.resolve("p-gw.local", "p.example").await.unwrap();
        assert!(first.ttl.is_some());
        assert!(cache.has_refresh_timer("p-gw.local"));

        // read once before expiry
        cache.resolve("p-gw.local", "p.example").await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(resolver.calls(), 2);
        assert!(cache.has_refresh_timer("p-gw.local"));

        // untouched through the next window
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(resolver.calls(), 2);
        assert!(cache.peek("p-gw.local").is_none());
    }

    #[tokio::test]
    async fn test_invalidate_cancels_timer() {
        let (cache, _) = cache();
        cache.resolve("p-gw.local", "p.example").await.unwrap();
        assert!(cache.has_refresh_timer("p-gw.local"));

        cache.invalidate("p-gw.local");
        assert!(cache.peek("p-gw.local").is_none());
        assert!(!cache.has_refresh_timer("p-gw.local"));
    }

    #[tokio::test]
    async fn test_eviction_drops_oldest() {
        let (cache, _) = cache_with(CacheConfig {
            high_water: 8,
            low_water: 6,
            ..CacheConfig::default()
        });

        for i in 0..9 {
            cache
                .resolve(&format!("h{i}-gw.local"), &format!("10.0.0.{i}"))
                .await
                .unwrap();
        }

        assert_eq!(cache.len(), 6);
        for i in 0..3 {
            assert!(cache.peek(&format!("h{i}-gw.local")).is_none());
        }
        for i in 3..9 {
            assert!(cache.peek(&format!("h{i}-gw.local")).is_some());
        }
    }

    struct SlowResolver;

    #[async_trait]
    impl AddressResolver for SlowResolver {
        async fn lookup(&self, _host: &str) -> anyhow::Result<IpAddr> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok("10.9.9.9".parse().unwrap())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_discards_inflight_lookup() {
        let cache = LookupCache::new(Arc::new(SlowResolver), "gw.local", "-", CacheConfig::default());
        let stale = tokio::spawn({
            let cache = cache.clone();
            async move { cache.resolve("p-gw.local", "old.example").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        cache.invalidate("p-gw.local");
        let fresh = cache.resolve("p-gw.local", "192.168.7.7").await.unwrap();
        assert_eq!(fresh.address, "192.168.7.7".parse::<IpAddr>().unwrap());

        // the old caller still gets its answer, but it is not cached
        let old = stale.await.unwrap().unwrap();
        assert_eq!(old.address, "10.9.9.9".parse::<IpAddr>().unwrap());
        assert_eq!(
            cache.peek("p-gw.local").unwrap().address,
            "192.168.7.7".parse::<IpAddr>().unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_discards_inflight_refresh() {
        let (cache, resolver) = cache();
        cache.resolve("p-gw.local", "p.example").await.unwrap();
        cache.resolve("p-gw.local", "p.example").await.unwrap();

        // refresh fires at 10s and is still resolving at 10.005s
        tokio::time::sleep(Duration::from_millis(10_005)).await;
        assert_eq!(resolver.calls(), 2);

        cache.invalidate("p-gw.local");
        cache.resolve("p-gw.local", "192.168.7.7").await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(
            cache.peek("p-gw.local").unwrap().address,
            "192.168.7.7".parse::<IpAddr>().unwrap()
        );
    }

    fn insert(cache: &LookupCache, hostname: &str, seq: u64, result: LookupResult) {
        lock(&cache.inner.entries).insert(
            hostname.to_string(),
            Entry {
                result,
                lookup_hostname: hostname.to_string(),
                read_since_refresh: false,
                seq,
                refresh: None,
            },
        );
    }

    #[tokio::test]
    async fn test_cleanup_at_default_marks() {
        let (cache, _) = cache_with(CacheConfig::default());
        let address: IpAddr = "10.0.0.1".parse().unwrap();
        for i in 0..900 {
            insert(&cache, &format!("h{i}-gw.local"), i, LookupResult::new(address, None));
        }
        let expired = Utc::now() - chrono::Duration::hours(1);
        insert(&cache, "old-gw.local", 900, LookupResult::new(address, Some(expired)));
        assert_eq!(cache.len(), 901);

        cache.cleanup();

        assert_eq!(cache.len(), 600);
        assert!(cache.peek("old-gw.local").is_none());
        for i in 0..300 {
            assert!(cache.peek(&format!("h{i}-gw.local")).is_none());
        }
        for i in 300..900 {
            assert!(cache.peek(&format!("h{i}-gw.local")).is_some());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_cleanup_drops_stale_entries() {
        let (cache, _) = cache_with(CacheConfig::default());
        let address: IpAddr = "10.0.0.1".parse().unwrap();
        let expired = Utc::now() - chrono::Duration::hours(1);
        insert(&cache, "old-gw.local", 0, LookupResult::new(address, Some(expired)));
        insert(&cache, "live-gw.local", 1, LookupResult::new(address, None));

        let cancel = CancellationToken::new();
        let task = tokio::spawn(cache.clone().run_cleanup(cancel.clone()));
        tokio::time::sleep(Duration::from_secs(31)).await;

        assert!(cache.peek("old-gw.local").is_none());
        assert!(cache.peek("live-gw.local").is_some());

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_peek_does_not_mark_read() {
        let (cache, _) = cache();
        cache.resolve("p-gw.local", "p.example").await.unwrap();
        cache.peek("p-gw.local");

        let entries = lock(&cache.inner.entries);
        assert!(!entries["p-gw.local"].read_since_refresh);
    }
}
