//! TTL cache with single-flight coalescing
//!
//! One namespace per record type, keyed `<type>:<domain-or-ip>`. Entries
//! expire at creation + configured TTL regardless of authoritative TTLs.
//! While a miss for key K is in flight, concurrent requesters for K wait on
//! the same pending slot; exactly one upstream resolution executes.

use crate::resolver::Resolver;
use crate::workers::WorkerPool;
use crate::{normalize_key, CacheStats, DnsEntry, DnsError, DnsValue, MxRecord, RecordType};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{oneshot, watch};

#[derive(Debug, Clone)]
pub struct DnsCacheConfig {
    /// Whether the cache (and its cleanup task) is active at all
    pub enabled: bool,
    /// Entry lifetime, independent of authoritative TTLs
    pub ttl: Duration,
    /// Entry cap; the oldest entry by creation time is evicted on insert
    pub max_entries: usize,
    /// Expired-entry sweep interval
    pub cleanup_interval: Duration,
    /// Per-query upstream timeout
    pub timeout: Duration,
    /// Lookup worker count; queue size is twice this
    pub workers: usize,
}

impl Default for DnsCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(1800),
            max_entries: 1000,
            cleanup_interval: Duration::from_secs(120),
            timeout: Duration::from_secs(5),
            workers: 10,
        }
    }
}

struct CacheInner {
    entries: HashMap<String, DnsEntry>,
    pending: HashMap<String, Vec<oneshot::Sender<Result<DnsValue, DnsError>>>>,
    stats: CacheStats,
}

/// Process-wide caching resolver front-end
pub struct DnsCache {
    resolver: Arc<dyn Resolver>,
    config: DnsCacheConfig,
    inner: Mutex<CacheInner>,
    workers: WorkerPool,
    shutdown: watch::Sender<bool>,
}

impl DnsCache {
    pub fn new(resolver: Arc<dyn Resolver>, config: DnsCacheConfig) -> Arc<Self> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let cache = Arc::new(Self {
            resolver,
            workers: WorkerPool::new(config.workers),
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                pending: HashMap::new(),
                stats: CacheStats::default(),
            }),
            shutdown,
        });

        if cache.config.enabled {
            Self::spawn_cleanup(Arc::downgrade(&cache), shutdown_rx);
        }
        cache
    }

    fn spawn_cleanup(cache: Weak<Self>, mut shutdown: watch::Receiver<bool>) {
        let interval = match cache.upgrade() {
            Some(cache) => cache.config.cleanup_interval,
            None => return,
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                match cache.upgrade() {
                    Some(cache) => cache.cleanup_expired(),
                    None => break,
                }
            }
        });
    }

    /// Stop the background cleanup task
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Remove every expired entry and stamp the sweep time
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        inner.stats.entries = inner.entries.len();
        inner.stats.last_cleanup = Some(SystemTime::now());
    }

    /// Snapshot of the cache counters
    pub fn stats(&self) -> CacheStats {
        let mut inner = self.inner.lock();
        inner.stats.entries = inner.entries.len();
        inner.stats.clone()
    }

    pub fn hit_rate(&self) -> f64 {
        self.stats().hit_rate()
    }

    /// Core lookup: cache hit, single-flight join, or flight leadership.
    pub async fn lookup(&self, record: RecordType, key: &str) -> Result<DnsValue, DnsError> {
        let key = normalize_key(key);
        if key.is_empty() {
            return Err(DnsError::NxDomain);
        }
        if !self.config.enabled {
            return self.resolve_upstream(record, key).await;
        }

        let cache_key = format!("{}:{}", record.tag(), key);
        let waiter = {
            let mut inner = self.inner.lock();
            if let Some(entry) = inner.entries.get(&cache_key) {
                if !entry.is_expired(Instant::now()) {
                    let value = entry.value.clone();
                    inner.stats.hits += 1;
                    return Ok(value);
                }
                inner.entries.remove(&cache_key);
            }
            inner.stats.misses += 1;
            match inner.pending.get_mut(&cache_key) {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    Some(rx)
                }
                None => {
                    inner.pending.insert(cache_key.clone(), Vec::new());
                    None
                }
            }
        };

        if let Some(rx) = waiter {
            return rx
                .await
                .unwrap_or_else(|_| Err(DnsError::Other("resolution abandoned".into())));
        }

        // Flight leader: resolve upstream, publish, then wake the waiters.
        let result = self.resolve_upstream(record, key).await;
        let waiters = {
            let mut inner = self.inner.lock();
            match &result {
                Ok(value) => {
                    Self::insert_entry(
                        &mut inner,
                        cache_key.clone(),
                        value.clone(),
                        self.config.ttl,
                        self.config.max_entries,
                    );
                }
                Err(_) => {
                    // Errors are not cached; the next request retries.
                    inner.stats.errors += 1;
                }
            }
            inner.pending.remove(&cache_key).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }

    fn insert_entry(
        inner: &mut CacheInner,
        key: String,
        value: DnsValue,
        ttl: Duration,
        max_entries: usize,
    ) {
        while inner.entries.len() >= max_entries.max(1) {
            let oldest = inner
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.created)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                    inner.stats.evictions += 1;
                }
                None => break,
            }
        }
        let now = Instant::now();
        inner.entries.insert(
            key,
            DnsEntry {
                value,
                created: now,
                expires: now + ttl,
            },
        );
        inner.stats.entries = inner.entries.len();
    }

    async fn resolve_upstream(
        &self,
        record: RecordType,
        key: String,
    ) -> Result<DnsValue, DnsError> {
        let (tx, rx) = oneshot::channel();
        let resolver = Arc::clone(&self.resolver);
        let timeout = self.config.timeout;
        self.workers.submit(Box::pin(async move {
            let result = match tokio::time::timeout(timeout, resolver.resolve(record, &key)).await
            {
                Ok(result) => result,
                Err(_) => Err(DnsError::Timeout),
            };
            let _ = tx.send(result);
        }));
        rx.await
            .unwrap_or_else(|_| Err(DnsError::Other("lookup worker dropped".into())))
    }

    // -------------------------------------------------------------------------
    // Typed accessors
    // -------------------------------------------------------------------------

    pub async fn lookup_txt(&self, domain: &str) -> Result<Vec<String>, DnsError> {
        match self.lookup(RecordType::Txt, domain).await? {
            DnsValue::Txt(records) => Ok(records),
            _ => Err(DnsError::Other("record type mismatch".into())),
        }
    }

    pub async fn lookup_a(&self, domain: &str) -> Result<Vec<std::net::Ipv4Addr>, DnsError> {
        match self.lookup(RecordType::A, domain).await? {
            DnsValue::A(addrs) => Ok(addrs),
            _ => Err(DnsError::Other("record type mismatch".into())),
        }
    }

    pub async fn lookup_mx(&self, domain: &str) -> Result<Vec<MxRecord>, DnsError> {
        match self.lookup(RecordType::Mx, domain).await? {
            DnsValue::Mx(records) => Ok(records),
            _ => Err(DnsError::Other("record type mismatch".into())),
        }
    }

    pub async fn lookup_ptr(&self, ip: IpAddr) -> Result<Vec<String>, DnsError> {
        match self.lookup(RecordType::Ptr, &ip.to_string()).await? {
            DnsValue::Ptr(names) => Ok(names),
            _ => Err(DnsError::Other("record type mismatch".into())),
        }
    }

    /// First TXT record starting `v=spf1`.
    ///
    /// A domain that resolves but publishes no SPF record reports
    /// `Ok(None)`; the underlying TXT answer stays cached, so repeating the
    /// question carries no retry penalty.
    pub async fn spf_record(&self, domain: &str) -> Result<Option<String>, DnsError> {
        match self.lookup_txt(domain).await {
            Ok(records) => Ok(records
                .into_iter()
                .find(|r| r.starts_with("v=spf1 ") || r.trim_end() == "v=spf1")),
            Err(DnsError::NxDomain) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// TXT record at `_dmarc.<domain>` starting `v=DMARC1`.
    pub async fn dmarc_record(&self, domain: &str) -> Result<Option<String>, DnsError> {
        match self.lookup_txt(&format!("_dmarc.{}", domain)).await {
            Ok(records) => Ok(records.into_iter().find(|r| r.starts_with("v=DMARC1"))),
            Err(DnsError::NxDomain) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::StaticResolver;
    use std::net::Ipv4Addr;

    fn test_config() -> DnsCacheConfig {
        DnsCacheConfig {
            cleanup_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_hit_after_miss() {
        let resolver = Arc::new(StaticResolver::new().a("mail.example.com", &[Ipv4Addr::new(10, 0, 0, 1)]));
        let cache = DnsCache::new(resolver.clone(), test_config());

        let first = cache.lookup_a("mail.example.com").await.unwrap();
        let second = cache.lookup_a("mail.example.com").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(resolver.lookup_count(), 1);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_concurrent_misses() {
        let resolver = Arc::new(
            StaticResolver::new()
                .with_delay(Duration::from_millis(50))
                .txt("example.com", &["v=spf1 -all"]),
        );
        let cache = DnsCache::new(resolver.clone(), test_config());

        let mut handles = Vec::new();
        for _ in 0..20 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.lookup_txt("example.com").await
            }));
        }
        for handle in handles {
            assert_eq!(
                handle.await.unwrap().unwrap(),
                vec!["v=spf1 -all".to_string()]
            );
        }
        assert_eq!(resolver.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let resolver = Arc::new(StaticResolver::new().txt("example.com", &["hello"]));
        let config = DnsCacheConfig {
            ttl: Duration::ZERO,
            ..test_config()
        };
        let cache = DnsCache::new(resolver.clone(), config);

        cache.lookup_txt("example.com").await.unwrap();
        cache.lookup_txt("example.com").await.unwrap();
        assert_eq!(resolver.lookup_count(), 2);
        assert_eq!(cache.stats().hits, 0);
    }

    #[tokio::test]
    async fn test_capacity_eviction_drops_oldest() {
        let resolver = Arc::new(
            StaticResolver::new()
                .txt("one.test", &["1"])
                .txt("two.test", &["2"])
                .txt("three.test", &["3"])
                .txt("four.test", &["4"]),
        );
        let config = DnsCacheConfig {
            max_entries: 3,
            ..test_config()
        };
        let cache = DnsCache::new(resolver.clone(), config);

        for domain in ["one.test", "two.test", "three.test", "four.test"] {
            cache.lookup_txt(domain).await.unwrap();
        }

        let stats = cache.stats();
        assert_eq!(stats.entries, 3);
        assert_eq!(stats.evictions, 1);

        // The oldest entry (one.test) is gone; looking it up resolves again.
        let before = resolver.lookup_count();
        cache.lookup_txt("one.test").await.unwrap();
        assert_eq!(resolver.lookup_count(), before + 1);
    }

    #[tokio::test]
    async fn test_errors_are_not_cached() {
        let resolver = Arc::new(StaticResolver::new().failing(
            RecordType::Txt,
            "flaky.test",
            DnsError::Timeout,
        ));
        let cache = DnsCache::new(resolver.clone(), test_config());

        assert_eq!(
            cache.lookup_txt("flaky.test").await,
            Err(DnsError::Timeout)
        );
        assert_eq!(
            cache.lookup_txt("flaky.test").await,
            Err(DnsError::Timeout)
        );
        assert_eq!(resolver.lookup_count(), 2);
        assert_eq!(cache.stats().errors, 2);
    }

    #[tokio::test]
    async fn test_missing_spf_is_not_found_and_txt_stays_cached() {
        let resolver =
            Arc::new(StaticResolver::new().txt("plain.test", &["some verification token"]));
        let cache = DnsCache::new(resolver.clone(), test_config());

        assert_eq!(cache.spf_record("plain.test").await, Ok(None));
        assert_eq!(cache.spf_record("plain.test").await, Ok(None));
        // The TXT answer was cached; only one upstream resolution happened.
        assert_eq!(resolver.lookup_count(), 1);
    }

    #[tokio::test]
    async fn test_dmarc_record_found() {
        let resolver = Arc::new(
            StaticResolver::new().txt("_dmarc.example.com", &["v=DMARC1; p=reject; pct=100"]),
        );
        let cache = DnsCache::new(resolver, test_config());

        let record = cache.dmarc_record("example.com").await.unwrap();
        assert_eq!(record.as_deref(), Some("v=DMARC1; p=reject; pct=100"));
        assert_eq!(cache.dmarc_record("missing.example").await, Ok(None));
    }

    #[tokio::test]
    async fn test_cleanup_removes_expired_entries() {
        let resolver = Arc::new(StaticResolver::new().txt("short.test", &["x"]));
        let config = DnsCacheConfig {
            ttl: Duration::ZERO,
            ..test_config()
        };
        let cache = DnsCache::new(resolver, config);

        cache.lookup_txt("short.test").await.unwrap();
        cache.cleanup_expired();

        let stats = cache.stats();
        assert_eq!(stats.entries, 0);
        assert!(stats.last_cleanup.is_some());
    }
}
