//! Upstream resolver abstraction
//!
//! The cache talks to DNS through the `Resolver` trait so tests can swap the
//! real hickory resolver for a static in-memory one.

use crate::{normalize_key, DnsError, DnsValue, MxRecord, RecordType};
use async_trait::async_trait;
use hickory_resolver::error::{ResolveError, ResolveErrorKind};
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// One upstream resolution, keyed the same way the cache is keyed.
///
/// For PTR lookups `key` is the textual IP address.
#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    async fn resolve(&self, record: RecordType, key: &str) -> Result<DnsValue, DnsError>;
}

/// Production resolver backed by hickory-resolver
pub struct HickoryDnsResolver {
    inner: TokioAsyncResolver,
}

impl HickoryDnsResolver {
    /// Build from the system resolver configuration
    pub fn new() -> Result<Self, DnsError> {
        let inner = TokioAsyncResolver::tokio_from_system_conf()
            .map_err(|e| DnsError::Other(format!("resolver init: {}", e)))?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Resolver for HickoryDnsResolver {
    async fn resolve(&self, record: RecordType, key: &str) -> Result<DnsValue, DnsError> {
        match record {
            RecordType::Txt => {
                let lookup = self.inner.txt_lookup(key).await.map_err(map_resolve_error)?;
                let records = lookup
                    .iter()
                    .map(|txt| {
                        txt.txt_data()
                            .iter()
                            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
                            .collect::<String>()
                    })
                    .collect();
                Ok(DnsValue::Txt(records))
            }
            RecordType::A => {
                let lookup = self
                    .inner
                    .ipv4_lookup(key)
                    .await
                    .map_err(map_resolve_error)?;
                Ok(DnsValue::A(lookup.iter().map(|a| a.0).collect()))
            }
            RecordType::Mx => {
                let lookup = self.inner.mx_lookup(key).await.map_err(map_resolve_error)?;
                let records = lookup
                    .iter()
                    .map(|mx| MxRecord {
                        preference: mx.preference(),
                        exchange: mx.exchange().to_utf8().trim_end_matches('.').to_string(),
                    })
                    .collect();
                Ok(DnsValue::Mx(records))
            }
            RecordType::Ptr => {
                let ip: IpAddr = key
                    .parse()
                    .map_err(|_| DnsError::Other(format!("invalid ptr key: {}", key)))?;
                let lookup = self
                    .inner
                    .reverse_lookup(ip)
                    .await
                    .map_err(map_resolve_error)?;
                let names = lookup
                    .iter()
                    .map(|ptr| ptr.0.to_utf8().trim_end_matches('.').to_string())
                    .collect();
                Ok(DnsValue::Ptr(names))
            }
        }
    }
}

fn map_resolve_error(err: ResolveError) -> DnsError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => DnsError::NxDomain,
        ResolveErrorKind::Timeout => DnsError::Timeout,
        other => DnsError::Other(other.to_string()),
    }
}

/// Fixed-answer resolver for tests.
///
/// Counts upstream resolutions so single-flight behavior is observable, and
/// can delay answers to widen race windows.
#[derive(Default)]
pub struct StaticResolver {
    records: parking_lot::Mutex<HashMap<(RecordType, String), Result<DnsValue, DnsError>>>,
    delay: Duration,
    lookups: AtomicU64,
    default_error: Option<DnsError>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn txt(self, domain: &str, values: &[&str]) -> Self {
        self.put(
            RecordType::Txt,
            domain,
            Ok(DnsValue::Txt(values.iter().map(|v| v.to_string()).collect())),
        )
    }

    pub fn a(self, domain: &str, addrs: &[Ipv4Addr]) -> Self {
        self.put(RecordType::A, domain, Ok(DnsValue::A(addrs.to_vec())))
    }

    pub fn mx(self, domain: &str, hosts: &[(u16, &str)]) -> Self {
        let records = hosts
            .iter()
            .map(|(preference, exchange)| MxRecord {
                preference: *preference,
                exchange: exchange.to_string(),
            })
            .collect();
        self.put(RecordType::Mx, domain, Ok(DnsValue::Mx(records)))
    }

    pub fn ptr(self, ip: &str, names: &[&str]) -> Self {
        self.put(
            RecordType::Ptr,
            ip,
            Ok(DnsValue::Ptr(names.iter().map(|n| n.to_string()).collect())),
        )
    }

    pub fn failing(self, record: RecordType, key: &str, err: DnsError) -> Self {
        self.put(record, key, Err(err))
    }

    /// Every lookup without an explicit answer fails with `err`, which
    /// simulates a full resolver outage.
    pub fn failing_by_default(mut self, err: DnsError) -> Self {
        self.default_error = Some(err);
        self
    }

    fn put(self, record: RecordType, key: &str, value: Result<DnsValue, DnsError>) -> Self {
        self.records
            .lock()
            .insert((record, normalize_key(key)), value);
        self
    }

    /// Upstream resolutions performed so far
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, record: RecordType, key: &str) -> Result<DnsValue, DnsError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.records
            .lock()
            .get(&(record, normalize_key(key)))
            .cloned()
            .unwrap_or_else(|| Err(self.default_error.clone().unwrap_or(DnsError::NxDomain)))
    }
}
