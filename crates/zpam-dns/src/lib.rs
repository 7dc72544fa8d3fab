//! ZPAM DNS resolver cache
//!
//! TTL-bounded caching with single-flight coalescing for the record types the
//! authentication validator needs: TXT, A, MX and PTR, plus derived SPF and
//! DMARC accessors. Misses resolve through a bounded worker pool; a full
//! queue falls back to a directly spawned task so requests are never dropped.

use std::time::{Instant, SystemTime};

pub mod cache;
pub mod resolver;
mod workers;

pub use cache::{DnsCache, DnsCacheConfig};
pub use resolver::{HickoryDnsResolver, Resolver, StaticResolver};

use thiserror::Error;

/// Why a lookup failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// The domain does not exist or has no records of the requested type
    #[error("domain not found")]
    NxDomain,
    /// The query exceeded its deadline
    #[error("dns query timed out")]
    Timeout,
    /// Any other resolution failure
    #[error("dns failure: {0}")]
    Other(String),
}

/// Record types served by the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    Txt,
    A,
    Mx,
    Ptr,
}

impl RecordType {
    /// Cache namespace tag
    pub fn tag(&self) -> &'static str {
        match self {
            RecordType::Txt => "txt",
            RecordType::A => "a",
            RecordType::Mx => "mx",
            RecordType::Ptr => "ptr",
        }
    }
}

/// Typed lookup result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsValue {
    Txt(Vec<String>),
    A(Vec<std::net::Ipv4Addr>),
    Mx(Vec<MxRecord>),
    Ptr(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MxRecord {
    pub preference: u16,
    pub exchange: String,
}

/// One cached record with its lifetime bounds
#[derive(Debug, Clone)]
pub struct DnsEntry {
    pub value: DnsValue,
    pub created: Instant,
    pub expires: Instant,
}

impl DnsEntry {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires
    }
}

/// Cache counters, mutated under the same lock as the cache map
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub evictions: u64,
    pub entries: usize,
    pub last_cleanup: Option<SystemTime>,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

pub(crate) fn normalize_key(key: &str) -> String {
    key.trim().trim_end_matches('.').to_lowercase()
}
