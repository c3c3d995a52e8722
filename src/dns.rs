//! DNS cache.
//!
//! Each hostname gets its own slot with its own async lock, so a slow
//! resolution only holds up callers asking for the same name. The map of
//! slots is an LRU bounded by `DNS_CACHE_SIZE` and is only locked long
//! enough to fetch or create a slot.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lru::LruCache;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};
use trust_dns_resolver::config::{LookupIpStrategy, ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::http_metrics::HttpMetrics;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DnsError {
    #[error("no addresses found for {0}")]
    NotFound(String),

    #[error("resolving {host} failed: {message}")]
    Failed { host: String, message: String },

    #[error("resolving {0} timed out")]
    Timeout(String),
}

/// Result of one resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsEntry {
    pub hostname: String,
    /// Never empty
    pub addresses: Vec<IpAddr>,
    /// Every name seen while resolving, including CNAME aliases
    pub names: Vec<String>,
    resolved_at: Instant,
}

impl DnsEntry {
    pub fn new(hostname: &str, addresses: Vec<IpAddr>, names: Vec<String>) -> Self {
        let mut all_names = vec![hostname.to_string()];
        for name in names {
            if !all_names.iter().any(|n| n.eq_ignore_ascii_case(&name)) {
                all_names.push(name);
            }
        }
        Self {
            hostname: hostname.to_string(),
            addresses,
            names: all_names,
            resolved_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.resolved_at.elapsed()
    }

    pub fn is_fresh(&self, ttl: Duration) -> bool {
        self.age() < ttl
    }

    /// True if `name` is the hostname or one of its aliases
    pub fn has_name(&self, name: &str) -> bool {
        let name = name.trim_end_matches('.');
        self.names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }
}

/// Addresses plus the names encountered on the way
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    pub addresses: Vec<IpAddr>,
    pub names: Vec<String>,
}

/// Network resolution behind the cache
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Resolved, DnsError>;
}

/// System resolver (falls back to Google DNS when no system config exists)
pub struct TrustDnsResolver {
    resolver: TokioAsyncResolver,
    timeout: Duration,
}

impl TrustDnsResolver {
    pub fn new(timeout_seconds: u64, ipv6_enabled: bool) -> Self {
        let (config, mut opts) = match trust_dns_resolver::system_conf::read_system_conf() {
            Ok(conf) => conf,
            Err(e) => {
                warn!(error = %e, "[DNS] Failed to load system DNS config, falling back to Google DNS");
                (ResolverConfig::google(), ResolverOpts::default())
            }
        };
        opts.timeout = Duration::from_secs(timeout_seconds);
        opts.attempts = 2;
        opts.ip_strategy = if ipv6_enabled {
            LookupIpStrategy::Ipv4thenIpv6
        } else {
            LookupIpStrategy::Ipv4Only
        };

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            timeout: Duration::from_secs(timeout_seconds),
        }
    }
}

#[async_trait]
impl HostResolver for TrustDnsResolver {
    async fn resolve(&self, host: &str) -> Result<Resolved, DnsError> {
        let lookup = match timeout(self.timeout, self.resolver.lookup_ip(host)).await {
            Ok(Ok(lookup)) => lookup,
            Ok(Err(e)) => {
                return Err(DnsError::Failed {
                    host: host.to_string(),
                    message: e.to_string(),
                })
            }
            Err(_) => return Err(DnsError::Timeout(host.to_string())),
        };

        let addresses: Vec<IpAddr> = lookup.iter().collect();
        let mut names = Vec::new();
        for record in lookup.as_lookup().records() {
            let name = record.name().to_utf8();
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            if !names.contains(&name) {
                names.push(name);
            }
        }
        Ok(Resolved { addresses, names })
    }
}

type Slot = RwLock<Option<Arc<DnsEntry>>>;

pub struct DnsCache {
    resolver: Arc<dyn HostResolver>,
    slots: Mutex<LruCache<String, Arc<Slot>>>,
    ttl: Duration,
    ipv6_enabled: bool,
}

impl DnsCache {
    pub fn new(
        resolver: Arc<dyn HostResolver>,
        capacity: usize,
        ttl: Duration,
        ipv6_enabled: bool,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            resolver,
            slots: Mutex::new(LruCache::new(capacity)),
            ttl,
            ipv6_enabled,
        }
    }

    /// Cache backed by the system resolver
    pub fn from_config(config: &crate::Config) -> Self {
        let resolver = TrustDnsResolver::new(config.dns_resolver_timeout_seconds, config.ipv6_enabled);
        Self::new(
            Arc::new(resolver),
            config.dns_cache_size,
            Duration::from_secs(config.dns_cache_ttl_seconds),
            config.ipv6_enabled,
        )
    }

    /// Resolve `host`, answering from the cache while the entry is fresh
    pub async fn resolve(&self, host: &str) -> Result<Arc<DnsEntry>, DnsError> {
        let host = host
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim_end_matches('.')
            .to_ascii_lowercase();

        if let Some(entry) = self.literal(&host) {
            return Ok(entry);
        }

        let slot = self.slot(&host);

        {
            let cached = slot.read().await;
            if let Some(entry) = cached.as_ref().filter(|e| e.is_fresh(self.ttl)) {
                HttpMetrics::record_dns(true);
                return Ok(entry.clone());
            }
        }

        let mut cached = slot.write().await;
        // Another caller may have refreshed it while we waited
        if let Some(entry) = cached.as_ref().filter(|e| e.is_fresh(self.ttl)) {
            HttpMetrics::record_dns(true);
            return Ok(entry.clone());
        }

        HttpMetrics::record_dns(false);
        let resolved = self.resolver.resolve(&host).await?;
        let addresses: Vec<IpAddr> = resolved
            .addresses
            .into_iter()
            .filter(|ip| self.ipv6_enabled || ip.is_ipv4())
            .collect();
        if addresses.is_empty() {
            return Err(DnsError::NotFound(host));
        }

        let entry = Arc::new(DnsEntry::new(&host, addresses, resolved.names));
        debug!(
            host = %host,
            addresses = ?entry.addresses,
            aliases = entry.names.len() - 1,
            "[DNS] Resolved"
        );
        *cached = Some(entry.clone());
        Ok(entry)
    }

    /// Cached entry without resolving, fresh or not
    pub fn cached(&self, host: &str) -> Option<Arc<DnsEntry>> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let slot = slots.peek(&host.to_ascii_lowercase())?.clone();
        drop(slots);
        let entry = slot.try_read().ok()?.clone();
        entry
    }

    /// Number of hostnames with a slot
    pub fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn slot(&self, host: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get_or_insert(host.to_string(), || Arc::new(RwLock::new(None)))
            .clone()
    }

    /// `localhost` and IP literals never touch the network
    fn literal(&self, host: &str) -> Option<Arc<DnsEntry>> {
        if host == "localhost" {
            let mut addresses = vec![IpAddr::V4(Ipv4Addr::LOCALHOST)];
            if self.ipv6_enabled {
                addresses.push(IpAddr::V6(Ipv6Addr::LOCALHOST));
            }
            return Some(Arc::new(DnsEntry::new(host, addresses, Vec::new())));
        }
        let ip: IpAddr = host.parse().ok()?;
        Some(Arc::new(DnsEntry::new(host, vec![ip], Vec::new())))
    }
}
