use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::config::CaptureConfig;

/// The sentinel returned for addresses without a usable PTR name. It is a
/// valid cached value: failed lookups are cached too, so a non-resolvable
/// address is not queried again until its entry expires.
pub const NO_DOMAIN: &str = "-";

/// How often the background sweep removes expired entries.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
struct DnsCacheEntry {
    domain: String,
    inserted_at: Instant,
    ttl: Duration,
}

impl DnsCacheEntry {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

/// Reverse-DNS resolver with a bounded TTL cache.
///
/// `resolve` is total: it never fails, returning [`NO_DOMAIN`] when
/// resolution is disabled, the address is private, or no PTR record can be
/// obtained within the configured deadline. The cache is admission-bounded:
/// once `dns_cache_size` entries are live, new results are simply not
/// cached until the sweep or an expired-entry eviction frees a slot.
pub struct DnsResolver {
    enabled: bool,
    timeout: Duration,
    cache_ttl: Duration,
    max_cache_size: usize,
    cache: DashMap<String, DnsCacheEntry>,
    cache_count: AtomicI64,
    resolvers: Vec<TokioAsyncResolver>,
}

impl DnsResolver {
    pub fn new(config: &CaptureConfig) -> Self {
        if !config.dns_enabled {
            return Self::disabled();
        }

        let resolvers = config
            .dns_servers
            .iter()
            .map(|addr| {
                let mut resolver_config = ResolverConfig::new();
                resolver_config.add_name_server(NameServerConfig::new(*addr, Protocol::Udp));
                let mut opts = ResolverOpts::default();
                opts.timeout = config.dns_timeout;
                opts.attempts = 1;
                TokioAsyncResolver::tokio(resolver_config, opts)
            })
            .collect();

        Self {
            enabled: true,
            timeout: config.dns_timeout,
            cache_ttl: config.dns_cache_ttl,
            max_cache_size: config.dns_cache_size,
            cache: DashMap::new(),
            cache_count: AtomicI64::new(0),
            resolvers,
        }
    }

    fn disabled() -> Self {
        Self {
            enabled: false,
            timeout: Duration::ZERO,
            cache_ttl: Duration::ZERO,
            max_cache_size: 0,
            cache: DashMap::new(),
            cache_count: AtomicI64::new(0),
            resolvers: Vec::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Resolve an address to a domain name, consulting the cache first.
    pub async fn resolve(&self, ip: Ipv4Addr) -> String {
        if !self.enabled {
            return NO_DOMAIN.to_string();
        }

        let key = ip.to_string();
        if let Some((domain, expired)) = self.cache_lookup(&key) {
            if !expired {
                return domain;
            }
            self.evict(&key);
        }

        // Private and link-local addresses never have a public PTR; skip
        // the network round trip and leave them uncached.
        if is_private(ip) {
            return NO_DOMAIN.to_string();
        }

        let domain = match tokio::time::timeout(self.timeout, self.lookup(ip)).await {
            Ok(domain) => domain,
            Err(_) => NO_DOMAIN.to_string(),
        };

        self.admit(key, domain.clone());
        domain
    }

    /// Query each configured server in order; the first non-empty PTR wins.
    /// Falls back to the system reverse resolver when all of them fail.
    async fn lookup(&self, ip: Ipv4Addr) -> String {
        let addr = IpAddr::V4(ip);
        for resolver in &self.resolvers {
            if let Ok(ptr) = resolver.reverse_lookup(addr).await {
                if let Some(name) = ptr.iter().next() {
                    let domain = name.to_string();
                    if !domain.is_empty() {
                        return domain;
                    }
                }
            }
        }

        tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&addr).ok())
            .await
            .ok()
            .flatten()
            .filter(|domain| !domain.is_empty())
            .unwrap_or_else(|| NO_DOMAIN.to_string())
    }

    fn cache_lookup(&self, key: &str) -> Option<(String, bool)> {
        self.cache
            .get(key)
            .map(|entry| (entry.domain.clone(), entry.is_expired()))
    }

    fn evict(&self, key: &str) {
        if self.cache.remove(key).is_some() {
            self.cache_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Admit a result only while the live count is below the bound. The
    /// slot is reserved atomically before the insert so concurrent
    /// admissions cannot push the count past the bound; a collision with
    /// an existing key releases the reservation.
    fn admit(&self, key: String, domain: String) {
        let max = self.max_cache_size as i64;
        let reserved = self
            .cache_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |count| {
                (count < max).then_some(count + 1)
            });
        if reserved.is_err() {
            return;
        }
        match self.cache.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(DnsCacheEntry {
                    domain,
                    inserted_at: Instant::now(),
                    ttl: self.cache_ttl,
                });
            }
            Entry::Occupied(_) => {
                self.cache_count.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }

    /// Remove every expired entry. Readers are never blocked for the whole
    /// sweep; DashMap locks one shard at a time.
    pub fn sweep_expired(&self) -> usize {
        let mut removed = 0usize;
        self.cache.retain(|_, entry| {
            if entry.is_expired() {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            self.cache_count.fetch_sub(removed as i64, Ordering::Relaxed);
        }
        removed
    }

    pub fn cached_entries(&self) -> i64 {
        self.cache_count.load(Ordering::Relaxed)
    }
}

/// RFC1918 ranges plus loopback and link-local (unicast and multicast).
pub fn is_private(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || (octets[0] == 224 && octets[1] == 0 && octets[2] == 0)
}

/// Periodically sweep expired entries until cancelled.
pub fn spawn_sweeper(resolver: Arc<DnsResolver>, tracker: &TaskTracker, token: CancellationToken) {
    tracker.spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {
                    let removed = resolver.sweep_expired();
                    if removed > 0 {
                        debug!("dns cache sweep removed {removed} expired entries");
                    }
                }
            }
        }
        debug!("dns cache sweeper stopped");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn test_config(enabled: bool, cache_size: usize, ttl: Duration) -> CaptureConfig {
        CaptureConfig {
            interface: "lo".to_string(),
            all_interfaces: false,
            loopback_filter: true,
            worker_count: 1,
            event_buffer_size: 16,
            worker_batch_size: 4,
            dns_enabled: enabled,
            dns_timeout: Duration::from_millis(500),
            dns_cache_size: cache_size,
            dns_cache_ttl: ttl,
            dns_servers: vec!["8.8.8.8:53".parse::<SocketAddr>().unwrap()],
        }
    }

    #[tokio::test]
    async fn disabled_resolver_returns_sentinel() {
        let resolver = DnsResolver::new(&test_config(false, 10, Duration::from_secs(300)));
        assert_eq!(resolver.resolve(Ipv4Addr::new(8, 8, 8, 8)).await, NO_DOMAIN);
        assert_eq!(resolver.cached_entries(), 0);
    }

    #[tokio::test]
    async fn private_addresses_short_circuit_without_caching() {
        let resolver = DnsResolver::new(&test_config(true, 10, Duration::from_secs(300)));
        for ip in [
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(192, 168, 1, 1),
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(169, 254, 1, 1),
            Ipv4Addr::new(224, 0, 0, 251),
        ] {
            assert_eq!(resolver.resolve(ip).await, NO_DOMAIN, "{ip}");
        }
        assert_eq!(resolver.cached_entries(), 0);
    }

    #[test]
    fn private_ranges() {
        assert!(is_private(Ipv4Addr::new(10, 255, 255, 255)));
        assert!(is_private(Ipv4Addr::new(172, 31, 0, 1)));
        assert!(!is_private(Ipv4Addr::new(172, 32, 0, 1)));
        assert!(!is_private(Ipv4Addr::new(8, 8, 8, 8)));
        assert!(!is_private(Ipv4Addr::new(224, 0, 1, 1)));
    }

    #[tokio::test]
    async fn cache_admission_is_bounded() {
        let resolver = DnsResolver::new(&test_config(true, 2, Duration::from_secs(300)));
        resolver.admit("1.2.3.4".to_string(), "one.example.".to_string());
        resolver.admit("5.6.7.8".to_string(), "two.example.".to_string());
        assert_eq!(resolver.cached_entries(), 2);

        // A third insertion is silently dropped; nothing is evicted.
        resolver.admit("9.9.9.9".to_string(), "three.example.".to_string());
        assert_eq!(resolver.cached_entries(), 2);
        assert!(resolver.cache_lookup("9.9.9.9").is_none());
        assert!(resolver.cache_lookup("1.2.3.4").is_some());
    }

    #[tokio::test]
    async fn eviction_frees_an_admission_slot() {
        let resolver = DnsResolver::new(&test_config(true, 1, Duration::from_secs(300)));
        resolver.admit("1.2.3.4".to_string(), "one.example.".to_string());
        resolver.admit("5.6.7.8".to_string(), "two.example.".to_string());
        assert_eq!(resolver.cached_entries(), 1);
        assert!(resolver.cache_lookup("5.6.7.8").is_none());

        resolver.evict("1.2.3.4");
        resolver.admit("5.6.7.8".to_string(), "two.example.".to_string());
        assert_eq!(resolver.cached_entries(), 1);
        assert!(resolver.cache_lookup("5.6.7.8").is_some());
    }

    #[tokio::test]
    async fn admission_collision_does_not_double_count() {
        let resolver = DnsResolver::new(&test_config(true, 10, Duration::from_secs(300)));
        resolver.admit("1.2.3.4".to_string(), "one.example.".to_string());
        resolver.admit("1.2.3.4".to_string(), "other.example.".to_string());
        assert_eq!(resolver.cached_entries(), 1);
        // The original entry survives a collision.
        let (domain, _) = resolver.cache_lookup("1.2.3.4").unwrap();
        assert_eq!(domain, "one.example.");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_evicted_on_lookup() {
        let resolver = DnsResolver::new(&test_config(true, 10, Duration::from_secs(1)));
        resolver.admit("1.2.3.4".to_string(), "one.example.".to_string());

        let (_, expired) = resolver.cache_lookup("1.2.3.4").unwrap();
        assert!(!expired);

        tokio::time::advance(Duration::from_secs(2)).await;
        let (_, expired) = resolver.cache_lookup("1.2.3.4").unwrap();
        assert!(expired);

        resolver.evict("1.2.3.4");
        assert_eq!(resolver.cached_entries(), 0);
        assert!(resolver.cache_lookup("1.2.3.4").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_only_expired_entries() {
        let resolver = DnsResolver::new(&test_config(true, 10, Duration::from_secs(10)));
        resolver.admit("1.2.3.4".to_string(), "old.example.".to_string());

        tokio::time::advance(Duration::from_secs(5)).await;
        resolver.admit("5.6.7.8".to_string(), "new.example.".to_string());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(resolver.sweep_expired(), 1);
        assert_eq!(resolver.cached_entries(), 1);
        assert!(resolver.cache_lookup("1.2.3.4").is_none());
        assert!(resolver.cache_lookup("5.6.7.8").is_some());
    }
}
