//! DNS resolution for mail delivery.
//!
//! Implements MX record lookup with A/AAAA fallback and RFC 7505 null-MX
//! handling. Includes LRU caching with TTL tracking.

use std::{
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use hickory_resolver::{
    TokioAsyncResolver,
    config::{ResolverConfig, ResolverOpts},
};
use lru::LruCache;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Maximum number of mail server candidates handed back to the courier.
const MAX_CANDIDATES: usize = 5;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("no mail servers found for domain: {0}")]
    NoMailServers(String),

    /// RFC 7505 null MX: the domain explicitly declares it accepts no mail.
    #[error("domain declares a null MX record: {0}")]
    NullMx(String),

    #[error("dns lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::error::ResolveError),

    #[error("domain does not exist: {0}")]
    DomainNotFound(String),

    #[error("dns query timed out for domain: {0}")]
    Timeout(String),
}

impl DnsError {
    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::LookupFailed(_))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DnsConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_cache_ttl_secs() -> u64 {
    300
}

const fn default_cache_size() -> usize {
    1000
}

const DEFAULT_CACHE_SIZE_NONZERO: NonZeroUsize = NonZeroUsize::new(default_cache_size()).unwrap();

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: default_cache_ttl_secs(),
            cache_size: default_cache_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailServer {
    pub host: String,
    /// MX priority (lower value = higher priority). 0 for A/AAAA fallback.
    pub priority: u16,
    pub port: u16,
}

#[derive(Debug, Clone)]
struct CachedResult {
    servers: Arc<Vec<MailServer>>,
    expires_at: Instant,
}

impl MailServer {
    #[must_use]
    pub const fn new(host: String, priority: u16, port: u16) -> Self {
        Self {
            host,
            priority,
            port,
        }
    }

    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// DNS resolver for mail delivery, with IDNA normalization and LRU caching.
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    cache: Arc<Mutex<LruCache<String, CachedResult>>>,
    config: DnsConfig,
}

impl DnsResolver {
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn new() -> Result<Self, DnsError> {
        Self::with_dns_config(DnsConfig::default())
    }

    /// # Errors
    ///
    /// Returns an error if the resolver cannot be initialized.
    pub fn with_dns_config(dns_config: DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(dns_config.timeout_secs);

        let resolver = TokioAsyncResolver::tokio(ResolverConfig::default(), opts);
        let cache = Arc::new(Mutex::new(new_cache(dns_config.cache_size)));

        Ok(Self {
            resolver,
            cache,
            config: dns_config,
        })
    }

    /// # Errors
    ///
    /// Returns an error if the resolver cannot be initialized.
    pub fn with_resolver_config(
        resolver_config: ResolverConfig,
        opts: ResolverOpts,
        dns_config: DnsConfig,
    ) -> Result<Self, DnsError> {
        let resolver = TokioAsyncResolver::tokio(resolver_config, opts);
        let cache = Arc::new(Mutex::new(new_cache(dns_config.cache_size)));

        Ok(Self {
            resolver,
            cache,
            config: dns_config,
        })
    }

    /// Resolves mail servers for a domain, MX first with A/AAAA fallback,
    /// capped at [`MAX_CANDIDATES`] entries in priority order.
    ///
    /// # Errors
    ///
    /// Returns [`DnsError`] if the domain doesn't exist, declares a null
    /// MX, or the lookup itself fails.
    pub async fn resolve_mail_servers(
        &self,
        domain: &str,
    ) -> Result<Arc<Vec<MailServer>>, DnsError> {
        let ascii_domain = mailcore_common::normalize::to_ascii(domain)
            .map_err(|_| DnsError::DomainNotFound(domain.to_string()))?;

        {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&ascii_domain) {
                if cached.expires_at > Instant::now() {
                    debug!("cache hit for {ascii_domain}, {} server(s)", cached.servers.len());
                    return Ok(Arc::clone(&cached.servers));
                }
            }
        }

        let servers = Arc::new(self.resolve_mail_servers_uncached(&ascii_domain).await?);

        let expires_at = Instant::now() + Duration::from_secs(self.config.cache_ttl_secs);
        let cached_result = CachedResult {
            servers: servers.clone(),
            expires_at,
        };

        {
            let mut cache = self.cache.lock().await;
            cache.put(ascii_domain, cached_result);
        }

        Ok(servers)
    }

    async fn resolve_mail_servers_uncached(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(mx_lookup) => {
                let records: Vec<_> = mx_lookup.iter().collect();

                if records.len() == 1 && records[0].exchange().to_utf8().trim_end_matches('.').is_empty() {
                    warn!("{domain} declares a null MX, refusing delivery");
                    return Err(DnsError::NullMx(domain.to_string()));
                }

                let mut servers: Vec<MailServer> = records
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8();
                        MailServer::new(host, mx.preference(), 25)
                    })
                    .collect();

                if servers.is_empty() {
                    debug!("no MX records for {domain}, falling back to A/AAAA");
                    return self.fallback_to_a_aaaa(domain).await;
                }

                Ok(cap_candidates(&mut servers))
            }
            Err(err) => {
                if matches!(
                    err.kind(),
                    hickory_resolver::error::ResolveErrorKind::NoRecordsFound { .. }
                ) {
                    debug!("no MX records found for {domain}, falling back to A/AAAA");
                    self.fallback_to_a_aaaa(domain).await
                } else {
                    warn!("MX lookup failed for {domain}: {err}");
                    Err(DnsError::LookupFailed(err))
                }
            }
        }
    }

    /// Falls back to A/AAAA records when no MX records exist at all (RFC
    /// 5321 §5.1). A domain that *has* MX records but lists none explicitly
    /// (null MX) must never reach this path.
    async fn fallback_to_a_aaaa(&self, domain: &str) -> Result<Vec<MailServer>, DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(ip_lookup) => {
                let mut servers: Vec<MailServer> = ip_lookup
                    .iter()
                    .map(|ip| MailServer::new(ip.to_string(), 0, 25))
                    .collect();

                if servers.is_empty() {
                    Err(DnsError::NoMailServers(domain.to_string()))
                } else {
                    Ok(cap_candidates(&mut servers))
                }
            }
            Err(err) => {
                warn!("A/AAAA lookup failed for {domain}: {err}");
                if matches!(
                    err.kind(),
                    hickory_resolver::error::ResolveErrorKind::NoRecordsFound { .. }
                ) {
                    Err(DnsError::NoMailServers(domain.to_string()))
                } else {
                    Err(DnsError::LookupFailed(err))
                }
            }
        }
    }

    /// # Errors
    ///
    /// Returns `DnsError::DomainNotFound` if the domain does not exist.
    pub async fn validate_domain(&self, domain: &str) -> Result<(), DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(_) => Ok(()),
            Err(err)
                if matches!(
                    err.kind(),
                    hickory_resolver::error::ResolveErrorKind::NoRecordsFound { .. }
                ) =>
            {
                Err(DnsError::DomainNotFound(domain.to_string()))
            }
            Err(err) => Err(DnsError::LookupFailed(err)),
        }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new().expect("failed to create default DNS resolver")
    }
}

fn new_cache(size: usize) -> LruCache<String, CachedResult> {
    LruCache::new(NonZeroUsize::new(size).unwrap_or(DEFAULT_CACHE_SIZE_NONZERO))
}

/// Sorts by priority, randomizes the order within each priority tier, then
/// truncates to [`MAX_CANDIDATES`].
fn cap_candidates(servers: &mut Vec<MailServer>) -> Vec<MailServer> {
    servers.sort_by_key(|s| s.priority);

    let mut rng = rand::rng();
    let mut i = 0;
    while i < servers.len() {
        let mut j = i + 1;
        while j < servers.len() && servers[j].priority == servers[i].priority {
            j += 1;
        }
        servers[i..j].shuffle(&mut rng);
        i = j;
    }

    servers.truncate(MAX_CANDIDATES);
    std::mem::take(servers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires network access"]
    async fn mx_lookup_gmail() {
        let resolver = DnsResolver::new().unwrap();
        let servers = resolver.resolve_mail_servers("gmail.com").await.unwrap();
        assert!(!servers.is_empty());
        assert!(servers.iter().all(|s| s.port == 25));
    }

    #[test]
    fn mail_server_address() {
        let server = MailServer::new("mail.example.com".to_string(), 10, 25);
        assert_eq!(server.address(), "mail.example.com:25");
    }

    #[test]
    fn cap_candidates_sorts_and_truncates() {
        let mut servers = vec![
            MailServer::new("mx-a".into(), 30, 25),
            MailServer::new("mx-b".into(), 10, 25),
            MailServer::new("mx-c".into(), 20, 25),
            MailServer::new("mx-d".into(), 10, 25),
            MailServer::new("mx-e".into(), 40, 25),
            MailServer::new("mx-f".into(), 50, 25),
        ];
        let capped = cap_candidates(&mut servers);
        assert_eq!(capped.len(), 5);
        assert!(capped.windows(2).all(|w| w[0].priority <= w[1].priority));
        assert_eq!(capped[0].priority, 10);
        assert_eq!(capped[1].priority, 10);
    }

    #[test]
    fn dns_error_is_temporary() {
        assert!(DnsError::Timeout("example.com".to_string()).is_temporary());
        assert!(!DnsError::NoMailServers("example.com".to_string()).is_temporary());
        assert!(!DnsError::NullMx("example.com".to_string()).is_temporary());
        assert!(!DnsError::DomainNotFound("example.com".to_string()).is_temporary());
    }
}
