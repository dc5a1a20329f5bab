//! MTA-STS cache (C4, §4.4): fetch, parse, validate, persist, and
//! periodically refresh per-domain STS policies.

use std::{
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use dashmap::DashMap;
use mailcore_common::{normalize, Domain};
use mailcore_tracing::traced;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::{
    domaininfo::atomic_write,
    error::{Result, SerializationError, SpoolError},
};

const MAX_BODY_BYTES: u64 = 10 * 1024;
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const REFRESH_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StsMode {
    Enforce,
    Testing,
    None,
}

/// A parsed, validated MTA-STS policy (RFC 8461).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StsPolicy {
    pub mode: StsMode,
    pub max_age: u64,
    pub mx: Vec<String>,
}

impl StsPolicy {
    /// Parses and validates RFC 8461 policy text.
    ///
    /// Valid iff `version == STSv1`, `max_age > 0`, `mode` is one of
    /// `enforce`/`testing`/`none`, and `mx` is non-empty.
    pub fn parse(body: &str) -> std::result::Result<Self, &'static str> {
        let mut version = None;
        let mut mode = None;
        let mut max_age = None;
        let mut mx = Vec::new();

        for line in body.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "version" => version = Some(value.to_string()),
                "mode" => {
                    mode = match value {
                        "enforce" => Some(StsMode::Enforce),
                        "testing" => Some(StsMode::Testing),
                        "none" => Some(StsMode::None),
                        _ => return Err("unrecognized mode"),
                    };
                }
                "max_age" => max_age = value.parse::<u64>().ok(),
                "mx" => mx.push(value.to_string()),
                _ => {}
            }
        }

        if version.as_deref() != Some("STSv1") {
            return Err("missing or wrong version");
        }
        let mode = mode.ok_or("missing mode")?;
        let max_age = max_age.ok_or("missing or invalid max_age")?;
        if max_age == 0 {
            return Err("max_age must be > 0");
        }
        if mx.is_empty() {
            return Err("mx list must be non-empty");
        }

        Ok(Self { mode, max_age, mx })
    }

    /// Whether `candidate_mx` is permitted by this policy's `mx` list.
    ///
    /// Always true outside `enforce` mode. Both the pattern and the
    /// candidate are compared as IDNA A-labels with trailing dots
    /// stripped, case-insensitively. A leading `*.` in a pattern
    /// matches exactly one label in the leftmost position; `*`
    /// anywhere else in a pattern is a literal character.
    #[must_use]
    pub fn mx_is_allowed(&self, candidate_mx: &str) -> bool {
        if self.mode != StsMode::Enforce {
            return true;
        }

        let Ok(candidate) = normalize::to_ascii(candidate_mx.trim_end_matches('.')) else {
            return false;
        };
        let candidate = candidate.to_lowercase();

        self.mx.iter().any(|pattern| mx_pattern_matches(pattern, &candidate))
    }
}

fn mx_pattern_matches(pattern: &str, candidate: &str) -> bool {
    let pattern = pattern.trim_end_matches('.');
    let Ok(pattern_ascii) = normalize::to_ascii(pattern) else {
        return false;
    };
    let pattern_ascii = pattern_ascii.to_lowercase();

    if let Some(rest) = pattern_ascii.strip_prefix("*.") {
        let Some((first_label, remainder)) = candidate.split_once('.') else {
            return false;
        };
        let _ = first_label;
        remainder == rest
    } else {
        pattern_ascii == candidate
    }
}

/// Builds the HTTP client [`fetch_policy`] expects: redirects
/// disallowed, so a redirecting origin fails fetch per §4.4 rather
/// than being followed.
///
/// # Errors
///
/// Returns an error if the underlying TLS backend fails to initialize.
pub fn build_http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
}

/// Fetches the MTA-STS policy for `domain` over HTTPS.
///
/// `client` must be built with redirects disabled (see
/// [`build_http_client`]) — this function treats a redirection
/// response as a fetch failure rather than following it.
///
/// # Errors
///
/// Returns an error string describing why the fetch failed: a
/// redirect, non-200 status, wrong media type, oversized body, or an
/// unparseable policy.
#[traced]
pub async fn fetch_policy(
    client: &reqwest::Client,
    domain: &Domain,
) -> std::result::Result<StsPolicy, String> {
    let url = format!("https://mta-sts.{domain}/.well-known/mta-sts.txt");

    let response = client
        .get(&url)
        .timeout(FETCH_TIMEOUT)
        .send()
        .await
        .map_err(|e| format!("fetch failed: {e}"))?;

    if response.status().is_redirection() {
        return Err(format!("unexpected redirect: {}", response.status()));
    }
    if response.status() != reqwest::StatusCode::OK {
        return Err(format!("unexpected status: {}", response.status()));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if !content_type.starts_with("text/plain") {
        return Err(format!("unexpected media type: {content_type}"));
    }

    if let Some(len) = response.content_length() {
        if len > MAX_BODY_BYTES {
            return Err(format!("body too large: {len} bytes"));
        }
    }

    let body = response.text().await.map_err(|e| format!("read body failed: {e}"))?;
    if body.len() as u64 > MAX_BODY_BYTES {
        return Err("body exceeded 10 KiB cap".to_string());
    }

    StsPolicy::parse(&body).map_err(std::string::ToString::to_string)
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    policy: StsPolicy,
}

/// Cached lookup result: either a usable policy or "expired"/absent.
pub enum CacheLookup {
    Fresh(StsPolicy),
    Expired,
    Absent,
}

/// On-disk MTA-STS policy cache: one file per domain, whose mtime
/// holds the expiration instant (§4.4).
#[derive(Debug)]
pub struct StsCache {
    dir: PathBuf,
    memo: DashMap<Domain, StsPolicy>,
}

impl StsCache {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            memo: DashMap::new(),
        }
    }

    /// # Errors
    ///
    /// Returns [`SpoolError::Io`] if the directory cannot be created.
    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await.map_err(SpoolError::Io)
    }

    fn path_for(&self, domain: &Domain) -> PathBuf {
        assert!(
            !domain.as_str().contains('/'),
            "domain name must never contain '/': {domain}"
        );
        self.dir.join(URL_SAFE_NO_PAD.encode(domain.as_str().as_bytes()))
    }

    /// Looks up a cached policy, checking the file's mtime against now.
    ///
    /// A record whose body fails to decode is treated as absent (the
    /// caller should re-fetch), matching §4.4's "corrupt files cause a
    /// re-fetch".
    #[traced]
    pub async fn lookup(&self, domain: &Domain) -> CacheLookup {
        let path = self.path_for(domain);
        let Ok(metadata) = fs::metadata(&path).await else {
            return CacheLookup::Absent;
        };
        let Ok(modified) = metadata.modified() else {
            return CacheLookup::Absent;
        };
        if modified <= SystemTime::now() {
            return CacheLookup::Expired;
        }

        if let Some(policy) = self.memo.get(domain) {
            return CacheLookup::Fresh(policy.clone());
        }

        let Ok(bytes) = fs::read(&path).await else {
            return CacheLookup::Absent;
        };
        match bincode::serde::decode_from_slice::<CacheRecord, _>(&bytes, bincode::config::standard()) {
            Ok((record, _)) => {
                self.memo.insert(domain.clone(), record.policy.clone());
                CacheLookup::Fresh(record.policy)
            }
            Err(_) => CacheLookup::Absent,
        }
    }

    /// Persists `policy`, setting the file's mtime to `now + max_age`.
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::Io`] if the file cannot be written, or
    /// [`SpoolError::Serialization`] if the policy cannot be encoded.
    #[traced]
    pub async fn store(&self, domain: &Domain, policy: StsPolicy) -> Result<()> {
        let record = CacheRecord { policy: policy.clone() };
        let bytes = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(SerializationError::from)?;

        let dest = self.path_for(domain);
        atomic_write(&self.dir, &dest, &bytes).await?;

        let expires_at = SystemTime::now() + Duration::from_secs(policy.max_age);
        set_mtime(&dest, expires_at).await?;

        self.memo.insert(domain.clone(), policy);
        Ok(())
    }

    /// Lists every domain with a cache entry, for the background
    /// refresher.
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::Io`] if the directory cannot be read.
    pub async fn domains(&self) -> Result<Vec<Domain>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await.map_err(SpoolError::Io)?;
        while let Some(entry) = entries.next_entry().await.map_err(SpoolError::Io)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Ok(bytes) = URL_SAFE_NO_PAD.decode(name) {
                if let Ok(domain) = String::from_utf8(bytes) {
                    out.push(Domain::new(domain));
                }
            }
        }
        Ok(out)
    }

    /// Runs forever, re-fetching every cached domain's policy every
    /// [`REFRESH_INTERVAL`]. Failures leave the stale-but-present entry
    /// in place rather than evicting it (§4.4).
    pub async fn run_refresher(&self, client: reqwest::Client) {
        let mut interval = tokio::time::interval(REFRESH_INTERVAL);
        loop {
            interval.tick().await;
            let Ok(domains) = self.domains().await else {
                continue;
            };
            for domain in domains {
                match fetch_policy(&client, &domain).await {
                    Ok(policy) => {
                        if let Err(e) = self.store(&domain, policy).await {
                            tracing::warn!(%domain, error = %e, "failed to persist refreshed STS policy");
                        }
                    }
                    Err(e) => {
                        tracing::debug!(%domain, error = %e, "STS refresh failed, keeping stale entry");
                    }
                }
            }
        }
    }
}

async fn set_mtime(path: &Path, when: SystemTime) -> Result<()> {
    let secs = when
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let atime = filetime::FileTime::now();
        let mtime = filetime::FileTime::from_unix_time(secs, 0);
        filetime::set_file_times(&path, atime, mtime)
    })
    .await
    .map_err(|e| SpoolError::Internal(format!("set_mtime task panicked: {e}")))?
    .map_err(SpoolError::Io)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_policy() {
        let body = "version: STSv1\nmode: enforce\nmax_age: 86400\nmx: mail.example.com\nmx: *.example.com\n";
        let policy = StsPolicy::parse(body).unwrap();
        assert_eq!(policy.mode, StsMode::Enforce);
        assert_eq!(policy.max_age, 86400);
        assert_eq!(policy.mx, vec!["mail.example.com", "*.example.com"]);
    }

    #[test]
    fn rejects_zero_max_age() {
        let body = "version: STSv1\nmode: enforce\nmax_age: 0\nmx: mail.example.com\n";
        assert!(StsPolicy::parse(body).is_err());
    }

    #[test]
    fn rejects_empty_mx_list() {
        let body = "version: STSv1\nmode: enforce\nmax_age: 100\n";
        assert!(StsPolicy::parse(body).is_err());
    }

    #[test]
    fn non_enforce_mode_allows_everything() {
        let policy = StsPolicy {
            mode: StsMode::Testing,
            max_age: 100,
            mx: vec!["mail.example.com".to_string()],
        };
        assert!(policy.mx_is_allowed("totally-different.test"));
    }

    #[test]
    fn wildcard_matches_one_leftmost_label() {
        let policy = StsPolicy {
            mode: StsMode::Enforce,
            max_age: 100,
            mx: vec!["*.example.com".to_string()],
        };
        assert!(policy.mx_is_allowed("mx1.example.com"));
        assert!(!policy.mx_is_allowed("mx1.sub.example.com"));
        assert!(!policy.mx_is_allowed("example.com"));
    }

    #[test]
    fn exact_pattern_matches_case_insensitively() {
        let policy = StsPolicy {
            mode: StsMode::Enforce,
            max_age: 100,
            mx: vec!["Mail.Example.com".to_string()],
        };
        assert!(policy.mx_is_allowed("mail.example.com"));
    }

    #[tokio::test]
    async fn store_then_lookup_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StsCache::new(dir.path());
        cache.ensure_dir().await.unwrap();

        let domain = Domain::new("example.com");
        let policy = StsPolicy {
            mode: StsMode::Enforce,
            max_age: 86400,
            mx: vec!["mail.example.com".to_string()],
        };
        cache.store(&domain, policy).await.unwrap();

        match cache.lookup(&domain).await {
            CacheLookup::Fresh(p) => assert_eq!(p.mx, vec!["mail.example.com".to_string()]),
            _ => panic!("expected a fresh cache hit"),
        }
    }

    #[tokio::test]
    async fn expired_entry_is_reported_expired() {
        let dir = tempfile::tempdir().unwrap();
        let cache = StsCache::new(dir.path());
        cache.ensure_dir().await.unwrap();

        let domain = Domain::new("example.com");
        let policy = StsPolicy {
            mode: StsMode::Enforce,
            max_age: 1,
            mx: vec!["mail.example.com".to_string()],
        };
        cache.store(&domain, policy).await.unwrap();

        let path = cache.path_for(&domain);
        set_mtime(&path, SystemTime::now() - Duration::from_secs(10))
            .await
            .unwrap();

        assert!(matches!(cache.lookup(&domain).await, CacheLookup::Expired));
    }
}
