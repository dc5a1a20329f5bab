//! Domaininfo store (C3, §4.3): a per-destination-domain sticky record
//! of the strongest outbound security level ever observed, with
//! downgrade rejection.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use dashmap::{mapref::entry::Entry, DashMap};
use mailcore_common::Domain;
use mailcore_tracing::traced;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{Result, SerializationError, SpoolError};

/// Outbound TLS posture observed for a destination domain, ordered so
/// that `Plain < TlsInsecure < TlsSecure` (§8 invariant 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SecurityLevel {
    Plain,
    TlsInsecure,
    TlsSecure,
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    level: SecurityLevel,
}

/// Process-wide singleton tracking the strongest security level ever
/// observed per destination domain. Loaded once at startup via
/// [`load_all`](Self::load_all); after that, [`outgoing_sec_level`]
/// serves from memory and persists updates in the background.
#[derive(Debug)]
pub struct DomaininfoStore {
    dir: PathBuf,
    cache: DashMap<Domain, SecurityLevel>,
}

impl DomaininfoStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: DashMap::new(),
        }
    }

    /// Creates the store directory if missing.
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::Io`] if the directory cannot be created.
    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).await.map_err(SpoolError::Io)
    }

    /// Loads every existing record from disk into memory. Call once at
    /// startup, before the first `Put` reaches the queue engine.
    ///
    /// A record file that fails to decode is skipped rather than
    /// failing startup; a corrupt domaininfo record degrades to "no
    /// prior observation" for that domain, which is safe (the next
    /// observed level is simply recorded as the new baseline).
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::Io`] if the directory cannot be read.
    #[traced]
    pub async fn load_all(&self) -> Result<()> {
        let mut entries = fs::read_dir(&self.dir).await.map_err(SpoolError::Io)?;
        while let Some(entry) = entries.next_entry().await.map_err(SpoolError::Io)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(domain_bytes) = URL_SAFE_NO_PAD.decode(name) else {
                continue;
            };
            let Ok(domain) = String::from_utf8(domain_bytes) else {
                continue;
            };
            let Ok(bytes) = fs::read(entry.path()).await else {
                continue;
            };
            let Ok((record, _)) =
                bincode::serde::decode_from_slice::<Record, _>(&bytes, bincode::config::standard())
            else {
                continue;
            };
            self.cache.insert(Domain::new(domain), record.level);
        }
        Ok(())
    }

    /// Records `observed` as the security level for `domain`.
    ///
    /// Returns `true` if `observed` was accepted (no prior record, or
    /// `observed >= stored`), `false` if it represents a downgrade from
    /// a previously observed stronger level — the caller must treat a
    /// `false` result as a transient delivery failure (§4.6 step 4d).
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::Io`] if persisting the updated record
    /// fails (the in-memory decision still stands; only the on-disk
    /// record may be stale until the next successful write).
    #[traced]
    pub async fn outgoing_sec_level(&self, domain: &Domain, observed: SecurityLevel) -> Result<bool> {
        let to_persist = match self.cache.entry(domain.clone()) {
            Entry::Vacant(e) => {
                e.insert(observed);
                Some(observed)
            }
            Entry::Occupied(mut e) => {
                if observed >= *e.get() {
                    e.insert(observed);
                    Some(observed)
                } else {
                    None
                }
            }
        };

        let Some(level) = to_persist else {
            return Ok(false);
        };

        self.persist(domain, level).await?;
        Ok(true)
    }

    fn path_for(&self, domain: &Domain) -> PathBuf {
        self.dir.join(URL_SAFE_NO_PAD.encode(domain.as_str().as_bytes()))
    }

    async fn persist(&self, domain: &Domain, level: SecurityLevel) -> Result<()> {
        let record = Record { level };
        let bytes = bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(SerializationError::from)?;
        atomic_write(&self.dir, &self.path_for(domain), &bytes).await
    }
}

pub(crate) async fn atomic_write(dir: &Path, dest: &Path, bytes: &[u8]) -> Result<()> {
    let temp = dir.join(format!(".tmp-{:x}", rand::random::<u64>()));
    fs::write(&temp, bytes).await.map_err(SpoolError::Io)?;
    fs::rename(&temp, dest).await.map_err(SpoolError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_order_plain_below_tls() {
        assert!(SecurityLevel::Plain < SecurityLevel::TlsInsecure);
        assert!(SecurityLevel::TlsInsecure < SecurityLevel::TlsSecure);
    }

    #[tokio::test]
    async fn first_observation_is_always_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let store = DomaininfoStore::new(dir.path());
        store.ensure_dir().await.unwrap();

        let domain = Domain::new("example.com");
        let ok = store
            .outgoing_sec_level(&domain, SecurityLevel::TlsInsecure)
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn downgrade_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = DomaininfoStore::new(dir.path());
        store.ensure_dir().await.unwrap();

        let domain = Domain::new("example.com");
        store
            .outgoing_sec_level(&domain, SecurityLevel::TlsSecure)
            .await
            .unwrap();

        let ok = store
            .outgoing_sec_level(&domain, SecurityLevel::Plain)
            .await
            .unwrap();
        assert!(!ok);
    }

    #[tokio::test]
    async fn equal_level_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let store = DomaininfoStore::new(dir.path());
        store.ensure_dir().await.unwrap();

        let domain = Domain::new("example.com");
        store
            .outgoing_sec_level(&domain, SecurityLevel::TlsInsecure)
            .await
            .unwrap();
        let ok = store
            .outgoing_sec_level(&domain, SecurityLevel::TlsInsecure)
            .await
            .unwrap();
        assert!(ok);
    }

    #[tokio::test]
    async fn persisted_record_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = DomaininfoStore::new(dir.path());
        store.ensure_dir().await.unwrap();
        let domain = Domain::new("example.com");
        store
            .outgoing_sec_level(&domain, SecurityLevel::TlsSecure)
            .await
            .unwrap();

        let reloaded = DomaininfoStore::new(dir.path());
        reloaded.load_all().await.unwrap();
        let ok = reloaded
            .outgoing_sec_level(&domain, SecurityLevel::Plain)
            .await
            .unwrap();
        assert!(!ok);
    }
}
