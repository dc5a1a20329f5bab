//! Crash-safe file-backed storage for queue items (§6).
//!
//! Every write goes to a temp file in the same directory, then an
//! atomic rename drops it into place as `m:<id>`. A reader never
//! observes a partially written item: either the old file is still
//! there, or the new one is, never a half-written one. Startup recovery
//! just lists the directory for `m:`-prefixed names.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use mailcore_tracing::traced;
use rand::Rng;
use tokio::fs;

use crate::{
    error::{Result, SpoolError, ValidationError},
    item::{QueueItem, QueueItemId},
};

/// Storage abstraction over queue items, so the queue engine (C7) can
/// be tested against an in-memory store without touching a filesystem.
#[async_trait]
pub trait ItemStore: Send + Sync + std::fmt::Debug {
    /// Persists a new item. Errors with [`SpoolError::AlreadyExists`]
    /// if an item with the same id is already stored.
    async fn put(&self, item: &QueueItem) -> Result<()>;

    /// Loads an item by id.
    async fn get(&self, id: &QueueItemId) -> Result<QueueItem>;

    /// Overwrites an existing item (used after a partial-delivery
    /// attempt updates per-recipient status).
    async fn update(&self, item: &QueueItem) -> Result<()>;

    /// Removes an item once every recipient has reached a terminal
    /// state.
    async fn delete(&self, id: &QueueItemId) -> Result<()>;

    /// Lists every item currently stored, for crash recovery and
    /// periodic queue scans.
    async fn list_ids(&self) -> Result<Vec<QueueItemId>>;
}

/// On-disk queue item store: one file per item in a single directory.
#[derive(Debug, Clone)]
pub struct FileItemStore {
    path: PathBuf,
}

#[cfg(unix)]
const SYSTEM_DIRS: &[&str] = &[
    "/etc", "/bin", "/sbin", "/usr", "/boot", "/sys", "/proc", "/dev",
];

impl FileItemStore {
    /// Validates and wraps `path` as an item store directory.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] if `path` is relative, contains a
    /// `..` component, or (on Unix) falls under a well-known system
    /// directory.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        validate_path(&path)?;
        Ok(Self { path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the store directory if it doesn't exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`SpoolError::Io`] if the directory cannot be created.
    pub async fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.path).await.map_err(SpoolError::Io)
    }

    fn item_path(&self, id: &QueueItemId) -> PathBuf {
        self.path.join(id.filename())
    }

    fn temp_path(&self, id: &QueueItemId) -> PathBuf {
        let suffix: u32 = rand::rng().random();
        self.path.join(format!(".tmp-{}-{suffix:08x}", id.as_str()))
    }

    #[traced]
    async fn write_atomic(&self, item: &QueueItem) -> Result<()> {
        let encoded = bincode::serde::encode_to_vec(item, bincode::config::standard())
            .map_err(crate::error::SerializationError::from)?;

        let temp = self.temp_path(&item.id);
        fs::write(&temp, &encoded).await.map_err(SpoolError::Io)?;
        fs::rename(&temp, self.item_path(&item.id))
            .await
            .map_err(SpoolError::Io)?;
        Ok(())
    }
}

fn validate_path(path: &Path) -> std::result::Result<(), ValidationError> {
    if !path.is_absolute() {
        return Err(ValidationError::InvalidConfiguration(format!(
            "spool path must be absolute: {}",
            path.display()
        )));
    }

    if path.components().any(|c| c.as_os_str() == "..") {
        return Err(ValidationError::InvalidConfiguration(format!(
            "spool path cannot contain '..': {}",
            path.display()
        )));
    }

    #[cfg(unix)]
    {
        let s = path.to_string_lossy();
        if SYSTEM_DIRS.iter().any(|d| s == *d || s.starts_with(&format!("{d}/"))) {
            return Err(ValidationError::InvalidConfiguration(format!(
                "spool path cannot be a system directory: {}",
                path.display()
            )));
        }
    }

    Ok(())
}

#[async_trait]
impl ItemStore for FileItemStore {
    #[traced]
    async fn put(&self, item: &QueueItem) -> Result<()> {
        if fs::try_exists(self.item_path(&item.id))
            .await
            .map_err(SpoolError::Io)?
        {
            return Err(SpoolError::AlreadyExists(item.id.clone()));
        }
        self.write_atomic(item).await
    }

    #[traced]
    async fn get(&self, id: &QueueItemId) -> Result<QueueItem> {
        let bytes = fs::read(self.item_path(id))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SpoolError::NotFound(id.clone()),
                _ => SpoolError::Io(e),
            })?;
        let (item, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
            .map_err(crate::error::SerializationError::from)?;
        Ok(item)
    }

    #[traced]
    async fn update(&self, item: &QueueItem) -> Result<()> {
        self.write_atomic(item).await
    }

    #[traced]
    async fn delete(&self, id: &QueueItemId) -> Result<()> {
        match fs::remove_file(self.item_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SpoolError::Io(e)),
        }
    }

    #[traced]
    async fn list_ids(&self) -> Result<Vec<QueueItemId>> {
        let mut out = Vec::new();
        let mut entries = fs::read_dir(&self.path).await.map_err(SpoolError::Io)?;
        while let Some(entry) = entries.next_entry().await.map_err(SpoolError::Io)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(id) = QueueItemId::from_filename(name) {
                out.push(id);
            }
        }
        Ok(out)
    }
}
