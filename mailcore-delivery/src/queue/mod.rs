//! Queue engine (C7, §4.7): `Put`, the per-item send loop, crash
//! recovery, and the glue between the alias table, the couriers, and
//! the spool.
//!
//! Concurrency follows §5: one send-loop task per item, one concurrent
//! sender per PENDING recipient within that item, no ordering across
//! items. A per-item lock serializes the whole-file rewrite that
//! follows every attempt round, so a crash can never observe a
//! partially-written item.

pub mod retry;

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use dashmap::DashMap;
use futures_util::future::join_all;
use mailcore_aliases::{AliasTable, RecipientKind as AliasRecipientKind};
use mailcore_common::{Domain, normalize};
use mailcore_spool::{
    FileItemStore, ItemStore,
    item::{QueueItem, QueueItemId, QueuedRecipient, RecipientKind, RecipientStatus},
};
use mailcore_tracing::traced;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::{
    dsn::{self, DsnConfig},
    error::{DeliveryError, PermanentError, SystemError, TemporaryError},
    local::LocalCourier,
    remote::RemoteCourier,
    srs,
};

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Items above this count are rejected at `Put` with a permanent
    /// "queue full" failure (§4.7).
    pub max_items: usize,
    /// How long an item may sit with a pending recipient before the
    /// send loop gives up and bounces it.
    pub give_up_after: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_items: 10_000,
            give_up_after: Duration::from_secs(5 * 24 * 60 * 60),
        }
    }
}

/// Argv for a PIPE recipient, split the way a shell would word-split a
/// bare command line but without ever invoking a shell.
fn pipe_argv(command: &str) -> Vec<String> {
    command.split_whitespace().map(ToString::to_string).collect()
}

const PIPE_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the on-disk spool and the in-memory index of items with an
/// active send loop. Cheap to clone (everything behind `Arc`); meant to
/// be constructed once and shared.
pub struct QueueEngine {
    store: Arc<FileItemStore>,
    aliases: Arc<AliasTable>,
    local: Arc<LocalCourier>,
    remote: Arc<RemoteCourier>,
    local_domains: Arc<HashSet<Domain>>,
    dsn_config: DsnConfig,
    config: QueueConfig,
    /// One lock per active item, guarding its whole-file rewrite.
    locks: DashMap<QueueItemId, Arc<Mutex<()>>>,
    /// Items with a running send loop; also doubles as the `max_items` count.
    active: DashMap<QueueItemId, ()>,
}

impl QueueEngine {
    #[must_use]
    pub fn new(
        store: Arc<FileItemStore>,
        aliases: Arc<AliasTable>,
        local: Arc<LocalCourier>,
        remote: Arc<RemoteCourier>,
        local_domains: Arc<HashSet<Domain>>,
        dsn_config: DsnConfig,
        config: QueueConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            aliases,
            local,
            remote,
            local_domains,
            dsn_config,
            config,
            locks: DashMap::new(),
            active: DashMap::new(),
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Scans the spool for items left behind by a prior process and
    /// relaunches a send loop for each. An item already in a terminal
    /// state simply runs its loop once more, finds nothing pending,
    /// and is removed immediately.
    ///
    /// # Errors
    ///
    /// Propagates a spool I/O failure while listing the directory.
    #[traced]
    pub async fn recover(self: &Arc<Self>) -> Result<usize, DeliveryError> {
        let ids = self.store.list_ids().await.map_err(DeliveryError::from)?;
        let mut recovered = 0;

        for id in ids {
            match self.store.get(&id).await {
                Ok(item) => {
                    self.active.insert(item.id.clone(), ());
                    self.spawn_send_loop(item);
                    recovered += 1;
                }
                Err(err) => {
                    warn!(id = %id, error = %err, "failed to recover queue item, leaving it on disk");
                }
            }
        }

        info!(recovered, "queue recovery complete");
        Ok(recovered)
    }

    /// Accepts a new message: expands every envelope recipient through
    /// the alias table, writes the resulting item to the spool, and
    /// starts its send loop (§4.7 `Put`).
    ///
    /// # Errors
    ///
    /// Returns [`SystemError::QueueFull`] if the queue is already at
    /// `max_items`. Propagates alias recursion and spool write failures.
    #[traced]
    pub async fn put(self: &Arc<Self>, from: &str, to: &[String], data: Vec<u8>) -> Result<QueueItemId, DeliveryError> {
        if self.active.len() >= self.config.max_items {
            return Err(DeliveryError::System(SystemError::QueueFull));
        }

        let mut rcpt = Vec::new();
        for address in to {
            let normalized = normalize::normalize_address(address)?;
            let expanded = self.aliases.resolve(&normalized).await?;
            rcpt.extend(expanded.into_iter().map(to_queued_recipient));
        }

        let item = QueueItem::new(from, to.to_vec(), rcpt, data);
        let id = item.id.clone();

        self.store.put(&item).await.map_err(DeliveryError::from)?;
        self.active.insert(id.clone(), ());
        self.spawn_send_loop(item);

        Ok(id)
    }

    fn spawn_send_loop(self: &Arc<Self>, item: QueueItem) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_send_loop(item).await;
        });
    }

    /// Repeatedly dispatches PENDING recipients until every recipient
    /// reaches a terminal state or `give_up_after` elapses, then bounces
    /// whatever's left (unless the sender is the null reverse path) and
    /// removes the item.
    async fn run_send_loop(self: Arc<Self>, mut item: QueueItem) {
        let id = item.id.clone();
        let lock = Arc::clone(
            self.locks
                .entry(id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );

        loop {
            if elapsed_since(item.created_at) >= self.config.give_up_after {
                debug!(id = %id, "item gave up after its retry window elapsed");
                break;
            }

            let pending: Vec<usize> = item
                .rcpt
                .iter()
                .enumerate()
                .filter(|(_, r)| r.is_pending())
                .map(|(idx, _)| idx)
                .collect();
            if pending.is_empty() {
                break;
            }

            let outcomes = join_all(pending.into_iter().map(|idx| {
                let from = item.from.clone();
                let data = item.data.clone();
                let recipient = item.rcpt[idx].clone();
                let engine = Arc::clone(&self);
                async move { (idx, engine.attempt(&from, &recipient, &data).await) }
            }))
            .await;

            {
                let _guard = lock.lock().await;
                for (idx, outcome) in outcomes {
                    match outcome {
                        Ok(()) => item.rcpt[idx].status = RecipientStatus::Sent,
                        Err(err) if err.is_permanent() => {
                            item.rcpt[idx].status = RecipientStatus::Failed;
                            item.rcpt[idx].last_failure_message = Some(err.to_string());
                        }
                        Err(err) => {
                            item.rcpt[idx].last_failure_message = Some(err.to_string());
                        }
                    }
                }
                if let Err(err) = self.store.update(&item).await {
                    error!(id = %id, error = %err, "failed to persist item after attempt round");
                }
            }

            if !item.has_pending() {
                break;
            }

            tokio::time::sleep(retry::next_delay(elapsed_since(item.created_at))).await;
        }

        self.finish(item).await;
    }

    /// Dispatches a single recipient to the courier its kind calls for.
    async fn attempt(&self, from: &str, recipient: &QueuedRecipient, data: &[u8]) -> Result<(), DeliveryError> {
        match recipient.kind {
            RecipientKind::Pipe => self.attempt_pipe(recipient, data).await,
            RecipientKind::Forward => {
                let via = recipient.via.as_deref().unwrap_or_default();
                let sender = self.maybe_rewrite_sender(from, &recipient.original);
                self.remote.forward(&sender, &recipient.target, data, via).await
            }
            RecipientKind::Email => {
                let (_, domain) = mailcore_common::envelope::split(&recipient.target);
                if self.local_domains.contains(&Domain::new(domain)) {
                    self.local.deliver(from, &recipient.target, data).await
                } else {
                    let sender = self.maybe_rewrite_sender(from, &recipient.original);
                    self.remote.deliver(&sender, &recipient.target, data).await
                }
            }
        }
    }

    /// SRS-rewrites the envelope sender when this delivery forwards mail
    /// that didn't originate here, so a later bounce routes back to us
    /// instead of to a server with no record of the message.
    fn maybe_rewrite_sender(&self, from: &str, original_recipient: &str) -> String {
        if !srs::is_foreign_sender(from, &self.local_domains) {
            return from.to_string();
        }
        srs::rewrite(from, original_recipient).unwrap_or_else(|_| from.to_string())
    }

    async fn attempt_pipe(&self, recipient: &QueuedRecipient, data: &[u8]) -> Result<(), DeliveryError> {
        use tokio::io::AsyncWriteExt;

        let argv = pipe_argv(&recipient.target);
        let Some((program, args)) = argv.split_first() else {
            return Err(DeliveryError::Permanent(PermanentError::PolicyRefused(
                "empty pipe command".to_string(),
            )));
        };

        let run = async {
            let mut child = tokio::process::Command::new(program)
                .args(args)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::piped())
                .spawn()
                .map_err(|e| DeliveryError::System(SystemError::Internal(format!("failed to spawn pipe command: {e}"))))?;

            let mut stdin = child.stdin.take().ok_or_else(|| {
                DeliveryError::System(SystemError::Internal("pipe command stdin missing".to_string()))
            })?;
            stdin
                .write_all(data)
                .await
                .map_err(|e| DeliveryError::System(SystemError::Internal(e.to_string())))?;
            drop(stdin);

            let output = child
                .wait_with_output()
                .await
                .map_err(|e| DeliveryError::System(SystemError::Internal(e.to_string())))?;

            if output.status.success() {
                Ok(())
            } else {
                Err(DeliveryError::Permanent(PermanentError::MessageRejected(format!(
                    "pipe command exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                ))))
            }
        };

        match tokio::time::timeout(PIPE_TIMEOUT, run).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Temporary(TemporaryError::Timeout(
                "pipe command timed out".to_string(),
            ))),
        }
    }

    /// Bounces whatever's left, then removes the item from the spool
    /// and the in-memory index.
    async fn finish(&self, item: QueueItem) {
        let id = item.id.clone();

        if let Some(bounce) = dsn::build(&item, &self.local_domains, &self.dsn_config) {
            match self.resolve_bounce_recipient(bounce).await {
                Ok(bounce) => {
                    if let Err(err) = self.store.put(&bounce).await {
                        error!(id = %id, error = %err, "failed to queue delivery status notification");
                    } else {
                        self.active.insert(bounce.id.clone(), ());
                        self.spawn_send_loop(bounce);
                    }
                }
                Err(err) => {
                    error!(id = %id, error = %err, "failed to resolve delivery status notification recipient");
                }
            }
        }

        if let Err(err) = self.store.delete(&id).await {
            error!(id = %id, error = %err, "failed to remove completed item from spool");
        }
        self.active.remove(&id);
        self.locks.remove(&id);
    }

    /// Runs a freshly built DSN's single unexpanded recipient (the
    /// original sender) through the same normalize-then-resolve path
    /// every other envelope recipient takes, so a bounce addressed to a
    /// local alias is expanded rather than delivered literally.
    async fn resolve_bounce_recipient(&self, mut bounce: QueueItem) -> Result<QueueItem, DeliveryError> {
        let mut rcpt = Vec::new();
        for address in &bounce.to {
            let normalized = normalize::normalize_address(address)?;
            let expanded = self.aliases.resolve(&normalized).await?;
            rcpt.extend(expanded.into_iter().map(to_queued_recipient));
        }
        bounce.rcpt = rcpt;
        Ok(bounce)
    }
}

fn to_queued_recipient(r: mailcore_aliases::Recipient) -> QueuedRecipient {
    let kind = match r.kind {
        AliasRecipientKind::Email => RecipientKind::Email,
        AliasRecipientKind::Pipe => RecipientKind::Pipe,
        AliasRecipientKind::Forward => RecipientKind::Forward,
    };
    let mut queued = QueuedRecipient::new(kind, r.target, r.original);
    queued.via = r.via;
    queued
}

fn elapsed_since(created_at: u64) -> Duration {
    let now = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(created_at);
    Duration::from_secs(now.saturating_sub(created_at))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_argv_splits_on_whitespace() {
        assert_eq!(pipe_argv("/bin/cat -u"), vec!["/bin/cat", "-u"]);
        assert_eq!(pipe_argv("  /bin/true  "), vec!["/bin/true"]);
    }

    #[test]
    fn elapsed_since_never_goes_negative_for_future_timestamps() {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(elapsed_since(now + 60), Duration::ZERO);
    }

    #[tokio::test]
    async fn put_rejects_once_at_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileItemStore::new(dir.path().to_path_buf()).unwrap());
        let aliases = Arc::new(AliasTable::new(mailcore_aliases::AliasTableConfig::default()));
        let dns = Arc::new(crate::dns::DnsResolver::new().unwrap());
        let sts = Arc::new(mailcore_spool::StsCache::new(dir.path().join("sts")));
        let domaininfo = Arc::new(mailcore_spool::DomaininfoStore::new(dir.path().join("domaininfo")));
        let local = Arc::new(LocalCourier::new(crate::local::LocalCourierConfig::default()));
        let remote = Arc::new(RemoteCourier::new(dns, sts, domaininfo, crate::remote::RemoteCourierConfig::default()));

        let engine = QueueEngine::new(
            store,
            aliases,
            local,
            remote,
            Arc::new(HashSet::new()),
            DsnConfig::default(),
            QueueConfig { max_items: 0, give_up_after: Duration::from_secs(60) },
        );

        let err = engine.put("a@ex", &["b@ex".to_string()], b"hi".to_vec()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::System(SystemError::QueueFull)));
    }
}
