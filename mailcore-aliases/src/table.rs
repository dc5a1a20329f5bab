//! The alias table (C2, §4.2): recursive alias expansion over one or
//! more local domains.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use ahash::{AHashMap, AHashSet};
use mailcore_common::Domain;
use mailcore_tracing::traced;
use parking_lot::RwLock;
use tokio::process::Command;
use tokio::time::timeout;

use crate::{
    error::{AliasError, Result},
    parse,
    types::{Recipient, RecipientKind},
};

const MAX_RECURSION_DEPTH: usize = 10;
const HOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// A predicate answering "does this mailbox exist", consulted when an
/// address has no alias entry of its own. Typically backed by the
/// embedder's user database; a table with no predicate treats every
/// address without an alias as nonexistent.
pub type UserExists = Arc<dyn Fn(&str) -> bool + Send + Sync>;

struct Inner {
    domains: AHashSet<Domain>,
    files: AHashMap<Domain, Vec<PathBuf>>,
    aliases: AHashMap<String, Vec<Recipient>>,
}

/// Loads alias files for a set of local domains and resolves envelope
/// recipients against them.
///
/// Resolution is depth-first: an alias's targets are themselves
/// resolved, recursively, up to [`MAX_RECURSION_DEPTH`] levels. PIPE and
/// FORWARD recipients are terminal — they are never re-expanded.
pub struct AliasTable {
    inner: RwLock<Inner>,
    suffix_sep: Option<char>,
    drop_chars: Vec<char>,
    resolve_hook: Option<PathBuf>,
    user_exists: Option<UserExists>,
}

/// Configuration knobs that parallel a traditional `sendmail`-style
/// local-part cleaning pass (§4.2).
#[derive(Default)]
pub struct AliasTableConfig {
    /// Character separating the local part from a detail suffix, e.g.
    /// `+` in `alice+newsletter@example.com`. When set, a lookup that
    /// misses the full local part retries with everything from this
    /// character onward stripped.
    pub suffix_sep: Option<char>,
    /// Characters stripped from the local part before a further lookup
    /// retry, e.g. `.` so `a.l.i.c.e@x` falls back to `alice@x`.
    pub drop_chars: Vec<char>,
    /// External command invoked with the address as its sole argument
    /// when no other rule matches. Its stdout is parsed one recipient
    /// per line using the same RHS grammar as alias files.
    pub resolve_hook: Option<PathBuf>,
    /// Predicate used to decide whether an address with no alias entry
    /// should still resolve to itself as a plain mailbox delivery.
    pub user_exists: Option<UserExists>,
}

impl AliasTable {
    #[must_use]
    pub fn new(config: AliasTableConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                domains: AHashSet::new(),
                files: AHashMap::new(),
                aliases: AHashMap::new(),
            }),
            suffix_sep: config.suffix_sep,
            drop_chars: config.drop_chars,
            resolve_hook: config.resolve_hook,
            user_exists: config.user_exists,
        }
    }

    /// Registers `domain` as local. Addresses in other domains are
    /// never looked up in the alias table; [`resolve`](Self::resolve)
    /// returns them as a single unexpanded EMAIL recipient.
    pub fn add_domain(&self, domain: Domain) {
        self.inner.write().domains.insert(domain);
    }

    #[must_use]
    pub fn is_local(&self, domain: &Domain) -> bool {
        self.inner.read().domains.contains(domain)
    }

    /// Loads `path` as an alias file for `domain`, merging its entries
    /// into the table. Multiple files may contribute to the same
    /// domain; a later file's entries for a duplicate key are appended
    /// rather than replacing the earlier ones.
    ///
    /// # Errors
    ///
    /// Returns [`AliasError::Io`] if the file cannot be read.
    #[traced]
    pub async fn add_aliases_file(&self, domain: Domain, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref().to_path_buf();
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| AliasError::Io {
                path: path.display().to_string(),
                source,
            })?;

        let entries = parse::parse_file(&contents, &domain);

        let mut inner = self.inner.write();
        inner.domains.insert(domain.clone());
        inner.files.entry(domain).or_default().push(path);
        for entry in entries {
            inner.aliases.entry(entry.key).or_default().extend(entry.recipients);
        }

        Ok(())
    }

    /// Re-reads every registered alias file from scratch, discarding
    /// any entries previously loaded from files (programmatically
    /// registered entries, if any, are not affected by this method —
    /// the table currently has no such API, so this simply rebuilds
    /// the whole map).
    ///
    /// # Errors
    ///
    /// Returns [`AliasError::Io`] if any registered file can no longer
    /// be read.
    #[traced]
    pub async fn reload(&self) -> Result<()> {
        let files: Vec<(Domain, Vec<PathBuf>)> = {
            let inner = self.inner.read();
            inner.files.iter().map(|(d, p)| (d.clone(), p.clone())).collect()
        };

        let mut aliases: AHashMap<String, Vec<Recipient>> = AHashMap::new();
        for (domain, paths) in &files {
            for path in paths {
                let contents =
                    tokio::fs::read_to_string(path)
                        .await
                        .map_err(|source| AliasError::Io {
                            path: path.display().to_string(),
                            source,
                        })?;
                for entry in parse::parse_file(&contents, domain) {
                    aliases.entry(entry.key).or_insert_with(Vec::new).extend(entry.recipients);
                }
            }
        }

        self.inner.write().aliases = aliases;
        Ok(())
    }

    /// Whether `address` would resolve to something deliverable: it has
    /// an alias entry (direct or cleaned), it answers yes to the
    /// configured `user_exists` predicate, or it falls under a domain
    /// catch-all.
    #[must_use]
    pub fn exists(&self, address: &str) -> bool {
        if self.lookup(address).is_some() {
            return true;
        }
        if self.user_exists.as_ref().is_some_and(|f| f(address)) {
            return true;
        }
        let Some((_, domain)) = split_domain(address) else {
            return false;
        };
        self.catch_all(&domain).is_some()
    }

    /// Expands `address` into its concrete delivery targets.
    ///
    /// Non-local addresses are returned unexpanded as a single EMAIL
    /// recipient. Local addresses are looked up directly, then against a
    /// single cleaned key (detail suffix stripped, then drop-characters
    /// removed from what's left), then through the external resolve
    /// hook; if still unmatched and the address passes `user_exists`, it
    /// resolves to itself as a plain mailbox; only after that does a
    /// domain catch-all apply, so a catch-all never shadows a real local
    /// mailbox that simply has no alias entry of its own.
    ///
    /// # Errors
    ///
    /// Returns [`AliasError::RecursionLimitExceeded`] if expansion
    /// recurses past the depth cap (e.g. a catch-all alias loop), and
    /// propagates [`AliasError::HookFailed`]/[`AliasError::HookTimeout`]
    /// from a misbehaving resolve hook.
    #[traced]
    pub async fn resolve(&self, address: &str) -> Result<Vec<Recipient>> {
        self.resolve_depth(address, 0).await
    }

    async fn resolve_depth(&self, address: &str, depth: usize) -> Result<Vec<Recipient>> {
        if depth >= MAX_RECURSION_DEPTH {
            return Err(AliasError::RecursionLimitExceeded(address.to_string()));
        }

        let Some((_, domain)) = split_domain(address) else {
            return Ok(vec![Recipient::email(address, address)]);
        };

        if !self.is_local(&domain) {
            return Ok(vec![Recipient::email(address, address)]);
        }

        if let Some(targets) = self.lookup(address) {
            return self.expand_all(&targets, address, depth).await;
        }

        if let Some(hook) = &self.resolve_hook {
            if let Some(targets) = self.run_hook(hook, address).await? {
                return self.expand_all(&targets, address, depth).await;
            }
        }

        if self.user_exists.as_ref().is_some_and(|f| f(address)) {
            return Ok(vec![Recipient::email(address, address)]);
        }

        if let Some(targets) = self.catch_all(&domain) {
            return self.expand_all(&targets, address, depth).await;
        }

        Ok(Vec::new())
    }

    /// Looks up `address` directly, then against a single cleaned key:
    /// the detail suffix (if any) stripped, then drop-characters removed
    /// from whatever remains. Does not consult the domain catch-all —
    /// that's [`Self::catch_all`], checked later so it never shadows a
    /// real local mailbox that just has no alias entry.
    fn lookup(&self, address: &str) -> Option<Vec<Recipient>> {
        let inner = self.inner.read();

        if let Some(targets) = inner.aliases.get(address) {
            return Some(targets.clone());
        }

        let (user, domain) = split_domain(address)?;

        let mut cleaned = user.clone();
        if let Some(sep) = self.suffix_sep {
            if let Some(idx) = cleaned.find(sep) {
                cleaned.truncate(idx);
            }
        }
        if !self.drop_chars.is_empty() {
            cleaned = cleaned.chars().filter(|c| !self.drop_chars.contains(c)).collect();
        }

        if cleaned == user {
            return None;
        }

        let key = format!("{cleaned}@{domain}");
        inner.aliases.get(&key).cloned()
    }

    fn catch_all(&self, domain: &Domain) -> Option<Vec<Recipient>> {
        let inner = self.inner.read();
        inner.aliases.get(&format!("*@{domain}")).cloned()
    }

    async fn expand_all(
        &self,
        targets: &[Recipient],
        original: &str,
        depth: usize,
    ) -> Result<Vec<Recipient>> {
        let mut out = Vec::with_capacity(targets.len());
        for target in targets {
            match target.kind {
                RecipientKind::Pipe | RecipientKind::Forward => {
                    let mut r = target.clone();
                    r.original = original.to_string();
                    out.push(r);
                }
                RecipientKind::Email => {
                    let expanded = Box::pin(self.resolve_depth(&target.target, depth + 1)).await?;
                    if expanded.is_empty() {
                        // No alias and no such mailbox: deliver as given.
                        let mut r = target.clone();
                        r.original = original.to_string();
                        out.push(r);
                    } else {
                        for mut r in expanded {
                            r.original = original.to_string();
                            out.push(r);
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    async fn run_hook(&self, hook: &Path, address: &str) -> Result<Option<Vec<Recipient>>> {
        if !hook.exists() {
            return Ok(None);
        }

        let run = async {
            let output = Command::new(hook).arg(address).output().await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    AliasError::HookMissing
                } else {
                    AliasError::HookFailed(e.to_string())
                }
            })?;

            if !output.status.success() {
                return Err(AliasError::HookFailed(format!(
                    "exit status {}",
                    output.status
                )));
            }

            let stdout = String::from_utf8_lossy(&output.stdout);
            let recipients: Vec<Recipient> =
                stdout.lines().filter_map(parse::parse_hook_line).collect();

            Ok(recipients)
        };

        match timeout(HOOK_TIMEOUT, run).await {
            Ok(Ok(recipients)) if recipients.is_empty() => Ok(None),
            Ok(Ok(recipients)) => Ok(Some(recipients)),
            Ok(Err(AliasError::HookMissing)) => Ok(None),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(AliasError::HookTimeout),
        }
    }
}

fn split_domain(address: &str) -> Option<(String, Domain)> {
    let (user, domain) = address.split_once('@')?;
    if domain.is_empty() {
        return None;
    }
    Some((user.to_string(), Domain::new(domain)))
}
