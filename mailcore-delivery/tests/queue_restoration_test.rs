//! Crash recovery: items already sitting on disk (as if the process had
//! been killed mid-delivery) are picked back up by `QueueEngine::recover`
//! and resume from their per-recipient status rather than restarting
//! from scratch.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mailcore_aliases::{AliasTable, AliasTableConfig};
use mailcore_common::Domain;
use mailcore_delivery::dns::DnsResolver;
use mailcore_delivery::dsn::DsnConfig;
use mailcore_delivery::local::{LocalCourier, LocalCourierConfig};
use mailcore_delivery::queue::{QueueConfig, QueueEngine};
use mailcore_delivery::remote::{RemoteCourier, RemoteCourierConfig};
use mailcore_spool::item::{QueueItem, QueuedRecipient, RecipientKind, RecipientStatus};
use mailcore_spool::{DomaininfoStore, FileItemStore, ItemStore, StsCache};

async fn wait_until_drained(store: &FileItemStore, tries: usize) {
    for _ in 0..tries {
        if store.list_ids().await.unwrap().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn recover_resumes_pending_recipients_and_drops_fully_sent_items() {
    let dir = tempfile::tempdir().unwrap();
    let outfile = dir.path().join("mailbox");

    let store = Arc::new(FileItemStore::new(dir.path().join("queue")).unwrap());
    store.ensure_dir().await.unwrap();

    // already fully delivered before the crash: recover should just clean it up
    let mut done = QueuedRecipient::new(RecipientKind::Email, "alice@local.test", "alice@local.test");
    done.status = RecipientStatus::Sent;
    let done_item = QueueItem::new(
        "sender@local.test",
        vec!["alice@local.test".to_string()],
        vec![done],
        b"Subject: done\r\n\r\nold".to_vec(),
    );
    store.put(&done_item).await.unwrap();

    // still pending when the crash happened: recover should retry it
    let pending = QueuedRecipient::new(RecipientKind::Email, "bob@local.test", "bob@local.test");
    let pending_item = QueueItem::new(
        "sender@local.test",
        vec!["bob@local.test".to_string()],
        vec![pending],
        b"Subject: pending\r\n\r\nrecovered body".to_vec(),
    );
    store.put(&pending_item).await.unwrap();

    let mut locals = HashSet::new();
    locals.insert(Domain::new("local.test"));

    let domaininfo = Arc::new(DomaininfoStore::new(dir.path().join("domaininfo")));
    domaininfo.ensure_dir().await.unwrap();
    let sts = Arc::new(StsCache::new(dir.path().join("sts")));
    sts.ensure_dir().await.unwrap();
    let dns = Arc::new(DnsResolver::new().unwrap());
    let aliases = Arc::new(AliasTable::new(AliasTableConfig::default()));

    let engine = QueueEngine::new(
        Arc::clone(&store),
        aliases,
        Arc::new(LocalCourier::new(LocalCourierConfig {
            command: PathBuf::from("sh"),
            args: vec!["-c".to_string(), format!("cat >> {}", outfile.display())],
            timeout: Duration::from_secs(5),
        })),
        Arc::new(RemoteCourier::new(dns, sts, domaininfo, RemoteCourierConfig::default())),
        Arc::new(locals),
        DsnConfig::default(),
        QueueConfig::default(),
    );

    let recovered = engine.recover().await.unwrap();
    assert_eq!(recovered, 2);

    wait_until_drained(&store, 40).await;

    let written = tokio::fs::read_to_string(&outfile).await.unwrap();
    assert!(written.contains("recovered body"));
    assert!(!written.contains("old"));
}

#[tokio::test]
async fn recover_on_an_empty_spool_finds_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileItemStore::new(dir.path().join("queue")).unwrap());
    store.ensure_dir().await.unwrap();

    let domaininfo = Arc::new(DomaininfoStore::new(dir.path().join("domaininfo")));
    let sts = Arc::new(StsCache::new(dir.path().join("sts")));
    let dns = Arc::new(DnsResolver::new().unwrap());
    let aliases = Arc::new(AliasTable::new(AliasTableConfig::default()));

    let engine = QueueEngine::new(
        store,
        aliases,
        Arc::new(LocalCourier::new(LocalCourierConfig::default())),
        Arc::new(RemoteCourier::new(dns, sts, domaininfo, RemoteCourierConfig::default())),
        Arc::new(HashSet::new()),
        DsnConfig::default(),
        QueueConfig::default(),
    );

    assert_eq!(engine.recover().await.unwrap(), 0);
}
