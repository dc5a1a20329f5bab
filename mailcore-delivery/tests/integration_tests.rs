//! End-to-end tests driving `QueueEngine` through real couriers: a
//! spawned shell command for local delivery, and `support::mock_server`
//! standing in for a remote MX.

mod support;

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
use mailcore_spool::{DomaininfoStore, FileItemStore, ItemStore, StsCache};
use support::mock_server::{MockSmtpServer, SmtpCommand};

struct Harness {
    engine: Arc<QueueEngine>,
    store: Arc<FileItemStore>,
    aliases: Arc<AliasTable>,
    _dir: tempfile::TempDir,
}

/// Builds a fully wired queue engine over a fresh temp directory. Every
/// local domain in `local_domains` accepts any address (`user_exists`
/// always true) unless the test installs its own alias file afterward.
async fn harness(local_domains: HashSet<Domain>, local: LocalCourierConfig, max_items: usize) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileItemStore::new(dir.path().join("queue")).unwrap());
    store.ensure_dir().await.unwrap();
    let domaininfo = Arc::new(DomaininfoStore::new(dir.path().join("domaininfo")));
    domaininfo.ensure_dir().await.unwrap();
    let sts = Arc::new(StsCache::new(dir.path().join("sts")));
    sts.ensure_dir().await.unwrap();
    let dns = Arc::new(DnsResolver::new().unwrap());

    let aliases = Arc::new(AliasTable::new(AliasTableConfig {
        user_exists: Some(Arc::new(|_: &str| true)),
        ..AliasTableConfig::default()
    }));
    for domain in &local_domains {
        aliases.add_domain(domain.clone());
    }

    let engine = QueueEngine::new(
        Arc::clone(&store),
        Arc::clone(&aliases),
        Arc::new(LocalCourier::new(local)),
        Arc::new(RemoteCourier::new(dns, sts, domaininfo, RemoteCourierConfig::default())),
        Arc::new(local_domains),
        DsnConfig::default(),
        QueueConfig {
            max_items,
            give_up_after: Duration::from_secs(60),
        },
    );

    Harness { engine, store, aliases, _dir: dir }
}

async fn wait_until_drained(store: &FileItemStore, tries: usize) {
    for _ in 0..tries {
        if store.list_ids().await.unwrap().is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn local_delivery_writes_message_to_configured_command() {
    let dir = tempfile::tempdir().unwrap();
    let outfile = dir.path().join("mailbox");

    let mut locals = HashSet::new();
    locals.insert(Domain::new("local.test"));

    let h = harness(
        locals,
        LocalCourierConfig {
            command: PathBuf::from("sh"),
            args: vec!["-c".to_string(), format!("cat >> {}", outfile.display())],
            timeout: Duration::from_secs(5),
        },
        10,
    )
    .await;

    h.engine
        .put("sender@local.test", &["alice@local.test".to_string()], b"Subject: hi\r\n\r\nbody text".to_vec())
        .await
        .unwrap();

    wait_until_drained(&h.store, 40).await;

    let written = tokio::fs::read_to_string(&outfile).await.unwrap();
    assert!(written.contains("body text"));
}

#[tokio::test]
async fn local_delivery_permanent_failure_generates_dsn() {
    let dir = tempfile::tempdir().unwrap();
    let logfile = dir.path().join("attempts.log");

    let mut locals = HashSet::new();
    locals.insert(Domain::new("local.test"));

    // every local delivery attempt (original and, later, the bounce it
    // produces) is logged here before being permanently rejected
    let h = harness(
        locals,
        LocalCourierConfig {
            command: PathBuf::from("sh"),
            args: vec!["-c".to_string(), format!("cat >> {}; exit 1", logfile.display())],
            timeout: Duration::from_secs(5),
        },
        10,
    )
    .await;

    h.engine
        .put("sender@local.test", &["bob@local.test".to_string()], b"Subject: hi\r\n\r\nbody".to_vec())
        .await
        .unwrap();

    // the original attempt fails permanently and queues a bounce back to
    // the sender, which is itself local and also gets logged before
    // failing permanently a second time (a DSN never spawns its own DSN)
    wait_until_drained(&h.store, 60).await;
    assert!(h.store.list_ids().await.unwrap().is_empty());

    let log = tokio::fs::read_to_string(&logfile).await.unwrap();
    assert!(log.contains("Subject: hi"));
    assert!(log.contains("multipart/report"));
    assert!(log.contains("bob@local.test"));
}

#[tokio::test]
async fn put_rejects_once_active_items_reach_capacity() {
    let mut locals = HashSet::new();
    locals.insert(Domain::new("local.test"));

    let h = harness(
        locals,
        LocalCourierConfig {
            command: PathBuf::from("sh"),
            args: vec!["-c".to_string(), "sleep 5".to_string()],
            timeout: Duration::from_secs(10),
        },
        1,
    )
    .await;

    h.engine
        .put("a@local.test", &["b@local.test".to_string()], b"one".to_vec())
        .await
        .unwrap();

    let err = h
        .engine
        .put("a@local.test", &["c@local.test".to_string()], b"two".to_vec())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        mailcore_delivery::DeliveryError::System(mailcore_delivery::SystemError::QueueFull)
    ));
}

#[tokio::test]
async fn remote_forward_delivers_against_mock_smtp_server() {
    let server = MockSmtpServer::builder().build().await.unwrap();

    let mut locals = HashSet::new();
    locals.insert(Domain::new("local.test"));

    let h = harness(locals, LocalCourierConfig::default(), 10).await;

    let dir = tempfile::tempdir().unwrap();
    let alias_file = dir.path().join("local.test");
    tokio::fs::write(
        &alias_file,
        format!("relay: > {} bob@remote.test\n", server.addr()),
    )
    .await
    .unwrap();
    h.aliases.add_aliases_file(Domain::new("local.test"), &alias_file).await.unwrap();

    h.engine
        .put("sender@local.test", &["relay@local.test".to_string()], b"Subject: hi\r\n\r\nforwarded".to_vec())
        .await
        .unwrap();

    wait_until_drained(&h.store, 60).await;

    let commands = server.commands().await;
    assert!(commands.iter().any(|c| matches!(c, SmtpCommand::MailFrom(_))));
    assert!(commands.iter().any(|c| matches!(c, SmtpCommand::RcptTo(addr) if addr.contains("bob@remote.test"))));
    assert!(commands.iter().any(|c| matches!(c, SmtpCommand::MessageContent(body) if String::from_utf8_lossy(body).contains("forwarded"))));

    server.shutdown();
}

#[tokio::test]
async fn remote_forward_classifies_5xx_rcpt_as_permanent_and_bounces() {
    let server = MockSmtpServer::builder()
        .with_rcpt_to_response(550, "no such user")
        .build()
        .await
        .unwrap();

    let mut locals = HashSet::new();
    locals.insert(Domain::new("local.test"));
    // the bounce this produces addresses the sender, which is local; give
    // it a courier that terminates (instead of the unconfigured default
    // MDA path) so the whole send loop converges deterministically
    let bounce_courier = LocalCourierConfig {
        command: PathBuf::from("false"),
        args: Vec::new(),
        timeout: Duration::from_secs(5),
    };
    let h = harness(locals, bounce_courier, 10).await;

    let dir = tempfile::tempdir().unwrap();
    let alias_file = dir.path().join("local.test");
    tokio::fs::write(
        &alias_file,
        format!("relay: > {} bob@remote.test\n", server.addr()),
    )
    .await
    .unwrap();
    h.aliases.add_aliases_file(Domain::new("local.test"), &alias_file).await.unwrap();

    h.engine
        .put("sender@local.test", &["relay@local.test".to_string()], b"Subject: hi\r\n\r\nbody".to_vec())
        .await
        .unwrap();

    wait_until_drained(&h.store, 60).await;
    assert!(h.store.list_ids().await.unwrap().is_empty());

    server.shutdown();
}
