#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::io::Write;

use mailcore_aliases::{AliasTable, AliasTableConfig};
use mailcore_common::Domain;

fn write_file(contents: &str) -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().expect("create temp file");
    f.write_all(contents.as_bytes()).expect("write temp file");
    f
}

#[tokio::test]
async fn list_alias_expands_to_members() {
    let file = write_file("list: alice, bob\n");
    let table = AliasTable::new(AliasTableConfig::default());
    table
        .add_aliases_file(Domain::new("example.test"), file.path())
        .await
        .unwrap();

    let resolved = table.resolve("list@example.test").await.unwrap();
    let targets: Vec<&str> = resolved.iter().map(|r| r.target.as_str()).collect();
    assert_eq!(targets, vec!["alice@example.test", "bob@example.test"]);
    assert!(resolved.iter().all(|r| r.original == "list@example.test"));
}

#[tokio::test]
async fn catch_all_resolves_unmatched_addresses() {
    let file = write_file("*: catchall\n");
    let table = AliasTable::new(AliasTableConfig::default());
    table
        .add_aliases_file(Domain::new("example.test"), file.path())
        .await
        .unwrap();

    let resolved = table.resolve("anyone@example.test").await.unwrap();
    assert_eq!(resolved[0].target, "catchall@example.test");
}

#[tokio::test]
async fn nested_alias_chains_expand_recursively() {
    let file = write_file("outer: middle\nmiddle: alice\n");
    let table = AliasTable::new(AliasTableConfig::default());
    table
        .add_aliases_file(Domain::new("example.test"), file.path())
        .await
        .unwrap();

    let resolved = table.resolve("outer@example.test").await.unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].target, "alice@example.test");
}

#[tokio::test]
async fn pipe_recipient_is_terminal() {
    let file = write_file("alice: | /usr/bin/procmail -d alice\n");
    let table = AliasTable::new(AliasTableConfig::default());
    table
        .add_aliases_file(Domain::new("example.test"), file.path())
        .await
        .unwrap();

    let resolved = table.resolve("alice@example.test").await.unwrap();
    assert_eq!(resolved.len(), 1);
    assert!(!resolved[0].is_email());
    assert_eq!(resolved[0].target, "/usr/bin/procmail -d alice");
}

#[tokio::test]
async fn forward_recipient_carries_explicit_relays() {
    let file = write_file("list: > relay1.test,relay2.test big@far.test\n");
    let table = AliasTable::new(AliasTableConfig::default());
    table
        .add_aliases_file(Domain::new("example.test"), file.path())
        .await
        .unwrap();

    let resolved = table.resolve("list@example.test").await.unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!(resolved[0].target, "big@far.test");
    assert_eq!(
        resolved[0].via.as_deref(),
        Some(&["relay1.test".to_string(), "relay2.test".to_string()][..])
    );
}

#[tokio::test]
async fn reload_picks_up_file_changes() {
    let file = write_file("alice: bob\n");
    let table = AliasTable::new(AliasTableConfig::default());
    table
        .add_aliases_file(Domain::new("example.test"), file.path())
        .await
        .unwrap();

    std::fs::write(file.path(), "alice: carol\n").unwrap();
    table.reload().await.unwrap();

    let resolved = table.resolve("alice@example.test").await.unwrap();
    assert_eq!(resolved[0].target, "carol@example.test");
}
