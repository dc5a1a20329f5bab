#![allow(clippy::expect_used, clippy::unwrap_used)]

use mailcore_spool::{
    FileItemStore, ItemStore, QueueItem, QueuedRecipient, RecipientKind, RecipientStatus,
};

fn item() -> QueueItem {
    QueueItem::new(
        "sender@example.com",
        vec!["rcpt@example.com".to_string()],
        vec![QueuedRecipient::new(
            RecipientKind::Email,
            "rcpt@example.com",
            "rcpt@example.com",
        )],
        b"From: sender\r\n\r\nbody".to_vec(),
    )
}

#[tokio::test]
async fn items_survive_a_simulated_restart() {
    let dir = tempfile::tempdir().expect("tempdir");

    let mut a = item();
    {
        let store = FileItemStore::new(dir.path()).expect("valid path");
        store.ensure_dir().await.expect("create dir");
        store.put(&a).await.expect("put a");

        a.rcpt[0].status = RecipientStatus::Sent;
        store.update(&a).await.expect("update a");
    }

    let reopened = FileItemStore::new(dir.path()).expect("valid path");
    let ids = reopened.list_ids().await.expect("list");
    assert_eq!(ids.len(), 1);

    let recovered = reopened.get(&a.id).await.expect("get");
    assert_eq!(recovered.rcpt[0].status, RecipientStatus::Sent);
    assert!(recovered.is_complete());
}

#[tokio::test]
async fn deleting_a_complete_item_removes_it_from_the_recovery_scan() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileItemStore::new(dir.path()).expect("valid path");
    store.ensure_dir().await.expect("create dir");

    let a = item();
    store.put(&a).await.expect("put");
    store.delete(&a.id).await.expect("delete");

    let ids = store.list_ids().await.expect("list");
    assert!(ids.is_empty());
}
