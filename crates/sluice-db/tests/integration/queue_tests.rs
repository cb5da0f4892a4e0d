use std::time::Duration;

use sluice_core::{AppError, QueueClient};
use sluice_db::PgQueue;

use crate::common::setup_test_db;

async fn queue(db: &sluice_db::Database, name: &str) -> PgQueue {
    let queue = db.queue(name);
    queue.ensure_exists().await.unwrap();
    queue
}

#[tokio::test]
async fn ensure_exists_is_idempotent() {
    let (db, _container) = setup_test_db().await;
    let q = queue(&db, "items").await;
    q.ensure_exists().await.unwrap();
    assert_eq!(q.len().await.unwrap(), 0);
}

#[tokio::test]
async fn send_then_receive_counts_delivery() {
    let (db, _container) = setup_test_db().await;
    let q = queue(&db, "items").await;

    let receipt = q.send_message(r#"{"operation":"noop"}"#).await.unwrap();
    assert!(receipt.expires_at > receipt.inserted_at);

    let received = q
        .receive_messages(10, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(received.len(), 1);
    let message = &received[0];
    assert_eq!(message.id, receipt.message_id);
    assert_eq!(message.raw_content, r#"{"operation":"noop"}"#);
    assert_eq!(message.dequeue_count, 1);
    assert!(message.next_visible_at > message.inserted_at);
    assert!(!message.ack_token.is_empty());
}

#[tokio::test]
async fn received_message_is_hidden_from_other_consumers() {
    let (db, _container) = setup_test_db().await;
    let q = queue(&db, "items").await;
    q.send_message("one").await.unwrap();

    let first = q.receive_messages(1, Duration::from_secs(30)).await.unwrap();
    let second = q.receive_messages(1, Duration::from_secs(30)).await.unwrap();

    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
}

#[tokio::test]
async fn message_reappears_after_visibility_timeout() {
    let (db, _container) = setup_test_db().await;
    let q = queue(&db, "items").await;
    q.send_message("retry me").await.unwrap();

    let first = q
        .receive_messages(1, Duration::from_millis(200))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let again = q
        .receive_messages(1, Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(again.len(), 1);
    assert_eq!(again[0].id, first[0].id);
    assert_eq!(again[0].dequeue_count, 2);
    assert_ne!(again[0].ack_token, first[0].ack_token);
}

#[tokio::test]
async fn receive_respects_max_and_insertion_order() {
    let (db, _container) = setup_test_db().await;
    let q = queue(&db, "items").await;
    for body in ["a", "b", "c"] {
        q.send_message(body).await.unwrap();
    }

    let batch = q.receive_messages(2, Duration::from_secs(30)).await.unwrap();
    let bodies: Vec<_> = batch.iter().map(|m| m.raw_content.as_str()).collect();
    assert_eq!(bodies, ["a", "b"]);
}

#[tokio::test]
async fn queues_are_isolated_by_name() {
    let (db, _container) = setup_test_db().await;
    let main = queue(&db, "items").await;
    let poison = queue(&db, "items-poison").await;
    poison.send_message("archived").await.unwrap();

    assert!(
        main.receive_messages(10, Duration::from_secs(30))
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(poison.len().await.unwrap(), 1);
}

#[tokio::test]
async fn delete_is_idempotent_and_token_checked() {
    let (db, _container) = setup_test_db().await;
    let q = queue(&db, "items").await;
    q.send_message("work").await.unwrap();
    let message = q
        .receive_messages(1, Duration::from_secs(30))
        .await
        .unwrap()
        .remove(0);

    let stale = q
        .delete_message(&message.id, &uuid::Uuid::new_v4().to_string())
        .await;
    assert!(matches!(stale, Err(AppError::MessageAlreadyDeleted(_))));

    q.delete_message(&message.id, &message.ack_token)
        .await
        .unwrap();
    let again = q.delete_message(&message.id, &message.ack_token).await;
    assert!(matches!(again, Err(AppError::MessageAlreadyDeleted(_))));
    assert_eq!(q.len().await.unwrap(), 0);
}

#[tokio::test]
async fn update_visibility_rotates_token() {
    let (db, _container) = setup_test_db().await;
    let q = queue(&db, "items").await;
    q.send_message("work").await.unwrap();
    let message = q
        .receive_messages(1, Duration::from_secs(30))
        .await
        .unwrap()
        .remove(0);

    let token = q
        .update_visibility(&message.id, &message.ack_token, Duration::ZERO)
        .await
        .unwrap();
    assert_ne!(token, message.ack_token);

    let old = q.delete_message(&message.id, &message.ack_token).await;
    assert!(matches!(old, Err(AppError::MessageAlreadyDeleted(_))));

    let visible = q
        .receive_messages(1, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].dequeue_count, 2);
}

#[tokio::test]
async fn expired_messages_are_purged() {
    let (db, _container) = setup_test_db().await;
    let q = queue(&db, "items")
        .await
        .with_message_ttl(Duration::from_millis(100));
    q.send_message("short lived").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let received = q
        .receive_messages(10, Duration::from_secs(30))
        .await
        .unwrap();
    assert!(received.is_empty());
    assert_eq!(q.len().await.unwrap(), 0);
}

#[tokio::test]
async fn concurrent_receivers_never_share_a_message() {
    let (db, _container) = setup_test_db().await;
    let q = queue(&db, "items").await;
    for i in 0..20 {
        q.send_message(&i.to_string()).await.unwrap();
    }

    let (a, b) = tokio::join!(
        q.receive_messages(15, Duration::from_secs(30)),
        q.receive_messages(15, Duration::from_secs(30)),
    );
    let mut ids: Vec<_> = a
        .unwrap()
        .into_iter()
        .chain(b.unwrap())
        .map(|m| m.id)
        .collect();
    let total = ids.len();
    ids.sort();
    ids.dedup();

    assert_eq!(total, 20);
    assert_eq!(ids.len(), 20);
}
