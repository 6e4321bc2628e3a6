mod common;

use common::TestDb;
use serde_json::json;
use std::time::Duration;
use relay_pgmq::{PgmqClient, PgmqListener};

// ---------------------------------------------------------------------------
// Test 1: Notify wakes a listener on the queue channel
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_notify_wakes_listener() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let client = PgmqClient::new(test_db.pool.clone());
    let q = format!("listen_{}", test_db.test_id);
    client.create_queue(&q).await.expect("create_queue");

    let mut listener = PgmqListener::connect(&test_db.pool)
        .await
        .expect("listener connect");
    listener.listen(&q).await.expect("listen");

    client.notify(&q).await.expect("notify");

    let channel = listener
        .recv_timeout(Duration::from_secs(5))
        .await
        .expect("recv_timeout")
        .expect("notification before deadline");
    assert_eq!(channel, q);

    let _ = client.drop_queue(&q).await;
}

// ---------------------------------------------------------------------------
// Test 2: recv_timeout returns None when nothing arrives
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_recv_timeout_elapses_quietly() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let q = format!("silent_{}", test_db.test_id);

    let client = PgmqClient::new(test_db.pool.clone());
    client.create_queue(&q).await.expect("create_queue");

    let mut listener = PgmqListener::connect(&test_db.pool)
        .await
        .expect("listener connect");
    listener.listen(&q).await.expect("listen");

    let woke = listener
        .recv_timeout(Duration::from_millis(200))
        .await
        .expect("recv_timeout");
    assert!(woke.is_none());

    let _ = client.drop_queue(&q).await;
}

// ---------------------------------------------------------------------------
// Test 3: Transactional notify is delivered at commit, not before
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_notify_in_transaction_delivered_at_commit() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let client = PgmqClient::new(test_db.pool.clone());
    let q = format!("txnotify_{}", test_db.test_id);
    client.create_queue(&q).await.expect("create_queue");

    let mut listener = PgmqListener::connect(&test_db.pool)
        .await
        .expect("listener connect");
    listener.listen(&q).await.expect("listen");

    let mut tx = test_db.pool.begin().await.expect("begin");
    client
        .send_in(&mut tx, &q, &json!({"wake": true}))
        .await
        .expect("send_in");
    client.notify_in(&mut tx, &q).await.expect("notify_in");

    // Not committed yet: no wake-up
    let early = listener
        .recv_timeout(Duration::from_millis(200))
        .await
        .expect("recv before commit");
    assert!(early.is_none());

    tx.commit().await.expect("commit");

    let channel = listener
        .recv_timeout(Duration::from_secs(5))
        .await
        .expect("recv after commit")
        .expect("notification after commit");
    assert_eq!(channel, q);

    // And the message is visible too
    let msgs = client.read(&q, 0, 10).await.expect("read");
    assert_eq!(msgs.len(), 1);

    let _ = client.drop_queue(&q).await;
}
