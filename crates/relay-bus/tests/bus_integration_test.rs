mod common;

use common::TestDb;
use serde_json::json;
use uuid::Uuid;

use relay_bus::CommandBus;
use relay_shared::models::{
    AuditEventType, CommandQuery, CommandStatus, SendRequest,
};
use relay_shared::{queues, RelayError};

// ---------------------------------------------------------------------------
// Test 1: Single send stores metadata, queue message and SENT audit event
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_send_stores_metadata_message_and_audit() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("payments");
    bus.ensure_domain(&domain).await.expect("ensure_domain");

    let command_id = Uuid::new_v4();
    let result = bus
        .send(SendRequest::new(
            &domain,
            "DebitAccount",
            command_id,
            json!({"acct": "A", "amt": 100}),
        ))
        .await
        .expect("send");

    assert_eq!(result.command_id, command_id);
    assert!(result.msg_id > 0);

    // Metadata
    let metadata = bus
        .get_command(&domain, command_id)
        .await
        .expect("get_command")
        .expect("metadata present");
    assert_eq!(metadata.status, CommandStatus::Pending);
    assert_eq!(metadata.attempts, 0);
    assert_eq!(metadata.max_attempts, 3);
    assert_eq!(metadata.msg_id, Some(result.msg_id));
    assert!(metadata.correlation_id.is_some(), "correlation id generated");
    assert!(metadata.reply_to.is_none());

    // Queue message carries the envelope
    let msgs = bus
        .queue()
        .read(&queues::command_queue(&domain), 0, 10)
        .await
        .expect("read");
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].message["command_type"], "DebitAccount");
    assert_eq!(msgs[0].message["command_id"], command_id.to_string());
    assert_eq!(msgs[0].message["data"]["amt"], 100);

    // Audit trail
    let trail = bus
        .get_audit_trail(command_id, Some(&domain))
        .await
        .expect("audit trail");
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].event_type, AuditEventType::Sent);
    assert_eq!(trail[0].details.as_ref().unwrap()["msg_id"], result.msg_id);
}

// ---------------------------------------------------------------------------
// Test 2: Duplicate submission surfaces DuplicateCommand, stores nothing new
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_duplicate_send_rejected() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("payments");
    bus.ensure_domain(&domain).await.expect("ensure_domain");

    let command_id = Uuid::new_v4();
    bus.send(SendRequest::new(&domain, "DebitAccount", command_id, json!({})))
        .await
        .expect("first send");

    let err = bus
        .send(SendRequest::new(&domain, "DebitAccount", command_id, json!({})))
        .await
        .expect_err("second send must fail");
    assert!(matches!(err, RelayError::DuplicateCommand { .. }));

    // Exactly one queue message and one SENT event
    let msgs = bus
        .queue()
        .read(&queues::command_queue(&domain), 0, 10)
        .await
        .expect("read");
    assert_eq!(msgs.len(), 1);

    let trail = bus
        .get_audit_trail(command_id, Some(&domain))
        .await
        .expect("audit trail");
    assert_eq!(trail.len(), 1);
}

// ---------------------------------------------------------------------------
// Test 3: Same command_id in different domains is allowed
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_cross_domain_collision_allowed() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let payments = test_db.domain("payments");
    let orders = test_db.domain("orders");
    bus.ensure_domain(&payments).await.expect("ensure payments");
    bus.ensure_domain(&orders).await.expect("ensure orders");

    let command_id = Uuid::new_v4();
    bus.send(SendRequest::new(&payments, "Noop", command_id, json!({})))
        .await
        .expect("payments send");
    bus.send(SendRequest::new(&orders, "Noop", command_id, json!({})))
        .await
        .expect("orders send");

    assert!(bus.command_exists(&payments, command_id).await.unwrap());
    assert!(bus.command_exists(&orders, command_id).await.unwrap());
}

// ---------------------------------------------------------------------------
// Test 4: Send with unknown batch_id fails with BatchNotFound
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_send_with_unknown_batch_rejected() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("payments");
    bus.ensure_domain(&domain).await.expect("ensure_domain");

    let err = bus
        .send(
            SendRequest::new(&domain, "Noop", Uuid::new_v4(), json!({}))
                .with_batch_id(Uuid::new_v4()),
        )
        .await
        .expect_err("unknown batch must fail");
    assert!(matches!(err, RelayError::BatchNotFound { .. }));
}

// ---------------------------------------------------------------------------
// Test 5: Reply-to and explicit overrides are preserved
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_send_preserves_overrides() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("payments");
    bus.ensure_domain(&domain).await.expect("ensure_domain");

    let command_id = Uuid::new_v4();
    let correlation_id = Uuid::new_v4();
    let reply_queue = queues::reply_queue(&domain);

    bus.send(
        SendRequest::new(&domain, "DebitAccount", command_id, json!({}))
            .with_correlation_id(correlation_id)
            .with_reply_to(&reply_queue)
            .with_max_attempts(7),
    )
    .await
    .expect("send");

    let metadata = bus
        .get_command(&domain, command_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metadata.correlation_id, Some(correlation_id));
    assert_eq!(metadata.reply_to.as_deref(), Some(reply_queue.as_str()));
    assert_eq!(metadata.max_attempts, 7);

    let msgs = bus
        .queue()
        .read(&queues::command_queue(&domain), 0, 10)
        .await
        .expect("read");
    assert_eq!(msgs[0].message["correlation_id"], correlation_id.to_string());
    assert_eq!(msgs[0].message["reply_to"], reply_queue);
}

// ---------------------------------------------------------------------------
// Test 6: Bulk send groups by domain and enqueues everything
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_send_batch_multi_domain() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let payments = test_db.domain("payments");
    let orders = test_db.domain("orders");
    bus.ensure_domain(&payments).await.expect("ensure payments");
    bus.ensure_domain(&orders).await.expect("ensure orders");

    let mut requests = Vec::new();
    for i in 0..6 {
        let domain = if i % 2 == 0 { &payments } else { &orders };
        requests.push(SendRequest::new(
            domain,
            "Noop",
            Uuid::new_v4(),
            json!({"idx": i}),
        ));
    }

    let result = bus.send_batch(requests, Some(4)).await.expect("send_batch");
    assert_eq!(result.total_commands, 6);
    assert_eq!(result.chunks_processed, 2);
    assert_eq!(result.results.len(), 6);

    let payments_msgs = bus
        .queue()
        .read(&queues::command_queue(&payments), 0, 10)
        .await
        .expect("read payments");
    let orders_msgs = bus
        .queue()
        .read(&queues::command_queue(&orders), 0, 10)
        .await
        .expect("read orders");
    assert_eq!(payments_msgs.len(), 3);
    assert_eq!(orders_msgs.len(), 3);
}

// ---------------------------------------------------------------------------
// Test 7: Bulk send with a duplicate aborts the offending chunk atomically
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_send_batch_duplicate_aborts_chunk() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("payments");
    bus.ensure_domain(&domain).await.expect("ensure_domain");

    let existing_id = Uuid::new_v4();
    bus.send(SendRequest::new(&domain, "Noop", existing_id, json!({})))
        .await
        .expect("seed send");

    let requests = vec![
        SendRequest::new(&domain, "Noop", Uuid::new_v4(), json!({})),
        SendRequest::new(&domain, "Noop", existing_id, json!({})),
    ];

    let err = bus
        .send_batch(requests, None)
        .await
        .expect_err("duplicate in chunk must fail");
    assert!(matches!(err, RelayError::DuplicateCommand { .. }));

    // The whole chunk rolled back: only the seed message remains
    let msgs = bus
        .queue()
        .read(&queues::command_queue(&domain), 0, 10)
        .await
        .expect("read");
    assert_eq!(msgs.len(), 1);
}

// ---------------------------------------------------------------------------
// Test 8: query_commands filters and orders newest-first
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_query_commands_filters() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("payments");
    bus.ensure_domain(&domain).await.expect("ensure_domain");

    for i in 0..3 {
        bus.send(SendRequest::new(
            &domain,
            if i == 0 { "DebitAccount" } else { "CreditAccount" },
            Uuid::new_v4(),
            json!({}),
        ))
        .await
        .expect("send");
    }

    let mut filter = CommandQuery::new();
    filter.domain = Some(domain.clone());
    let all = bus.query_commands(&filter).await.expect("query all");
    assert_eq!(all.len(), 3);
    // Newest first
    assert!(all[0].created_at >= all[2].created_at);

    filter.command_type = Some("DebitAccount".to_string());
    let debits = bus.query_commands(&filter).await.expect("query debits");
    assert_eq!(debits.len(), 1);

    let mut status_filter = CommandQuery::new();
    status_filter.domain = Some(domain.clone());
    status_filter.status = Some(CommandStatus::Completed);
    let completed = bus
        .query_commands(&status_filter)
        .await
        .expect("query completed");
    assert!(completed.is_empty());
}

// ---------------------------------------------------------------------------
// Test 9: Pagination via limit/offset
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_query_commands_pagination() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("payments");
    bus.ensure_domain(&domain).await.expect("ensure_domain");

    for _ in 0..5 {
        bus.send(SendRequest::new(&domain, "Noop", Uuid::new_v4(), json!({})))
            .await
            .expect("send");
    }

    let mut filter = CommandQuery::new();
    filter.domain = Some(domain.clone());
    filter.limit = 2;

    let page1 = bus.query_commands(&filter).await.expect("page1");
    filter.offset = 2;
    let page2 = bus.query_commands(&filter).await.expect("page2");
    filter.offset = 4;
    let page3 = bus.query_commands(&filter).await.expect("page3");

    assert_eq!(page1.len(), 2);
    assert_eq!(page2.len(), 2);
    assert_eq!(page3.len(), 1);

    let mut seen = std::collections::HashSet::new();
    for metadata in page1.iter().chain(&page2).chain(&page3) {
        assert!(seen.insert(metadata.command_id), "no overlap across pages");
    }
}

// ---------------------------------------------------------------------------
// Test 10: Concurrent duplicate submissions — exactly one winner (P1)
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_concurrent_duplicate_submission() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("payments");
    bus.ensure_domain(&domain).await.expect("ensure_domain");

    let command_id = Uuid::new_v4();
    let mut tasks = Vec::new();
    for _ in 0..4 {
        let bus = bus.clone();
        let domain = domain.clone();
        tasks.push(tokio::spawn(async move {
            bus.send(SendRequest::new(&domain, "Noop", command_id, json!({})))
                .await
        }));
    }

    let mut successes = 0;
    let mut duplicates = 0;
    for task in tasks {
        match task.await.expect("join") {
            Ok(_) => successes += 1,
            Err(RelayError::DuplicateCommand { .. }) => duplicates += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(successes, 1, "exactly one submission wins");
    assert_eq!(duplicates, 3);

    let trail = bus
        .get_audit_trail(command_id, Some(&domain))
        .await
        .expect("audit");
    assert_eq!(trail.len(), 1, "exactly one SENT event");
}
