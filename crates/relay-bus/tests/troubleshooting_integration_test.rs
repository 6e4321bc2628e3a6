mod common;

use common::TestDb;
use serde_json::json;
use uuid::Uuid;

use relay_bus::{CommandBus, TroubleshootingFilter, TroubleshootingQueue};
use relay_shared::models::{
    AuditEventType, CommandError, CommandStatus, ErrorKind, SendRequest,
};
use relay_shared::{queues, RelayError};

/// Drive a freshly-sent command into IN_TROUBLESHOOTING_QUEUE the way the
/// worker does on a permanent failure: receive, archive, finish to TSQ.
async fn move_to_tsq(test_db: &TestDb, bus: &CommandBus, domain: &str, command_id: Uuid) {
    let queue_name = queues::command_queue(domain);
    let msgs = bus.queue().read(&queue_name, 30, 10).await.expect("read");
    let msg = msgs
        .iter()
        .find(|m| m.message["command_id"] == command_id.to_string())
        .expect("message on queue");

    let mut tx = test_db.pool.begin().await.expect("begin");
    let metadata = bus
        .commands()
        .sp_receive_command_in(&mut tx, domain, command_id, Some(msg.msg_id), None)
        .await
        .expect("sp_receive")
        .expect("not terminal");

    bus.queue()
        .archive_in(&mut tx, &queue_name, msg.msg_id)
        .await
        .expect("archive");
    bus.commands()
        .sp_finish_command_in(
            &mut tx,
            domain,
            command_id,
            CommandStatus::InTroubleshootingQueue,
            AuditEventType::MovedToTsq,
            Some(&CommandError::new(
                ErrorKind::Permanent,
                "INVALID_ACCOUNT",
                "Account not found",
            )),
            Some(&json!({"reason": "PERMANENT"})),
            metadata.batch_id,
        )
        .await
        .expect("sp_finish");
    tx.commit().await.expect("commit");
}

// ---------------------------------------------------------------------------
// Test 1: Listing joins the archived payload; count mirrors the filters
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_list_and_count() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("payments");
    bus.ensure_domain(&domain).await.expect("ensure_domain");
    let tsq = TroubleshootingQueue::new(bus.clone());

    let command_id = Uuid::new_v4();
    bus.send(SendRequest::new(
        &domain,
        "DebitAccount",
        command_id,
        json!({"amt": 100}),
    ))
    .await
    .expect("send");
    move_to_tsq(&test_db, &bus, &domain, command_id).await;

    let items = tsq
        .list(&domain, &TroubleshootingFilter::new())
        .await
        .expect("list");
    assert_eq!(items.len(), 1);

    let item = &items[0];
    assert_eq!(item.command_id, command_id);
    assert_eq!(item.command_type, "DebitAccount");
    assert_eq!(item.attempts, 1);
    let error = item.last_error.as_ref().expect("error recorded");
    assert_eq!(error.kind, ErrorKind::Permanent);
    assert_eq!(error.code, "INVALID_ACCOUNT");
    let payload = item.payload.as_ref().expect("archived payload joined");
    assert_eq!(payload["data"]["amt"], 100);

    assert_eq!(tsq.count(&domain, None).await.expect("count"), 1);
    assert_eq!(
        tsq.count(&domain, Some("DebitAccount")).await.expect("count typed"),
        1
    );
    assert_eq!(
        tsq.count(&domain, Some("Other")).await.expect("count other"),
        0
    );
}

// ---------------------------------------------------------------------------
// Test 2: Retry re-enqueues the archived payload and resets the command
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_operator_retry() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("payments");
    bus.ensure_domain(&domain).await.expect("ensure_domain");
    let tsq = TroubleshootingQueue::new(bus.clone());

    let command_id = Uuid::new_v4();
    bus.send(SendRequest::new(
        &domain,
        "DebitAccount",
        command_id,
        json!({"amt": 42}),
    ))
    .await
    .expect("send");
    move_to_tsq(&test_db, &bus, &domain, command_id).await;

    let old_msg_id = bus
        .get_command(&domain, command_id)
        .await
        .unwrap()
        .unwrap()
        .msg_id
        .unwrap();

    let new_msg_id = tsq
        .retry(&domain, command_id, Some("alice"))
        .await
        .expect("retry");
    assert_ne!(new_msg_id, old_msg_id, "fresh queue message");

    let metadata = bus
        .get_command(&domain, command_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metadata.status, CommandStatus::Pending);
    assert_eq!(metadata.attempts, 0);
    assert_eq!(metadata.msg_id, Some(new_msg_id));
    assert!(metadata.last_error.is_none(), "error cleared");

    // The re-enqueued message carries the original payload
    let msgs = bus
        .queue()
        .read(&queues::command_queue(&domain), 0, 10)
        .await
        .expect("read");
    assert_eq!(msgs.len(), 1);
    assert_eq!(msgs[0].msg_id, new_msg_id);
    assert_eq!(msgs[0].message["data"]["amt"], 42);

    // Audit has OPERATOR_RETRY with the operator and new msg id
    let trail = bus
        .get_audit_trail(command_id, Some(&domain))
        .await
        .expect("audit");
    let retry_event = trail
        .iter()
        .find(|e| e.event_type == AuditEventType::OperatorRetry)
        .expect("OPERATOR_RETRY recorded");
    assert_eq!(retry_event.details.as_ref().unwrap()["operator"], "alice");
    assert_eq!(
        retry_event.details.as_ref().unwrap()["new_msg_id"],
        new_msg_id
    );
}

// ---------------------------------------------------------------------------
// Test 3: Cancel is terminal and emits a reply when reply_to is set
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_operator_cancel_with_reply() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("payments");
    bus.ensure_domain(&domain).await.expect("ensure_domain");
    let tsq = TroubleshootingQueue::new(bus.clone());

    let command_id = Uuid::new_v4();
    let reply_queue = queues::reply_queue(&domain);
    bus.send(
        SendRequest::new(&domain, "DebitAccount", command_id, json!({}))
            .with_reply_to(&reply_queue),
    )
    .await
    .expect("send");
    move_to_tsq(&test_db, &bus, &domain, command_id).await;

    tsq.cancel(&domain, command_id, "unfixable", Some("bob"))
        .await
        .expect("cancel");

    let metadata = bus
        .get_command(&domain, command_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metadata.status, CommandStatus::Canceled);

    let replies = bus
        .queue()
        .read(&reply_queue, 0, 10)
        .await
        .expect("read replies");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].message["outcome"], "CANCELED");
    assert_eq!(replies[0].message["reason"], "unfixable");
    assert_eq!(replies[0].message["command_id"], command_id.to_string());

    let trail = bus
        .get_audit_trail(command_id, Some(&domain))
        .await
        .expect("audit");
    let cancel_events: Vec<_> = trail
        .iter()
        .filter(|e| e.event_type == AuditEventType::OperatorCancel)
        .collect();
    assert_eq!(cancel_events.len(), 1, "exactly one OPERATOR_CANCEL");
}

// ---------------------------------------------------------------------------
// Test 4: Manual complete emits a SUCCESS reply with the operator's result
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_operator_complete_with_reply() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("payments");
    bus.ensure_domain(&domain).await.expect("ensure_domain");
    let tsq = TroubleshootingQueue::new(bus.clone());

    let command_id = Uuid::new_v4();
    let reply_queue = queues::reply_queue(&domain);
    bus.send(
        SendRequest::new(&domain, "DebitAccount", command_id, json!({}))
            .with_reply_to(&reply_queue),
    )
    .await
    .expect("send");
    move_to_tsq(&test_db, &bus, &domain, command_id).await;

    tsq.complete(
        &domain,
        command_id,
        Some(json!({"manually": "fixed"})),
        Some("carol"),
    )
    .await
    .expect("complete");

    let metadata = bus
        .get_command(&domain, command_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metadata.status, CommandStatus::Completed);

    let replies = bus
        .queue()
        .read(&reply_queue, 0, 10)
        .await
        .expect("read replies");
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].message["outcome"], "SUCCESS");
    assert_eq!(replies[0].message["result"]["manually"], "fixed");
}

// ---------------------------------------------------------------------------
// Test 5: No reply without reply_to (P8)
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_no_reply_without_reply_to() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("payments");
    bus.ensure_domain(&domain).await.expect("ensure_domain");
    let tsq = TroubleshootingQueue::new(bus.clone());

    let command_id = Uuid::new_v4();
    bus.send(SendRequest::new(&domain, "DebitAccount", command_id, json!({})))
        .await
        .expect("send");
    move_to_tsq(&test_db, &bus, &domain, command_id).await;

    tsq.cancel(&domain, command_id, "no-reply", None)
        .await
        .expect("cancel");

    let replies = bus
        .queue()
        .read(&queues::reply_queue(&domain), 0, 10)
        .await
        .expect("read replies");
    assert!(replies.is_empty(), "no reply queue message");
}

// ---------------------------------------------------------------------------
// Test 6: Preconditions — unknown command and wrong status
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_precondition_failures() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("payments");
    bus.ensure_domain(&domain).await.expect("ensure_domain");
    let tsq = TroubleshootingQueue::new(bus.clone());

    // Unknown command
    let err = tsq
        .retry(&domain, Uuid::new_v4(), None)
        .await
        .expect_err("unknown command");
    assert!(matches!(err, RelayError::CommandNotFound { .. }));

    // Wrong status (still PENDING)
    let command_id = Uuid::new_v4();
    bus.send(SendRequest::new(&domain, "Noop", command_id, json!({})))
        .await
        .expect("send");
    let err = tsq
        .cancel(&domain, command_id, "nope", None)
        .await
        .expect_err("wrong status");
    assert!(matches!(err, RelayError::InvalidOperation(_)));

    // And the command is untouched
    let metadata = bus
        .get_command(&domain, command_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metadata.status, CommandStatus::Pending);
}

// ---------------------------------------------------------------------------
// Test 7: Terminal commands cannot re-enter via operator paths (P3/P4)
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_terminal_commands_locked_out() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("payments");
    bus.ensure_domain(&domain).await.expect("ensure_domain");
    let tsq = TroubleshootingQueue::new(bus.clone());

    let command_id = Uuid::new_v4();
    bus.send(SendRequest::new(&domain, "Noop", command_id, json!({})))
        .await
        .expect("send");
    move_to_tsq(&test_db, &bus, &domain, command_id).await;

    tsq.cancel(&domain, command_id, "done", None)
        .await
        .expect("cancel");

    // A second operator action on the now-terminal command fails
    let err = tsq
        .complete(&domain, command_id, None, None)
        .await
        .expect_err("terminal command");
    assert!(matches!(err, RelayError::InvalidOperation(_)));

    let metadata = bus
        .get_command(&domain, command_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metadata.status, CommandStatus::Canceled, "terminal is sticky");
}
