mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{spawn_worker, wait_until, TestDb};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use uuid::Uuid;

use relay_bus::CommandBus;
use relay_shared::models::{
    CommandEnvelope, ProcessStatus, ReplyEnvelope, ReplyOutcome,
};
use relay_shared::{queues, RelayError, RelayResult};
use relay_worker::{
    CommandHandler, CommandSpec, HandlerContext, HandlerError, HandlerRegistry,
    ProcessDefinition, ProcessManagerRegistry, ProcessRuntime, ReplyRouter, ReplyRouterConfig,
};

const WAIT: Duration = Duration::from_secs(15);

// ---------------------------------------------------------------------------
// A two-step shipment saga: reserve stock, then ship.
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct ShipmentState {
    order_id: String,
    reserved: bool,
    shipped: bool,
}

#[derive(Debug, Clone, Copy)]
enum ShipmentStep {
    Reserve,
    Ship,
}

struct ShipmentProcess;

#[async_trait]
impl ProcessDefinition for ShipmentProcess {
    type State = ShipmentState;
    type Step = ShipmentStep;

    fn process_type(&self) -> &str {
        "Shipment"
    }

    fn initial_state(&self, data: &Value) -> RelayResult<Self::State> {
        Ok(ShipmentState {
            order_id: data["order_id"].as_str().unwrap_or("unknown").to_string(),
            reserved: false,
            shipped: false,
        })
    }

    fn first_step(&self, _state: &Self::State) -> Option<Self::Step> {
        Some(ShipmentStep::Reserve)
    }

    fn step_name(&self, step: &Self::Step) -> String {
        match step {
            ShipmentStep::Reserve => "reserve".to_string(),
            ShipmentStep::Ship => "ship".to_string(),
        }
    }

    fn step_from_name(&self, name: &str) -> Option<Self::Step> {
        match name {
            "reserve" => Some(ShipmentStep::Reserve),
            "ship" => Some(ShipmentStep::Ship),
            _ => None,
        }
    }

    fn build_command(&self, step: &Self::Step, state: &Self::State) -> RelayResult<CommandSpec> {
        let command_type = match step {
            ShipmentStep::Reserve => "ReserveStock",
            ShipmentStep::Ship => "ShipOrder",
        };
        Ok(CommandSpec::new(
            command_type,
            json!({"order_id": state.order_id}),
        ))
    }

    fn update_state(
        &self,
        mut state: Self::State,
        step: &Self::Step,
        reply: &ReplyEnvelope,
    ) -> RelayResult<Self::State> {
        if reply.outcome != ReplyOutcome::Success {
            return Err(RelayError::invalid_operation("step did not succeed"));
        }
        match step {
            ShipmentStep::Reserve => {
                let available = reply
                    .result
                    .as_ref()
                    .and_then(|r| r["available"].as_bool())
                    .unwrap_or(false);
                if !available {
                    return Err(RelayError::invalid_operation("stock unavailable"));
                }
                state.reserved = true;
            }
            ShipmentStep::Ship => state.shipped = true,
        }
        Ok(state)
    }

    fn next_step(
        &self,
        current: &Self::Step,
        _reply: &ReplyEnvelope,
        _state: &Self::State,
    ) -> Option<Self::Step> {
        match current {
            ShipmentStep::Reserve => Some(ShipmentStep::Ship),
            ShipmentStep::Ship => None,
        }
    }
}

/// Stock handler parameterized by availability.
struct ReserveStock {
    available: bool,
}

#[async_trait]
impl CommandHandler for ReserveStock {
    async fn handle(&self, _c: CommandEnvelope, _ctx: HandlerContext) -> Result<Value, HandlerError> {
        Ok(json!({"available": self.available}))
    }
}

struct ShipOrder;

#[async_trait]
impl CommandHandler for ShipOrder {
    async fn handle(&self, _c: CommandEnvelope, _ctx: HandlerContext) -> Result<Value, HandlerError> {
        Ok(json!({"tracking": "TRK-1"}))
    }
}

fn spawn_router(
    bus: &CommandBus,
    managers: Arc<ProcessManagerRegistry>,
    domain: &str,
) -> (Arc<ReplyRouter>, JoinHandle<()>) {
    let mut config = ReplyRouterConfig::new(domain);
    config.poll_interval = Duration::from_millis(100);
    config.shutdown_timeout = Duration::from_secs(5);

    let router = Arc::new(ReplyRouter::new(bus.clone(), managers, config));
    let run = router.clone();
    let handle = tokio::spawn(async move {
        run.run().await.expect("router run");
    });
    (router, handle)
}

// ---------------------------------------------------------------------------
// Test 1: Full saga — two steps driven by replies, process completes
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_process_completes_through_replies() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("orders");
    bus.ensure_domain(&domain).await.expect("ensure_domain");

    let mut registry = HandlerRegistry::new();
    registry.register(&domain, "ReserveStock", Arc::new(ReserveStock { available: true }));
    registry.register(&domain, "ShipOrder", Arc::new(ShipOrder));
    let (worker, worker_handle) = spawn_worker(&bus, Arc::new(registry), &domain);

    let mut managers = ProcessManagerRegistry::new();
    managers.register(&domain, ShipmentProcess);
    let managers = Arc::new(managers);
    let (router, router_handle) = spawn_router(&bus, managers.clone(), &domain);

    let runtime = ProcessRuntime::new(bus.clone(), managers);
    let process_id = runtime
        .start_process(&domain, "Shipment", &json!({"order_id": "O-7"}), None)
        .await
        .expect("start_process");

    // The first command is correlated to the process
    let first = runtime
        .processes()
        .get(&domain, process_id)
        .await
        .expect("get process")
        .expect("process exists");
    assert_eq!(first.status, ProcessStatus::WaitingForReply);
    assert_eq!(first.current_step.as_deref(), Some("reserve"));

    // Wait for the saga to run to completion
    let processes = runtime.processes().clone();
    let domain_clone = domain.clone();
    wait_until(WAIT, "process completion", move || {
        let processes = processes.clone();
        let domain = domain_clone.clone();
        async move {
            processes
                .get(&domain, process_id)
                .await
                .expect("get")
                .map(|p| p.status == ProcessStatus::Completed)
                .unwrap_or(false)
        }
    })
    .await;

    let process = runtime
        .processes()
        .get(&domain, process_id)
        .await
        .unwrap()
        .unwrap();
    assert!(process.completed_at.is_some());
    assert_eq!(process.state["reserved"], true);
    assert_eq!(process.state["shipped"], true);
    assert!(process.current_step.is_none());

    // The step trail has both steps, each answered
    let steps = runtime
        .processes()
        .get_steps(&domain, process_id)
        .await
        .expect("steps");
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0].step_name, "reserve");
    assert_eq!(steps[0].command_type, "ReserveStock");
    assert_eq!(steps[0].reply_outcome, Some(ReplyOutcome::Success));
    assert!(steps[0].received_at.is_some());
    assert_eq!(steps[1].step_name, "ship");
    assert_eq!(steps[1].reply_outcome, Some(ReplyOutcome::Success));

    // Every issued command carried the process id as correlation id
    for step in &steps {
        let metadata = bus
            .get_command(&domain, step.command_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(metadata.correlation_id, Some(process_id));
        assert_eq!(
            metadata.reply_to.as_deref(),
            Some(queues::reply_queue(&domain).as_str())
        );
    }

    // The process shows up in domain listings
    let completed = runtime
        .processes()
        .list_processes(&domain, Some(ProcessStatus::Completed), 10, 0)
        .await
        .expect("list_processes");
    assert!(completed.iter().any(|p| p.process_id == process_id));

    worker.stop();
    router.stop();
    worker_handle.await.expect("worker task");
    router_handle.await.expect("router task");
}

// ---------------------------------------------------------------------------
// Test 2: Manager rejection fails the process
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_process_fails_on_rejected_reply() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("orders");
    bus.ensure_domain(&domain).await.expect("ensure_domain");

    let mut registry = HandlerRegistry::new();
    // Stock is NOT available: the reply succeeds but the manager rejects it
    registry.register(&domain, "ReserveStock", Arc::new(ReserveStock { available: false }));
    registry.register(&domain, "ShipOrder", Arc::new(ShipOrder));
    let (worker, worker_handle) = spawn_worker(&bus, Arc::new(registry), &domain);

    let mut managers = ProcessManagerRegistry::new();
    managers.register(&domain, ShipmentProcess);
    let managers = Arc::new(managers);
    let (router, router_handle) = spawn_router(&bus, managers.clone(), &domain);

    let runtime = ProcessRuntime::new(bus.clone(), managers);
    let process_id = runtime
        .start_process(&domain, "Shipment", &json!({"order_id": "O-8"}), None)
        .await
        .expect("start_process");

    let processes = runtime.processes().clone();
    let domain_clone = domain.clone();
    wait_until(WAIT, "process failure", move || {
        let processes = processes.clone();
        let domain = domain_clone.clone();
        async move {
            processes
                .get(&domain, process_id)
                .await
                .expect("get")
                .map(|p| p.status == ProcessStatus::Failed)
                .unwrap_or(false)
        }
    })
    .await;

    let process = runtime
        .processes()
        .get(&domain, process_id)
        .await
        .unwrap()
        .unwrap();
    let error = process.last_error.expect("error recorded");
    assert_eq!(error.code, "PROCESS_REPLY_REJECTED");

    // No second step was issued
    let steps = runtime
        .processes()
        .get_steps(&domain, process_id)
        .await
        .expect("steps");
    assert_eq!(steps.len(), 1);

    worker.stop();
    router.stop();
    worker_handle.await.expect("worker task");
    router_handle.await.expect("router task");
}

// ---------------------------------------------------------------------------
// Test 3: Replies without correlation or for unknown processes are discarded
// ---------------------------------------------------------------------------
#[tokio::test]
async fn test_unroutable_replies_discarded() {
    let test_db = TestDb::new().await.expect("TestDb::new");
    let bus = CommandBus::new(test_db.pool.clone());
    let domain = test_db.domain("orders");
    bus.ensure_domain(&domain).await.expect("ensure_domain");

    let managers = Arc::new(ProcessManagerRegistry::new());
    let (router, router_handle) = spawn_router(&bus, managers, &domain);

    let reply_queue = queues::reply_queue(&domain);

    // No correlation id
    bus.queue()
        .send(
            &reply_queue,
            &json!({"command_id": Uuid::new_v4(), "outcome": "SUCCESS"}),
        )
        .await
        .expect("send uncorrelated");
    // Unknown process
    bus.queue()
        .send(
            &reply_queue,
            &json!({
                "command_id": Uuid::new_v4(),
                "correlation_id": Uuid::new_v4(),
                "outcome": "SUCCESS",
            }),
        )
        .await
        .expect("send unknown process");
    // Unparseable
    bus.queue()
        .send(&reply_queue, &json!({"garbage": true}))
        .await
        .expect("send garbage");

    // All three are consumed without crashing the router
    let queue = bus.queue().clone();
    let reply_queue_clone = reply_queue.clone();
    wait_until(WAIT, "replies drained", move || {
        let queue = queue.clone();
        let reply_queue = reply_queue_clone.clone();
        async move {
            queue
                .read(&reply_queue, 0, 10)
                .await
                .expect("read")
                .is_empty()
                && queue
                    .queue_metrics(&reply_queue)
                    .await
                    .expect("metrics")
                    .queue_length
                    == 0
        }
    })
    .await;

    router.stop();
    router_handle.await.expect("router task");
}
