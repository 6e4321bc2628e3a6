//! # Process Managers
//!
//! A process manager is a state machine over a strongly-typed state and a
//! step enum: it issues exactly one command per step (correlation_id =
//! process_id, reply_to = the process's reply queue) and advances when the
//! reply is routed back.
//!
//! Definitions implement [`ProcessDefinition`] with typed state/steps; the
//! runtime stores state as JSONB and step names as text, so definitions
//! are erased behind [`DynProcessManager`] for the registry.

mod router;
mod runtime;

pub use router::{ReplyRouter, ReplyRouterConfig};
pub use runtime::ProcessRuntime;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgConnection;

use relay_shared::models::ReplyEnvelope;
use relay_shared::{RelayError, RelayResult};

/// The command a process issues for one step.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandSpec {
    pub command_type: String,
    pub data: Value,
}

impl CommandSpec {
    pub fn new(command_type: impl Into<String>, data: Value) -> Self {
        Self {
            command_type: command_type.into(),
            data,
        }
    }
}

/// A process manager definition over typed state and steps.
#[async_trait]
pub trait ProcessDefinition: Send + Sync + 'static {
    type State: Serialize + DeserializeOwned + Send + Sync;
    type Step: Send + Sync;

    /// The registry key (together with the domain).
    fn process_type(&self) -> &str;

    /// Build the initial state from the caller's start payload.
    fn initial_state(&self, data: &Value) -> RelayResult<Self::State>;

    /// The first step to run; None completes the process immediately.
    fn first_step(&self, state: &Self::State) -> Option<Self::Step>;

    /// Persisted name of a step (the `current_step` column).
    fn step_name(&self, step: &Self::Step) -> String;

    /// Rehydrate a step from its persisted name.
    fn step_from_name(&self, name: &str) -> Option<Self::Step>;

    /// The command payload for a step.
    fn build_command(&self, step: &Self::Step, state: &Self::State) -> RelayResult<CommandSpec>;

    /// Fold a reply into the state. An Err fails the whole process.
    fn update_state(
        &self,
        state: Self::State,
        step: &Self::Step,
        reply: &ReplyEnvelope,
    ) -> RelayResult<Self::State>;

    /// The step to run next; None completes the process.
    fn next_step(
        &self,
        current: &Self::Step,
        reply: &ReplyEnvelope,
        state: &Self::State,
    ) -> Option<Self::Step>;

    /// Hook to persist side state in the same transaction as the step's
    /// command, before it is enqueued.
    async fn before_send_command(
        &self,
        _conn: &mut PgConnection,
        _step: &Self::Step,
        _state: &Self::State,
    ) -> RelayResult<()> {
        Ok(())
    }
}

/// Type-erased process manager operating on JSON state and step names, as
/// stored in `bus_process`.
#[async_trait]
pub trait DynProcessManager: Send + Sync {
    fn process_type(&self) -> &str;
    fn initial_state(&self, data: &Value) -> RelayResult<Value>;
    fn first_step(&self, state: &Value) -> RelayResult<Option<String>>;
    fn build_command(&self, step_name: &str, state: &Value) -> RelayResult<CommandSpec>;
    /// Returns (new state, next step name).
    fn apply_reply(
        &self,
        state: &Value,
        step_name: &str,
        reply: &ReplyEnvelope,
    ) -> RelayResult<(Value, Option<String>)>;
    async fn before_send(
        &self,
        conn: &mut PgConnection,
        step_name: &str,
        state: &Value,
    ) -> RelayResult<()>;
}

struct ErasedDefinition<P> {
    inner: P,
}

impl<P: ProcessDefinition> ErasedDefinition<P> {
    fn state(&self, value: &Value) -> RelayResult<P::State> {
        Ok(serde_json::from_value(value.clone())?)
    }

    fn step(&self, name: &str) -> RelayResult<P::Step> {
        self.inner.step_from_name(name).ok_or_else(|| {
            RelayError::decode(format!(
                "unknown step '{name}' for process type '{}'",
                self.inner.process_type()
            ))
        })
    }
}

#[async_trait]
impl<P: ProcessDefinition> DynProcessManager for ErasedDefinition<P> {
    fn process_type(&self) -> &str {
        self.inner.process_type()
    }

    fn initial_state(&self, data: &Value) -> RelayResult<Value> {
        let state = self.inner.initial_state(data)?;
        Ok(serde_json::to_value(state)?)
    }

    fn first_step(&self, state: &Value) -> RelayResult<Option<String>> {
        let state = self.state(state)?;
        Ok(self
            .inner
            .first_step(&state)
            .map(|step| self.inner.step_name(&step)))
    }

    fn build_command(&self, step_name: &str, state: &Value) -> RelayResult<CommandSpec> {
        let state = self.state(state)?;
        let step = self.step(step_name)?;
        self.inner.build_command(&step, &state)
    }

    fn apply_reply(
        &self,
        state: &Value,
        step_name: &str,
        reply: &ReplyEnvelope,
    ) -> RelayResult<(Value, Option<String>)> {
        let state = self.state(state)?;
        let step = self.step(step_name)?;

        let new_state = self.inner.update_state(state, &step, reply)?;
        let next = self
            .inner
            .next_step(&step, reply, &new_state)
            .map(|next| self.inner.step_name(&next));
        Ok((serde_json::to_value(new_state)?, next))
    }

    async fn before_send(
        &self,
        conn: &mut PgConnection,
        step_name: &str,
        state: &Value,
    ) -> RelayResult<()> {
        let state = self.state(state)?;
        let step = self.step(step_name)?;
        self.inner.before_send_command(conn, &step, &state).await
    }
}

/// Registry of process managers keyed by (domain, process_type).
#[derive(Default)]
pub struct ProcessManagerRegistry {
    managers: HashMap<(String, String), Arc<dyn DynProcessManager>>,
}

impl std::fmt::Debug for ProcessManagerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManagerRegistry")
            .field("managers", &self.managers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ProcessManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ProcessDefinition>(&mut self, domain: impl Into<String>, definition: P) {
        let process_type = definition.process_type().to_string();
        self.managers.insert(
            (domain.into(), process_type),
            Arc::new(ErasedDefinition { inner: definition }),
        );
    }

    pub fn get(&self, domain: &str, process_type: &str) -> Option<Arc<dyn DynProcessManager>> {
        self.managers
            .get(&(domain.to_string(), process_type.to_string()))
            .cloned()
    }

    pub fn is_empty(&self) -> bool {
        self.managers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.managers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_shared::models::ReplyOutcome;
    use serde::Deserialize;
    use serde_json::json;
    use uuid::Uuid;

    #[derive(Debug, Serialize, Deserialize)]
    struct ShipmentState {
        order_id: String,
        reserved: bool,
        shipped: bool,
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
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
            let order_id = data["order_id"]
                .as_str()
                .ok_or_else(|| RelayError::invalid_operation("order_id required"))?
                .to_string();
            Ok(ShipmentState {
                order_id,
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

        fn build_command(
            &self,
            step: &Self::Step,
            state: &Self::State,
        ) -> RelayResult<CommandSpec> {
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
                return Err(RelayError::invalid_operation(format!(
                    "step failed: {:?}",
                    reply.reason
                )));
            }
            match step {
                ShipmentStep::Reserve => state.reserved = true,
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

    fn success_reply() -> ReplyEnvelope {
        ReplyEnvelope::success(Uuid::new_v4(), Some(Uuid::new_v4()), Some(json!({})))
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ProcessManagerRegistry::new();
        registry.register("orders", ShipmentProcess);

        assert!(registry.get("orders", "Shipment").is_some());
        assert!(registry.get("orders", "Other").is_none());
        assert!(registry.get("payments", "Shipment").is_none());
    }

    #[test]
    fn test_erased_initial_state_and_first_step() {
        let mut registry = ProcessManagerRegistry::new();
        registry.register("orders", ShipmentProcess);
        let manager = registry.get("orders", "Shipment").unwrap();

        let state = manager
            .initial_state(&json!({"order_id": "O-1"}))
            .unwrap();
        assert_eq!(state["order_id"], "O-1");
        assert_eq!(state["reserved"], false);

        let first = manager.first_step(&state).unwrap();
        assert_eq!(first.as_deref(), Some("reserve"));
    }

    #[test]
    fn test_erased_build_command() {
        let mut registry = ProcessManagerRegistry::new();
        registry.register("orders", ShipmentProcess);
        let manager = registry.get("orders", "Shipment").unwrap();

        let state = manager
            .initial_state(&json!({"order_id": "O-1"}))
            .unwrap();
        let spec = manager.build_command("reserve", &state).unwrap();
        assert_eq!(spec.command_type, "ReserveStock");
        assert_eq!(spec.data["order_id"], "O-1");

        assert!(manager.build_command("explode", &state).is_err());
    }

    #[test]
    fn test_erased_apply_reply_advances_then_completes() {
        let mut registry = ProcessManagerRegistry::new();
        registry.register("orders", ShipmentProcess);
        let manager = registry.get("orders", "Shipment").unwrap();

        let state = manager
            .initial_state(&json!({"order_id": "O-1"}))
            .unwrap();

        let (state, next) = manager
            .apply_reply(&state, "reserve", &success_reply())
            .unwrap();
        assert_eq!(state["reserved"], true);
        assert_eq!(next.as_deref(), Some("ship"));

        let (state, next) = manager.apply_reply(&state, "ship", &success_reply()).unwrap();
        assert_eq!(state["shipped"], true);
        assert!(next.is_none(), "last step completes the process");
    }

    #[test]
    fn test_erased_apply_reply_propagates_definition_error() {
        let mut registry = ProcessManagerRegistry::new();
        registry.register("orders", ShipmentProcess);
        let manager = registry.get("orders", "Shipment").unwrap();

        let state = manager
            .initial_state(&json!({"order_id": "O-1"}))
            .unwrap();
        let failed = ReplyEnvelope::failed(Uuid::new_v4(), None, "stock gone");

        assert!(manager.apply_reply(&state, "reserve", &failed).is_err());
    }
}
