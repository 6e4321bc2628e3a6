//! # Process Runtime
//!
//! Starting processes: one transaction covers the process row, the first
//! step's command submission and the first step-trail entry, so a process
//! can never exist without its in-flight command (or vice versa).

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use relay_bus::{CommandBus, ProcessRepository, StepInsert};
use relay_shared::models::{ProcessMetadata, ProcessStatus, SendRequest};
use relay_shared::{queues, RelayError, RelayResult};

use super::ProcessManagerRegistry;

/// Creates processes and issues their first commands.
#[derive(Clone)]
pub struct ProcessRuntime {
    bus: CommandBus,
    processes: ProcessRepository,
    registry: Arc<ProcessManagerRegistry>,
}

impl std::fmt::Debug for ProcessRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRuntime").finish_non_exhaustive()
    }
}

impl ProcessRuntime {
    pub fn new(bus: CommandBus, registry: Arc<ProcessManagerRegistry>) -> Self {
        Self {
            processes: ProcessRepository::new(bus.pool().clone()),
            bus,
            registry,
        }
    }

    pub fn processes(&self) -> &ProcessRepository {
        &self.processes
    }

    /// Start a process: build the initial state, persist the row, issue
    /// the first step's command (correlation_id = process_id, reply_to =
    /// the domain's reply queue) and record the step, atomically.
    ///
    /// Returns the process id. A definition whose first_step is None
    /// completes immediately without issuing a command.
    pub async fn start_process(
        &self,
        domain: &str,
        process_type: &str,
        data: &Value,
        batch_id: Option<Uuid>,
    ) -> RelayResult<Uuid> {
        let manager = self.registry.get(domain, process_type).ok_or_else(|| {
            RelayError::invalid_operation(format!(
                "no process manager registered for ({domain}, {process_type})"
            ))
        })?;

        let process_id = Uuid::new_v4();
        let reply_queue = queues::reply_queue(domain);
        let state = manager.initial_state(data)?;
        let first_step = manager.first_step(&state)?;

        let now = Utc::now();
        let mut tx = self.bus.pool().begin().await?;

        match first_step {
            Some(step_name) => {
                let metadata = ProcessMetadata {
                    domain: domain.to_string(),
                    process_id,
                    process_type: process_type.to_string(),
                    status: ProcessStatus::WaitingForReply,
                    current_step: Some(step_name.clone()),
                    state: state.clone(),
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                    completed_at: None,
                    batch_id,
                };
                self.processes.save_in(&mut tx, &metadata).await?;

                manager.before_send(&mut tx, &step_name, &state).await?;

                let spec = manager.build_command(&step_name, &state)?;
                let command_id = Uuid::new_v4();
                let request = SendRequest::new(domain, &spec.command_type, command_id, spec.data.clone())
                    .with_correlation_id(process_id)
                    .with_reply_to(&reply_queue);
                self.bus.send_in(&mut tx, &request).await?;

                self.processes
                    .record_step_in(
                        &mut tx,
                        &StepInsert {
                            domain: domain.to_string(),
                            process_id,
                            step_name: step_name.clone(),
                            command_id,
                            command_type: spec.command_type.clone(),
                            command_data: Some(spec.data),
                        },
                    )
                    .await?;

                tx.commit().await?;
                info!(
                    domain = %domain,
                    process_type = %process_type,
                    process_id = %process_id,
                    first_step = %step_name,
                    "Process started"
                );
            }
            None => {
                // Degenerate definition: nothing to do.
                let metadata = ProcessMetadata {
                    domain: domain.to_string(),
                    process_id,
                    process_type: process_type.to_string(),
                    status: ProcessStatus::Completed,
                    current_step: None,
                    state,
                    last_error: None,
                    created_at: now,
                    updated_at: now,
                    completed_at: Some(now),
                    batch_id,
                };
                self.processes.save_in(&mut tx, &metadata).await?;
                tx.commit().await?;
                info!(
                    domain = %domain,
                    process_type = %process_type,
                    process_id = %process_id,
                    "Process completed immediately (no first step)"
                );
            }
        }

        Ok(process_id)
    }
}
