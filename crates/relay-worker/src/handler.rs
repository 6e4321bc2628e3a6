//! # Command Handlers
//!
//! Application code plugs into the worker through [`CommandHandler`]. A
//! handler either returns a result value or fails with one of three
//! classifications that drive the command's lifecycle:
//!
//! - [`HandlerError::Transient`]: retried with backoff up to max_attempts.
//! - [`HandlerError::Permanent`]: no retry; the command moves to the
//!   troubleshooting queue for operator triage.
//! - [`HandlerError::BusinessRule`]: an expected negative outcome; the
//!   command becomes FAILED with no retry and no troubleshooting entry.
//!
//! Handlers must be idempotent: the bus guarantees at-least-once delivery,
//! not exactly-once execution.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use relay_shared::models::{CommandEnvelope, CommandError, ErrorKind};

/// Per-invocation context passed alongside the command.
#[derive(Debug, Clone, Copy)]
pub struct HandlerContext {
    /// 1-based attempt number for this delivery.
    pub attempt: i32,
    pub max_attempts: i32,
    pub msg_id: i64,
}

/// A classified handler failure.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("transient failure [{code}]: {message}")]
    Transient { code: String, message: String },

    #[error("permanent failure [{code}]: {message}")]
    Permanent {
        code: String,
        message: String,
        details: Option<Value>,
    },

    #[error("business rule violation [{code}]: {message}")]
    BusinessRule {
        code: String,
        message: String,
        details: Option<Value>,
    },
}

impl HandlerError {
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn business_rule(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BusinessRule {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, value: Value) -> Self {
        match &mut self {
            Self::Permanent { details, .. } | Self::BusinessRule { details, .. } => {
                *details = Some(value);
            }
            Self::Transient { .. } => {}
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Permanent { .. } => ErrorKind::Permanent,
            Self::BusinessRule { .. } => ErrorKind::BusinessRule,
        }
    }

    pub fn code(&self) -> &str {
        match self {
            Self::Transient { code, .. }
            | Self::Permanent { code, .. }
            | Self::BusinessRule { code, .. } => code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message, .. }
            | Self::Permanent { message, .. }
            | Self::BusinessRule { message, .. } => message,
        }
    }

    pub fn details(&self) -> Option<&Value> {
        match self {
            Self::Transient { .. } => None,
            Self::Permanent { details, .. } | Self::BusinessRule { details, .. } => {
                details.as_ref()
            }
        }
    }

    /// The error shape persisted on the command row.
    pub fn to_command_error(&self) -> CommandError {
        CommandError::new(self.kind(), self.code(), self.message())
    }
}

/// A command handler registered for one (domain, command_type).
///
/// Handlers hold only immutable references to their collaborators
/// (repositories, pools); per-request data stays on the stack.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(
        &self,
        command: CommandEnvelope,
        ctx: HandlerContext,
    ) -> Result<Value, HandlerError>;
}

/// Registry mapping (domain, command_type) to handlers.
///
/// Built once at startup and shared immutably with every worker. A
/// missing registration is surfaced to the worker as a transient dispatch
/// failure, so an operator can register the handler and retry.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<(String, String), Arc<dyn CommandHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        domain: impl Into<String>,
        command_type: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) {
        self.handlers
            .insert((domain.into(), command_type.into()), handler);
    }

    pub fn get(&self, domain: &str, command_type: &str) -> Option<Arc<dyn CommandHandler>> {
        self.handlers
            .get(&(domain.to_string(), command_type.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Command types registered for a domain.
    pub fn command_types(&self, domain: &str) -> Vec<&str> {
        self.handlers
            .keys()
            .filter(|(d, _)| d == domain)
            .map(|(_, t)| t.as_str())
            .collect()
    }
}
