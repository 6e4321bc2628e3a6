//! Domain models shared across the bus, worker and operator surfaces.

mod audit;
mod batch;
mod command;
mod envelope;
mod process;

pub use audit::{AuditEvent, AuditEventType};
pub use batch::{BatchCommand, BatchMetadata, BatchStatus, CompletionCommand};
pub use command::{
    BatchSendResult, CommandError, CommandMetadata, CommandQuery, CommandStatus, ErrorKind,
    SendRequest, SendResult,
};
pub use envelope::{CommandEnvelope, ReplyEnvelope, ReplyOutcome};
pub use process::{ProcessMetadata, ProcessStatus, ProcessStepRecord};
