//! # relay-bus
//!
//! The submission side of the relay command bus: repositories over the
//! durable tables, the [`CommandBus`] façade for single/bulk/batch
//! submission, and the [`TroubleshootingQueue`] operator surface.
//!
//! All writes happen inside single database transactions that also carry
//! the pgmq queue operations, so a command's metadata, audit trail and
//! queue message can never diverge.

pub mod bus;
pub mod repository;
pub mod troubleshooting;

pub use bus::{CommandBus, CreateBatchOptions};
pub use repository::{
    AuditEntry, AuditLogger, BatchRepository, CommandRepository, ProcessRepository, StepInsert,
};
pub use troubleshooting::{TroubleshootingFilter, TroubleshootingItem, TroubleshootingQueue};
