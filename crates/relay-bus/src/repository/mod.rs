//! Repositories over the durable command-bus tables.
//!
//! Every write method has a `*_in` variant taking `&mut PgConnection` so
//! callers can compose repository writes with queue operations in one
//! transaction. The pool-scoped variants are conveniences for reads and
//! one-shot writes.

mod audit;
mod batch;
mod command;
mod process;

pub use audit::{AuditEntry, AuditLogger};
pub use batch::BatchRepository;
pub use command::CommandRepository;
pub use process::{ProcessRepository, StepInsert};
