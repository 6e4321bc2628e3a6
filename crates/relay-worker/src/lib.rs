//! # relay-worker
//!
//! The consumption side of the relay command bus:
//!
//! - [`handler`]: the `CommandHandler` trait, the transient / permanent /
//!   business-rule failure classification, and the handler registry.
//! - [`worker`]: the bounded-concurrency dispatch engine, one per domain.
//! - [`process`]: reply routing and process managers (sagas advanced one
//!   command per step).
//! - [`watchdog`]: supervision of workers/routers via their health state.
//! - [`runtime`]: assembly of workers, routers and watchdogs from
//!   configuration, used by the `relay-worker` binary.

pub mod dispatch;
pub mod handler;
pub mod process;
pub mod runtime;
pub mod watchdog;
pub mod worker;

pub use handler::{CommandHandler, HandlerContext, HandlerError, HandlerRegistry};
pub use process::{
    CommandSpec, ProcessDefinition, ProcessManagerRegistry, ProcessRuntime, ReplyRouter,
    ReplyRouterConfig,
};
pub use runtime::WorkerRuntime;
pub use watchdog::{Monitorable, Watchdog};
pub use worker::{Worker, WorkerConfig};
