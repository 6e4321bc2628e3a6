//! # relay-pgmq
//!
//! Transaction-aware wrapper over the [pgmq](https://github.com/pgmq/pgmq)
//! Postgres extension.
//!
//! Every mutating queue operation comes in two forms: a pool-scoped
//! convenience method and a `*_in` variant that runs on a caller-owned
//! connection, so higher layers can join enqueue/delete/archive/set-vt with
//! their own metadata writes in a single transaction and emit one NOTIFY at
//! commit.
//!
//! ## Example
//!
//! ```ignore
//! use relay_pgmq::PgmqClient;
//!
//! # async fn example(pool: sqlx::PgPool) -> Result<(), relay_pgmq::PgmqError> {
//! let client = PgmqClient::new(pool);
//! client.create_queue("payments__commands").await?;
//!
//! let msg_id = client
//!     .send("payments__commands", &serde_json::json!({"amount": 100}))
//!     .await?;
//!
//! let messages = client.read("payments__commands", 30, 10).await?;
//! assert_eq!(messages[0].msg_id, msg_id);
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod listener;
mod types;

pub use client::PgmqClient;
pub use error::PgmqError;
pub use listener::PgmqListener;
pub use types::{ArchivedMessage, QueueMessage, QueueMetrics};
