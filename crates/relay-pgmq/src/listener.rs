//! # Queue Listener
//!
//! LISTEN/NOTIFY wake-ups for queue consumers, over
//! [`sqlx::postgres::PgListener`].
//!
//! Postgres NOTIFY is signal-only and not guaranteed delivery: notifications
//! are lost if the listener is disconnected and are never generated for
//! messages that were enqueued before LISTEN began. Consumers treat a
//! notification as "poll now" and keep an interval poll as fallback.

use std::time::Duration;

use sqlx::postgres::{PgListener, PgPool};
use tracing::debug;

use crate::error::PgmqError;

/// A LISTEN subscription on one or more queue channels.
///
/// Holds a dedicated connection from the pool for the lifetime of the
/// listener.
pub struct PgmqListener {
    inner: PgListener,
}

impl std::fmt::Debug for PgmqListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgmqListener").finish_non_exhaustive()
    }
}

impl PgmqListener {
    /// Connect a listener using the given pool's configuration.
    pub async fn connect(pool: &PgPool) -> Result<Self, PgmqError> {
        let inner = PgListener::connect_with(pool).await?;
        Ok(Self { inner })
    }

    /// Subscribe to wake-ups for a queue (channel name == queue name).
    pub async fn listen(&mut self, queue_name: &str) -> Result<(), PgmqError> {
        self.inner.listen(queue_name).await?;
        debug!(queue = %queue_name, "Listening for queue notifications");
        Ok(())
    }

    /// Wait for the next notification on any subscribed channel.
    ///
    /// Returns the channel (queue) name. Errors indicate a lost connection;
    /// callers fall back to polling and may reconnect.
    pub async fn recv(&mut self) -> Result<String, PgmqError> {
        let notification = self.inner.recv().await?;
        Ok(notification.channel().to_string())
    }

    /// Wait for a notification for at most `timeout`.
    ///
    /// `Ok(None)` means the timeout elapsed without a wake-up.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<String>, PgmqError> {
        match tokio::time::timeout(timeout, self.inner.recv()).await {
            Ok(Ok(notification)) => Ok(Some(notification.channel().to_string())),
            Ok(Err(e)) => Err(e.into()),
            Err(_elapsed) => Ok(None),
        }
    }
}
