//! Connection seam between the engine and a database driver.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{MigrateError, MigrateResult};

/// A live database connection with standard transactional semantics.
///
/// The engine is single-threaded per run: one connection, one statement
/// at a time. Implementations do not need internal synchronization.
#[async_trait]
pub trait Connection: Send {
    /// Execute one SQL statement (or script) outside of result
    /// consumption.
    async fn execute(&mut self, sql: &str) -> MigrateResult<()>;

    /// Begin a transaction.
    async fn begin(&mut self) -> MigrateResult<()>;

    /// Commit the current transaction.
    async fn commit(&mut self) -> MigrateResult<()>;

    /// Roll back the current transaction.
    async fn rollback(&mut self) -> MigrateResult<()>;
}

impl fmt::Debug for dyn Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Connection")
    }
}

/// Hands out connections to the engine.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Open (or check out) a connection.
    async fn connect(&self) -> MigrateResult<Box<dyn Connection>>;
}

/// Upper bound on the backoff between connection attempts.
const MAX_CONNECT_BACKOFF: Duration = Duration::from_secs(60);

/// Obtain a connection, retrying transient failures with exponential
/// backoff.
///
/// `retries` is the number of attempts beyond the first; `interval` is
/// the first delay, doubling per attempt up to one minute.
pub async fn connect_with_retries(
    provider: &dyn ConnectionProvider,
    retries: u32,
    interval: Duration,
) -> MigrateResult<Box<dyn Connection>> {
    let mut attempt = 0u32;
    loop {
        match provider.connect().await {
            Ok(conn) => {
                debug!(attempt, "database connection established");
                return Ok(conn);
            }
            Err(err) if attempt < retries && err.is_transient() => {
                let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
                let delay = interval
                    .checked_mul(factor)
                    .map_or(MAX_CONNECT_BACKOFF, |d| d.min(MAX_CONNECT_BACKOFF));
                warn!(attempt, ?delay, %err, "connection failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Convenience: map a backend failure into the database error kind.
pub fn backend_error(err: impl std::fmt::Display) -> MigrateError {
    MigrateError::database(err.to_string())
}
