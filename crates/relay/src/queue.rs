//! Transactional dequeue against the PostgreSQL queue store.
//!
//! Each call runs `SELECT status, notification_id, payload FROM <procedure>($1)`
//! inside its own transaction. The procedure long-polls for up to `$1` seconds;
//! the client allows 30 seconds more before it gives up on the call.

use std::future::Future;
use std::time::Duration;

use sqlx::postgres::{PgConnection, PgStatement};
use sqlx::{Connection, Executor, Postgres, Row, Statement, Transaction};
use uuid::Uuid;

use herald_common::config::AppConfig;
use herald_common::db;
use herald_common::error::AppError;
use herald_common::types::NotificationRecord;

/// Procedure status meaning the call succeeded.
pub const STATUS_SUCCESS: i32 = 0;

/// Client-side headroom over the store-side long-poll.
pub const TIMEOUT_HEADROOM_SECS: u64 = 30;

/// Anything the polling loop can pull notification records from.
pub trait NotificationSource: Send {
    /// Claim the next record. `Ok(None)` means no work this round.
    fn fetch_next(
        &mut self,
    ) -> impl Future<Output = Result<Option<NotificationRecord>, AppError>> + Send;

    /// Release the underlying store connection.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Classes of store failures the dequeue handles differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// Chosen as deadlock victim; treated as no work
    Deadlock,
    /// Procedure missing, or replaced with a different signature or result type;
    /// the prepared call is rebuilt
    SchemaChanged,
    /// Raised explicitly by the procedure
    UserError,
    /// The connection itself is unusable
    Connection,
    Unknown,
}

impl StoreErrorKind {
    /// Classify by SQLSTATE.
    pub fn from_code(code: &str) -> Self {
        match code {
            "40P01" => StoreErrorKind::Deadlock,
            // undefined_function
            "42883" => StoreErrorKind::SchemaChanged,
            // feature_not_supported, raised as "cached plan must not change result type"
            "0A000" => StoreErrorKind::SchemaChanged,
            "P0001" => StoreErrorKind::UserError,
            _ => StoreErrorKind::Unknown,
        }
    }

    pub fn of(err: &sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => db_err
                .code()
                .map(|code| Self::from_code(&code))
                .unwrap_or(StoreErrorKind::Unknown),
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => StoreErrorKind::Connection,
            _ => StoreErrorKind::Unknown,
        }
    }
}

/// Dequeue client holding one store connection and the prepared procedure call.
pub struct DequeueClient {
    database_url: String,
    procedure: String,
    call_sql: String,
    poll_interval_secs: u64,
    conn: Option<PgConnection>,
    statement: Option<PgStatement<'static>>,
}

impl DequeueClient {
    pub fn new(config: &AppConfig) -> Self {
        Self::with_procedure(
            config.database_url.clone(),
            &config.dequeue_procedure,
            config.poll_interval_secs,
        )
    }

    pub fn with_procedure(database_url: String, procedure: &str, poll_interval_secs: u64) -> Self {
        Self {
            database_url,
            procedure: procedure.to_string(),
            call_sql: format!(
                "SELECT status, notification_id, payload FROM {}($1)",
                procedure
            ),
            poll_interval_secs,
            conn: None,
            statement: None,
        }
    }

    /// Start from an already open connection instead of connecting lazily.
    pub fn with_connection(mut self, conn: PgConnection) -> Self {
        self.conn = Some(conn);
        self
    }

    /// Execution timeout of one dequeue call.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.saturating_add(TIMEOUT_HEADROOM_SECS))
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub fn is_prepared(&self) -> bool {
        self.statement.is_some()
    }

    /// Dequeue one record, absorbing deadlocks and repairing the call on schema drift.
    pub async fn fetch_next(&mut self) -> Result<Option<NotificationRecord>, AppError> {
        match self.try_fetch().await {
            Ok(record) => Ok(record),
            Err(AppError::Database(err)) => match StoreErrorKind::of(&err) {
                StoreErrorKind::Deadlock => {
                    tracing::debug!(
                        procedure = %self.procedure,
                        "Dequeue call was picked as deadlock victim"
                    );
                    Ok(None)
                }
                StoreErrorKind::SchemaChanged => {
                    tracing::warn!(
                        procedure = %self.procedure,
                        error = %err,
                        "Dequeue procedure missing or changed, rebuilding the prepared call"
                    );
                    self.invalidate_statement().await;
                    Err(AppError::Database(err))
                }
                StoreErrorKind::Connection => {
                    self.drop_connection();
                    Err(AppError::Database(err))
                }
                StoreErrorKind::UserError | StoreErrorKind::Unknown => Err(AppError::Database(err)),
            },
            Err(AppError::Timeout(elapsed)) => {
                // The abandoned query may still be on the wire
                self.drop_connection();
                Err(AppError::Timeout(elapsed))
            }
            Err(other) => Err(other),
        }
    }

    /// Close the connection if one is open.
    pub async fn close(&mut self) {
        self.statement = None;
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "Error closing queue store connection");
            }
            tracing::info!("Closed queue store connection");
        }
    }

    async fn try_fetch(&mut self) -> Result<Option<NotificationRecord>, AppError> {
        let timeout = self.command_timeout();
        let timeout_secs = i32::try_from(self.poll_interval_secs).unwrap_or(i32::MAX);

        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                let conn = db::connect(&self.database_url).await?;
                tracing::debug!(procedure = %self.procedure, "Queue store (re)connected");
                conn
            }
        };
        let conn = self.conn.insert(conn);

        let statement = match self.statement.take() {
            Some(statement) => statement,
            None => {
                let prepared = (&mut *conn).prepare(self.call_sql.as_str()).await?;
                Statement::to_owned(&prepared)
            }
        };
        let statement = self.statement.insert(statement);

        let mut tx = conn.begin().await?;
        match call(&mut tx, statement, &self.procedure, timeout_secs, timeout).await {
            Ok(record) => {
                tx.commit().await?;
                Ok(record)
            }
            Err(e) => {
                rollback(tx).await;
                Err(e)
            }
        }
    }

    async fn invalidate_statement(&mut self) {
        self.statement = None;
        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = conn.clear_cached_statements().await {
                tracing::debug!(error = %e, "Failed to clear cached statements");
            }
        }
    }

    fn drop_connection(&mut self) {
        self.statement = None;
        if self.conn.take().is_some() {
            tracing::warn!("Dropped queue store connection, reconnecting on next poll");
        }
    }
}

impl NotificationSource for DequeueClient {
    async fn fetch_next(&mut self) -> Result<Option<NotificationRecord>, AppError> {
        DequeueClient::fetch_next(self).await
    }

    async fn close(&mut self) {
        DequeueClient::close(self).await
    }
}

/// Run the prepared call inside `tx` and decode its single row.
async fn call(
    tx: &mut Transaction<'_, Postgres>,
    statement: &PgStatement<'static>,
    procedure: &str,
    timeout_secs: i32,
    timeout: Duration,
) -> Result<Option<NotificationRecord>, AppError> {
    let set_timeout = format!("SET LOCAL statement_timeout = {}", timeout.as_millis());
    sqlx::query(&set_timeout).execute(&mut **tx).await?;

    let row = tokio::time::timeout(
        timeout,
        statement.query().bind(timeout_secs).fetch_optional(&mut **tx),
    )
    .await
    .map_err(|_| AppError::Timeout(timeout))??;

    let Some(row) = row else {
        return Ok(None);
    };

    let status: i32 = row.try_get("status")?;
    if status != STATUS_SUCCESS {
        tracing::info!(procedure, status, "Dequeue procedure returned non-success status");
        return Ok(None);
    }

    let Some(id) = row.try_get::<Option<Uuid>, _>("notification_id")? else {
        return Ok(None);
    };
    let payload: Option<String> = row.try_get("payload")?;

    let record = NotificationRecord::from_xml(id, payload.as_deref().unwrap_or_default())?;
    Ok(Some(record))
}

/// Best-effort rollback; the store may already have rolled back on its own.
async fn rollback(tx: Transaction<'_, Postgres>) {
    if let Err(e) = tx.rollback().await {
        tracing::debug!(error = %e, "Rollback failed");
    }
}
