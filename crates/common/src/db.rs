use sqlx::{Connection, PgConnection};

/// Open a dedicated PostgreSQL connection for the queue worker.
///
/// The relay makes exactly one store call at a time, so it holds a single
/// connection instead of a pool and reopens it whenever it is dropped.
pub async fn connect(database_url: &str) -> Result<PgConnection, sqlx::Error> {
    let conn = PgConnection::connect(database_url).await?;

    tracing::debug!("Connected to PostgreSQL queue store");
    Ok(conn)
}
