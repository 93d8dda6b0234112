//! Integration tests for the dequeue client against a real queue store.
//!
//! These tests require a running PostgreSQL database and the `DATABASE_URL`
//! environment variable to be set. Run with:
//!
//! ```bash
//! DATABASE_URL="postgresql://..." cargo test -p herald-relay --test integration -- --ignored --nocapture
//! ```

use sqlx::PgPool;

use herald_common::error::AppError;
use herald_relay::queue::DequeueClient;

/// Apply migrations, empty the queue and build a client on a pool connection.
async fn setup(pool: &PgPool, procedure: &str) -> DequeueClient {
    sqlx::migrate!("../../migrations").run(pool).await.unwrap();

    sqlx::query("DELETE FROM notification_queue")
        .execute(pool)
        .await
        .unwrap();

    let conn = pool.acquire().await.unwrap().detach();

    // Zero-second long-poll keeps empty-queue tests fast
    DequeueClient::with_procedure(std::env::var("DATABASE_URL").unwrap(), procedure, 0)
        .with_connection(conn)
}

async fn enqueue(pool: &PgPool, payload: &str) -> uuid::Uuid {
    let (id,): (uuid::Uuid,) = sqlx::query_as("SELECT enqueue_notification($1)")
        .bind(payload)
        .fetch_one(pool)
        .await
        .unwrap();
    id
}

async fn queue_len(pool: &PgPool) -> i64 {
    let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM notification_queue")
        .fetch_one(pool)
        .await
        .unwrap();
    count
}

#[sqlx::test]
#[ignore] // Requires DATABASE_URL, run explicitly with --ignored
async fn test_dequeue_claims_record(pool: PgPool) {
    let mut client = setup(&pool, "dequeue_notification").await;

    let id = enqueue(
        &pool,
        "<Notification><Application>Jobs</Application><Type>Build Failed</Type>\
         <Title>X</Title><Message>Y</Message></Notification>",
    )
    .await;

    let record = client.fetch_next().await.unwrap().expect("expected a record");
    assert_eq!(record.id, id);
    assert_eq!(record.application, "Jobs");
    assert_eq!(record.type_key(), "BUILD_FAILED");

    assert_eq!(queue_len(&pool).await, 0, "claim must be committed");
    assert!(client.fetch_next().await.unwrap().is_none());
}

#[sqlx::test]
#[ignore]
async fn test_empty_queue_returns_none(pool: PgPool) {
    let mut client = setup(&pool, "dequeue_notification").await;

    assert!(client.fetch_next().await.unwrap().is_none());
    assert!(client.is_prepared());
}

#[sqlx::test]
#[ignore]
async fn test_non_success_status_returns_none(pool: PgPool) {
    let mut client = setup(&pool, "dequeue_busy").await;

    sqlx::query(
        r#"
        CREATE OR REPLACE FUNCTION dequeue_busy(p_timeout_sec INT)
        RETURNS TABLE (status INT, notification_id UUID, payload TEXT)
        LANGUAGE sql
        AS $$ SELECT 3, gen_random_uuid(), '<Notification/>'::TEXT $$
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    assert!(client.fetch_next().await.unwrap().is_none());
}

#[sqlx::test]
#[ignore]
async fn test_missing_procedure_rebuilds_call(pool: PgPool) {
    let mut client = setup(&pool, "dequeue_later").await;

    let result = client.fetch_next().await;
    assert!(matches!(result, Err(AppError::Database(_))));
    assert!(!client.is_prepared());
    assert!(client.is_connected());

    sqlx::query(
        r#"
        CREATE FUNCTION dequeue_later(p_timeout_sec INT)
        RETURNS TABLE (status INT, notification_id UUID, payload TEXT)
        LANGUAGE sql
        AS $$ SELECT * FROM dequeue_notification(p_timeout_sec) $$
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    enqueue(&pool, "<Notification><Application>Jobs</Application></Notification>").await;
    let record = client.fetch_next().await.unwrap();
    assert!(record.is_some());
}

#[sqlx::test]
#[ignore]
async fn test_malformed_payload_rolls_back(pool: PgPool) {
    let mut client = setup(&pool, "dequeue_notification").await;

    enqueue(&pool, "<Notification><Application>Jobs</Notification>").await;

    let result = client.fetch_next().await;
    assert!(matches!(result, Err(AppError::Decode(_))));
    assert_eq!(queue_len(&pool).await, 1, "claim must be rolled back");
}

#[sqlx::test]
#[ignore]
async fn test_close_releases_connection(pool: PgPool) {
    let mut client = setup(&pool, "dequeue_notification").await;
    assert!(client.is_connected());

    client.close().await;
    assert!(!client.is_connected());
}

#[sqlx::test]
#[ignore]
async fn test_changed_result_type_rebuilds_call(pool: PgPool) {
    let mut client = setup(&pool, "dequeue_reshaped").await;

    sqlx::query(
        r#"
        CREATE FUNCTION dequeue_reshaped(p_timeout_sec INT)
        RETURNS TABLE (status INT, notification_id UUID, payload TEXT)
        LANGUAGE sql
        AS $$ SELECT * FROM dequeue_notification(p_timeout_sec) $$
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    assert!(client.fetch_next().await.unwrap().is_none());
    assert!(client.is_prepared());

    sqlx::query("DROP FUNCTION dequeue_reshaped(INT)")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        r#"
        CREATE FUNCTION dequeue_reshaped(p_timeout_sec INT)
        RETURNS TABLE (status INT, notification_id UUID, payload VARCHAR)
        LANGUAGE sql
        AS $$
            SELECT status, notification_id, payload::VARCHAR
            FROM dequeue_notification(p_timeout_sec)
        $$
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    // The stale plan fails once, then the call is prepared again
    assert!(matches!(client.fetch_next().await, Err(AppError::Database(_))));
    assert!(!client.is_prepared());
    assert!(client.is_connected());

    let id = enqueue(&pool, "<Growl><Application>Jobs</Application></Growl>").await;
    let record = client.fetch_next().await.unwrap().expect("expected a record");
    assert_eq!(record.id, id);
    assert!(client.is_prepared());
}

#[sqlx::test]
#[ignore]
async fn test_deadlock_victim_returns_none(pool: PgPool) {
    sqlx::query(
        r#"
        CREATE FUNCTION dequeue_deadlocked(p_timeout_sec INT)
        RETURNS TABLE (status INT, notification_id UUID, payload TEXT)
        LANGUAGE plpgsql
        AS $$
        BEGIN
            RAISE EXCEPTION 'deadlock detected' USING ERRCODE = '40P01';
        END;
        $$
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    let mut client = setup(&pool, "dequeue_deadlocked").await;

    for _ in 0..2 {
        assert!(client.fetch_next().await.unwrap().is_none());
        assert!(client.is_connected());
        assert!(client.is_prepared());
    }
}

#[sqlx::test]
#[ignore]
async fn test_raised_error_propagates_and_keeps_connection(pool: PgPool) {
    sqlx::query(
        r#"
        CREATE FUNCTION dequeue_raising(p_timeout_sec INT)
        RETURNS TABLE (status INT, notification_id UUID, payload TEXT)
        LANGUAGE plpgsql
        AS $$
        BEGIN
            RAISE EXCEPTION 'queue is paused';
        END;
        $$
        "#,
    )
    .execute(&pool)
    .await
    .unwrap();

    let mut client = setup(&pool, "dequeue_raising").await;

    let result = client.fetch_next().await;
    assert!(matches!(result, Err(AppError::Database(_))));
    assert!(client.is_connected());
    assert!(client.is_prepared());
}
