//! Batch table operations

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::config::MAX_REQUESTS_PER_BATCH;
use crate::error::{Error, Result};
use crate::models::{Batch, BatchTransition};
use crate::state::BatchState;

/// Insert a fresh `building` batch for `(url, model)`.
pub async fn insert_building(conn: &mut SqliteConnection, url: &str, model: &str) -> Result<Batch> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO batches (id, model, url, state, created_at, updated_at)
        VALUES (?, ?, ?, 'building', ?, ?)
        "#,
    )
    .bind(&id)
    .bind(model)
    .bind(url)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    get_conn(conn, &id).await
}

/// Fetch a batch by id.
pub async fn get(pool: &SqlitePool, id: &str) -> Result<Batch> {
    sqlx::query_as("SELECT * FROM batches WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::not_found(format!("batch {}", id)))
}

async fn get_conn(conn: &mut SqliteConnection, id: &str) -> Result<Batch> {
    sqlx::query_as("SELECT * FROM batches WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found(format!("batch {}", id)))
}

/// The one `building` candidate for `(url, model)`, or nothing when it
/// would overflow the request cap. Callers treat the result as provisional
/// and re-validate size under their own serialization.
pub async fn find_building_batch(
    conn: &mut SqliteConnection,
    url: &str,
    model: &str,
) -> Result<Option<Batch>> {
    let batch = sqlx::query_as(
        r#"
        SELECT * FROM batches
        WHERE url = ? AND model = ? AND state = 'building' AND request_count < ?
        ORDER BY created_at ASC
        LIMIT 1
        "#,
    )
    .bind(url)
    .bind(model)
    .bind(MAX_REQUESTS_PER_BATCH)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(batch)
}

/// Compare-and-set state transition plus the audit row, in the caller's
/// transaction. Fails with `InvalidTransition` when the move is illegal or
/// the row is no longer in `from`.
pub async fn transition(
    conn: &mut SqliteConnection,
    batch_id: &str,
    from: BatchState,
    to: BatchState,
) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            entity: "batch",
            id: batch_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    let result = sqlx::query("UPDATE batches SET state = ?, updated_at = ? WHERE id = ? AND state = ?")
        .bind(to.to_string())
        .bind(Utc::now())
        .bind(batch_id)
        .bind(from.to_string())
        .execute(&mut *conn)
        .await?;

    if result.rows_affected() == 0 {
        // Either the batch is gone or a concurrent writer moved it first.
        let current: Option<(String,)> = sqlx::query_as("SELECT state FROM batches WHERE id = ?")
            .bind(batch_id)
            .fetch_optional(&mut *conn)
            .await?;
        return match current {
            None => Err(Error::not_found(format!("batch {}", batch_id))),
            Some((state,)) => Err(Error::InvalidTransition {
                entity: "batch",
                id: batch_id.to_string(),
                from: state,
                to: to.to_string(),
            }),
        };
    }

    sqlx::query(
        r#"
        INSERT INTO batch_transitions (id, batch_id, from_state, to_state, transitioned_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(batch_id)
    .bind(from.to_string())
    .bind(to.to_string())
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Pool convenience: transition in its own transaction.
pub async fn transition_pool(
    pool: &SqlitePool,
    batch_id: &str,
    from: BatchState,
    to: BatchState,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    transition(&mut tx, batch_id, from, to).await?;
    tx.commit().await?;
    Ok(())
}

/// Audit trail for a batch, oldest first.
pub async fn transitions(pool: &SqlitePool, batch_id: &str) -> Result<Vec<BatchTransition>> {
    let rows = sqlx::query_as(
        "SELECT * FROM batch_transitions WHERE batch_id = ? ORDER BY transitioned_at ASC, id ASC",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// All batches in a state.
pub async fn list_by_state(pool: &SqlitePool, state: BatchState) -> Result<Vec<Batch>> {
    let rows = sqlx::query_as("SELECT * FROM batches WHERE state = ? ORDER BY created_at ASC")
        .bind(state.to_string())
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

/// All non-terminal batches (restart recovery scan).
pub async fn list_non_terminal(pool: &SqlitePool) -> Result<Vec<Batch>> {
    let terminal: Vec<String> = BatchState::ALL
        .iter()
        .filter(|s| s.is_terminal())
        .map(|s| s.to_string())
        .collect();
    // Fixed small set, safe to inline
    let placeholders = terminal.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT * FROM batches WHERE state NOT IN ({}) ORDER BY created_at ASC",
        placeholders
    );
    let mut query = sqlx::query_as(&sql);
    for state in &terminal {
        query = query.bind(state);
    }
    let rows = query.fetch_all(pool).await?;
    Ok(rows)
}

/// Batches waiting for capacity for one model, oldest wait first.
pub async fn list_waiting_for_capacity(pool: &SqlitePool, model: &str) -> Result<Vec<Batch>> {
    let rows = sqlx::query_as(
        r#"
        SELECT * FROM batches
        WHERE model = ? AND state = 'waiting_for_capacity'
        ORDER BY waiting_for_capacity_since_at ASC, id ASC
        "#,
    )
    .bind(model)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Models that currently have batches waiting for capacity.
pub async fn models_with_waiting(pool: &SqlitePool) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT model FROM batches WHERE state = 'waiting_for_capacity'",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(m,)| m).collect())
}

/// Sum of estimated tokens over batches occupying provider queue slots for
/// `model`, excluding `exclude_batch_id`.
pub async fn reserved_tokens(
    pool: &SqlitePool,
    model: &str,
    exclude_batch_id: &str,
) -> Result<i64> {
    let states: Vec<String> = BatchState::ALL
        .iter()
        .filter(|s| s.holds_capacity())
        .map(|s| s.to_string())
        .collect();
    let placeholders = states.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT COALESCE(SUM(estimated_input_tokens_total), 0) FROM batches \
         WHERE model = ? AND id != ? AND state IN ({})",
        placeholders
    );
    let mut query = sqlx::query_as(&sql).bind(model).bind(exclude_batch_id);
    for state in &states {
        query = query.bind(state);
    }
    let (sum,): (i64,) = query.fetch_one(pool).await?;
    Ok(sum)
}

/// Stale `building` batches (older than the cutoff).
pub async fn list_stale_building(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<Vec<Batch>> {
    let rows = sqlx::query_as(
        "SELECT * FROM batches WHERE state = 'building' AND created_at < ? ORDER BY created_at ASC",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Batches whose retention window has passed.
pub async fn list_expired(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<Batch>> {
    let rows = sqlx::query_as(
        "SELECT * FROM batches WHERE expires_at IS NOT NULL AND expires_at < ? ORDER BY expires_at ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Delete a batch row; requests, transitions and attempts cascade.
pub async fn delete(pool: &SqlitePool, batch_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM batches WHERE id = ?")
        .bind(batch_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================================
// Attribute mutations (always alongside a transition, same transaction)
// ============================================================================

pub async fn set_input_file(
    conn: &mut SqliteConnection,
    batch_id: &str,
    file_id: &str,
) -> Result<()> {
    sqlx::query("UPDATE batches SET provider_input_file_id = ?, updated_at = ? WHERE id = ?")
        .bind(file_id)
        .bind(Utc::now())
        .bind(batch_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_provider_batch(
    conn: &mut SqliteConnection,
    batch_id: &str,
    provider_batch_id: &str,
    expires_at: Option<DateTime<Utc>>,
) -> Result<()> {
    sqlx::query(
        "UPDATE batches SET provider_batch_id = ?, expires_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(provider_batch_id)
    .bind(expires_at)
    .bind(Utc::now())
    .bind(batch_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn stamp_waiting_for_capacity(
    conn: &mut SqliteConnection,
    batch_id: &str,
    reason: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE batches SET
            waiting_for_capacity_since_at = COALESCE(waiting_for_capacity_since_at, ?),
            capacity_wait_reason = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(Utc::now())
    .bind(reason)
    .bind(Utc::now())
    .bind(batch_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn set_capacity_wait_reason(
    pool: &SqlitePool,
    batch_id: &str,
    reason: &str,
) -> Result<()> {
    sqlx::query("UPDATE batches SET capacity_wait_reason = ?, updated_at = ? WHERE id = ?")
        .bind(reason)
        .bind(Utc::now())
        .bind(batch_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Merge a provider poll into the batch row: counters, usage, last-checked.
pub async fn merge_provider_poll(
    conn: &mut SqliteConnection,
    batch_id: &str,
    completed: i64,
    failed: i64,
    total: i64,
    input_tokens: i64,
    cached_tokens: i64,
    reasoning_tokens: i64,
    output_tokens: i64,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE batches SET
            provider_requests_completed = ?,
            provider_requests_failed = ?,
            provider_requests_total = ?,
            input_tokens = ?,
            cached_tokens = ?,
            reasoning_tokens = ?,
            output_tokens = ?,
            provider_status_last_checked_at = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(completed)
    .bind(failed)
    .bind(total)
    .bind(input_tokens)
    .bind(cached_tokens)
    .bind(reasoning_tokens)
    .bind(output_tokens)
    .bind(Utc::now())
    .bind(Utc::now())
    .bind(batch_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn set_output_files(
    conn: &mut SqliteConnection,
    batch_id: &str,
    output_file_id: Option<&str>,
    error_file_id: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE batches SET provider_output_file_id = ?, provider_error_file_id = ?, updated_at = ? WHERE id = ?",
    )
    .bind(output_file_id)
    .bind(error_file_id)
    .bind(Utc::now())
    .bind(batch_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn set_error_msg(conn: &mut SqliteConnection, batch_id: &str, msg: &str) -> Result<()> {
    sqlx::query("UPDATE batches SET error_msg = ?, updated_at = ? WHERE id = ?")
        .bind(msg)
        .bind(Utc::now())
        .bind(batch_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Record a token-limit failure: bump the attempt counter and schedule the
/// next try.
pub async fn set_token_limit_backoff(
    conn: &mut SqliteConnection,
    batch_id: &str,
    attempts: i64,
    next_at: DateTime<Utc>,
    last_error: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE batches SET
            token_limit_retry_attempts = ?,
            token_limit_retry_next_at = ?,
            token_limit_retry_last_error = ?,
            capacity_wait_reason = 'token_limit_exceeded_backoff',
            provider_batch_id = NULL,
            provider_status_last_checked_at = NULL,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(attempts)
    .bind(next_at)
    .bind(last_error)
    .bind(Utc::now())
    .bind(batch_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Clear token-limit retry bookkeeping after a successful (re)submission.
pub async fn reset_token_limit_backoff(conn: &mut SqliteConnection, batch_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE batches SET
            token_limit_retry_attempts = 0,
            token_limit_retry_next_at = NULL,
            token_limit_retry_last_error = NULL,
            capacity_wait_reason = NULL,
            waiting_for_capacity_since_at = NULL,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(Utc::now())
    .bind(batch_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Clear provider handles ahead of a full resubmission (expired with no
/// partial output).
pub async fn clear_provider_ids(conn: &mut SqliteConnection, batch_id: &str) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE batches SET
            provider_batch_id = NULL,
            provider_output_file_id = NULL,
            provider_error_file_id = NULL,
            provider_status_last_checked_at = NULL,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(Utc::now())
    .bind(batch_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Clear the input file handle too; the next upload re-renders the batch
/// (after partial expiration only the pending remainder is resubmitted).
pub async fn clear_input_file(conn: &mut SqliteConnection, batch_id: &str) -> Result<()> {
    sqlx::query("UPDATE batches SET provider_input_file_id = NULL, updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(batch_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ============================================================================
// Aggregated request-state views
// ============================================================================

/// Per-state request counts for a batch.
#[derive(Debug, Clone, Default)]
pub struct RequestStateCounts {
    pub counts: Vec<(String, i64)>,
}

impl RequestStateCounts {
    pub fn get(&self, state: &str) -> i64 {
        self.counts
            .iter()
            .find(|(s, _)| s == state)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    pub fn total(&self) -> i64 {
        self.counts.iter().map(|(_, n)| n).sum()
    }
}

pub async fn request_state_counts(pool: &SqlitePool, batch_id: &str) -> Result<RequestStateCounts> {
    let counts = sqlx::query_as(
        "SELECT state, COUNT(*) FROM requests WHERE batch_id = ? GROUP BY state",
    )
    .bind(batch_id)
    .fetch_all(pool)
    .await?;
    Ok(RequestStateCounts { counts })
}

/// Per-state batch counts, for the operator CLI.
#[derive(Debug, Clone, Default)]
pub struct BatchStateCounts {
    pub counts: Vec<(String, i64)>,
}

pub async fn batch_state_counts(pool: &SqlitePool) -> Result<BatchStateCounts> {
    let counts = sqlx::query_as("SELECT state, COUNT(*) FROM batches GROUP BY state")
        .fetch_all(pool)
        .await?;
    Ok(BatchStateCounts { counts })
}

/// Recent batches, newest first, for the operator CLI.
pub async fn list_recent(pool: &SqlitePool, limit: i64) -> Result<Vec<Batch>> {
    let rows = sqlx::query_as("SELECT * FROM batches ORDER BY created_at DESC LIMIT ?")
        .bind(limit)
        .fetch_all(pool)
        .await?;
    Ok(rows)
}
