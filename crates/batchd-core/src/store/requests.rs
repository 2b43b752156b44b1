//! Request table operations

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{DeliveryOutcome, Request, RequestDeliveryAttempt, SubmitRequest};
use crate::state::RequestState;

/// Persist a validated submission into its batch. The aggregate triggers
/// bump the batch counters in the same transaction.
#[allow(clippy::too_many_arguments)]
pub async fn insert(
    conn: &mut SqliteConnection,
    batch_id: &str,
    submit: &SubmitRequest,
    payload_canonical: &str,
    payload_size: i64,
    estimated_input_tokens: i64,
    estimated_request_input_tokens: i64,
) -> Result<Request> {
    let id = Uuid::new_v4().to_string();
    let now = Utc::now();
    let delivery_config = serde_json::to_string(&submit.delivery_config)?;

    let result = sqlx::query(
        r#"
        INSERT INTO requests
            (id, batch_id, custom_id, url, model, state, request_payload,
             request_payload_size, estimated_input_tokens,
             estimated_request_input_tokens, delivery_config, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&id)
    .bind(batch_id)
    .bind(&submit.custom_id)
    .bind(&submit.url)
    .bind(&submit.model)
    .bind(payload_canonical)
    .bind(payload_size)
    .bind(estimated_input_tokens)
    .bind(estimated_request_input_tokens)
    .bind(&delivery_config)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await;

    match result {
        Ok(_) => get_conn(conn, &id).await,
        Err(e) if is_unique_violation(&e) => Err(Error::validation(format!(
            "duplicate custom_id {:?} in batch {}",
            submit.custom_id, batch_id
        ))),
        Err(e) => Err(e.into()),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.is_unique_violation())
        .unwrap_or(false)
}

/// Fetch a request by id.
pub async fn get(pool: &SqlitePool, id: &str) -> Result<Request> {
    sqlx::query_as("SELECT * FROM requests WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| Error::not_found(format!("request {}", id)))
}

async fn get_conn(conn: &mut SqliteConnection, id: &str) -> Result<Request> {
    sqlx::query_as("SELECT * FROM requests WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| Error::not_found(format!("request {}", id)))
}

/// Requests of one batch matching a set of custom_ids.
pub async fn get_by_custom_ids(
    conn: &mut SqliteConnection,
    batch_id: &str,
    custom_ids: &[String],
) -> Result<Vec<Request>> {
    if custom_ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = custom_ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT * FROM requests WHERE batch_id = ? AND custom_id IN ({})",
        placeholders
    );
    let mut query = sqlx::query_as(&sql).bind(batch_id);
    for custom_id in custom_ids {
        query = query.bind(custom_id);
    }
    let rows = query.fetch_all(&mut *conn).await?;
    Ok(rows)
}

/// All requests of a batch in a given state, submission order.
pub async fn list_by_state(
    pool: &SqlitePool,
    batch_id: &str,
    state: RequestState,
) -> Result<Vec<Request>> {
    let rows = sqlx::query_as(
        "SELECT * FROM requests WHERE batch_id = ? AND state = ? ORDER BY created_at ASC, id ASC",
    )
    .bind(batch_id)
    .bind(state.to_string())
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// All requests of a batch, submission order (JSONL render order).
pub async fn list_for_batch(pool: &SqlitePool, batch_id: &str) -> Result<Vec<Request>> {
    let rows =
        sqlx::query_as("SELECT * FROM requests WHERE batch_id = ? ORDER BY created_at ASC, id ASC")
            .bind(batch_id)
            .fetch_all(pool)
            .await?;
    Ok(rows)
}

/// True when every request of the batch is in a terminal state.
pub async fn all_terminal(pool: &SqlitePool, batch_id: &str) -> Result<bool> {
    let non_terminal: Vec<String> = RequestState::ALL
        .iter()
        .filter(|s| !s.is_terminal())
        .map(|s| s.to_string())
        .collect();
    let placeholders = non_terminal.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
    let sql = format!(
        "SELECT COUNT(*) FROM requests WHERE batch_id = ? AND state IN ({})",
        placeholders
    );
    let mut query = sqlx::query_as(&sql).bind(batch_id);
    for state in &non_terminal {
        query = query.bind(state);
    }
    let (count,): (i64,) = query.fetch_one(pool).await?;
    Ok(count == 0)
}

/// Compare-and-set state transition. Requests have no per-transition audit
/// table; delivery attempts are audited separately.
pub async fn transition(
    conn: &mut SqliteConnection,
    request_id: &str,
    from: RequestState,
    to: RequestState,
) -> Result<()> {
    if !from.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            entity: "request",
            id: request_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    let result =
        sqlx::query("UPDATE requests SET state = ?, updated_at = ? WHERE id = ? AND state = ?")
            .bind(to.to_string())
            .bind(Utc::now())
            .bind(request_id)
            .bind(from.to_string())
            .execute(&mut *conn)
            .await?;

    if result.rows_affected() == 0 {
        let current: Option<(String,)> = sqlx::query_as("SELECT state FROM requests WHERE id = ?")
            .bind(request_id)
            .fetch_optional(&mut *conn)
            .await?;
        return match current {
            None => Err(Error::not_found(format!("request {}", request_id))),
            Some((state,)) => Err(Error::InvalidTransition {
                entity: "request",
                id: request_id.to_string(),
                from: state,
                to: to.to_string(),
            }),
        };
    }

    Ok(())
}

/// Pool convenience: transition in its own transaction.
pub async fn transition_pool(
    pool: &SqlitePool,
    request_id: &str,
    from: RequestState,
    to: RequestState,
) -> Result<()> {
    let mut tx = pool.begin().await?;
    transition(&mut tx, request_id, from, to).await?;
    tx.commit().await?;
    Ok(())
}

/// Bulk move every request of the batch from one state to another.
pub async fn bulk_transition(
    conn: &mut SqliteConnection,
    batch_id: &str,
    from: RequestState,
    to: RequestState,
) -> Result<u64> {
    if !from.can_transition_to(to) {
        return Err(Error::InvalidTransition {
            entity: "request",
            id: format!("batch {}", batch_id),
            from: from.to_string(),
            to: to.to_string(),
        });
    }
    let result = sqlx::query(
        "UPDATE requests SET state = ?, updated_at = ? WHERE batch_id = ? AND state = ?",
    )
    .bind(to.to_string())
    .bind(Utc::now())
    .bind(batch_id)
    .bind(from.to_string())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Success path for reconciliation: store the full result line and move to
/// `openai_processed`.
pub async fn set_processed(
    conn: &mut SqliteConnection,
    request_id: &str,
    response_payload: &str,
) -> Result<()> {
    transition(conn, request_id, RequestState::OpenaiProcessing, RequestState::OpenaiProcessed)
        .await?;
    sqlx::query(
        "UPDATE requests SET response_payload = ?, error_msg = NULL, updated_at = ? WHERE id = ?",
    )
    .bind(response_payload)
    .bind(Utc::now())
    .bind(request_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Error path for reconciliation: record the full result line as the error.
pub async fn set_failed(
    conn: &mut SqliteConnection,
    request_id: &str,
    from: RequestState,
    error_msg: &str,
) -> Result<()> {
    transition(conn, request_id, from, RequestState::Failed).await?;
    sqlx::query("UPDATE requests SET error_msg = ?, updated_at = ? WHERE id = ?")
        .bind(error_msg)
        .bind(Utc::now())
        .bind(request_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Token-limit retry restart: every request of the batch that has already
/// moved past `pending` goes back to `pending` with response and error
/// cleared. A bulk write; the per-request transition table does not model
/// this restart.
pub async fn reset_for_token_limit_retry(
    conn: &mut SqliteConnection,
    batch_id: &str,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE requests SET
            state = 'pending',
            error_msg = NULL,
            response_payload = NULL,
            updated_at = ?
        WHERE batch_id = ? AND state IN
            ('openai_processing', 'openai_processed', 'delivering', 'delivered',
             'delivery_failed', 'failed', 'expired', 'cancelled')
        "#,
    )
    .bind(Utc::now())
    .bind(batch_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Partial-expiration cleanup: whatever is still `openai_processing` after
/// reconciliation goes back to `pending` for resubmission.
pub async fn reset_processing_to_pending(
    conn: &mut SqliteConnection,
    batch_id: &str,
) -> Result<u64> {
    bulk_transition(conn, batch_id, RequestState::OpenaiProcessing, RequestState::Pending).await
}

/// Requests the provider never answered: whatever is still
/// `openai_processing` after a completed batch reconciles becomes `failed`.
pub async fn fail_leftover_processing(
    conn: &mut SqliteConnection,
    batch_id: &str,
    error_msg: &str,
) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE requests SET state = 'failed', error_msg = ?, updated_at = ?
        WHERE batch_id = ? AND state = 'openai_processing'
        "#,
    )
    .bind(error_msg)
    .bind(Utc::now())
    .bind(batch_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Cancel every non-terminal request of the batch.
pub async fn cancel_non_terminal(conn: &mut SqliteConnection, batch_id: &str) -> Result<u64> {
    let result = sqlx::query(
        r#"
        UPDATE requests SET state = 'cancelled', updated_at = ?
        WHERE batch_id = ? AND state IN
            ('pending', 'openai_processing', 'openai_processed', 'delivering')
        "#,
    )
    .bind(Utc::now())
    .bind(batch_id)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected())
}

/// Bump the delivery attempt counter.
pub async fn increment_delivery_attempts(
    conn: &mut SqliteConnection,
    request_id: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE requests SET delivery_attempt_count = delivery_attempt_count + 1, updated_at = ? WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(request_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Append a delivery attempt audit row.
pub async fn insert_delivery_attempt(
    conn: &mut SqliteConnection,
    request_id: &str,
    outcome: DeliveryOutcome,
    delivery_config_snapshot: &str,
    error_msg: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO request_delivery_attempts
            (id, request_id, outcome, delivery_config_snapshot, error_msg, attempted_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(request_id)
    .bind(outcome.to_string())
    .bind(delivery_config_snapshot)
    .bind(error_msg)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Delivery attempt audit for a request, oldest first.
pub async fn delivery_attempts(
    pool: &SqlitePool,
    request_id: &str,
) -> Result<Vec<RequestDeliveryAttempt>> {
    let rows = sqlx::query_as(
        "SELECT * FROM request_delivery_attempts WHERE request_id = ? ORDER BY attempted_at ASC, id ASC",
    )
    .bind(request_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
