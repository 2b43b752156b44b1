//! Database module - SQLx with SQLite
//!
//! Schema notes:
//! - Batch aggregates (`request_count`, `size_bytes`,
//!   `estimated_input_tokens_total`) are maintained exclusively by triggers
//!   on `requests`, inside the same transaction as the row change.
//! - `batch_transitions` and `request_delivery_attempts` are append-only.
//! - The `jobs` table backs the durable job queue; a partial unique index
//!   on `unique_key` deduplicates live jobs.

use crate::config::get_db_path;
use crate::error::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::str::FromStr;

/// Database state
#[derive(Clone)]
pub struct Database {
    pub pool: SqlitePool,
}

impl Database {
    /// Create a new database connection with default path
    pub async fn new() -> Result<Self> {
        let db_path = get_db_path()?;
        Self::open(db_path).await
    }

    /// Create a new database connection with a specific path
    pub async fn open(db_path: PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        log::info!("Connecting to database: {}", db_path.display());

        // foreign_keys must be set per connection, so it goes through the
        // connect options rather than a one-off PRAGMA query.
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        // Enable WAL mode for better concurrent read/write performance
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;

        // Retry on SQLITE_BUSY instead of failing immediately
        sqlx::query("PRAGMA busy_timeout = 5000")
            .execute(&pool)
            .await?;

        // Synchronous NORMAL is safe with WAL and faster than FULL
        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&pool)
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run database migrations
    async fn run_migrations(&self) -> Result<()> {
        log::info!("Running database migrations...");

        // Batches: one provider batch job
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batches (
                id TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                url TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'building',
                provider_input_file_id TEXT,
                provider_output_file_id TEXT,
                provider_error_file_id TEXT,
                provider_batch_id TEXT,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                expires_at DATETIME,
                provider_status_last_checked_at DATETIME,
                waiting_for_capacity_since_at DATETIME,
                request_count INTEGER NOT NULL DEFAULT 0,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                estimated_input_tokens_total INTEGER NOT NULL DEFAULT 0,
                provider_requests_completed INTEGER NOT NULL DEFAULT 0,
                provider_requests_failed INTEGER NOT NULL DEFAULT 0,
                provider_requests_total INTEGER NOT NULL DEFAULT 0,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                cached_tokens INTEGER NOT NULL DEFAULT 0,
                reasoning_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                capacity_wait_reason TEXT,
                token_limit_retry_attempts INTEGER NOT NULL DEFAULT 0,
                token_limit_retry_next_at DATETIME,
                token_limit_retry_last_error TEXT,
                error_msg TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_batches_url_model_state ON batches(url, model, state)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_batches_model_state ON batches(model, state)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_batches_state ON batches(state)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_batches_expires_at ON batches(expires_at)")
            .execute(&self.pool)
            .await?;

        // Requests: individual submissions, owned by a batch
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                id TEXT PRIMARY KEY,
                batch_id TEXT NOT NULL,
                custom_id TEXT NOT NULL,
                url TEXT NOT NULL,
                model TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                request_payload TEXT NOT NULL,
                request_payload_size INTEGER NOT NULL,
                response_payload TEXT,
                estimated_input_tokens INTEGER NOT NULL DEFAULT 0,
                estimated_request_input_tokens INTEGER NOT NULL DEFAULT 0,
                delivery_config TEXT NOT NULL,
                error_msg TEXT,
                delivery_attempt_count INTEGER NOT NULL DEFAULT 0,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (batch_id) REFERENCES batches(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_requests_batch_custom ON requests(batch_id, custom_id)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_requests_batch ON requests(batch_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_requests_batch_state ON requests(batch_id, state)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_requests_batch_created ON requests(batch_id, created_at, id)",
        )
        .execute(&self.pool)
        .await?;
        // custom_id search
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_requests_custom_id ON requests(custom_id)")
            .execute(&self.pool)
            .await?;

        // Aggregate triggers. These are the only writers of request_count,
        // size_bytes and estimated_input_tokens_total.
        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS trg_requests_insert_aggregates
            AFTER INSERT ON requests
            BEGIN
                UPDATE batches SET
                    request_count = request_count + 1,
                    size_bytes = size_bytes + NEW.request_payload_size,
                    estimated_input_tokens_total = estimated_input_tokens_total + NEW.estimated_input_tokens,
                    updated_at = CURRENT_TIMESTAMP
                WHERE id = NEW.batch_id;
            END
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS trg_requests_delete_aggregates
            AFTER DELETE ON requests
            BEGIN
                UPDATE batches SET
                    request_count = request_count - 1,
                    size_bytes = size_bytes - OLD.request_payload_size,
                    estimated_input_tokens_total = estimated_input_tokens_total - OLD.estimated_input_tokens,
                    updated_at = CURRENT_TIMESTAMP
                WHERE id = OLD.batch_id;
            END
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TRIGGER IF NOT EXISTS trg_requests_update_aggregates
            AFTER UPDATE OF request_payload_size, estimated_input_tokens ON requests
            BEGIN
                UPDATE batches SET
                    size_bytes = size_bytes - OLD.request_payload_size + NEW.request_payload_size,
                    estimated_input_tokens_total = estimated_input_tokens_total - OLD.estimated_input_tokens + NEW.estimated_input_tokens,
                    updated_at = CURRENT_TIMESTAMP
                WHERE id = NEW.batch_id;
            END
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Batch transitions: append-only audit
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS batch_transitions (
                id TEXT PRIMARY KEY,
                batch_id TEXT NOT NULL,
                from_state TEXT NOT NULL,
                to_state TEXT NOT NULL,
                transitioned_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (batch_id) REFERENCES batches(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_transitions_batch ON batch_transitions(batch_id, transitioned_at)",
        )
        .execute(&self.pool)
        .await?;

        // Delivery attempts: append-only audit
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS request_delivery_attempts (
                id TEXT PRIMARY KEY,
                request_id TEXT NOT NULL,
                outcome TEXT NOT NULL,
                delivery_config_snapshot TEXT NOT NULL,
                error_msg TEXT,
                attempted_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (request_id) REFERENCES requests(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_delivery_attempts_request ON request_delivery_attempts(request_id, attempted_at)",
        )
        .execute(&self.pool)
        .await?;

        // Jobs: durable work queue
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                kind TEXT NOT NULL,
                batch_id TEXT,
                request_id TEXT,
                unique_key TEXT,
                tag TEXT,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                run_at DATETIME NOT NULL,
                last_error TEXT,
                created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP,
                updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Live jobs are deduplicated on unique_key
        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_unique_key
            ON jobs(unique_key)
            WHERE unique_key IS NOT NULL AND state IN ('pending', 'running')
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_queue_state_run ON jobs(queue, state, run_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_tag ON jobs(tag) WHERE tag IS NOT NULL")
            .execute(&self.pool)
            .await?;

        log::info!("Database migrations completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::get_db_path as core_get_db_path;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't run in parallel
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_get_db_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        std::env::remove_var("BATCHD_DB_PATH");
        let path = core_get_db_path().unwrap();
        assert!(path.to_string_lossy().contains("batchd.db"));
    }

    #[test]
    fn test_get_db_path_env_override() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let test_path = "/tmp/test_batchd.db";
        std::env::set_var("BATCHD_DB_PATH", test_path);
        let path = core_get_db_path().unwrap();
        assert_eq!(path.to_string_lossy(), test_path);
        std::env::remove_var("BATCHD_DB_PATH");
    }

    #[tokio::test]
    async fn test_open_and_migrate_twice() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let db = Database::open(path.clone()).await.unwrap();
        drop(db);
        // Migrations are idempotent
        Database::open(path).await.unwrap();
    }

    #[tokio::test]
    async fn test_insert_aggregate_triggers() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(dir.path().join("test.db")).await.unwrap();

        sqlx::query(
            "INSERT INTO batches (id, model, url, created_at, updated_at) VALUES ('b1', 'm', '/u', ?, ?)",
        )
        .bind(chrono::Utc::now())
        .bind(chrono::Utc::now())
        .execute(&db.pool)
        .await
        .unwrap();

        for (id, size, tokens) in [("r1", 100, 25), ("r2", 50, 10)] {
            sqlx::query(
                r#"
                INSERT INTO requests
                    (id, batch_id, custom_id, url, model, request_payload,
                     request_payload_size, estimated_input_tokens, delivery_config,
                     created_at, updated_at)
                VALUES (?, 'b1', ?, '/u', 'm', '{}', ?, ?, '{"type":"webhook","url":"https://x"}', ?, ?)
                "#,
            )
            .bind(id)
            .bind(id)
            .bind(size)
            .bind(tokens)
            .bind(chrono::Utc::now())
            .bind(chrono::Utc::now())
            .execute(&db.pool)
            .await
            .unwrap();
        }

        let row: (i64, i64, i64) = sqlx::query_as(
            "SELECT request_count, size_bytes, estimated_input_tokens_total FROM batches WHERE id = 'b1'",
        )
        .fetch_one(&db.pool)
        .await
        .unwrap();
        assert_eq!(row, (2, 150, 35));

        sqlx::query("DELETE FROM requests WHERE id = 'r1'")
            .execute(&db.pool)
            .await
            .unwrap();

        let row: (i64, i64, i64) = sqlx::query_as(
            "SELECT request_count, size_bytes, estimated_input_tokens_total FROM batches WHERE id = 'b1'",
        )
        .fetch_one(&db.pool)
        .await
        .unwrap();
        assert_eq!(row, (1, 50, 10));
    }

    #[tokio::test]
    async fn test_cascade_delete() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::open(dir.path().join("test.db")).await.unwrap();

        sqlx::query("INSERT INTO batches (id, model, url) VALUES ('b1', 'm', '/u')")
            .execute(&db.pool)
            .await
            .unwrap();
        sqlx::query(
            r#"
            INSERT INTO requests
                (id, batch_id, custom_id, url, model, request_payload,
                 request_payload_size, delivery_config)
            VALUES ('r1', 'b1', 'c1', '/u', 'm', '{}', 2, '{"type":"amqp_queue","queue":"q"}')
            "#,
        )
        .execute(&db.pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO batch_transitions (id, batch_id, from_state, to_state) VALUES ('t1', 'b1', 'building', 'uploading')",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        sqlx::query("DELETE FROM batches WHERE id = 'b1'")
            .execute(&db.pool)
            .await
            .unwrap();

        let (requests,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM requests")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        let (transitions,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM batch_transitions")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!((requests, transitions), (0, 0));
    }
}
