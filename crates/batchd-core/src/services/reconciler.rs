//! Result file reconciliation
//!
//! Streams a provider JSONL result file in bounded chunks and applies each
//! line to its request by `custom_id`. Applying the same file twice leaves
//! every request where it was: successes already in `openai_processed` are
//! skipped, terminal requests are skipped, malformed lines are logged and
//! dropped.

use std::collections::HashMap;
use std::path::Path;

use sqlx::SqlitePool;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::error::Result;
use crate::models::ResultLine;
use crate::state::RequestState;
use crate::store::requests;

/// Lines applied per transaction.
const CHUNK_LINES: usize = 100;
/// Progress log cadence, in chunks.
const LOG_EVERY_CHUNKS: usize = 10;

/// Which provider file a line came from. Error-file lines are errors no
/// matter what they contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Output,
    Error,
}

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped_terminal: usize,
    pub skipped_already_processed: usize,
    pub unknown_custom_id: usize,
    pub malformed_lines: usize,
}

impl ReconcileStats {
    fn merge(&mut self, other: ReconcileStats) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped_terminal += other.skipped_terminal;
        self.skipped_already_processed += other.skipped_already_processed;
        self.unknown_custom_id += other.unknown_custom_id;
        self.malformed_lines += other.malformed_lines;
    }
}

/// Apply one downloaded result file to the batch's requests.
pub async fn apply_result_file(
    pool: &SqlitePool,
    batch_id: &str,
    path: &Path,
    kind: FileKind,
) -> Result<ReconcileStats> {
    let file = tokio::fs::File::open(path).await?;
    let mut lines = BufReader::new(file).lines();

    let mut stats = ReconcileStats::default();
    let mut chunk: Vec<String> = Vec::with_capacity(CHUNK_LINES);
    let mut chunk_index = 0usize;
    let mut line_count = 0usize;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        line_count += 1;
        chunk.push(line);
        if chunk.len() >= CHUNK_LINES {
            stats.merge(apply_chunk(pool, batch_id, &chunk, kind).await?);
            chunk.clear();
            chunk_index += 1;
            if chunk_index % LOG_EVERY_CHUNKS == 0 {
                log::info!(
                    "Reconciling batch {}: {} lines processed ({:?} file)",
                    batch_id,
                    line_count,
                    kind
                );
            }
        }
    }
    if !chunk.is_empty() {
        stats.merge(apply_chunk(pool, batch_id, &chunk, kind).await?);
    }

    log::info!(
        "Reconciled batch {} ({:?} file): {} ok, {} failed, {} already processed, {} terminal, {} unknown, {} malformed",
        batch_id,
        kind,
        stats.succeeded,
        stats.failed,
        stats.skipped_already_processed,
        stats.skipped_terminal,
        stats.unknown_custom_id,
        stats.malformed_lines
    );
    Ok(stats)
}

/// Parse and apply one chunk inside a single transaction.
async fn apply_chunk(
    pool: &SqlitePool,
    batch_id: &str,
    lines: &[String],
    kind: FileKind,
) -> Result<ReconcileStats> {
    let mut stats = ReconcileStats::default();

    let mut parsed: Vec<(&str, ResultLine)> = Vec::with_capacity(lines.len());
    for line in lines {
        match serde_json::from_str::<ResultLine>(line) {
            Ok(result) => parsed.push((line.as_str(), result)),
            Err(e) => {
                log::warn!("Skipping malformed result line for batch {}: {}", batch_id, e);
                stats.malformed_lines += 1;
            }
        }
    }

    let custom_ids: Vec<String> = parsed.iter().map(|(_, r)| r.custom_id.clone()).collect();

    let mut tx = pool.begin().await?;
    let known = requests::get_by_custom_ids(&mut tx, batch_id, &custom_ids).await?;
    let by_custom_id: HashMap<&str, &crate::models::Request> =
        known.iter().map(|r| (r.custom_id.as_str(), r)).collect();

    for (raw, result) in &parsed {
        let request = match by_custom_id.get(result.custom_id.as_str()) {
            Some(request) => *request,
            None => {
                log::warn!(
                    "Result line for unknown custom_id {:?} in batch {}",
                    result.custom_id,
                    batch_id
                );
                stats.unknown_custom_id += 1;
                continue;
            }
        };

        let state = request.state()?;
        if state.is_terminal() {
            stats.skipped_terminal += 1;
            continue;
        }

        if result.is_error(kind == FileKind::Error) {
            if state == RequestState::OpenaiProcessing {
                requests::set_failed(&mut tx, &request.id, state, raw).await?;
                stats.failed += 1;
            } else {
                // Anything past openai_processing already has its outcome
                stats.skipped_terminal += 1;
            }
        } else if state == RequestState::OpenaiProcessed {
            stats.skipped_already_processed += 1;
        } else if state == RequestState::OpenaiProcessing {
            // Whole line, not just the body: delivery needs custom_id at
            // the top level
            requests::set_processed(&mut tx, &request.id, raw).await?;
            stats.succeeded += 1;
        } else {
            // pending or delivering: a stale file replay; leave it alone
            stats.skipped_terminal += 1;
        }
    }
    tx.commit().await?;

    Ok(stats)
}
