//! Storage operations for per-problem status rows.
//!
//! A problem row is the persisted side of the pipeline state machine.
//! Updates require the owning runner's worker id to match the row's
//! `owner_worker` (compare-and-set), so two runners can never interleave
//! writes for the same problem.

use std::collections::HashMap;

use super::DbPool;
use crate::error::StorageError;

/// Row type for problem queries.
type ProblemRow = (
    i64,
    String,
    i64,
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
);

/// A persisted problem status row.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProblemRecord {
    pub id: i64,
    pub task_id: String,
    pub user_id: i64,
    pub raw_ref: String,
    pub source_adapter: String,
    pub short_id: String,
    pub target_adapter: String,
    pub state: String,
    /// JSON map of stage name to attempt count.
    pub retry_counts: String,
    pub last_error_kind: Option<String>,
    pub last_error_message: Option<String>,
    pub real_id: Option<String>,
    pub uploaded_url: Option<String>,
    pub owner_worker: Option<String>,
}

impl From<ProblemRow> for ProblemRecord {
    fn from(r: ProblemRow) -> Self {
        Self {
            id: r.0,
            task_id: r.1,
            user_id: r.2,
            raw_ref: r.3,
            source_adapter: r.4,
            short_id: r.5,
            target_adapter: r.6,
            state: r.7,
            retry_counts: r.8,
            last_error_kind: r.9,
            last_error_message: r.10,
            real_id: r.11,
            uploaded_url: r.12,
            owner_worker: r.13,
        }
    }
}

impl ProblemRecord {
    /// Parse the retry-count map. Corrupt JSON counts as empty.
    pub fn retry_count_map(&self) -> HashMap<String, u32> {
        serde_json::from_str(&self.retry_counts).unwrap_or_default()
    }

    /// Whether the recorded state is terminal.
    pub fn is_terminal(&self) -> bool {
        self.state == "completed"
            || self.state == "cancelled"
            || self.state.starts_with("failed_")
    }
}

const PROBLEM_COLUMNS: &str = "id, task_id, user_id, raw_ref, source_adapter, short_id, \
     target_adapter, state, retry_counts, last_error_kind, last_error_message, real_id, \
     uploaded_url, owner_worker";

/// Insert a problem row in `pending` state, returning its id.
pub async fn insert(
    pool: &DbPool,
    task_id: &str,
    user_id: i64,
    raw_ref: &str,
    source_adapter: &str,
    short_id: &str,
    target_adapter: &str,
) -> Result<i64, StorageError> {
    let result = sqlx::query(
        "INSERT INTO problems (task_id, user_id, raw_ref, source_adapter, short_id, target_adapter)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(task_id)
    .bind(user_id)
    .bind(raw_ref)
    .bind(source_adapter)
    .bind(short_id)
    .bind(target_adapter)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.last_insert_rowid())
}

/// Fetch one problem row.
pub async fn get(pool: &DbPool, id: i64) -> Result<Option<ProblemRecord>, StorageError> {
    let row: Option<ProblemRow> =
        sqlx::query_as(&format!("SELECT {PROBLEM_COLUMNS} FROM problems WHERE id = ?"))
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| StorageError::Query { source: e })?;
    Ok(row.map(ProblemRecord::from))
}

/// All problem rows of a task, in insertion order.
pub async fn list_by_task(
    pool: &DbPool,
    task_id: &str,
) -> Result<Vec<ProblemRecord>, StorageError> {
    let rows: Vec<ProblemRow> = sqlx::query_as(&format!(
        "SELECT {PROBLEM_COLUMNS} FROM problems WHERE task_id = ? ORDER BY id"
    ))
    .bind(task_id)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(rows.into_iter().map(ProblemRecord::from).collect())
}

/// Claim ownership of a problem row for `worker`.
///
/// Succeeds when the row is unowned or already owned by the same worker.
pub async fn claim(pool: &DbPool, id: i64, worker: &str) -> Result<bool, StorageError> {
    let result = sqlx::query(
        "UPDATE problems SET owner_worker = ?, updated_at = datetime('now')
         WHERE id = ? AND (owner_worker IS NULL OR owner_worker = ?)",
    )
    .bind(worker)
    .bind(id)
    .bind(worker)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.rows_affected() > 0)
}

/// Advance the state of an owned row. Fails with [`StorageError::OwnerMismatch`]
/// when `worker` no longer owns the row.
pub async fn update_state(
    pool: &DbPool,
    id: i64,
    worker: &str,
    state: &str,
) -> Result<(), StorageError> {
    let result = sqlx::query(
        "UPDATE problems SET state = ?, updated_at = datetime('now')
         WHERE id = ? AND owner_worker = ?",
    )
    .bind(state)
    .bind(id)
    .bind(worker)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    if result.rows_affected() == 0 {
        return Err(owner_mismatch(pool, id).await);
    }
    Ok(())
}

/// Record a terminal error on an owned row.
pub async fn set_error(
    pool: &DbPool,
    id: i64,
    worker: &str,
    state: &str,
    kind: &str,
    message: &str,
) -> Result<(), StorageError> {
    let result = sqlx::query(
        "UPDATE problems SET state = ?, last_error_kind = ?, last_error_message = ?,
             updated_at = datetime('now')
         WHERE id = ? AND owner_worker = ?",
    )
    .bind(state)
    .bind(kind)
    .bind(message)
    .bind(id)
    .bind(worker)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    if result.rows_affected() == 0 {
        return Err(owner_mismatch(pool, id).await);
    }
    Ok(())
}

/// Persist the upload result on an owned row. The `uploaded_url` becomes
/// visible here, after the workspace receipt is already on disk.
pub async fn set_upload_result(
    pool: &DbPool,
    id: i64,
    worker: &str,
    real_id: &str,
    uploaded_url: &str,
) -> Result<(), StorageError> {
    let result = sqlx::query(
        "UPDATE problems SET real_id = ?, uploaded_url = ?, updated_at = datetime('now')
         WHERE id = ? AND owner_worker = ?",
    )
    .bind(real_id)
    .bind(uploaded_url)
    .bind(id)
    .bind(worker)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    if result.rows_affected() == 0 {
        return Err(owner_mismatch(pool, id).await);
    }
    Ok(())
}

/// Store the attempt count for one stage in the JSON retry map.
pub async fn set_retry_count(
    pool: &DbPool,
    id: i64,
    stage: &str,
    attempts: u32,
) -> Result<(), StorageError> {
    let Some(record) = get(pool, id).await? else {
        return Ok(());
    };
    let mut map = record.retry_count_map();
    map.insert(stage.to_string(), attempts);
    let json = serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string());
    sqlx::query("UPDATE problems SET retry_counts = ?, updated_at = datetime('now') WHERE id = ?")
        .bind(json)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Release ownership of a row, keeping its state.
pub async fn release(pool: &DbPool, id: i64, worker: &str) -> Result<(), StorageError> {
    sqlx::query("UPDATE problems SET owner_worker = NULL WHERE id = ? AND owner_worker = ?")
        .bind(id)
        .bind(worker)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Reset terminal non-completed problems of a task back to `pending` for a
/// user-initiated retry, clearing errors, retry counts, and ownership.
pub async fn reset_for_retry(pool: &DbPool, task_id: &str) -> Result<Vec<i64>, StorageError> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        "SELECT id FROM problems
         WHERE task_id = ? AND (state LIKE 'failed_%' OR state = 'cancelled')",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    let ids: Vec<i64> = rows.into_iter().map(|r| r.0).collect();
    if ids.is_empty() {
        return Ok(ids);
    }
    sqlx::query(
        "UPDATE problems SET state = 'pending', retry_counts = '{}',
             last_error_kind = NULL, last_error_message = NULL, owner_worker = NULL,
             updated_at = datetime('now')
         WHERE task_id = ? AND (state LIKE 'failed_%' OR state = 'cancelled')",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(ids)
}

/// Queue statistics across all problems:
/// `(pending, running, completed, failed)`.
pub async fn queue_counts(pool: &DbPool) -> Result<(i64, i64, i64, i64), StorageError> {
    let row: (i64, i64, i64, i64) = sqlx::query_as(
        "SELECT COALESCE(SUM(state = 'pending'), 0),
                COALESCE(SUM(state NOT IN ('pending', 'completed', 'cancelled')
                             AND state NOT LIKE 'failed_%'), 0),
                COALESCE(SUM(state = 'completed'), 0),
                COALESCE(SUM(state LIKE 'failed_%'), 0)
         FROM problems",
    )
    .fetch_one(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(row)
}

async fn owner_mismatch(pool: &DbPool, id: i64) -> StorageError {
    let owner = get(pool, id)
        .await
        .ok()
        .flatten()
        .and_then(|r| r.owner_worker)
        .unwrap_or_else(|| "<none>".to_string());
    StorageError::OwnerMismatch { owner }
}
