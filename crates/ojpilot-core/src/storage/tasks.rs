//! Storage operations for task envelopes.
//!
//! A task row is the persisted batch submission; per-problem rows live
//! in [`super::problems`]. The task service is the only writer of the
//! aggregate `status` column.

use super::DbPool;
use crate::error::StorageError;

/// Row type for task queries.
type TaskRow = (
    String,
    i64,
    String,
    Option<String>,
    String,
    String,
    String,
    String,
);

/// A persisted task envelope.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TaskRecord {
    pub id: String,
    pub user_id: i64,
    pub target_adapter: String,
    pub llm_provider: Option<String>,
    /// Comma-separated enabled stages, e.g. `fetch,generate,upload,solve`.
    pub stages: String,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

impl From<TaskRow> for TaskRecord {
    fn from(r: TaskRow) -> Self {
        Self {
            id: r.0,
            user_id: r.1,
            target_adapter: r.2,
            llm_provider: r.3,
            stages: r.4,
            status: r.5,
            created_at: r.6,
            updated_at: r.7,
        }
    }
}

const TASK_COLUMNS: &str =
    "id, user_id, target_adapter, llm_provider, stages, status, created_at, updated_at";

/// Insert a new task envelope in `pending` status.
pub async fn insert(
    pool: &DbPool,
    id: &str,
    user_id: i64,
    target_adapter: &str,
    llm_provider: Option<&str>,
    stages: &str,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO tasks (id, user_id, target_adapter, llm_provider, stages) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(user_id)
    .bind(target_adapter)
    .bind(llm_provider)
    .bind(stages)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Fetch a task owned by `user_id`.
pub async fn get(
    pool: &DbPool,
    user_id: i64,
    id: &str,
) -> Result<Option<TaskRecord>, StorageError> {
    let row: Option<TaskRow> = sqlx::query_as(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks WHERE id = ? AND user_id = ?"
    ))
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(row.map(TaskRecord::from))
}

/// List tasks owned by `user_id`, newest first, optionally filtered by
/// status.
pub async fn list(
    pool: &DbPool,
    user_id: i64,
    status: Option<&str>,
    limit: i64,
    offset: i64,
) -> Result<Vec<TaskRecord>, StorageError> {
    let rows: Vec<TaskRow> = match status {
        Some(status) => {
            sqlx::query_as(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE user_id = ? AND status = ?
                 ORDER BY created_at DESC LIMIT ? OFFSET ?"
            ))
            .bind(user_id)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
        None => {
            sqlx::query_as(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks
                 WHERE user_id = ?
                 ORDER BY created_at DESC LIMIT ? OFFSET ?"
            ))
            .bind(user_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(pool)
            .await
        }
    }
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(rows.into_iter().map(TaskRecord::from).collect())
}

/// Update the aggregate status of a task.
pub async fn update_status(pool: &DbPool, id: &str, status: &str) -> Result<(), StorageError> {
    sqlx::query("UPDATE tasks SET status = ?, updated_at = datetime('now') WHERE id = ?")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Delete a task owned by `user_id`. Problem rows cascade.
pub async fn delete(pool: &DbPool, user_id: i64, id: &str) -> Result<bool, StorageError> {
    let result = sqlx::query("DELETE FROM tasks WHERE id = ? AND user_id = ?")
        .bind(id)
        .bind(user_id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.rows_affected() > 0)
}

/// Aggregate task counts: `(total, success, running, failed, pending)`.
pub async fn status_counts(pool: &DbPool) -> Result<(i64, i64, i64, i64, i64), StorageError> {
    let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
        "SELECT COUNT(*),
                COALESCE(SUM(status = 'completed'), 0),
                COALESCE(SUM(status = 'running'), 0),
                COALESCE(SUM(status = 'failed'), 0),
                COALESCE(SUM(status = 'pending'), 0)
         FROM tasks",
    )
    .fetch_one(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(row)
}
