//! Append-only activity log.

use super::DbPool;
use crate::error::StorageError;

/// One activity entry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub user_id: i64,
    pub kind: String,
    pub payload: String,
    pub ts: String,
}

/// Append an activity entry. Payload is serialized JSON.
pub async fn record(
    pool: &DbPool,
    user_id: i64,
    kind: &str,
    payload: &serde_json::Value,
) -> Result<(), StorageError> {
    sqlx::query("INSERT INTO activity_log (user_id, kind, payload) VALUES (?, ?, ?)")
        .bind(user_id)
        .bind(kind)
        .bind(payload.to_string())
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Most recent entries for a user, newest first.
pub async fn recent(
    pool: &DbPool,
    user_id: i64,
    limit: i64,
) -> Result<Vec<ActivityEntry>, StorageError> {
    let rows: Vec<(i64, i64, String, String, String)> = sqlx::query_as(
        "SELECT id, user_id, kind, payload, ts FROM activity_log
         WHERE user_id = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(rows
        .into_iter()
        .map(|r| ActivityEntry {
            id: r.0,
            user_id: r.1,
            kind: r.2,
            payload: r.3,
            ts: r.4,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::init_test_db;

    #[tokio::test]
    async fn record_and_read_back() {
        let pool = init_test_db().await.expect("db");
        record(&pool, 1, "task.created", &serde_json::json!({"task_id": "t-1"}))
            .await
            .expect("record");
        record(&pool, 1, "task.deleted", &serde_json::json!({"task_id": "t-1"}))
            .await
            .expect("record");
        record(&pool, 2, "task.created", &serde_json::json!({"task_id": "t-2"}))
            .await
            .expect("record");

        let entries = recent(&pool, 1, 10).await.expect("recent");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "task.deleted");
        assert!(entries[1].payload.contains("t-1"));
    }
}
