//! Per-call LLM usage accounting.

use super::DbPool;
use crate::error::StorageError;

/// Record one LLM call's token usage and latency.
pub async fn record(
    pool: &DbPool,
    provider: &str,
    endpoint: &str,
    input_tokens: u32,
    output_tokens: u32,
    latency_ms: u64,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO llm_usage (provider, endpoint, input_tokens, output_tokens, latency_ms)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(provider)
    .bind(endpoint)
    .bind(i64::from(input_tokens))
    .bind(i64::from(output_tokens))
    .bind(latency_ms as i64)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Total `(input_tokens, output_tokens, calls)` for one provider.
pub async fn totals_for_provider(
    pool: &DbPool,
    provider: &str,
) -> Result<(i64, i64, i64), StorageError> {
    let row: (i64, i64, i64) = sqlx::query_as(
        "SELECT COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0), COUNT(*)
         FROM llm_usage WHERE provider = ?",
    )
    .bind(provider)
    .fetch_one(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(row)
}
