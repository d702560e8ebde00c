//! Storage operations for per-user adapter credential bags.
//!
//! Credential bags are JSON maps encrypted with the process key before
//! they reach the database. Adapters read them fresh on every call via
//! [`DbCredentials`]; nothing outside this module sees ciphertext.

use std::collections::HashMap;
use std::sync::Arc;

use super::crypto::SecretKey;
use super::DbPool;
use crate::error::StorageError;
use crate::judge::CredentialSource;

/// Encrypt and upsert the credential bag for `(user_id, adapter)`.
pub async fn save_config(
    pool: &DbPool,
    key: &SecretKey,
    user_id: i64,
    adapter: &str,
    fields: &HashMap<String, String>,
) -> Result<(), StorageError> {
    let plaintext = serde_json::to_vec(fields).map_err(|e| StorageError::Crypto {
        message: format!("failed to serialize credential bag: {e}"),
    })?;
    let blob = key.encrypt(&plaintext)?;
    sqlx::query(
        "INSERT INTO adapter_configs (user_id, adapter_name, encrypted_blob, updated_at)
         VALUES (?, ?, ?, datetime('now'))
         ON CONFLICT (user_id, adapter_name)
         DO UPDATE SET encrypted_blob = excluded.encrypted_blob, updated_at = datetime('now')",
    )
    .bind(user_id)
    .bind(adapter)
    .bind(blob)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Load and decrypt the credential bag for `(user_id, adapter)`.
/// Returns an empty map when the user has not configured the adapter.
pub async fn load_config(
    pool: &DbPool,
    key: &SecretKey,
    user_id: i64,
    adapter: &str,
) -> Result<HashMap<String, String>, StorageError> {
    let row: Option<(Vec<u8>,)> = sqlx::query_as(
        "SELECT encrypted_blob FROM adapter_configs WHERE user_id = ? AND adapter_name = ?",
    )
    .bind(user_id)
    .bind(adapter)
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;

    let Some((blob,)) = row else {
        return Ok(HashMap::new());
    };
    let plaintext = key.decrypt(&blob)?;
    serde_json::from_slice(&plaintext).map_err(|e| StorageError::Crypto {
        message: format!("failed to deserialize credential bag: {e}"),
    })
}

/// Delete the credential bag for `(user_id, adapter)`.
pub async fn delete_config(
    pool: &DbPool,
    user_id: i64,
    adapter: &str,
) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM adapter_configs WHERE user_id = ? AND adapter_name = ?")
        .bind(user_id)
        .bind(adapter)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Live credential source backed by the database.
///
/// This is the only [`CredentialSource`] in production; each call hits
/// the database so configuration swaps take effect mid-batch and no
/// tenant state lingers in adapter instances.
pub struct DbCredentials {
    pool: DbPool,
    key: SecretKey,
}

impl DbCredentials {
    /// Wrap a pool and process key as a credential source.
    pub fn new(pool: DbPool, key: SecretKey) -> Arc<Self> {
        Arc::new(Self { pool, key })
    }
}

#[async_trait::async_trait]
impl CredentialSource for DbCredentials {
    async fn adapter_config(
        &self,
        user_id: i64,
        adapter: &str,
    ) -> Result<HashMap<String, String>, StorageError> {
        load_config(&self.pool, &self.key, user_id, adapter).await
    }
}
