//! Storage operations for LLM provider rows.
//!
//! The static seed comes from [`crate::llm::providers::builtin_specs`];
//! rows only add runtime-editable credentials on top. Credentials are
//! encrypted like adapter bags.

use std::collections::HashMap;

use super::crypto::SecretKey;
use super::DbPool;
use crate::error::StorageError;

/// Row type for provider queries.
type ProviderRow = (String, String, String, String, String, i64, Option<Vec<u8>>);

/// A persisted provider row.
#[derive(Debug, Clone)]
pub struct ProviderRecord {
    pub id: String,
    pub display_name: String,
    /// Wire protocol kind: `openai-compat` or `anthropic`.
    pub kind: String,
    pub api_url: String,
    pub model: String,
    pub user_selectable: bool,
    /// Whether credentials have been saved; ciphertext stays internal.
    pub has_credentials: bool,
}

impl From<ProviderRow> for ProviderRecord {
    fn from(r: ProviderRow) -> Self {
        Self {
            id: r.0,
            display_name: r.1,
            kind: r.2,
            api_url: r.3,
            model: r.4,
            user_selectable: r.5 != 0,
            has_credentials: r.6.is_some(),
        }
    }
}

const PROVIDER_COLUMNS: &str =
    "id, display_name, kind, api_url, model, user_selectable, credentials_blob";

/// Insert a provider row if absent. Used by the seed pass at startup.
pub async fn seed(
    pool: &DbPool,
    id: &str,
    display_name: &str,
    kind: &str,
    api_url: &str,
    model: &str,
    user_selectable: bool,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO providers (id, display_name, kind, api_url, model, user_selectable)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT (id) DO NOTHING",
    )
    .bind(id)
    .bind(display_name)
    .bind(kind)
    .bind(api_url)
    .bind(model)
    .bind(i64::from(user_selectable))
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// All provider rows, ordered by id.
pub async fn list(pool: &DbPool) -> Result<Vec<ProviderRecord>, StorageError> {
    let rows: Vec<ProviderRow> =
        sqlx::query_as(&format!("SELECT {PROVIDER_COLUMNS} FROM providers ORDER BY id"))
            .fetch_all(pool)
            .await
            .map_err(|e| StorageError::Query { source: e })?;
    Ok(rows.into_iter().map(ProviderRecord::from).collect())
}

/// Fetch one provider row.
pub async fn get(pool: &DbPool, id: &str) -> Result<Option<ProviderRecord>, StorageError> {
    let row: Option<ProviderRow> =
        sqlx::query_as(&format!("SELECT {PROVIDER_COLUMNS} FROM providers WHERE id = ?"))
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| StorageError::Query { source: e })?;
    Ok(row.map(ProviderRecord::from))
}

/// Update editable fields and (optionally) credentials for a provider.
pub async fn save(
    pool: &DbPool,
    key: &SecretKey,
    id: &str,
    api_url: Option<&str>,
    model: Option<&str>,
    credentials: Option<&HashMap<String, String>>,
) -> Result<(), StorageError> {
    if let Some(api_url) = api_url {
        sqlx::query("UPDATE providers SET api_url = ? WHERE id = ?")
            .bind(api_url)
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| StorageError::Query { source: e })?;
    }
    if let Some(model) = model {
        sqlx::query("UPDATE providers SET model = ? WHERE id = ?")
            .bind(model)
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| StorageError::Query { source: e })?;
    }
    if let Some(credentials) = credentials {
        let plaintext = serde_json::to_vec(credentials).map_err(|e| StorageError::Crypto {
            message: format!("failed to serialize provider credentials: {e}"),
        })?;
        let blob = key.encrypt(&plaintext)?;
        sqlx::query("UPDATE providers SET credentials_blob = ? WHERE id = ?")
            .bind(blob)
            .bind(id)
            .execute(pool)
            .await
            .map_err(|e| StorageError::Query { source: e })?;
    }
    Ok(())
}

/// Load and decrypt provider credentials. Empty when none are saved.
pub async fn load_credentials(
    pool: &DbPool,
    key: &SecretKey,
    id: &str,
) -> Result<HashMap<String, String>, StorageError> {
    let row: Option<(Option<Vec<u8>>,)> =
        sqlx::query_as("SELECT credentials_blob FROM providers WHERE id = ?")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(|e| StorageError::Query { source: e })?;
    let Some((Some(blob),)) = row else {
        return Ok(HashMap::new());
    };
    let plaintext = key.decrypt(&blob)?;
    serde_json::from_slice(&plaintext).map_err(|e| StorageError::Crypto {
        message: format!("failed to deserialize provider credentials: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::init_test_db;

    #[tokio::test]
    async fn seed_is_idempotent() {
        let pool = init_test_db().await.expect("db");
        seed(&pool, "openai", "OpenAI", "openai-compat", "https://api.openai.com/v1", "gpt-4o-mini", true)
            .await
            .expect("seed");
        seed(&pool, "openai", "Changed", "openai-compat", "https://elsewhere", "other", false)
            .await
            .expect("second seed");

        let record = get(&pool, "openai").await.expect("get").expect("some");
        // The second seed must not clobber the first row.
        assert_eq!(record.display_name, "OpenAI");
        assert!(!record.has_credentials);
    }

    #[tokio::test]
    async fn save_and_load_credentials() {
        let pool = init_test_db().await.expect("db");
        let key = SecretKey::from_secret("test");
        seed(&pool, "openai", "OpenAI", "openai-compat", "https://api.openai.com/v1", "gpt-4o-mini", true)
            .await
            .expect("seed");

        let mut credentials = HashMap::new();
        credentials.insert("api_key".to_string(), "sk-test".to_string());
        save(&pool, &key, "openai", None, Some("gpt-4o"), Some(&credentials))
            .await
            .expect("save");

        let record = get(&pool, "openai").await.expect("get").expect("some");
        assert_eq!(record.model, "gpt-4o");
        assert!(record.has_credentials);

        let loaded = load_credentials(&pool, &key, "openai").await.expect("load");
        assert_eq!(loaded.get("api_key").map(String::as_str), Some("sk-test"));
    }

    #[tokio::test]
    async fn missing_credentials_are_empty() {
        let pool = init_test_db().await.expect("db");
        let key = SecretKey::from_secret("test");
        seed(&pool, "ollama", "Ollama", "openai-compat", "http://localhost:11434/v1", "llama3.1", true)
            .await
            .expect("seed");
        let loaded = load_credentials(&pool, &key, "ollama").await.expect("load");
        assert!(loaded.is_empty());
    }
}
