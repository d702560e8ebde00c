//! Storage operations for users and session tokens.

use super::DbPool;
use crate::error::StorageError;

/// Row type for user queries.
type UserRow = (i64, String, String, i64, String, Option<String>);

/// A registered user.
#[derive(Debug, Clone, serde::Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    /// Bcrypt hash; never serialized to transports.
    #[serde(skip)]
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: String,
    pub last_seen_at: Option<String>,
}

impl From<UserRow> for User {
    fn from(r: UserRow) -> Self {
        Self {
            id: r.0,
            username: r.1,
            password_hash: r.2,
            is_admin: r.3 != 0,
            created_at: r.4,
            last_seen_at: r.5,
        }
    }
}

const USER_COLUMNS: &str = "id, username, password_hash, is_admin, created_at, last_seen_at";

/// Insert a new user with a pre-hashed password.
pub async fn create_user(
    pool: &DbPool,
    username: &str,
    password_hash: &str,
    is_admin: bool,
) -> Result<i64, StorageError> {
    let result = sqlx::query(
        "INSERT INTO users (username, password_hash, is_admin) VALUES (?, ?, ?)",
    )
    .bind(username)
    .bind(password_hash)
    .bind(i64::from(is_admin))
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(result.last_insert_rowid())
}

/// Look up a user by username.
pub async fn find_by_username(
    pool: &DbPool,
    username: &str,
) -> Result<Option<User>, StorageError> {
    let row: Option<UserRow> =
        sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?"))
            .bind(username)
            .fetch_optional(pool)
            .await
            .map_err(|e| StorageError::Query { source: e })?;
    Ok(row.map(User::from))
}

/// Look up a user by id.
pub async fn find_by_id(pool: &DbPool, user_id: i64) -> Result<Option<User>, StorageError> {
    let row: Option<UserRow> =
        sqlx::query_as(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?"))
            .bind(user_id)
            .fetch_optional(pool)
            .await
            .map_err(|e| StorageError::Query { source: e })?;
    Ok(row.map(User::from))
}

/// Update the user's last-seen timestamp to now.
pub async fn touch_last_seen(pool: &DbPool, user_id: i64) -> Result<(), StorageError> {
    sqlx::query("UPDATE users SET last_seen_at = datetime('now') WHERE id = ?")
        .bind(user_id)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// `(total, active)` user counts; active means seen in the last 7 days.
pub async fn counts(pool: &DbPool) -> Result<(i64, i64), StorageError> {
    let row: (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*),
                COALESCE(SUM(last_seen_at IS NOT NULL AND last_seen_at > datetime('now', '-7 days')), 0)
         FROM users",
    )
    .fetch_one(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(row)
}

// ── Sessions ─────────────────────────────────────────────────────────

/// Insert a session token with an expiry `ttl_secs` from now.
pub async fn create_session(
    pool: &DbPool,
    user_id: i64,
    token: &str,
    ttl_secs: u64,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO sessions (token, user_id, expires_at)
         VALUES (?, ?, datetime('now', '+' || ? || ' seconds'))",
    )
    .bind(token)
    .bind(user_id)
    .bind(ttl_secs as i64)
    .execute(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

/// Resolve an unexpired session token to its user id.
pub async fn find_session(pool: &DbPool, token: &str) -> Result<Option<i64>, StorageError> {
    let row: Option<(i64,)> = sqlx::query_as(
        "SELECT user_id FROM sessions WHERE token = ? AND expires_at > datetime('now')",
    )
    .bind(token)
    .fetch_optional(pool)
    .await
    .map_err(|e| StorageError::Query { source: e })?;
    Ok(row.map(|r| r.0))
}

/// Delete a session token.
pub async fn delete_session(pool: &DbPool, token: &str) -> Result<(), StorageError> {
    sqlx::query("DELETE FROM sessions WHERE token = ?")
        .bind(token)
        .execute(pool)
        .await
        .map_err(|e| StorageError::Query { source: e })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::init_test_db;

    #[tokio::test]
    async fn create_and_find_user() {
        let pool = init_test_db().await.expect("db");
        let id = create_user(&pool, "alice", "hash", false).await.expect("create");

        let user = find_by_username(&pool, "alice").await.expect("find").expect("some");
        assert_eq!(user.id, id);
        assert!(!user.is_admin);
        assert!(user.last_seen_at.is_none());

        assert!(find_by_username(&pool, "bob").await.expect("find").is_none());
    }

    #[tokio::test]
    async fn duplicate_username_rejected() {
        let pool = init_test_db().await.expect("db");
        create_user(&pool, "alice", "hash", false).await.expect("first");
        assert!(create_user(&pool, "alice", "hash2", false).await.is_err());
    }

    #[tokio::test]
    async fn session_lifecycle() {
        let pool = init_test_db().await.expect("db");
        let id = create_user(&pool, "alice", "hash", false).await.expect("create");

        create_session(&pool, id, "tok-1", 3600).await.expect("session");
        assert_eq!(find_session(&pool, "tok-1").await.expect("find"), Some(id));

        delete_session(&pool, "tok-1").await.expect("delete");
        assert_eq!(find_session(&pool, "tok-1").await.expect("find"), None);
    }

    #[tokio::test]
    async fn expired_session_not_found() {
        let pool = init_test_db().await.expect("db");
        let id = create_user(&pool, "alice", "hash", false).await.expect("create");
        create_session(&pool, id, "tok-old", 0).await.expect("session");
        assert_eq!(find_session(&pool, "tok-old").await.expect("find"), None);
    }

    #[tokio::test]
    async fn counts_track_activity() {
        let pool = init_test_db().await.expect("db");
        let id = create_user(&pool, "alice", "hash", false).await.expect("a");
        create_user(&pool, "bob", "hash", false).await.expect("b");

        let (total, active) = counts(&pool).await.expect("counts");
        assert_eq!(total, 2);
        assert_eq!(active, 0);

        touch_last_seen(&pool, id).await.expect("touch");
        let (_, active) = counts(&pool).await.expect("counts");
        assert_eq!(active, 1);
    }
}
