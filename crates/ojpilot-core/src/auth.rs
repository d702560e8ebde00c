//! Session authentication over the users table.
//!
//! Passwords are bcrypt hashes; sessions are random 64-hex tokens with
//! a configured expiry. A transport binds these to its login endpoints.

use rand::RngCore;

use crate::error::AuthError;
use crate::storage::users::{self, User};
use crate::storage::{activity_log, DbPool};

/// A successful login: the session token and the user it belongs to.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AuthSession {
    /// Bearer token for subsequent calls.
    pub token: String,
    /// The authenticated user.
    pub user: User,
}

/// Hash a password for storage.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(|e| AuthError::Hash {
        message: e.to_string(),
    })
}

/// Verify a password and issue a session token.
pub async fn login(
    pool: &DbPool,
    session_ttl_secs: u64,
    username: &str,
    password: &str,
) -> Result<AuthSession, AuthError> {
    let Some(user) = users::find_by_username(pool, username).await? else {
        // Burn a comparison so unknown users take as long as bad passwords.
        let _ = bcrypt::verify(password, "$2b$12$invalidsaltinvalidsaltinvalidsaltinvalidsalt");
        return Err(AuthError::InvalidCredentials);
    };
    let valid = bcrypt::verify(password, &user.password_hash).map_err(|e| AuthError::Hash {
        message: e.to_string(),
    })?;
    if !valid {
        return Err(AuthError::InvalidCredentials);
    }

    let token = new_token();
    users::create_session(pool, user.id, &token, session_ttl_secs).await?;
    users::touch_last_seen(pool, user.id).await?;
    let _ = activity_log::record(
        pool,
        user.id,
        "auth.login",
        &serde_json::json!({ "username": user.username }),
    )
    .await;
    tracing::info!(user = %user.username, "login");
    Ok(AuthSession { token, user })
}

/// Resolve a session token to its user, bumping last-seen.
pub async fn check(pool: &DbPool, token: &str) -> Result<User, AuthError> {
    let Some(user_id) = users::find_session(pool, token).await? else {
        return Err(AuthError::SessionExpired);
    };
    let Some(user) = users::find_by_id(pool, user_id).await? else {
        return Err(AuthError::SessionExpired);
    };
    users::touch_last_seen(pool, user.id).await?;
    Ok(user)
}

/// Invalidate a session token.
pub async fn logout(pool: &DbPool, token: &str) -> Result<(), AuthError> {
    if let Ok(Some(user_id)) = users::find_session(pool, token).await {
        let _ = activity_log::record(pool, user_id, "auth.logout", &serde_json::json!({})).await;
    }
    users::delete_session(pool, token).await?;
    Ok(())
}

fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::init_test_db;

    async fn seeded() -> DbPool {
        let pool = init_test_db().await.expect("db");
        let hash = hash_password("hunter2").expect("hash");
        users::create_user(&pool, "alice", &hash, false)
            .await
            .expect("user");
        pool
    }

    #[tokio::test]
    async fn login_check_logout_round_trip() {
        let pool = seeded().await;

        let session = login(&pool, 3600, "alice", "hunter2").await.expect("login");
        assert_eq!(session.token.len(), 64);
        assert_eq!(session.user.username, "alice");

        let user = check(&pool, &session.token).await.expect("check");
        assert_eq!(user.username, "alice");

        logout(&pool, &session.token).await.expect("logout");
        assert!(matches!(
            check(&pool, &session.token).await,
            Err(AuthError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn wrong_password_rejected() {
        let pool = seeded().await;
        assert!(matches!(
            login(&pool, 3600, "alice", "wrong").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn unknown_user_rejected() {
        let pool = seeded().await;
        assert!(matches!(
            login(&pool, 3600, "mallory", "hunter2").await,
            Err(AuthError::InvalidCredentials)
        ));
    }

    #[tokio::test]
    async fn expired_session_rejected() {
        let pool = seeded().await;
        let session = login(&pool, 0, "alice", "hunter2").await.expect("login");
        assert!(matches!(
            check(&pool, &session.token).await,
            Err(AuthError::SessionExpired)
        ));
    }

    #[tokio::test]
    async fn bogus_token_rejected() {
        let pool = seeded().await;
        assert!(matches!(
            check(&pool, "deadbeef").await,
            Err(AuthError::SessionExpired)
        ));
    }
}
