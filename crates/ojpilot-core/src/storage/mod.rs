//! SQLite persistence layer for the ojpilot engine.
//!
//! One embedded database holds every durable entity: users and
//! sessions, task envelopes, per-problem status rows, credential bags,
//! provider records, and the activity and usage logs. Each table family
//! gets a thin repository submodule; the pool runs in WAL mode so
//! status reads never wait on a writing runner. Credentials are
//! encrypted at rest, and [`crypto`] is the only place ciphertext is
//! produced or opened.

pub mod activity_log;
pub mod adapter_configs;
pub mod crypto;
pub mod llm_usage;
pub mod problems;
pub mod providers;
pub mod tasks;
pub mod users;

use crate::error::StorageError;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Type alias for the SQLite connection pool.
pub type DbPool = sqlx::SqlitePool;

// SQLite admits one writer at a time; WAL keeps readers unblocked while
// a runner persists a state transition. Eight connections cover the
// default stage gate widths without stacking up writers.
const POOL_CONNECTIONS: u32 = 8;

fn connection_error(source: sqlx::Error) -> StorageError {
    StorageError::Connection { source }
}

/// Pragmas shared by the file-backed and in-memory pools: WAL journal,
/// relaxed fsync (WAL makes `Normal` durable enough for status rows that
/// the workspace can reconstruct), enforced foreign keys, and a busy
/// timeout wide enough for a saturated batch.
fn connect_options(url: &str) -> Result<SqliteConnectOptions, StorageError> {
    let options = SqliteConnectOptions::from_str(url)
        .map_err(connection_error)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .busy_timeout(Duration::from_secs(10));
    Ok(options)
}

async fn run_migrations(pool: &DbPool) -> Result<(), StorageError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|source| StorageError::Migration { source })
}

/// Open (creating if needed) the engine database at `db_path` and bring
/// its schema up to date. `~` in the path resolves against the home
/// directory; missing parent directories are created first.
pub async fn init_db(db_path: &str) -> Result<DbPool, StorageError> {
    let resolved = expand_tilde(db_path);
    let parent = Path::new(&resolved)
        .parent()
        .filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        std::fs::create_dir_all(parent).map_err(|e| connection_error(sqlx::Error::Io(e)))?;
    }

    let pool = SqlitePoolOptions::new()
        .max_connections(POOL_CONNECTIONS)
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(connect_options(&format!("sqlite:{resolved}"))?)
        .await
        .map_err(connection_error)?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// In-memory database for tests. A single connection keeps the whole
/// database on one handle, so no shared-cache setup is needed.
#[cfg(any(test, feature = "test-helpers"))]
pub async fn init_test_db() -> Result<DbPool, StorageError> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect_options("sqlite::memory:")?)
        .await
        .map_err(connection_error)?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Resolve a leading `~` against the user's home directory. Anything
/// else, including a bare relative path, passes through untouched.
pub(crate) fn expand_tilde(path: &str) -> String {
    let Some(home) = dirs::home_dir() else {
        return path.to_string();
    };
    match path.strip_prefix('~') {
        Some("") => home.to_string_lossy().into_owned(),
        Some(rest) => match rest.strip_prefix('/') {
            Some(tail) => home.join(tail).to_string_lossy().into_owned(),
            // "~user" forms are not supported; leave them alone.
            None => path.to_string(),
        },
        None => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn init_test_db_creates_all_tables() {
        let pool = init_test_db().await.expect("init test db");

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool)
        .await
        .expect("query tables");

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert!(table_names.contains(&"users"));
        assert!(table_names.contains(&"sessions"));
        assert!(table_names.contains(&"tasks"));
        assert!(table_names.contains(&"problems"));
        assert!(table_names.contains(&"adapter_configs"));
        assert!(table_names.contains(&"providers"));
        assert!(table_names.contains(&"activity_log"));
        assert!(table_names.contains(&"llm_usage"));
    }

    #[tokio::test]
    async fn init_test_db_idempotent() {
        let pool = init_test_db().await.expect("first init");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("second migration run");
    }

    #[test]
    fn expand_tilde_passthrough_for_absolute() {
        assert_eq!(expand_tilde("/tmp/ojpilot.db"), "/tmp/ojpilot.db");
    }

    #[test]
    fn expand_tilde_leaves_user_forms_and_relative_paths() {
        assert_eq!(expand_tilde("~alice/data"), "~alice/data");
        assert_eq!(expand_tilde("data/ojpilot.db"), "data/ojpilot.db");
    }

    #[test]
    fn expand_tilde_resolves_home_prefix() {
        if let Some(home) = dirs::home_dir() {
            let expanded = expand_tilde("~/ojpilot.db");
            assert!(expanded.starts_with(home.to_string_lossy().as_ref()));
            assert!(expanded.ends_with("ojpilot.db"));
            assert_eq!(expand_tilde("~"), home.to_string_lossy());
        }
    }
}
