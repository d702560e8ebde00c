//! Error types for the ojpilot core library.
//!
//! Each module boundary has its own error enum to provide clear error
//! boundaries. The library uses `thiserror` for structured, typed errors.
//! Classification of errors into retryable and terminal kinds lives in
//! [`crate::pipeline::ErrorKind`], derived from these enums.

/// Errors related to configuration loading, parsing, and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required configuration field is absent.
    #[error("missing required config field: {field}")]
    MissingField {
        /// The name of the missing field.
        field: String,
    },

    /// A configuration field has an unacceptable value.
    #[error("invalid value for config field '{field}': {message}")]
    InvalidValue {
        /// The name of the invalid field.
        field: String,
        /// A description of why the value is invalid.
        message: String,
    },

    /// The configuration file does not exist at the specified path.
    #[error("config file not found: {path}")]
    FileNotFound {
        /// The path that was searched.
        path: String,
    },

    /// TOML deserialization failed.
    #[error("failed to parse config file: {source}")]
    ParseError {
        /// The underlying TOML parse error.
        #[source]
        source: toml::de::Error,
    },
}

/// Errors from judge adapter operations (fetch, upload, submit, status).
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Credentials are missing, expired, or rejected by the judge.
    #[error("judge authentication failed: {message}")]
    Auth {
        /// Details about the authentication failure.
        message: String,
    },

    /// The requested problem does not exist on the judge.
    #[error("problem not found: {pid}")]
    NotFound {
        /// The problem id that was requested.
        pid: String,
    },

    /// The judge response could not be parsed into the expected shape.
    #[error("failed to parse judge response: {message}")]
    Parse {
        /// Details about the parse failure.
        message: String,
    },

    /// The judge refused the operation for the authenticated user.
    #[error("judge forbade the operation: {message}")]
    Forbidden {
        /// Details from the judge.
        message: String,
    },

    /// Upload collided with an existing problem of the same title.
    #[error("duplicate problem on target judge: {title}")]
    Duplicate {
        /// The colliding title.
        title: String,
    },

    /// The uploaded artifact was rejected as malformed.
    #[error("judge rejected uploaded data: {message}")]
    BadData {
        /// Details from the judge.
        message: String,
    },

    /// Judge returned HTTP 429 (rate limited).
    #[error("judge rate limited{}", match .retry_after {
        Some(secs) => format!(", retry after {secs}s"),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying, if provided by the judge.
        retry_after: Option<u64>,
    },

    /// Network-level failure communicating with the judge.
    #[error("judge network error: {source}")]
    Network {
        /// The underlying HTTP client error.
        #[source]
        source: reqwest::Error,
    },

    /// Any other judge error response.
    #[error("judge error (HTTP {status}): {message}")]
    Api {
        /// The HTTP status code.
        status: u16,
        /// The error message from the judge.
        message: String,
    },

    /// The adapter does not implement the requested capability.
    #[error("adapter '{adapter}' does not support {capability}")]
    Unsupported {
        /// The adapter name.
        adapter: String,
        /// The capability that was requested.
        capability: String,
    },
}

/// Errors from interacting with LLM providers.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// HTTP request to the LLM endpoint failed.
    #[error("LLM HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// LLM API returned an error response.
    #[error("LLM API error (status {status}): {message}")]
    Api {
        /// The HTTP status code.
        status: u16,
        /// The error message from the API.
        message: String,
    },

    /// LLM provider rate limit hit.
    #[error("LLM rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// LLM response could not be parsed or carried unusable content.
    #[error("failed to parse LLM response: {0}")]
    Parse(String),

    /// No provider is bound to the requested endpoint.
    #[error("no LLM provider configured for endpoint '{endpoint}'")]
    NotConfigured {
        /// The endpoint that had no binding.
        endpoint: String,
    },

    /// The call exceeded its configured wall-clock budget.
    #[error("LLM call timed out after {seconds}s")]
    Timeout {
        /// Number of seconds waited before timing out.
        seconds: u64,
    },

    /// Provider credentials failed shape validation or are absent.
    #[error("LLM credentials invalid for provider '{provider}': {message}")]
    Credentials {
        /// The provider id.
        provider: String,
        /// Details about what is missing or malformed.
        message: String,
    },

    /// The caller's cancellation token fired before the call finished.
    #[error("LLM call cancelled")]
    Cancelled,
}

/// Errors from SQLite storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to connect to SQLite database.
    #[error("database connection error: {source}")]
    Connection {
        /// The underlying SQLx error.
        #[source]
        source: sqlx::Error,
    },

    /// Database migration failed.
    #[error("database migration error: {source}")]
    Migration {
        /// The underlying migration error.
        #[source]
        source: sqlx::migrate::MigrateError,
    },

    /// A database query failed.
    #[error("database query error: {source}")]
    Query {
        /// The underlying SQLx error.
        #[source]
        source: sqlx::Error,
    },

    /// Credential encryption or decryption failed.
    #[error("credential crypto error: {message}")]
    Crypto {
        /// Details about the crypto failure.
        message: String,
    },

    /// An optimistic ownership update found the row claimed by another worker.
    #[error("problem row owned by another worker: {owner}")]
    OwnerMismatch {
        /// The worker id recorded on the row.
        owner: String,
    },
}

/// Errors from per-problem workspace operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// Filesystem operation failed.
    #[error("workspace io error at {path}: {source}")]
    Io {
        /// The path involved in the failing operation.
        path: String,
        /// The underlying io error.
        #[source]
        source: std::io::Error,
    },

    /// A stored artifact could not be deserialized.
    #[error("corrupt workspace artifact at {path}: {message}")]
    Corrupt {
        /// The path of the corrupt artifact.
        path: String,
        /// Details about the corruption.
        message: String,
    },

    /// Building the snapshot archive failed.
    #[error("workspace archive error: {message}")]
    Archive {
        /// Details about the archive failure.
        message: String,
    },
}

/// Errors from the concurrency gate set.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// The named gate does not exist.
    #[error("unknown gate: {name}")]
    UnknownGate {
        /// The gate name that failed to resolve.
        name: String,
    },

    /// The caller's cancellation token fired while waiting for a permit.
    #[error("gate acquisition cancelled while waiting on '{name}'")]
    Cancelled {
        /// The gate that was being waited on.
        name: String,
    },
}

/// Errors from authentication operations.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Unknown username or wrong password.
    #[error("invalid username or password")]
    InvalidCredentials,

    /// The session token is unknown or expired.
    #[error("session expired or unknown")]
    SessionExpired,

    /// Password hashing failed.
    #[error("password hash error: {message}")]
    Hash {
        /// Details from the hashing library.
        message: String,
    },

    /// Underlying storage failure.
    #[error("auth storage error: {0}")]
    Storage(#[from] StorageError),
}
