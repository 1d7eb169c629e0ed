//! Storage error shared by the durable stores.

/// Store operation error.
///
/// - `Unavailable`: the store could not be reached or timed out. Transient;
///   callers retry with backoff and never surface it to handlers.
/// - `Conflict`: an optimistic version check or a concurrent writer lost the
///   race. Retried locally by re-reading.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("concurrent modification: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Conflict(_))
    }

    pub(crate) fn poisoned() -> Self {
        StoreError::Unavailable("lock poisoned".to_string())
    }
}

/// Map SQLx errors to `StoreError`.
///
/// | SQLx error | SQLSTATE | StoreError |
/// |---|---|---|
/// | Database | `23505`, `40001`, `40P01` | `Conflict` |
/// | Database | `08xxx`, `57Pxx` | `Unavailable` |
/// | Database | other | `Unavailable` |
/// | RowNotFound | n/a | `NotFound` |
/// | ColumnDecode / Decode | n/a | `Serialization` |
/// | Pool / IO / TLS / other | n/a | `Unavailable` |
pub(crate) fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") | Some("40001") | Some("40P01") => StoreError::Conflict(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::RowNotFound => {
            StoreError::NotFound(format!("unexpected row not found in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(format!("decode error in {}: {}", operation, err))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}
