use axum::http::StatusCode;

/// Error type shared by the storage layer and everything above it.
///
/// Low-level engine failures are wrapped into `Storage`; the REST layer maps
/// each variant to an HTTP status via [`StoreError::http_status`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found")]
    NotFound,

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("store is read-only")]
    ReadOnly,

    #[error("parse error: {0}")]
    Parse(String),

    /// Recovered locally by the data-stream store (a new stream version is
    /// created); only surfaces when a caller asks for a strict update.
    #[error("record structure is incompatible with the stored stream")]
    StructureIncompatible,

    #[error("stored value has schema version {found}, newest supported is {supported}")]
    VersionMismatch { found: u8, supported: u8 },

    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn http_status(&self) -> StatusCode {
        match self {
            StoreError::InvalidRequest(_) | StoreError::Parse(_) => StatusCode::BAD_REQUEST,
            StoreError::NotFound => StatusCode::NOT_FOUND,
            StoreError::AlreadyExists(_) => StatusCode::CONFLICT,
            StoreError::ReadOnly => StatusCode::METHOD_NOT_ALLOWED,
            StoreError::StructureIncompatible => StatusCode::CONFLICT,
            StoreError::VersionMismatch { .. } | StoreError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

macro_rules! wrap_storage_error {
    ($($t:ty),+ $(,)?) => {
        $(impl From<$t> for StoreError {
            fn from(e: $t) -> Self {
                StoreError::Storage(e.to_string())
            }
        })+
    };
}

wrap_storage_error!(
    redb::DatabaseError,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
    std::io::Error,
);

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Storage(format!("value encode: {e}"))
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Storage(format!("value decode: {e}"))
    }
}
