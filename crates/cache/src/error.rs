use thiserror::Error;

/// Failure to derive index keys for one record.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The record's kind has no key derivation registered; excluded from
    /// the index when the spec allows missing kinds, otherwise fatal.
    #[error("kind {0} is not covered by this index")]
    Unsupported(String),
    #[error("cannot derive index key: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("duplicate key: {key}")]
    DuplicateKey { key: String },
    #[error("not found: {key}")]
    NotFound { key: String },
    #[error("index {index}: {reason}")]
    IndexBuild { index: String, reason: String },
    #[error("unknown index: {0}")]
    UnknownIndex(String),
    #[error(transparent)]
    Expression(#[from] mercury_expr::ExprError),
    #[error("internal: {0}")]
    Internal(String),
}
