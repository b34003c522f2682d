/// Errors raised while decoding or locating stored records.
///
/// The public store APIs return `anyhow::Result`; these variants are what
/// ends up inside when a row cannot be turned back into a domain value.
///
/// # Examples
///
/// ```rust
/// use hostwatch_storage::error::StorageError;
///
/// let err = StorageError::NotFound {
///     entity: "incident",
///     id: "42".to_string(),
/// };
/// assert!(err.to_string().contains("incident"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A required record was not found in the database.
    #[error("Storage: {entity} not found (id={id})")]
    NotFound { entity: &'static str, id: String },

    /// An underlying SQLite error from a sample partition.
    #[error("Storage: SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// An error from the management database.
    #[error("Storage: database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    /// Sample payload serialization or deserialization failure.
    #[error("Storage: JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A column held a value outside its domain (bad uuid, unknown ordinal).
    #[error("Storage: invalid value in column '{column}': {value}")]
    InvalidColumn { column: &'static str, value: String },
}

/// Convenience `Result` alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
