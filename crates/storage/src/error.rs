use thiserror::Error;

/// Errors raised by the unit of work and the sequence generator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An optimistic write found a newer version than the one it read.
    #[error("Version conflict on {entity} {id}")]
    VersionConflict { entity: &'static str, id: String },

    /// A unique constraint rejected the write.
    #[error("Unique constraint violated: {constraint}")]
    Duplicate { constraint: String },

    /// An update targeted a row that does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A stored value could not be mapped back into a domain type.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    pub(crate) fn conflict(entity: &'static str, id: impl ToString) -> Self {
        StoreError::VersionConflict {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn missing(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn duplicate(constraint: &str) -> Self {
        StoreError::Duplicate {
            constraint: constraint.to_string(),
        }
    }

    /// Maps unique violations to [`StoreError::Duplicate`].
    pub(crate) fn from_db(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err
            && db_err.is_unique_violation()
        {
            return StoreError::Duplicate {
                constraint: db_err.constraint().unwrap_or("unknown").to_string(),
            };
        }
        StoreError::Database(err)
    }

    /// True for optimistic conflicts, which callers retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }

    pub fn is_duplicate(&self, constraint: &str) -> bool {
        matches!(self, StoreError::Duplicate { constraint: c } if c == constraint)
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;
