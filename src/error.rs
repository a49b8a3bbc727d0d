// ⚠️ Error taxonomy for worksheet build and consumption
//
// Validation errors abort before any mutation (or skip a single row when the
// failure is row-scoped), data access errors always propagate after the
// active transaction rolls back, and a missing worksheet aborts before the
// database is touched.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UnmergeError {
    #[error("worksheet is missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("unsupported entity kind '{0}', expected 'person' or 'organization'")]
    UnsupportedEntityKind(String),

    #[error("invalid SSN: expected 9 digits, got {len} ('{digits}')")]
    InvalidSsn { digits: String, len: usize },

    #[error("worksheet row {row}: {message}")]
    MalformedRow { row: usize, message: String },

    #[error("unknown column kind code {0}")]
    UnknownColumnKind(i64),

    #[error("worksheet not found: {}", .0.display())]
    WorksheetNotFound(PathBuf),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("worksheet I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worksheet CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Coarse class of an error, used by callers to decide between
/// "fix the input" and "retry the run".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Validation,
    DataAccess,
    NotFound,
}

impl UnmergeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            UnmergeError::MissingColumns(_)
            | UnmergeError::UnsupportedEntityKind(_)
            | UnmergeError::InvalidSsn { .. }
            | UnmergeError::MalformedRow { .. }
            | UnmergeError::UnknownColumnKind(_) => ErrorClass::Validation,
            UnmergeError::WorksheetNotFound(_) => ErrorClass::NotFound,
            UnmergeError::Database(_)
            | UnmergeError::Io(_)
            | UnmergeError::Csv(_)
            | UnmergeError::Json(_) => ErrorClass::DataAccess,
        }
    }

    pub fn is_validation(&self) -> bool {
        self.class() == ErrorClass::Validation
    }
}

pub type Result<T> = std::result::Result<T, UnmergeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let missing = UnmergeError::MissingColumns(vec!["SSN".to_string(), "GroupID".to_string()]);
        assert_eq!(missing.class(), ErrorClass::Validation);
        assert_eq!(
            missing.to_string(),
            "worksheet is missing required columns: SSN, GroupID"
        );

        let not_found = UnmergeError::WorksheetNotFound(PathBuf::from("nope.csv"));
        assert_eq!(not_found.class(), ErrorClass::NotFound);

        let db = UnmergeError::from(rusqlite::Error::QueryReturnedNoRows);
        assert_eq!(db.class(), ErrorClass::DataAccess);
        assert!(!db.is_validation());
    }
}
