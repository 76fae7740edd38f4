use thiserror::Error;

/// What went wrong at the storage layer, abstracted over sqlx so callers
/// can branch on the kind without matching on driver errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseErrorKind {
    NotFound,
    /// A unique constraint rejected the write. The constraint name tells
    /// callers which idempotency rule fired.
    UniqueViolation {
        constraint: Option<String>,
    },
    /// Stored data violates an invariant the code relies on, e.g. a manual
    /// payment row with no transaction code.
    Inconsistent,
    ConnectionFailed,
    Unknown,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DatabaseError {
    pub kind: DatabaseErrorKind,
    pub message: String,
}

impl DatabaseError {
    pub fn new(kind: DatabaseErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::NotFound, what)
    }

    pub fn inconsistent(message: impl Into<String>) -> Self {
        Self::new(DatabaseErrorKind::Inconsistent, message)
    }

    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => {
                Self::new(DatabaseErrorKind::NotFound, "row not found")
            }
            sqlx::Error::Database(db_err) => {
                // 23505 = unique_violation
                if db_err.code().as_deref() == Some("23505") {
                    return Self::new(
                        DatabaseErrorKind::UniqueViolation {
                            constraint: db_err.constraint().map(|c| c.to_string()),
                        },
                        db_err.to_string(),
                    );
                }
                Self::new(DatabaseErrorKind::Unknown, db_err.to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::new(DatabaseErrorKind::ConnectionFailed, err.to_string())
            }
            _ => Self::new(DatabaseErrorKind::Unknown, err.to_string()),
        }
    }

    pub fn is_unique_violation(&self) -> bool {
        matches!(self.kind, DatabaseErrorKind::UniqueViolation { .. })
    }

    pub fn constraint(&self) -> Option<&str> {
        match &self.kind {
            DatabaseErrorKind::UniqueViolation { constraint } => constraint.as_deref(),
            _ => None,
        }
    }
}
