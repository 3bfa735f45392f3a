//! Error taxonomy shared by every botcore crate.

/// Errors raised by the command-processing core.
///
/// `NotFound`, `Validation`, `Conflict`, `Referenced` and `Rejected` are
/// meant to reach the actor as a chat message. Only a transient `Store`
/// failure is retryable; writes are single statement or single transaction,
/// so nothing is partially applied.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{kind} not found: {key}")]
    NotFound { kind: String, key: String },

    #[error("argument {name} at position {position} required")]
    Validation { name: String, position: usize },

    #[error("{kind} already exists: {key}")]
    Conflict { kind: String, key: String },

    /// Delete refused because rows in `tables` still point at the entity.
    #[error("{kind} {key} still referenced by {}", .tables.join(", "))]
    Referenced {
        kind: String,
        key: String,
        tables: Vec<String>,
    },

    /// A write the schema refuses (NOT NULL, CHECK, FOREIGN KEY, bad enum
    /// value). Retrying cannot help.
    #[error("{kind} rejected: {reason}")]
    Rejected { kind: String, reason: String },

    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("handler failed: {0}")]
    Handler(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn not_found(kind: impl Into<String>, key: impl ToString) -> Self {
        CoreError::NotFound {
            kind: kind.into(),
            key: key.to_string(),
        }
    }

    pub fn conflict(kind: impl Into<String>, key: impl ToString) -> Self {
        CoreError::Conflict {
            kind: kind.into(),
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound { .. })
    }

    pub fn rejected(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::Rejected {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    /// True only for store failures that may clear up on their own.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Store(rusqlite::Error::SqliteFailure(code, _)) => matches!(
                code.code,
                rusqlite::ErrorCode::DatabaseBusy
                    | rusqlite::ErrorCode::DatabaseLocked
                    | rusqlite::ErrorCode::CannotOpen
                    | rusqlite::ErrorCode::SystemIoFailure
            ),
            _ => false,
        }
    }

    /// Text shown to the actor when the transport catches this error.
    pub fn user_message(&self) -> String {
        match self {
            CoreError::NotFound { kind, key } => format!("{} {} not found!", kind, key),
            CoreError::Validation { name, position } => {
                format!("Argument {} at position {} required!", name, position)
            }
            CoreError::Conflict { kind, key } => format!("{} {} already exists!", kind, key),
            CoreError::Referenced { kind, key, tables } => {
                format!("{} {} is still used by {}!", kind, key, tables.join(", "))
            }
            CoreError::Rejected { kind, reason } => format!("{} rejected: {}!", kind, reason),
            CoreError::Store(_) if self.is_retryable() => {
                "Storage unavailable, please retry.".to_string()
            }
            CoreError::Store(_) | CoreError::Config(_) | CoreError::Handler(_) => {
                "Command failed!".to_string()
            }
        }
    }
}

/// True when a SQLite error is a UNIQUE / PRIMARY KEY constraint violation.
pub fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => {
            code.code == rusqlite::ErrorCode::ConstraintViolation
                && (code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

/// The constraint-violation text SQLite reports (`NOT NULL constraint
/// failed: folder.bkey`), or `None` for any other error.
pub fn constraint_violation(err: &rusqlite::Error) -> Option<&str> {
    match err {
        rusqlite::Error::SqliteFailure(code, message)
            if code.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Some(message.as_deref().unwrap_or("constraint failed"))
        }
        _ => None,
    }
}

/// True when a SQLite error is a FOREIGN KEY constraint violation.
pub fn is_foreign_key_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => {
            code.code == rusqlite::ErrorCode::ConstraintViolation
                && code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_messages_are_actor_readable() {
        let err = CoreError::not_found("Folder", 42);
        assert_eq!(err.user_message(), "Folder 42 not found!");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());

        let err = CoreError::Validation {
            name: "title".to_string(),
            position: 1,
        };
        assert_eq!(err.user_message(), "Argument title at position 1 required!");
    }

    fn sqlite_failure(code: i32, message: &str) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(code), Some(message.to_string()))
    }

    #[test]
    fn only_transient_store_errors_are_retryable() {
        let busy = CoreError::from(sqlite_failure(rusqlite::ffi::SQLITE_BUSY, "database is locked"));
        assert!(busy.is_retryable());
        assert_eq!(busy.user_message(), "Storage unavailable, please retry.");

        let not_null = CoreError::from(sqlite_failure(
            rusqlite::ffi::SQLITE_CONSTRAINT_NOTNULL,
            "NOT NULL constraint failed: folder.bkey",
        ));
        assert!(!not_null.is_retryable());
        assert_eq!(not_null.user_message(), "Command failed!");

        assert!(!CoreError::from(rusqlite::Error::InvalidQuery).is_retryable());
    }

    #[test]
    fn constraint_violations_are_classified() {
        let fk = sqlite_failure(
            rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY,
            "FOREIGN KEY constraint failed",
        );
        assert!(is_foreign_key_violation(&fk));
        assert_eq!(constraint_violation(&fk), Some("FOREIGN KEY constraint failed"));

        let busy = sqlite_failure(rusqlite::ffi::SQLITE_BUSY, "database is locked");
        assert!(!is_foreign_key_violation(&busy));
        assert_eq!(constraint_violation(&busy), None);
    }

    #[test]
    fn referenced_and_rejected_reach_the_actor() {
        let err = CoreError::Referenced {
            kind: "Folder".to_string(),
            key: "inbox".to_string(),
            tables: vec!["note".to_string()],
        };
        assert_eq!(err.user_message(), "Folder inbox is still used by note!");
        assert!(!err.is_retryable());

        let err = CoreError::rejected("Folder", "NOT NULL constraint failed: folder.bkey");
        assert_eq!(
            err.user_message(),
            "Folder rejected: NOT NULL constraint failed: folder.bkey!"
        );
    }
}
