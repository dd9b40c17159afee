//! Error taxonomy for record collection operations.
//!
//! # Responsibility
//! - Classify every failure a write or read pipeline can surface.
//! - Keep driver errors attached as `source()` for diagnostics.
//!
//! # Invariants
//! - Programmer errors are reported as `Invariant`, never as panics.
//! - A `Storage` error carries a friendly message only when the model
//!   declared one for the SQL constraint the driver reported.

use crate::db::DbError;
use crate::security::Operation;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug)]
pub enum CoreError {
    /// A declared constraint method rejected the data.
    Validation(String),
    Permission {
        uid: i64,
        model: String,
        operation: Operation,
    },
    NotFound(String),
    Storage {
        error: DbError,
        message: Option<String>,
    },
    Invariant(String),
}

impl CoreError {
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant(message.into())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Short stable code for log lines.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Permission { .. } => "permission",
            Self::NotFound(_) => "not_found",
            Self::Storage { .. } => "storage",
            Self::Invariant(_) => "invariant",
        }
    }
}

impl Display for CoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(message) => write!(f, "validation failed: {message}"),
            Self::Permission {
                uid,
                model,
                operation,
            } => write!(f, "user {uid} may not {operation} on {model}"),
            Self::NotFound(message) => write!(f, "not found: {message}"),
            Self::Storage {
                message: Some(message),
                ..
            } => write!(f, "{message}"),
            Self::Storage {
                error,
                message: None,
            } => write!(f, "{error}"),
            Self::Invariant(message) => write!(f, "invariant violated: {message}"),
        }
    }
}

impl Error for CoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Storage { error, .. } => Some(error),
            _ => None,
        }
    }
}

impl From<DbError> for CoreError {
    fn from(value: DbError) -> Self {
        Self::Storage {
            error: value,
            message: None,
        }
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::from(DbError::Sqlite(value))
    }
}
