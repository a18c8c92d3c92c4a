//! Error taxonomy shared by the engine
//!
//! Validation and not-found errors reach the caller synchronously. Computation
//! errors are caught per column by the scheduler and turned into strings.
//! Schema errors abort a column's create/delete and must be retried by hand.

use thiserror::Error;

use crate::db::DbError;

#[derive(Debug, Error)]
pub enum FeidError {
    /// Bad parameter record, unknown series, out-of-bound offsets.
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("computation failed for {column}: {message}")]
    Computation { column: String, message: String },

    #[error("schema change failed on {entity}.{column}: {message}")]
    Schema {
        entity: String,
        column: String,
        message: String,
    },

    /// The entity graph has no path between two entities. Only a broken
    /// configuration can produce this.
    #[error("entities {from} and {to} are not connected")]
    EntityNotConnected { from: String, to: String },

    #[error("storage error: {0}")]
    Db(#[from] DbError),
}

impl FeidError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        FeidError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        FeidError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn computation(column: impl Into<String>, message: impl Into<String>) -> Self {
        FeidError::Computation {
            column: column.into(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FeidError>;
