//! Store seam.
//!
//! The engine talks to the knowledge store through [`Store`]: one schema
//! statement or one data statement at a time, each applied atomically.
//! Nothing is assumed about atomicity across statements.

mod memory;
mod sled_store;
mod state;
mod statement;

pub use self::memory::MemoryStore;
pub use self::sled_store::SledStore;
pub use self::statement::{DataRows, DataStatement, Instance, Provenance, RolePlayer};

use crate::schema::{SchemaError, SchemaStatement, TypeDef};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by a store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store refused a statement.
    #[error("statement rejected: {message}")]
    Rejected {
        /// Reason given by the store.
        message: String,
    },

    /// A schema statement violated the type system.
    #[error("schema statement rejected: {0}")]
    Schema(#[from] SchemaError),

    /// A call did not complete in time. Whether it applied is unknown.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Description of the call.
        operation: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// A statement returned rows of an unexpected shape.
    #[error("unexpected result for {statement}")]
    UnexpectedRows {
        /// Description of the statement.
        statement: String,
    },

    /// The store cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Persistence failure in an embedded store.
    #[error(transparent)]
    Persistence(#[from] crate::error::Error),
}

impl StoreError {
    /// Create a rejection.
    pub fn rejected(message: impl Into<String>) -> Self {
        StoreError::Rejected {
            message: message.into(),
        }
    }

    /// Whether the outcome of the failed call is unknown.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, StoreError::Timeout { .. })
    }
}

impl From<sled::Error> for StoreError {
    fn from(err: sled::Error) -> Self {
        StoreError::Persistence(err.into())
    }
}

/// A graph-typed knowledge store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Apply one schema statement, fully or not at all.
    async fn execute_schema_statement(&self, statement: &SchemaStatement)
        -> Result<(), StoreError>;

    /// Introspect the current schema.
    async fn current_schema(&self) -> Result<Vec<TypeDef>, StoreError>;

    /// Run one data statement, fully or not at all.
    async fn execute_data_statement(&self, statement: &DataStatement)
        -> Result<DataRows, StoreError>;
}
