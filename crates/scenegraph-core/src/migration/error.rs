//! Migration-specific error types.

use crate::schema::{SchemaError, TypeKind, ValueKind};
use crate::store::StoreError;
use std::fmt;
use thiserror::Error;

/// Coarse classification of a [`MigrationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorCategory {
    /// Malformed proposal. Nothing was touched.
    Validation,
    /// Name/kind collision or cycle. Nothing was touched.
    Conflict,
    /// Missing or unresolvable reference. Nothing was touched.
    Dependency,
    /// The store rejected or failed a statement.
    Execution,
    /// Some operations committed before a failure; needs operator attention.
    PartialMigration,
    /// Bookkeeping or persistence failure inside the engine.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::Conflict => write!(f, "conflict"),
            ErrorCategory::Dependency => write!(f, "dependency"),
            ErrorCategory::Execution => write!(f, "execution"),
            ErrorCategory::PartialMigration => write!(f, "partial migration"),
            ErrorCategory::Internal => write!(f, "internal"),
        }
    }
}

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The proposal is malformed.
    #[error("invalid proposal: {message}")]
    Validation {
        /// What is wrong.
        message: String,
    },

    /// A name is already used by a type of a different kind.
    #[error("type {name} already exists as {existing}, cannot define it as {requested}")]
    NameConflict {
        /// The contested name.
        name: String,
        /// Kind registered for the name.
        existing: TypeKind,
        /// Kind requested for the name.
        requested: TypeKind,
    },

    /// Proposed supertypes form a cycle.
    #[error("supertype cycle: {}", types.join(" -> "))]
    SupertypeCycle {
        /// Types on the cycle, in walk order.
        types: Vec<String>,
    },

    /// Operations depend on each other circularly.
    #[error("operations depend on each other circularly: {}", operations.join(", "))]
    DependencyCycle {
        /// Operations that could not be ordered.
        operations: Vec<String>,
    },

    /// Any other conflict between the proposal and the schema.
    #[error("conflict: {message}")]
    Conflict {
        /// What conflicts.
        message: String,
    },

    /// An attribute cannot be retyped between these value kinds.
    #[error("incompatible value change for {attribute}: cannot convert {from} to {to}")]
    IncompatibleValueKind {
        /// The attribute type.
        attribute: String,
        /// Current value kind.
        from: ValueKind,
        /// Requested value kind.
        to: ValueKind,
    },

    /// A requested supertype exists neither in the schema nor in the proposal.
    #[error("supertype {supertype} of {name} is not defined")]
    MissingSupertype {
        /// The subtype.
        name: String,
        /// The missing supertype.
        supertype: String,
    },

    /// Any other unresolvable reference.
    #[error("unresolved dependency: {message}")]
    Dependency {
        /// What cannot be resolved.
        message: String,
    },

    /// The store failed a statement.
    #[error("operation {operation} failed: {source}")]
    Execution {
        /// Operation id.
        operation: String,
        /// Store failure.
        #[source]
        source: StoreError,
    },

    /// A plan stopped after committing some of its operations.
    #[error("migration {fingerprint} partially applied: {applied} operation(s) committed, {failed} failed")]
    PartialMigration {
        /// Plan fingerprint.
        fingerprint: String,
        /// Number of committed operations.
        applied: usize,
        /// Failing operation id.
        failed: String,
    },

    /// The plan deletes live data and destructive plans are not allowed.
    #[error("cannot run {operation}: {reason}")]
    UnsafeOperation {
        /// The operation.
        operation: String,
        /// Why it is unsafe.
        reason: String,
    },

    /// Another migration is recorded as in flight.
    #[error("migration already in progress: {migration_id}")]
    MigrationInProgress {
        /// Id of the in-flight record.
        migration_id: String,
    },

    /// No such migration record.
    #[error("migration not found: {migration_id}")]
    MigrationNotFound {
        /// The id looked up.
        migration_id: String,
    },

    /// Schema model error.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Store error outside of plan execution.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Persistence error.
    #[error("storage error: {0}")]
    Storage(#[from] crate::error::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),
}

impl From<sled::Error> for MigrationError {
    fn from(e: sled::Error) -> Self {
        MigrationError::Storage(e.into())
    }
}

impl MigrationError {
    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        MigrationError::Validation {
            message: message.into(),
        }
    }

    /// Create a conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        MigrationError::Conflict {
            message: message.into(),
        }
    }

    /// Create a dependency error.
    pub fn dependency(message: impl Into<String>) -> Self {
        MigrationError::Dependency {
            message: message.into(),
        }
    }

    /// Classify the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            MigrationError::Validation { .. } => ErrorCategory::Validation,
            MigrationError::NameConflict { .. }
            | MigrationError::SupertypeCycle { .. }
            | MigrationError::DependencyCycle { .. }
            | MigrationError::Conflict { .. }
            | MigrationError::IncompatibleValueKind { .. } => ErrorCategory::Conflict,
            MigrationError::MissingSupertype { .. } | MigrationError::Dependency { .. } => {
                ErrorCategory::Dependency
            }
            MigrationError::Execution { .. }
            | MigrationError::Store(_)
            | MigrationError::UnsafeOperation { .. }
            | MigrationError::MigrationInProgress { .. } => ErrorCategory::Execution,
            MigrationError::PartialMigration { .. } => ErrorCategory::PartialMigration,
            MigrationError::MigrationNotFound { .. }
            | MigrationError::Schema(_)
            | MigrationError::Storage(_)
            | MigrationError::Serialization(_)
            | MigrationError::Deserialization(_) => ErrorCategory::Internal,
        }
    }

    /// Whether the error was raised before anything was executed.
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Validation | ErrorCategory::Conflict | ErrorCategory::Dependency
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let conflict = MigrationError::NameConflict {
            name: "chair".into(),
            existing: TypeKind::Entity,
            requested: TypeKind::Attribute,
        };
        assert_eq!(conflict.category(), ErrorCategory::Conflict);
        assert!(conflict.is_planning_error());

        let cycle = MigrationError::SupertypeCycle {
            types: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(cycle.to_string(), "supertype cycle: a -> b -> a");
        assert_eq!(cycle.category(), ErrorCategory::Conflict);

        let missing = MigrationError::MissingSupertype {
            name: "lamp".into(),
            supertype: "fixture".into(),
        };
        assert_eq!(missing.category(), ErrorCategory::Dependency);

        let exec = MigrationError::Execution {
            operation: "define:chair".into(),
            source: StoreError::rejected("boom"),
        };
        assert_eq!(exec.category(), ErrorCategory::Execution);
        assert!(!exec.is_planning_error());
    }

    #[test]
    fn test_sled_errors_are_storage() {
        let err: MigrationError = sled::Error::Unsupported("read only".into()).into();
        assert!(matches!(err, MigrationError::Storage(crate::error::Error::Storage(_))));
        assert_eq!(err.category(), ErrorCategory::Internal);
    }

    #[test]
    fn test_error_display() {
        let err = MigrationError::IncompatibleValueKind {
            attribute: "size".into(),
            from: ValueKind::Boolean,
            to: ValueKind::Date,
        };
        assert!(err.to_string().contains("cannot convert boolean to date"));
    }
}
