//! Schema model errors.

use super::types::{TypeKind, ValueKind};
use thiserror::Error;

/// Errors raised when a schema definition or statement violates the type system.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// The named type does not exist.
    #[error("type not found: {name}")]
    TypeNotFound {
        /// The missing type.
        name: String,
    },

    /// The same name was defined twice.
    #[error("duplicate type definition: {name}")]
    DuplicateType {
        /// The duplicated name.
        name: String,
    },

    /// A name is already taken by a type of a different kind.
    #[error("type {name} is already defined as {existing}, cannot define it as {requested}")]
    KindConflict {
        /// The contested name.
        name: String,
        /// Kind already registered.
        existing: TypeKind,
        /// Kind requested.
        requested: TypeKind,
    },

    /// An existing type was redefined with a different supertype.
    #[error("type {name} already subtypes {existing:?}, cannot define it under {requested:?}")]
    SupertypeConflict {
        /// The type.
        name: String,
        /// Current supertype.
        existing: Option<String>,
        /// Requested supertype.
        requested: Option<String>,
    },

    /// An existing attribute was redefined with a different value kind.
    #[error("attribute {name} already has value {existing}, cannot define it with {requested}")]
    ValueKindConflict {
        /// The attribute.
        name: String,
        /// Current value kind.
        existing: ValueKind,
        /// Requested value kind.
        requested: ValueKind,
    },

    /// A supertype reference points at nothing.
    #[error("supertype {supertype} of {name} does not exist")]
    MissingSupertype {
        /// The subtype.
        name: String,
        /// The missing supertype.
        supertype: String,
    },

    /// A type subtypes a type of another kind.
    #[error("{name} ({kind}) cannot subtype {supertype} ({supertype_kind})")]
    SupertypeKindMismatch {
        /// The subtype.
        name: String,
        /// Kind of the subtype.
        kind: TypeKind,
        /// The supertype.
        supertype: String,
        /// Kind of the supertype.
        supertype_kind: TypeKind,
    },

    /// The supertype relation contains a cycle.
    #[error("supertype cycle through {name}")]
    SupertypeCycle {
        /// A type on the cycle.
        name: String,
    },

    /// An owned attribute type does not exist or is not an attribute.
    #[error("{owner} owns unknown attribute type {attribute}")]
    UnknownAttribute {
        /// The owner.
        owner: String,
        /// The attribute name.
        attribute: String,
    },

    /// A played role is not declared by the referenced relation or its ancestors.
    #[error("{player} plays undeclared role {role}")]
    UnknownRole {
        /// The player.
        player: String,
        /// The scoped role.
        role: String,
    },

    /// The named type has the wrong kind for the statement.
    #[error("{name} is a {found}, expected a {expected}")]
    WrongKind {
        /// The type.
        name: String,
        /// Expected kind.
        expected: TypeKind,
        /// Actual kind.
        found: TypeKind,
    },

    /// A type cannot be undefined while other types still reference it.
    #[error("{name} is still referenced by {}", dependents.join(", "))]
    HasDependents {
        /// The type.
        name: String,
        /// Referencing types or capabilities.
        dependents: Vec<String>,
    },

    /// An ownership to remove is not declared directly.
    #[error("{owner} does not directly own {attribute}")]
    NotOwned {
        /// The owner.
        owner: String,
        /// The attribute.
        attribute: String,
    },

    /// A role to remove is not played directly.
    #[error("{player} does not directly play {role}")]
    NotPlayed {
        /// The player.
        player: String,
        /// The scoped role.
        role: String,
    },

    /// A role to remove is not declared directly.
    #[error("{relation} does not directly relate {role}")]
    NotRelated {
        /// The relation.
        relation: String,
        /// The role.
        role: String,
    },
}
