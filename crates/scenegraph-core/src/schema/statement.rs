//! Schema statements: the unit of change sent to a store.

use super::definition::TypeDef;
use super::state::SchemaState;
use super::typeql;
use super::types::{RoleRef, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Classification of a schema statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Purely additive.
    Define,
    /// Changes an existing definition in place.
    Redefine,
    /// Removes a definition.
    Undefine,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Define => write!(f, "define"),
            OperationKind::Redefine => write!(f, "redefine"),
            OperationKind::Undefine => write!(f, "undefine"),
        }
    }
}

/// A single, atomically applied schema statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "statement", rename_all = "snake_case")]
pub enum SchemaStatement {
    /// Define a type (or extend an existing one of the same kind), optionally
    /// granting ownership of it or its roles to other types in the same statement.
    DefineType {
        definition: TypeDef,
        #[serde(default)]
        owned_by: BTreeSet<String>,
        /// `(player, role)` pairs for roles of the defined relation.
        #[serde(default)]
        played_by: BTreeSet<(String, String)>,
    },
    /// Grant ownership of an attribute type.
    AddOwns { owner: String, attribute: String },
    /// Grant a role.
    AddPlays { player: String, role: RoleRef },
    /// Declare a role on an existing relation.
    AddRelates { relation: String, role: String },
    /// Change the supertype of a type.
    SetSupertype {
        name: String,
        supertype: Option<String>,
        previous: Option<String>,
    },
    /// Change the value kind of an attribute type.
    SetValueKind {
        attribute: String,
        value_kind: ValueKind,
        previous: ValueKind,
    },
    /// Revoke ownership of an attribute type.
    RemoveOwns { owner: String, attribute: String },
    /// Revoke a role.
    RemovePlays { player: String, role: RoleRef },
    /// Remove a role declaration.
    RemoveRelates { relation: String, role: String },
    /// Remove a type. The full definition is retained so the removal can be reversed.
    UndefineType { definition: TypeDef },
}

impl SchemaStatement {
    /// Define a type with no extra grants.
    pub fn define(definition: impl Into<TypeDef>) -> Self {
        SchemaStatement::DefineType {
            definition: definition.into(),
            owned_by: BTreeSet::new(),
            played_by: BTreeSet::new(),
        }
    }

    /// Operation class of the statement.
    pub fn kind(&self) -> OperationKind {
        match self {
            SchemaStatement::DefineType { .. }
            | SchemaStatement::AddOwns { .. }
            | SchemaStatement::AddPlays { .. }
            | SchemaStatement::AddRelates { .. } => OperationKind::Define,
            SchemaStatement::SetSupertype { .. } | SchemaStatement::SetValueKind { .. } => {
                OperationKind::Redefine
            }
            SchemaStatement::RemoveOwns { .. }
            | SchemaStatement::RemovePlays { .. }
            | SchemaStatement::RemoveRelates { .. }
            | SchemaStatement::UndefineType { .. } => OperationKind::Undefine,
        }
    }

    /// The type primarily affected by this statement.
    pub fn target(&self) -> &str {
        match self {
            SchemaStatement::DefineType { definition, .. }
            | SchemaStatement::UndefineType { definition } => definition.name(),
            SchemaStatement::AddOwns { owner, .. } | SchemaStatement::RemoveOwns { owner, .. } => {
                owner
            }
            SchemaStatement::AddPlays { player, .. }
            | SchemaStatement::RemovePlays { player, .. } => player,
            SchemaStatement::AddRelates { relation, .. }
            | SchemaStatement::RemoveRelates { relation, .. } => relation,
            SchemaStatement::SetSupertype { name, .. } => name,
            SchemaStatement::SetValueKind { attribute, .. } => attribute,
        }
    }

    /// Render the statement as TypeQL.
    pub fn to_typeql(&self) -> String {
        typeql::render_statement(self)
    }

    /// Statements that undo this one, given the schema as it was before it applied.
    ///
    /// Extending a type that already existed only reverses the extension.
    pub fn inverse(&self, before: &SchemaState) -> Vec<SchemaStatement> {
        match self {
            SchemaStatement::DefineType {
                definition,
                owned_by,
                played_by,
            } => {
                let name = definition.name();
                let mut undo = Vec::new();
                for (player, role) in played_by {
                    let role = RoleRef::new(name, role.clone());
                    if !before.directly_plays(player, &role) {
                        undo.push(SchemaStatement::RemovePlays {
                            player: player.clone(),
                            role,
                        });
                    }
                }
                for owner in owned_by {
                    if !before.directly_owns(owner, name) {
                        undo.push(SchemaStatement::RemoveOwns {
                            owner: owner.clone(),
                            attribute: name.to_string(),
                        });
                    }
                }
                match before.get(name) {
                    None => undo.push(SchemaStatement::UndefineType {
                        definition: definition.clone(),
                    }),
                    Some(existing) => {
                        for attribute in definition.owns().difference(existing.owns()) {
                            undo.push(SchemaStatement::RemoveOwns {
                                owner: name.to_string(),
                                attribute: attribute.clone(),
                            });
                        }
                        for role in definition.plays().difference(existing.plays()) {
                            undo.push(SchemaStatement::RemovePlays {
                                player: name.to_string(),
                                role: role.clone(),
                            });
                        }
                        for role in definition.relates().difference(existing.relates()) {
                            undo.push(SchemaStatement::RemoveRelates {
                                relation: name.to_string(),
                                role: role.clone(),
                            });
                        }
                    }
                }
                undo
            }
            SchemaStatement::AddOwns { owner, attribute } => {
                if before.directly_owns(owner, attribute) {
                    Vec::new()
                } else {
                    vec![SchemaStatement::RemoveOwns {
                        owner: owner.clone(),
                        attribute: attribute.clone(),
                    }]
                }
            }
            SchemaStatement::AddPlays { player, role } => {
                if before.directly_plays(player, role) {
                    Vec::new()
                } else {
                    vec![SchemaStatement::RemovePlays {
                        player: player.clone(),
                        role: role.clone(),
                    }]
                }
            }
            SchemaStatement::AddRelates { relation, role } => {
                let declared = before
                    .get(relation)
                    .is_some_and(|def| def.relates().contains(role));
                if declared {
                    Vec::new()
                } else {
                    vec![SchemaStatement::RemoveRelates {
                        relation: relation.clone(),
                        role: role.clone(),
                    }]
                }
            }
            SchemaStatement::SetSupertype {
                name,
                supertype,
                previous,
            } => vec![SchemaStatement::SetSupertype {
                name: name.clone(),
                supertype: previous.clone(),
                previous: supertype.clone(),
            }],
            SchemaStatement::SetValueKind {
                attribute,
                value_kind,
                previous,
            } => vec![SchemaStatement::SetValueKind {
                attribute: attribute.clone(),
                value_kind: *previous,
                previous: *value_kind,
            }],
            SchemaStatement::RemoveOwns { owner, attribute } => vec![SchemaStatement::AddOwns {
                owner: owner.clone(),
                attribute: attribute.clone(),
            }],
            SchemaStatement::RemovePlays { player, role } => vec![SchemaStatement::AddPlays {
                player: player.clone(),
                role: role.clone(),
            }],
            SchemaStatement::RemoveRelates { relation, role } => {
                vec![SchemaStatement::AddRelates {
                    relation: relation.clone(),
                    role: role.clone(),
                }]
            }
            SchemaStatement::UndefineType { definition } => {
                vec![SchemaStatement::define(definition.clone())]
            }
        }
    }
}

impl fmt::Display for SchemaStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_typeql())
    }
}
