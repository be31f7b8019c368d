//! Change proposals.
//!
//! [`ChangeProposal`] is the strict shape the engine plans from. Loosely
//! structured analysis output is converted into it at the boundary by
//! [`RawAnalysis`](raw::RawAnalysis) and never travels further.

mod base;
pub mod raw;

pub use base::{base_schema_proposal, BASE_ATTRIBUTES, PHYSICAL_OBJECT, SPATIAL_RELATION};
pub use raw::{Analysis, BoundaryOptions, RawAnalysis};

use crate::migration::MigrationError;
use crate::schema::typeql::is_valid_identifier;
use crate::schema::{AttributeTypeDef, EntityTypeDef, RelationTypeDef, RoleRef, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A new relation type together with the types that should play its roles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewRelationType {
    /// The relation definition.
    pub definition: RelationTypeDef,
    /// Players per role name.
    #[serde(default)]
    pub role_players: BTreeMap<String, BTreeSet<String>>,
}

impl NewRelationType {
    /// Wrap a definition with no role players.
    pub fn new(definition: RelationTypeDef) -> Self {
        Self {
            definition,
            role_players: BTreeMap::new(),
        }
    }

    /// Add a player for one of the relation's roles.
    pub fn with_player(mut self, role: impl Into<String>, player: impl Into<String>) -> Self {
        self.role_players
            .entry(role.into())
            .or_default()
            .insert(player.into());
        self
    }
}

/// How an existing type should be retyped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Retype {
    /// Change an attribute type's value kind, converting existing values.
    ValueKind(ValueKind),
    /// Move an entity or relation type (and its instances) to a new type.
    Reclassify {
        /// Name of the new type.
        into: String,
        /// Supertype of the new type. Defaults to the old type's supertype.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        supertype: Option<String>,
    },
}

/// Requested changes to an existing type.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TypeModification {
    /// Type to modify.
    pub name: String,
    /// Attribute types to own.
    #[serde(default)]
    pub add_owns: BTreeSet<String>,
    /// Roles to play.
    #[serde(default)]
    pub add_plays: BTreeSet<RoleRef>,
    /// Retype instruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retype: Option<Retype>,
}

impl TypeModification {
    /// Create an empty modification of `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Own an additional attribute type.
    pub fn with_owns(mut self, attribute: impl Into<String>) -> Self {
        self.add_owns.insert(attribute.into());
        self
    }

    /// Play an additional role.
    pub fn with_plays(mut self, role: RoleRef) -> Self {
        self.add_plays.insert(role);
        self
    }

    /// Set the retype instruction.
    pub fn with_retype(mut self, retype: Retype) -> Self {
        self.retype = Some(retype);
        self
    }
}

/// One batch of requested schema changes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChangeProposal {
    /// New attribute types.
    #[serde(default)]
    pub new_attribute_types: Vec<AttributeTypeDef>,
    /// New entity types.
    #[serde(default)]
    pub new_entity_types: Vec<EntityTypeDef>,
    /// New relation types.
    #[serde(default)]
    pub new_relation_types: Vec<NewRelationType>,
    /// Modifications to existing types.
    #[serde(default)]
    pub modified_types: Vec<TypeModification>,
    /// Types to remove.
    #[serde(default)]
    pub removed_types: BTreeSet<String>,
}

impl ChangeProposal {
    /// Create an empty proposal.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new attribute type.
    pub fn with_attribute(mut self, def: AttributeTypeDef) -> Self {
        self.new_attribute_types.push(def);
        self
    }

    /// Add a new entity type.
    pub fn with_entity(mut self, def: EntityTypeDef) -> Self {
        self.new_entity_types.push(def);
        self
    }

    /// Add a new relation type with no role players.
    pub fn with_relation(self, def: RelationTypeDef) -> Self {
        self.with_relation_players(NewRelationType::new(def))
    }

    /// Add a new relation type with role players.
    pub fn with_relation_players(mut self, relation: NewRelationType) -> Self {
        self.new_relation_types.push(relation);
        self
    }

    /// Add a modification.
    pub fn with_modification(mut self, modification: TypeModification) -> Self {
        self.modified_types.push(modification);
        self
    }

    /// Remove a type.
    pub fn with_removal(mut self, name: impl Into<String>) -> Self {
        self.removed_types.insert(name.into());
        self
    }

    /// Whether the proposal requests nothing.
    pub fn is_empty(&self) -> bool {
        self.new_attribute_types.is_empty()
            && self.new_entity_types.is_empty()
            && self.new_relation_types.is_empty()
            && self.modified_types.is_empty()
            && self.removed_types.is_empty()
    }

    /// Names of every type this proposal defines, in list order.
    pub fn defined_names(&self) -> impl Iterator<Item = &str> {
        self.new_attribute_types
            .iter()
            .map(|a| a.name.as_str())
            .chain(self.new_entity_types.iter().map(|e| e.name.as_str()))
            .chain(
                self.new_relation_types
                    .iter()
                    .map(|r| r.definition.name.as_str()),
            )
    }

    /// Check the proposal's shape: legal identifiers, no name defined twice,
    /// no type modified twice.
    pub fn validate(&self) -> Result<(), MigrationError> {
        let mut seen = BTreeSet::new();
        for name in self.defined_names() {
            check_identifier(name)?;
            if !seen.insert(name) {
                return Err(MigrationError::validation(format!(
                    "type {name} is defined more than once"
                )));
            }
        }

        for attribute in &self.new_attribute_types {
            check_optional(attribute.supertype.as_deref())?;
        }
        for entity in &self.new_entity_types {
            check_optional(entity.supertype.as_deref())?;
            check_all(entity.owns.iter().map(String::as_str))?;
            check_roles(&entity.plays)?;
        }
        for relation in &self.new_relation_types {
            let def = &relation.definition;
            check_optional(def.supertype.as_deref())?;
            check_all(def.relates.iter().map(String::as_str))?;
            check_all(def.owns.iter().map(String::as_str))?;
            check_roles(&def.plays)?;
            for (role, players) in &relation.role_players {
                check_identifier(role)?;
                check_all(players.iter().map(String::as_str))?;
            }
        }

        let mut modified = BTreeSet::new();
        for modification in &self.modified_types {
            check_identifier(&modification.name)?;
            if !modified.insert(modification.name.as_str()) {
                return Err(MigrationError::validation(format!(
                    "type {} is modified more than once",
                    modification.name
                )));
            }
            check_all(modification.add_owns.iter().map(String::as_str))?;
            check_roles(&modification.add_plays)?;
            if let Some(Retype::Reclassify { into, supertype }) = &modification.retype {
                check_identifier(into)?;
                check_optional(supertype.as_deref())?;
                if *into == modification.name {
                    return Err(MigrationError::validation(format!(
                        "type {into} cannot be reclassified into itself"
                    )));
                }
            }
        }

        check_all(self.removed_types.iter().map(String::as_str))
    }

    /// Order-insensitive JSON encoding used for fingerprinting.
    pub fn canonical_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut canonical = self.clone();
        canonical
            .new_attribute_types
            .sort_by(|a, b| a.name.cmp(&b.name));
        canonical.new_entity_types.sort_by(|a, b| a.name.cmp(&b.name));
        canonical
            .new_relation_types
            .sort_by(|a, b| a.definition.name.cmp(&b.definition.name));
        canonical.modified_types.sort_by(|a, b| a.name.cmp(&b.name));
        serde_json::to_vec(&canonical)
    }
}

fn check_identifier(name: &str) -> Result<(), MigrationError> {
    if is_valid_identifier(name) {
        Ok(())
    } else {
        Err(MigrationError::validation(format!(
            "invalid type or role name: {name:?}"
        )))
    }
}

fn check_optional(name: Option<&str>) -> Result<(), MigrationError> {
    name.map_or(Ok(()), check_identifier)
}

fn check_all<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<(), MigrationError> {
    names.into_iter().try_for_each(check_identifier)
}

fn check_roles(roles: &BTreeSet<RoleRef>) -> Result<(), MigrationError> {
    roles.iter().try_for_each(|role| {
        check_identifier(&role.relation)?;
        check_identifier(&role.role)
    })
}
