//! Type definitions.

use super::types::{RoleRef, TypeKind, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

static NO_NAMES: BTreeSet<String> = BTreeSet::new();
static NO_ROLES: BTreeSet<RoleRef> = BTreeSet::new();

/// An attribute type definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeTypeDef {
    /// Attribute type name (unique across all kinds).
    pub name: String,
    /// Optional attribute supertype.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supertype: Option<String>,
    /// Value kind of the attribute.
    pub value_kind: ValueKind,
}

impl AttributeTypeDef {
    /// Create a new attribute type definition.
    pub fn new(name: impl Into<String>, value_kind: ValueKind) -> Self {
        Self {
            name: name.into(),
            supertype: None,
            value_kind,
        }
    }

    /// Set the supertype.
    pub fn with_supertype(mut self, supertype: impl Into<String>) -> Self {
        self.supertype = Some(supertype.into());
        self
    }
}

/// An entity type definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTypeDef {
    /// Entity type name.
    pub name: String,
    /// Optional entity supertype.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supertype: Option<String>,
    /// Attribute types owned directly by this type.
    #[serde(default)]
    pub owns: BTreeSet<String>,
    /// Roles played directly by this type.
    #[serde(default)]
    pub plays: BTreeSet<RoleRef>,
}

impl EntityTypeDef {
    /// Create a new entity type definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            supertype: None,
            owns: BTreeSet::new(),
            plays: BTreeSet::new(),
        }
    }

    /// Set the supertype.
    pub fn with_supertype(mut self, supertype: impl Into<String>) -> Self {
        self.supertype = Some(supertype.into());
        self
    }

    /// Own an attribute type.
    pub fn with_owns(mut self, attribute: impl Into<String>) -> Self {
        self.owns.insert(attribute.into());
        self
    }

    /// Play a role.
    pub fn with_plays(mut self, role: RoleRef) -> Self {
        self.plays.insert(role);
        self
    }
}

/// A relation type definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationTypeDef {
    /// Relation type name.
    pub name: String,
    /// Optional relation supertype.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supertype: Option<String>,
    /// Roles declared directly by this relation.
    #[serde(default)]
    pub relates: BTreeSet<String>,
    /// Attribute types owned directly by this relation.
    #[serde(default)]
    pub owns: BTreeSet<String>,
    /// Roles played directly by this relation.
    #[serde(default)]
    pub plays: BTreeSet<RoleRef>,
}

impl RelationTypeDef {
    /// Create a new relation type definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            supertype: None,
            relates: BTreeSet::new(),
            owns: BTreeSet::new(),
            plays: BTreeSet::new(),
        }
    }

    /// Set the supertype.
    pub fn with_supertype(mut self, supertype: impl Into<String>) -> Self {
        self.supertype = Some(supertype.into());
        self
    }

    /// Declare a role.
    pub fn with_relates(mut self, role: impl Into<String>) -> Self {
        self.relates.insert(role.into());
        self
    }

    /// Own an attribute type.
    pub fn with_owns(mut self, attribute: impl Into<String>) -> Self {
        self.owns.insert(attribute.into());
        self
    }
}

/// A schema type of any kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TypeDef {
    /// Attribute type.
    Attribute(AttributeTypeDef),
    /// Entity type.
    Entity(EntityTypeDef),
    /// Relation type.
    Relation(RelationTypeDef),
}

impl TypeDef {
    /// Type name.
    pub fn name(&self) -> &str {
        match self {
            TypeDef::Attribute(a) => &a.name,
            TypeDef::Entity(e) => &e.name,
            TypeDef::Relation(r) => &r.name,
        }
    }

    /// Kind of this type.
    pub fn kind(&self) -> TypeKind {
        match self {
            TypeDef::Attribute(_) => TypeKind::Attribute,
            TypeDef::Entity(_) => TypeKind::Entity,
            TypeDef::Relation(_) => TypeKind::Relation,
        }
    }

    /// Declared supertype.
    pub fn supertype(&self) -> Option<&str> {
        match self {
            TypeDef::Attribute(a) => a.supertype.as_deref(),
            TypeDef::Entity(e) => e.supertype.as_deref(),
            TypeDef::Relation(r) => r.supertype.as_deref(),
        }
    }

    /// Replace the declared supertype.
    pub fn set_supertype(&mut self, supertype: Option<String>) {
        match self {
            TypeDef::Attribute(a) => a.supertype = supertype,
            TypeDef::Entity(e) => e.supertype = supertype,
            TypeDef::Relation(r) => r.supertype = supertype,
        }
    }

    /// Directly owned attribute types.
    pub fn owns(&self) -> &BTreeSet<String> {
        match self {
            TypeDef::Attribute(_) => &NO_NAMES,
            TypeDef::Entity(e) => &e.owns,
            TypeDef::Relation(r) => &r.owns,
        }
    }

    /// Directly played roles.
    pub fn plays(&self) -> &BTreeSet<RoleRef> {
        match self {
            TypeDef::Attribute(_) => &NO_ROLES,
            TypeDef::Entity(e) => &e.plays,
            TypeDef::Relation(r) => &r.plays,
        }
    }

    /// Directly declared roles (relations only).
    pub fn relates(&self) -> &BTreeSet<String> {
        match self {
            TypeDef::Relation(r) => &r.relates,
            _ => &NO_NAMES,
        }
    }

    /// Mutable owned set. `None` for attribute types.
    pub fn owns_mut(&mut self) -> Option<&mut BTreeSet<String>> {
        match self {
            TypeDef::Attribute(_) => None,
            TypeDef::Entity(e) => Some(&mut e.owns),
            TypeDef::Relation(r) => Some(&mut r.owns),
        }
    }

    /// Mutable played set. `None` for attribute types.
    pub fn plays_mut(&mut self) -> Option<&mut BTreeSet<RoleRef>> {
        match self {
            TypeDef::Attribute(_) => None,
            TypeDef::Entity(e) => Some(&mut e.plays),
            TypeDef::Relation(r) => Some(&mut r.plays),
        }
    }

    /// Value kind (attributes only).
    pub fn value_kind(&self) -> Option<ValueKind> {
        match self {
            TypeDef::Attribute(a) => Some(a.value_kind),
            _ => None,
        }
    }

    /// Copy of this definition under a different name.
    pub fn renamed(&self, name: impl Into<String>) -> TypeDef {
        let mut def = self.clone();
        let name = name.into();
        match &mut def {
            TypeDef::Attribute(a) => a.name = name,
            TypeDef::Entity(e) => e.name = name,
            TypeDef::Relation(r) => r.name = name,
        }
        def
    }

    /// Merge the owns, plays and relates of `other` into this definition.
    pub fn absorb(&mut self, other: &TypeDef) {
        if let Some(owns) = self.owns_mut() {
            owns.extend(other.owns().iter().cloned());
        }
        if let Some(plays) = self.plays_mut() {
            plays.extend(other.plays().iter().cloned());
        }
        if let TypeDef::Relation(r) = self {
            r.relates.extend(other.relates().iter().cloned());
        }
    }
}

impl From<AttributeTypeDef> for TypeDef {
    fn from(def: AttributeTypeDef) -> Self {
        TypeDef::Attribute(def)
    }
}

impl From<EntityTypeDef> for TypeDef {
    fn from(def: EntityTypeDef) -> Self {
        TypeDef::Entity(def)
    }
}

impl From<RelationTypeDef> for TypeDef {
    fn from(def: RelationTypeDef) -> Self {
        TypeDef::Relation(def)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_builder() {
        let chair = EntityTypeDef::new("chair")
            .with_supertype("furniture")
            .with_owns("color")
            .with_plays(RoleRef::new("on", "subject"));
        let def = TypeDef::from(chair);

        assert_eq!(def.name(), "chair");
        assert_eq!(def.kind(), TypeKind::Entity);
        assert_eq!(def.supertype(), Some("furniture"));
        assert!(def.owns().contains("color"));
        assert!(def.plays().contains(&RoleRef::new("on", "subject")));
        assert!(def.relates().is_empty());
    }

    #[test]
    fn test_attribute_has_no_owns() {
        let mut def = TypeDef::from(AttributeTypeDef::new("size", ValueKind::String));
        assert!(def.owns().is_empty());
        assert!(def.owns_mut().is_none());
        assert_eq!(def.value_kind(), Some(ValueKind::String));
    }

    #[test]
    fn test_serde_tagging() {
        let def = TypeDef::from(RelationTypeDef::new("on").with_relates("subject"));
        let json = serde_json::to_value(&def).unwrap();
        assert_eq!(json["kind"], "relation");
        let back: TypeDef = serde_json::from_value(json).unwrap();
        assert_eq!(back, def);
    }

    #[test]
    fn test_absorb_and_rename() {
        let mut a = TypeDef::from(EntityTypeDef::new("gadget").with_owns("color"));
        let b = TypeDef::from(EntityTypeDef::new("device").with_owns("size"));
        a.absorb(&b);
        let renamed = a.renamed("device");
        assert_eq!(renamed.name(), "device");
        assert_eq!(renamed.owns().len(), 2);
    }
}
