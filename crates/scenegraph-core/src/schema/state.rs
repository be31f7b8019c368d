//! In-memory schema model.
//!
//! A flat registry of type definitions keyed by name (names are unique across
//! all kinds) plus a lazily built index of derived facts: direct subtypes and
//! the effective owns/plays/relates closures over the supertype hierarchy.
//! The index is discarded on every mutation.

use super::definition::TypeDef;
use super::error::SchemaError;
use super::statement::SchemaStatement;
use super::typeql;
use super::types::{RoleRef, TypeKind};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

#[derive(Debug, Default)]
struct DerivedIndex {
    subtypes: BTreeMap<String, BTreeSet<String>>,
    owns: BTreeMap<String, BTreeSet<String>>,
    plays: BTreeMap<String, BTreeSet<RoleRef>>,
    relates: BTreeMap<String, BTreeSet<String>>,
}

/// Snapshot of a schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaState {
    types: BTreeMap<String, TypeDef>,
    index: OnceLock<Arc<DerivedIndex>>,
}

impl PartialEq for SchemaState {
    fn eq(&self, other: &Self) -> bool {
        self.types == other.types
    }
}

impl SchemaState {
    /// Create an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a schema from definitions, validating every structural invariant.
    pub fn from_definitions(
        definitions: impl IntoIterator<Item = TypeDef>,
    ) -> Result<Self, SchemaError> {
        let mut types = BTreeMap::new();
        for def in definitions {
            let name = def.name().to_string();
            if types.insert(name.clone(), def).is_some() {
                return Err(SchemaError::DuplicateType { name });
            }
        }
        let state = Self {
            types,
            index: OnceLock::new(),
        };
        state.validate()?;
        Ok(state)
    }

    /// Number of types.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Whether the schema has no types.
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Whether a type with this name exists.
    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Look up a definition.
    pub fn get(&self, name: &str) -> Option<&TypeDef> {
        self.types.get(name)
    }

    /// Look up a definition, failing if it does not exist.
    pub fn definition_of(&self, name: &str) -> Result<&TypeDef, SchemaError> {
        self.types.get(name).ok_or_else(|| SchemaError::TypeNotFound {
            name: name.to_string(),
        })
    }

    /// Kind of a type, if it exists.
    pub fn kind_of(&self, name: &str) -> Option<TypeKind> {
        self.types.get(name).map(TypeDef::kind)
    }

    /// All definitions in name order.
    pub fn definitions(&self) -> impl Iterator<Item = &TypeDef> {
        self.types.values()
    }

    /// Names of all types of one kind, in name order.
    pub fn names_of_kind(&self, kind: TypeKind) -> Vec<String> {
        self.types
            .values()
            .filter(|def| def.kind() == kind)
            .map(|def| def.name().to_string())
            .collect()
    }

    /// Subtypes of a type. With `transitive`, all descendants in preorder.
    pub fn subtypes_of(&self, name: &str, transitive: bool) -> Result<Vec<String>, SchemaError> {
        self.definition_of(name)?;
        let index = self.index();
        let direct = |n: &str| -> Vec<String> {
            index
                .subtypes
                .get(n)
                .map(|set| set.iter().cloned().collect())
                .unwrap_or_default()
        };
        if !transitive {
            return Ok(direct(name));
        }
        let mut out = Vec::new();
        let mut stack: Vec<String> = direct(name).into_iter().rev().collect();
        let mut seen = BTreeSet::new();
        while let Some(next) = stack.pop() {
            if !seen.insert(next.clone()) {
                continue;
            }
            stack.extend(direct(&next).into_iter().rev());
            out.push(next);
        }
        Ok(out)
    }

    /// Ancestors of a type, nearest first.
    pub fn supertypes_of(&self, name: &str) -> Result<Vec<String>, SchemaError> {
        self.definition_of(name)?;
        Ok(self.ancestors(name))
    }

    /// Whether `name` is `ancestor` or one of its descendants.
    pub fn is_subtype_of(&self, name: &str, ancestor: &str) -> bool {
        name == ancestor || self.ancestors(name).iter().any(|a| a == ancestor)
    }

    /// Attribute types owned by a type, including inherited ownership.
    pub fn effective_attributes_of(&self, name: &str) -> Result<BTreeSet<String>, SchemaError> {
        self.definition_of(name)?;
        Ok(self.index().owns.get(name).cloned().unwrap_or_default())
    }

    /// Roles played by a type, including inherited ones.
    pub fn effective_roles_of(&self, name: &str) -> Result<BTreeSet<RoleRef>, SchemaError> {
        self.definition_of(name)?;
        Ok(self.index().plays.get(name).cloned().unwrap_or_default())
    }

    /// Roles declared by a relation, including inherited ones.
    pub fn effective_relates_of(&self, name: &str) -> Result<BTreeSet<String>, SchemaError> {
        let def = self.definition_of(name)?;
        if def.kind() != TypeKind::Relation {
            return Err(SchemaError::WrongKind {
                name: name.to_string(),
                expected: TypeKind::Relation,
                found: def.kind(),
            });
        }
        Ok(self.index().relates.get(name).cloned().unwrap_or_default())
    }

    /// Whether the referenced relation declares or inherits the role.
    pub fn declares_role(&self, role: &RoleRef) -> bool {
        self.index()
            .relates
            .get(&role.relation)
            .is_some_and(|roles| roles.contains(&role.role))
    }

    /// Whether `player` may fill `role` of an instance of relation type `relation`.
    ///
    /// A player qualifies when it plays the role scoped to the relation or to
    /// any of its ancestors.
    pub fn can_play(&self, player: &str, relation: &str, role: &str) -> bool {
        let index = self.index();
        let Some(played) = index.plays.get(player) else {
            return false;
        };
        std::iter::once(relation.to_string())
            .chain(self.ancestors(relation))
            .any(|rel| played.contains(&RoleRef::new(rel, role)))
    }

    /// Whether the owner declares ownership of the attribute directly.
    pub fn directly_owns(&self, owner: &str, attribute: &str) -> bool {
        self.types
            .get(owner)
            .is_some_and(|def| def.owns().contains(attribute))
    }

    /// Whether the player declares the role directly.
    pub fn directly_plays(&self, player: &str, role: &RoleRef) -> bool {
        self.types
            .get(player)
            .is_some_and(|def| def.plays().contains(role))
    }

    /// Types declaring direct ownership of an attribute.
    pub fn owners_of(&self, attribute: &str) -> Vec<String> {
        self.types
            .values()
            .filter(|def| def.owns().contains(attribute))
            .map(|def| def.name().to_string())
            .collect()
    }

    /// Direct plays declarations that reference roles of `relation`.
    pub fn players_of(&self, relation: &str) -> Vec<(String, RoleRef)> {
        self.types
            .values()
            .flat_map(|def| {
                def.plays()
                    .iter()
                    .filter(|role| role.relation == relation)
                    .map(|role| (def.name().to_string(), role.clone()))
            })
            .collect()
    }

    /// Schema elements that would dangle if `name` were undefined.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let mut dependents = Vec::new();
        if let Some(children) = self.index().subtypes.get(name) {
            dependents.extend(children.iter().map(|c| format!("{c} sub {name}")));
        }
        if self.kind_of(name) == Some(TypeKind::Attribute) {
            dependents.extend(
                self.owners_of(name)
                    .into_iter()
                    .map(|owner| format!("{owner} owns {name}")),
            );
        }
        if self.kind_of(name) == Some(TypeKind::Relation) {
            dependents.extend(
                self.players_of(name)
                    .into_iter()
                    .map(|(player, role)| format!("{player} plays {role}")),
            );
        }
        dependents
    }

    /// Definitions in dependency-friendly order: attributes, entities then
    /// relations, each kind walked from its roots in preorder.
    pub fn ordered_definitions(&self) -> Vec<&TypeDef> {
        let mut out = Vec::with_capacity(self.types.len());
        for kind in [TypeKind::Attribute, TypeKind::Entity, TypeKind::Relation] {
            for root in self.types.values().filter(|def| {
                def.kind() == kind && def.supertype().map_or(true, |s| !self.contains(s))
            }) {
                out.push(root);
                if let Ok(descendants) = self.subtypes_of(root.name(), true) {
                    out.extend(descendants.iter().filter_map(|d| self.types.get(d)));
                }
            }
        }
        out
    }

    /// Render the whole schema as a TypeQL define block.
    pub fn render(&self) -> String {
        typeql::render_schema(self)
    }

    /// Validate every structural invariant.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for def in self.types.values() {
            if let Some(supertype) = def.supertype() {
                let parent = self
                    .types
                    .get(supertype)
                    .ok_or_else(|| SchemaError::MissingSupertype {
                        name: def.name().to_string(),
                        supertype: supertype.to_string(),
                    })?;
                if parent.kind() != def.kind() {
                    return Err(SchemaError::SupertypeKindMismatch {
                        name: def.name().to_string(),
                        kind: def.kind(),
                        supertype: supertype.to_string(),
                        supertype_kind: parent.kind(),
                    });
                }
            }
            self.check_acyclic(def.name())?;
        }
        for def in self.types.values() {
            for attribute in def.owns() {
                if self.kind_of(attribute) != Some(TypeKind::Attribute) {
                    return Err(SchemaError::UnknownAttribute {
                        owner: def.name().to_string(),
                        attribute: attribute.clone(),
                    });
                }
            }
            for role in def.plays() {
                if !self.declares_role(role) {
                    return Err(SchemaError::UnknownRole {
                        player: def.name().to_string(),
                        role: role.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Apply one statement, rejecting it (and leaving the schema untouched)
    /// if the result would be invalid.
    pub fn apply_statement(&mut self, statement: &SchemaStatement) -> Result<(), SchemaError> {
        let mut types = self.types.clone();
        match statement {
            SchemaStatement::DefineType {
                definition,
                owned_by,
                played_by,
            } => {
                let name = definition.name().to_string();
                match types.get_mut(&name) {
                    Some(existing) => {
                        if existing.kind() != definition.kind() {
                            return Err(SchemaError::KindConflict {
                                name,
                                existing: existing.kind(),
                                requested: definition.kind(),
                            });
                        }
                        if existing.supertype() != definition.supertype() {
                            return Err(SchemaError::SupertypeConflict {
                                name,
                                existing: existing.supertype().map(str::to_string),
                                requested: definition.supertype().map(str::to_string),
                            });
                        }
                        if let (Some(current), Some(requested)) =
                            (existing.value_kind(), definition.value_kind())
                        {
                            if current != requested {
                                return Err(SchemaError::ValueKindConflict {
                                    name,
                                    existing: current,
                                    requested,
                                });
                            }
                        }
                        existing.absorb(definition);
                    }
                    None => {
                        types.insert(name.clone(), definition.clone());
                    }
                }
                for owner in owned_by {
                    if let Some(owns) = thing_mut(&mut types, owner)?.owns_mut() {
                        owns.insert(name.clone());
                    }
                }
                for (player, role) in played_by {
                    if let Some(plays) = thing_mut(&mut types, player)?.plays_mut() {
                        plays.insert(RoleRef::new(name.clone(), role.clone()));
                    }
                }
            }
            SchemaStatement::AddOwns { owner, attribute } => {
                if let Some(owns) = thing_mut(&mut types, owner)?.owns_mut() {
                    owns.insert(attribute.clone());
                }
            }
            SchemaStatement::AddPlays { player, role } => {
                if let Some(plays) = thing_mut(&mut types, player)?.plays_mut() {
                    plays.insert(role.clone());
                }
            }
            SchemaStatement::AddRelates { relation, role } => {
                match kind_mut(&mut types, relation, TypeKind::Relation)? {
                    TypeDef::Relation(r) => {
                        r.relates.insert(role.clone());
                    }
                    _ => unreachable_kind(relation)?,
                }
            }
            SchemaStatement::SetSupertype {
                name, supertype, ..
            } => {
                get_mut(&mut types, name)?.set_supertype(supertype.clone());
            }
            SchemaStatement::SetValueKind {
                attribute,
                value_kind,
                ..
            } => match kind_mut(&mut types, attribute, TypeKind::Attribute)? {
                TypeDef::Attribute(a) => a.value_kind = *value_kind,
                _ => unreachable_kind(attribute)?,
            },
            SchemaStatement::RemoveOwns { owner, attribute } => {
                let removed = get_mut(&mut types, owner)?
                    .owns_mut()
                    .is_some_and(|owns| owns.remove(attribute));
                if !removed {
                    return Err(SchemaError::NotOwned {
                        owner: owner.clone(),
                        attribute: attribute.clone(),
                    });
                }
            }
            SchemaStatement::RemovePlays { player, role } => {
                let removed = get_mut(&mut types, player)?
                    .plays_mut()
                    .is_some_and(|plays| plays.remove(role));
                if !removed {
                    return Err(SchemaError::NotPlayed {
                        player: player.clone(),
                        role: role.to_string(),
                    });
                }
            }
            SchemaStatement::RemoveRelates { relation, role } => {
                let removed = match get_mut(&mut types, relation)? {
                    TypeDef::Relation(r) => r.relates.remove(role),
                    _ => false,
                };
                if !removed {
                    return Err(SchemaError::NotRelated {
                        relation: relation.clone(),
                        role: role.clone(),
                    });
                }
            }
            SchemaStatement::UndefineType { definition } => {
                let name = definition.name();
                self.definition_of(name)?;
                let dependents = self.dependents_of(name);
                if !dependents.is_empty() {
                    return Err(SchemaError::HasDependents {
                        name: name.to_string(),
                        dependents,
                    });
                }
                types.remove(name);
            }
        }

        let next = Self {
            types,
            index: OnceLock::new(),
        };
        next.validate()?;
        *self = next;
        Ok(())
    }

    fn ancestors(&self, name: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut seen = BTreeSet::from([name.to_string()]);
        let mut current = self.types.get(name).and_then(TypeDef::supertype);
        while let Some(parent) = current {
            if !seen.insert(parent.to_string()) {
                break;
            }
            out.push(parent.to_string());
            current = self.types.get(parent).and_then(TypeDef::supertype);
        }
        out
    }

    fn check_acyclic(&self, name: &str) -> Result<(), SchemaError> {
        let mut seen = BTreeSet::from([name]);
        let mut current = self.types.get(name).and_then(TypeDef::supertype);
        while let Some(parent) = current {
            if !seen.insert(parent) {
                return Err(SchemaError::SupertypeCycle {
                    name: name.to_string(),
                });
            }
            current = self.types.get(parent).and_then(TypeDef::supertype);
        }
        Ok(())
    }

    fn index(&self) -> Arc<DerivedIndex> {
        Arc::clone(self.index.get_or_init(|| Arc::new(self.build_index())))
    }

    fn build_index(&self) -> DerivedIndex {
        let mut index = DerivedIndex::default();
        for def in self.types.values() {
            if let Some(parent) = def.supertype() {
                index
                    .subtypes
                    .entry(parent.to_string())
                    .or_default()
                    .insert(def.name().to_string());
            }
        }
        for def in self.types.values() {
            let name = def.name();
            let chain: Vec<&TypeDef> = std::iter::once(name.to_string())
                .chain(self.ancestors(name))
                .filter_map(|n| self.types.get(&n))
                .collect();
            let owns = chain.iter().flat_map(|d| d.owns().iter().cloned()).collect();
            let plays = chain.iter().flat_map(|d| d.plays().iter().cloned()).collect();
            index.owns.insert(name.to_string(), owns);
            index.plays.insert(name.to_string(), plays);
            if def.kind() == TypeKind::Relation {
                let relates = chain
                    .iter()
                    .flat_map(|d| d.relates().iter().cloned())
                    .collect();
                index.relates.insert(name.to_string(), relates);
            }
        }
        index
    }
}

fn get_mut<'a>(
    types: &'a mut BTreeMap<String, TypeDef>,
    name: &str,
) -> Result<&'a mut TypeDef, SchemaError> {
    types.get_mut(name).ok_or_else(|| SchemaError::TypeNotFound {
        name: name.to_string(),
    })
}

fn kind_mut<'a>(
    types: &'a mut BTreeMap<String, TypeDef>,
    name: &str,
    expected: TypeKind,
) -> Result<&'a mut TypeDef, SchemaError> {
    let def = get_mut(types, name)?;
    if def.kind() != expected {
        return Err(SchemaError::WrongKind {
            name: name.to_string(),
            expected,
            found: def.kind(),
        });
    }
    Ok(def)
}

fn thing_mut<'a>(
    types: &'a mut BTreeMap<String, TypeDef>,
    name: &str,
) -> Result<&'a mut TypeDef, SchemaError> {
    let def = get_mut(types, name)?;
    if !def.kind().is_thing() {
        return Err(SchemaError::WrongKind {
            name: name.to_string(),
            expected: TypeKind::Entity,
            found: def.kind(),
        });
    }
    Ok(def)
}

fn unreachable_kind(name: &str) -> Result<(), SchemaError> {
    Err(SchemaError::TypeNotFound {
        name: name.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeTypeDef, EntityTypeDef, RelationTypeDef, ValueKind};

    fn scene() -> SchemaState {
        SchemaState::from_definitions(vec![
            AttributeTypeDef::new("name", ValueKind::String).into(),
            AttributeTypeDef::new("color", ValueKind::String).into(),
            EntityTypeDef::new("physical_object")
                .with_owns("name")
                .with_plays(RoleRef::new("spatial_relation", "subject"))
                .into(),
            EntityTypeDef::new("furniture")
                .with_supertype("physical_object")
                .with_owns("color")
                .into(),
            EntityTypeDef::new("chair").with_supertype("furniture").into(),
            RelationTypeDef::new("spatial_relation")
                .with_relates("subject")
                .with_relates("reference")
                .into(),
            RelationTypeDef::new("on").with_supertype("spatial_relation").into(),
        ])
        .unwrap()
    }

    #[test]
    fn test_effective_closures() {
        let schema = scene();
        let owns = schema.effective_attributes_of("chair").unwrap();
        assert_eq!(owns, BTreeSet::from(["name".to_string(), "color".to_string()]));
        assert!(schema
            .effective_roles_of("chair")
            .unwrap()
            .contains(&RoleRef::new("spatial_relation", "subject")));
        assert_eq!(
            schema.effective_relates_of("on").unwrap(),
            BTreeSet::from(["reference".to_string(), "subject".to_string()])
        );
        assert!(schema.can_play("chair", "on", "subject"));
        assert!(!schema.can_play("chair", "on", "reference"));
    }

    #[test]
    fn test_subtypes_transitive_preorder() {
        let schema = scene();
        assert_eq!(
            schema.subtypes_of("physical_object", false).unwrap(),
            vec!["furniture"]
        );
        assert_eq!(
            schema.subtypes_of("physical_object", true).unwrap(),
            vec!["furniture", "chair"]
        );
        assert!(matches!(
            schema.subtypes_of("lamp", false),
            Err(SchemaError::TypeNotFound { .. })
        ));
    }

    #[test]
    fn test_rejects_cycles_and_kind_mismatch() {
        let cyclic = SchemaState::from_definitions(vec![
            EntityTypeDef::new("a").with_supertype("b").into(),
            EntityTypeDef::new("b").with_supertype("a").into(),
        ]);
        assert!(matches!(cyclic, Err(SchemaError::SupertypeCycle { .. })));

        let mixed = SchemaState::from_definitions(vec![
            AttributeTypeDef::new("color", ValueKind::String).into(),
            EntityTypeDef::new("chair").with_supertype("color").into(),
        ]);
        assert!(matches!(mixed, Err(SchemaError::SupertypeKindMismatch { .. })));
    }

    #[test]
    fn test_apply_statement_is_atomic() {
        let mut schema = scene();
        let before = schema.clone();
        let err = schema
            .apply_statement(&SchemaStatement::AddOwns {
                owner: "chair".into(),
                attribute: "weight".into(),
            })
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownAttribute { .. }));
        assert_eq!(schema, before);
    }

    #[test]
    fn test_undefine_requires_no_dependents() {
        let mut schema = scene();
        let furniture = schema.get("furniture").unwrap().clone();
        let err = schema
            .apply_statement(&SchemaStatement::UndefineType {
                definition: furniture,
            })
            .unwrap_err();
        assert!(matches!(err, SchemaError::HasDependents { .. }));

        let chair = schema.get("chair").unwrap().clone();
        schema
            .apply_statement(&SchemaStatement::UndefineType { definition: chair })
            .unwrap();
        assert!(!schema.contains("chair"));
        assert!(schema.subtypes_of("furniture", false).unwrap().is_empty());
    }

    #[test]
    fn test_set_supertype_rejects_cycle() {
        let mut schema = scene();
        let err = schema
            .apply_statement(&SchemaStatement::SetSupertype {
                name: "physical_object".into(),
                supertype: Some("chair".into()),
                previous: None,
            })
            .unwrap_err();
        assert!(matches!(err, SchemaError::SupertypeCycle { .. }));
    }

    #[test]
    fn test_define_extends_existing_type() {
        let mut schema = scene();
        schema
            .apply_statement(&SchemaStatement::define(
                EntityTypeDef::new("chair")
                    .with_supertype("furniture")
                    .with_owns("color"),
            ))
            .unwrap();
        assert!(schema.directly_owns("chair", "color"));

        let err = schema
            .apply_statement(&SchemaStatement::define(
                RelationTypeDef::new("chair").with_relates("x"),
            ))
            .unwrap_err();
        assert!(matches!(err, SchemaError::KindConflict { .. }));
    }

    #[test]
    fn test_ordered_definitions_put_supertypes_first() {
        let schema = scene();
        let order: Vec<&str> = schema.ordered_definitions().iter().map(|d| d.name()).collect();
        let pos = |n: &str| order.iter().position(|x| *x == n).unwrap();
        assert!(pos("physical_object") < pos("furniture"));
        assert!(pos("furniture") < pos("chair"));
        assert!(pos("color") < pos("chair"));
        assert!(pos("spatial_relation") < pos("on"));
    }
}
