//! Dependency resolution.
//!
//! Expands normalized changes into schema statements and orders them so
//! every statement runs after the statements it needs. Ties are broken by
//! ascending target name, then operation id, so plans are deterministic.

use super::error::MigrationError;
use super::normalize::{Change, NormalizedChangeSet};
use super::plan::Operation;
use crate::schema::{AttributeTypeDef, OperationKind, RoleRef, SchemaState, SchemaStatement, TypeDef};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use tracing::debug;

pub(crate) fn define_id(name: &str) -> String {
    format!("define:{name}")
}

pub(crate) fn owns_id(owner: &str, attribute: &str) -> String {
    format!("owns:{owner}:{attribute}")
}

pub(crate) fn plays_id(player: &str, role: &RoleRef) -> String {
    format!("plays:{player}:{role}")
}

pub(crate) fn relates_id(relation: &str, role: &str) -> String {
    format!("relates:{relation}:{role}")
}

pub(crate) fn sub_id(name: &str) -> String {
    format!("sub:{name}")
}

pub(crate) fn value_id(attribute: &str) -> String {
    format!("value:{attribute}")
}

pub(crate) fn unowns_id(owner: &str, attribute: &str) -> String {
    format!("unowns:{owner}:{attribute}")
}

pub(crate) fn unplays_id(player: &str, role: &RoleRef) -> String {
    format!("unplays:{player}:{role}")
}

pub(crate) fn undefine_id(name: &str) -> String {
    format!("undefine:{name}")
}

/// Orders normalized changes into operations.
pub struct DependencyResolver;

impl DependencyResolver {
    /// Expand and order `changes`. `state` is the schema the plan starts from.
    pub fn resolve(
        state: &SchemaState,
        changes: &NormalizedChangeSet,
    ) -> Result<Vec<Operation>, MigrationError> {
        let mut ops = BTreeMap::new();
        for change in &changes.changes {
            expand(change, &mut ops)?;
        }
        link(state, &mut ops);
        let ordered = order(ops)?;
        debug!(operations = ordered.len(), "resolved plan order");
        Ok(ordered)
    }
}

fn add(ops: &mut BTreeMap<String, Operation>, op: Operation) -> Result<(), MigrationError> {
    if ops.contains_key(&op.id) {
        return Err(MigrationError::conflict(format!(
            "operation {} is requested twice",
            op.id
        )));
    }
    ops.insert(op.id.clone(), op);
    Ok(())
}

fn expand(change: &Change, ops: &mut BTreeMap<String, Operation>) -> Result<(), MigrationError> {
    match change {
        Change::DefineType { definition } => add(
            ops,
            Operation::new(
                define_id(definition.name()),
                SchemaStatement::define(definition.clone()),
            ),
        ),
        Change::AddOwns { owner, attribute } => add(
            ops,
            Operation::new(
                owns_id(owner, attribute),
                SchemaStatement::AddOwns {
                    owner: owner.clone(),
                    attribute: attribute.clone(),
                },
            ),
        ),
        Change::AddPlays { player, role } => add(
            ops,
            Operation::new(
                plays_id(player, role),
                SchemaStatement::AddPlays {
                    player: player.clone(),
                    role: role.clone(),
                },
            ),
        ),
        Change::AddRelates { relation, role } => add(
            ops,
            Operation::new(
                relates_id(relation, role),
                SchemaStatement::AddRelates {
                    relation: relation.clone(),
                    role: role.clone(),
                },
            ),
        ),
        Change::SetSupertype {
            name,
            supertype,
            previous,
        } => add(
            ops,
            Operation::new(
                sub_id(name),
                SchemaStatement::SetSupertype {
                    name: name.clone(),
                    supertype: supertype.clone(),
                    previous: previous.clone(),
                },
            ),
        ),
        Change::ChangeValueKind {
            attribute,
            from,
            to,
            shadow,
            owners,
        } => {
            let shadow_def = TypeDef::from(AttributeTypeDef::new(shadow.clone(), *to));
            add(
                ops,
                Operation::new(
                    define_id(shadow),
                    SchemaStatement::DefineType {
                        definition: shadow_def.clone(),
                        owned_by: owners.iter().cloned().collect(),
                        played_by: BTreeSet::new(),
                    },
                ),
            )?;

            let mut retype = Operation::new(
                value_id(attribute),
                SchemaStatement::SetValueKind {
                    attribute: attribute.clone(),
                    value_kind: *to,
                    previous: *from,
                },
            );
            retype.depends_on.insert(define_id(shadow));
            add(ops, retype)?;

            let mut undefine = Operation::new(
                undefine_id(shadow),
                SchemaStatement::UndefineType {
                    definition: shadow_def,
                },
            );
            undefine.depends_on.insert(value_id(attribute));
            for owner in owners {
                let mut detach = Operation::new(
                    unowns_id(owner, shadow),
                    SchemaStatement::RemoveOwns {
                        owner: owner.clone(),
                        attribute: shadow.clone(),
                    },
                );
                detach.depends_on.insert(value_id(attribute));
                undefine.depends_on.insert(detach.id.clone());
                add(ops, detach)?;
            }
            add(ops, undefine)
        }
        Change::Reclassify {
            from,
            into,
            subtypes,
            players,
        } => {
            let into_id = define_id(into.name());
            add(
                ops,
                Operation::new(
                    into_id.clone(),
                    SchemaStatement::DefineType {
                        definition: into.clone(),
                        owned_by: BTreeSet::new(),
                        played_by: players
                            .iter()
                            .map(|(player, role)| (player.clone(), role.role.clone()))
                            .collect(),
                    },
                ),
            )?;

            let mut undefine = Operation::new(
                undefine_id(from.name()),
                SchemaStatement::UndefineType {
                    definition: from.clone(),
                },
            );
            undefine.depends_on.insert(into_id.clone());
            for subtype in subtypes {
                let mut moved = Operation::new(
                    sub_id(subtype),
                    SchemaStatement::SetSupertype {
                        name: subtype.clone(),
                        supertype: Some(into.name().to_string()),
                        previous: Some(from.name().to_string()),
                    },
                );
                moved.depends_on.insert(into_id.clone());
                undefine.depends_on.insert(moved.id.clone());
                add(ops, moved)?;
            }
            for (player, role) in players {
                let mut detach = Operation::new(
                    unplays_id(player, role),
                    SchemaStatement::RemovePlays {
                        player: player.clone(),
                        role: role.clone(),
                    },
                );
                detach.depends_on.insert(into_id.clone());
                undefine.depends_on.insert(detach.id.clone());
                add(ops, detach)?;
            }
            add(ops, undefine)
        }
        Change::RemoveType {
            definition,
            detach_owners,
            detach_players,
        } => {
            let name = definition.name();
            let mut undefine = Operation::new(
                undefine_id(name),
                SchemaStatement::UndefineType {
                    definition: definition.clone(),
                },
            );
            for owner in detach_owners {
                let detach = Operation::new(
                    unowns_id(owner, name),
                    SchemaStatement::RemoveOwns {
                        owner: owner.clone(),
                        attribute: name.to_string(),
                    },
                );
                undefine.depends_on.insert(detach.id.clone());
                add(ops, detach)?;
            }
            for (player, role) in detach_players {
                let detach = Operation::new(
                    unplays_id(player, role),
                    SchemaStatement::RemovePlays {
                        player: player.clone(),
                        role: role.clone(),
                    },
                );
                undefine.depends_on.insert(detach.id.clone());
                add(ops, detach)?;
            }
            add(ops, undefine)
        }
    }
}

/// Types and roles a statement needs to exist before it runs.
fn requirements(statement: &SchemaStatement) -> (Vec<&str>, Vec<RoleRef>) {
    match statement {
        SchemaStatement::DefineType {
            definition,
            owned_by,
            played_by,
        } => {
            let mut types: Vec<&str> = definition.supertype().into_iter().collect();
            types.extend(definition.owns().iter().map(String::as_str));
            types.extend(definition.plays().iter().map(|r| r.relation.as_str()));
            types.extend(owned_by.iter().map(String::as_str));
            types.extend(played_by.iter().map(|(player, _)| player.as_str()));
            (types, definition.plays().iter().cloned().collect())
        }
        SchemaStatement::AddOwns { owner, attribute } => {
            (vec![owner.as_str(), attribute.as_str()], Vec::new())
        }
        SchemaStatement::AddPlays { player, role } => (
            vec![player.as_str(), role.relation.as_str()],
            vec![role.clone()],
        ),
        SchemaStatement::AddRelates { relation, .. } => (vec![relation.as_str()], Vec::new()),
        SchemaStatement::SetSupertype {
            name, supertype, ..
        } => {
            let mut types = vec![name.as_str()];
            types.extend(supertype.as_deref());
            (types, Vec::new())
        }
        SchemaStatement::SetValueKind { attribute, .. } => {
            (vec![attribute.as_str()], Vec::new())
        }
        SchemaStatement::RemoveOwns { .. }
        | SchemaStatement::RemovePlays { .. }
        | SchemaStatement::RemoveRelates { .. }
        | SchemaStatement::UndefineType { .. } => (Vec::new(), Vec::new()),
    }
}

/// Whether the stored definition of `def` points at `name`.
fn references(def: &TypeDef, name: &str) -> bool {
    def.supertype() == Some(name)
        || def.owns().contains(name)
        || def.plays().iter().any(|role| role.relation == name)
}

/// Add the edges implied by what each statement needs.
fn link(state: &SchemaState, ops: &mut BTreeMap<String, Operation>) {
    let ids: BTreeSet<String> = ops.keys().cloned().collect();
    let detachments: Vec<(String, String)> = ops
        .values()
        .filter(|op| {
            op.kind == OperationKind::Undefine
                || matches!(op.payload, SchemaStatement::SetSupertype { .. })
        })
        .map(|op| (op.id.clone(), op.target.clone()))
        .collect();

    for op in ops.values_mut() {
        let (types, roles) = requirements(&op.payload);
        let mut needs: BTreeSet<String> = types
            .into_iter()
            .map(define_id)
            .chain(roles.iter().map(|r| relates_id(&r.relation, &r.role)))
            .collect();

        if let SchemaStatement::DefineType { definition, .. } = &op.payload {
            // A replacement is defined only after the old type is gone.
            needs.insert(undefine_id(definition.name()));
        }

        if let SchemaStatement::UndefineType { definition } = &op.payload {
            let name = definition.name();
            for (id, target) in &detachments {
                if target != name && state.get(target).is_some_and(|def| references(def, name)) {
                    needs.insert(id.clone());
                }
            }
        }

        needs.remove(&op.id);
        op.depends_on
            .extend(needs.into_iter().filter(|id| ids.contains(id)));
    }
}

/// Kahn's algorithm with a min-heap keyed on `(target, id)`.
fn order(mut ops: BTreeMap<String, Operation>) -> Result<Vec<Operation>, MigrationError> {
    let mut indegree: BTreeMap<String, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for op in ops.values() {
        indegree.insert(op.id.clone(), op.depends_on.len());
        for dep in &op.depends_on {
            dependents.entry(dep.clone()).or_default().push(op.id.clone());
        }
    }

    let mut ready: BinaryHeap<Reverse<(String, String)>> = ops
        .values()
        .filter(|op| op.depends_on.is_empty())
        .map(|op| Reverse((op.target.clone(), op.id.clone())))
        .collect();

    let mut ordered = Vec::with_capacity(ops.len());
    while let Some(Reverse((_, id))) = ready.pop() {
        let Some(op) = ops.remove(&id) else {
            continue;
        };
        for next in dependents.get(&id).into_iter().flatten() {
            if let Some(count) = indegree.get_mut(next) {
                *count -= 1;
                if *count == 0 {
                    if let Some(next_op) = ops.get(next) {
                        ready.push(Reverse((next_op.target.clone(), next.clone())));
                    }
                }
            }
        }
        ordered.push(op);
    }

    if !ops.is_empty() {
        return Err(MigrationError::DependencyCycle {
            operations: ops.into_keys().collect(),
        });
    }
    Ok(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::ProposalNormalizer;
    use crate::proposal::{ChangeProposal, Retype, TypeModification};
    use crate::schema::{EntityTypeDef, RelationTypeDef, ValueKind};
    use pretty_assertions::assert_eq;

    fn ids(ops: &[Operation]) -> Vec<&str> {
        ops.iter().map(|op| op.id.as_str()).collect()
    }

    fn plan(state: &SchemaState, proposal: &ChangeProposal) -> Vec<Operation> {
        let set = ProposalNormalizer::normalize(state, proposal).unwrap();
        DependencyResolver::resolve(state, &set).unwrap()
    }

    fn assert_dependencies_precede(ops: &[Operation]) {
        for (i, op) in ops.iter().enumerate() {
            for dep in &op.depends_on {
                let at = ops.iter().position(|o| &o.id == dep).unwrap();
                assert!(at < i, "{} runs before its dependency {dep}", op.id);
            }
        }
    }

    #[test]
    fn test_attribute_before_owner() {
        let proposal = ChangeProposal::new()
            .with_entity(EntityTypeDef::new("chair").with_owns("color"))
            .with_attribute(AttributeTypeDef::new("color", ValueKind::String));
        let ops = plan(&SchemaState::new(), &proposal);
        assert_eq!(ids(&ops), vec!["define:color", "define:chair"]);
        assert_dependencies_precede(&ops);
    }

    #[test]
    fn test_supertype_before_subtype_regardless_of_name() {
        let proposal = ChangeProposal::new()
            .with_entity(EntityTypeDef::new("zebra"))
            .with_entity(EntityTypeDef::new("animal_baby").with_supertype("zebra"));
        let ops = plan(&SchemaState::new(), &proposal);
        assert_eq!(ids(&ops), vec!["define:zebra", "define:animal_baby"]);
    }

    #[test]
    fn test_relation_before_plays() {
        let proposal = ChangeProposal::new()
            .with_entity(EntityTypeDef::new("apple").with_plays(RoleRef::new("rests_on", "item")))
            .with_relation(RelationTypeDef::new("rests_on").with_relates("item"));
        let ops = plan(&SchemaState::new(), &proposal);
        assert_eq!(ids(&ops), vec!["define:rests_on", "define:apple"]);
    }

    #[test]
    fn test_ties_broken_by_name() {
        let proposal = ChangeProposal::new()
            .with_entity(EntityTypeDef::new("b"))
            .with_entity(EntityTypeDef::new("C"))
            .with_entity(EntityTypeDef::new("a"));
        let ops = plan(&SchemaState::new(), &proposal);
        assert_eq!(ids(&ops), vec!["define:C", "define:a", "define:b"]);
    }

    #[test]
    fn test_value_kind_change_expansion() {
        let state = SchemaState::from_definitions(vec![
            AttributeTypeDef::new("size", ValueKind::String).into(),
            EntityTypeDef::new("box").with_owns("size").into(),
        ])
        .unwrap();
        let proposal = ChangeProposal::new().with_modification(
            TypeModification::new("size").with_retype(Retype::ValueKind(ValueKind::Double)),
        );
        let ops = plan(&state, &proposal);
        assert_eq!(
            ids(&ops),
            vec![
                "define:size__double",
                "value:size",
                "unowns:box:size__double",
                "undefine:size__double"
            ]
        );
        assert_dependencies_precede(&ops);
    }

    #[test]
    fn test_reclassify_moves_subtypes_before_undefine() {
        let state = SchemaState::from_definitions(vec![
            EntityTypeDef::new("gadget").into(),
            EntityTypeDef::new("phone").with_supertype("gadget").into(),
        ])
        .unwrap();
        let proposal = ChangeProposal::new().with_modification(
            TypeModification::new("gadget").with_retype(Retype::Reclassify {
                into: "device".into(),
                supertype: None,
            }),
        );
        let ops = plan(&state, &proposal);
        assert_eq!(ids(&ops), vec!["define:device", "sub:phone", "undefine:gadget"]);
    }

    #[test]
    fn test_removal_follows_dependents() {
        let state = SchemaState::from_definitions(vec![
            AttributeTypeDef::new("color", ValueKind::String).into(),
            EntityTypeDef::new("furniture").with_owns("color").into(),
            EntityTypeDef::new("chair").with_supertype("furniture").into(),
            EntityTypeDef::new("lamp").with_owns("color").into(),
        ])
        .unwrap();
        let proposal = ChangeProposal::new()
            .with_removal("color")
            .with_removal("furniture")
            .with_removal("chair");
        let ops = plan(&state, &proposal);
        assert_dependencies_precede(&ops);
        let at = |id: &str| ops.iter().position(|o| o.id == id).unwrap();
        assert!(at("undefine:chair") < at("undefine:furniture"));
        assert!(at("undefine:furniture") < at("undefine:color"));
        assert!(at("unowns:lamp:color") < at("undefine:color"));
    }

    #[test]
    fn test_replacement_undefines_first() {
        let state = SchemaState::from_definitions(vec![AttributeTypeDef::new(
            "weight",
            ValueKind::String,
        )
        .into()])
        .unwrap();
        let proposal = ChangeProposal::new()
            .with_removal("weight")
            .with_attribute(AttributeTypeDef::new("weight", ValueKind::Double));
        let ops = plan(&state, &proposal);
        assert_eq!(ids(&ops), vec!["undefine:weight", "define:weight"]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let mut a = Operation::new("define:a", SchemaStatement::define(EntityTypeDef::new("a")));
        let mut b = Operation::new("define:b", SchemaStatement::define(EntityTypeDef::new("b")));
        a.depends_on.insert("define:b".into());
        b.depends_on.insert("define:a".into());
        let ops = BTreeMap::from([(a.id.clone(), a), (b.id.clone(), b)]);
        let err = order(ops).unwrap_err();
        assert!(matches!(err, MigrationError::DependencyCycle { ref operations } if operations.len() == 2));
    }
}
