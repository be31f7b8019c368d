//! Validating state machine shared by the embedded stores.
//!
//! Every statement is checked in full before anything is mutated, so a
//! rejected statement leaves the state untouched.

use super::statement::{DataRows, DataStatement, Instance};
use super::StoreError;
use crate::schema::{SchemaState, SchemaStatement, TypeDef, TypeKind};
use std::collections::{BTreeMap, BTreeSet};

/// What a statement changed, so persistent stores can write only the delta.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    pub schema_changed: bool,
    pub upserted: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct StoreState {
    schema: SchemaState,
    instances: BTreeMap<String, Instance>,
    next_iid: u64,
}

impl StoreState {
    pub fn from_parts(
        definitions: Vec<TypeDef>,
        instances: impl IntoIterator<Item = Instance>,
    ) -> Result<Self, StoreError> {
        let schema = SchemaState::from_definitions(definitions)?;
        let instances: BTreeMap<String, Instance> = instances
            .into_iter()
            .map(|instance| (instance.iid.clone(), instance))
            .collect();
        let next_iid = instances
            .keys()
            .filter_map(|iid| u64::from_str_radix(iid.trim_start_matches("0x"), 16).ok())
            .max()
            .map_or(1, |max| max + 1);
        Ok(Self {
            schema,
            instances,
            next_iid,
        })
    }

    pub fn definitions(&self) -> Vec<TypeDef> {
        self.schema.definitions().cloned().collect()
    }

    pub fn instance(&self, iid: &str) -> Option<&Instance> {
        self.instances.get(iid)
    }

    pub fn apply_schema(&mut self, statement: &SchemaStatement) -> Result<Effects, StoreError> {
        let mut next = self.schema.clone();
        next.apply_statement(statement)?;
        for instance in self.instances.values() {
            conforms(&next, &self.instances, instance).map_err(|reason| {
                StoreError::rejected(format!(
                    "{} would orphan data: {reason}",
                    statement.to_typeql().replace('\n', " ")
                ))
            })?;
        }
        self.schema = next;
        Ok(Effects {
            schema_changed: true,
            ..Default::default()
        })
    }

    pub fn apply_data(
        &mut self,
        statement: &DataStatement,
    ) -> Result<(DataRows, Effects), StoreError> {
        let mut effects = Effects::default();
        let rows = match statement {
            DataStatement::CountInstances {
                type_name,
                include_subtypes,
            } => {
                self.require_type(type_name)?;
                DataRows::Count(self.of_type(type_name, *include_subtypes).count() as u64)
            }
            DataStatement::ReadInstances {
                type_name,
                include_subtypes,
            } => {
                self.require_type(type_name)?;
                DataRows::Instances(self.of_type(type_name, *include_subtypes).cloned().collect())
            }
            DataStatement::GetInstance { iid } => {
                DataRows::Instances(self.instances.get(iid).cloned().into_iter().collect())
            }
            DataStatement::ReadOwners { attribute } => DataRows::Instances(
                self.instances
                    .values()
                    .filter(|i| i.has(attribute))
                    .cloned()
                    .collect(),
            ),
            DataStatement::FindByAttribute {
                type_name,
                attribute,
                value,
            } => DataRows::Instances(
                self.instances
                    .values()
                    .filter(|i| {
                        type_name
                            .as_deref()
                            .map_or(true, |t| self.schema.is_subtype_of(&i.type_name, t))
                    })
                    .filter(|i| i.values(attribute).contains(value))
                    .cloned()
                    .collect(),
            ),
            DataStatement::FindMigrated {
                fingerprint,
                type_name,
            } => DataRows::Instances(
                self.instances
                    .values()
                    .filter(|i| i.type_name == *type_name)
                    .filter(|i| {
                        i.provenance
                            .as_ref()
                            .is_some_and(|p| p.fingerprint == *fingerprint)
                    })
                    .cloned()
                    .collect(),
            ),
            DataStatement::InsertInstance {
                type_name,
                attributes,
                role_players,
                provenance,
            } => {
                let iid = format!("0x{:016x}", self.next_iid);
                let instance = Instance {
                    iid: iid.clone(),
                    type_name: type_name.clone(),
                    attributes: attributes
                        .iter()
                        .filter(|(_, values)| !values.is_empty())
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    role_players: role_players.clone(),
                    provenance: provenance.clone(),
                };
                conforms(&self.schema, &self.instances, &instance).map_err(StoreError::rejected)?;
                self.next_iid += 1;
                self.instances.insert(iid.clone(), instance);
                effects.upserted.insert(iid.clone());
                DataRows::Inserted(iid)
            }
            DataStatement::PutAttribute {
                iid,
                attribute,
                values,
            } => {
                let mut updated = self.existing(iid)?.clone();
                if values.is_empty() {
                    updated.attributes.remove(attribute);
                } else {
                    updated.attributes.insert(attribute.clone(), values.clone());
                }
                conforms(&self.schema, &self.instances, &updated).map_err(StoreError::rejected)?;
                self.instances.insert(iid.clone(), updated);
                effects.upserted.insert(iid.clone());
                DataRows::Affected(1)
            }
            DataStatement::RemoveAttribute { iid, attribute } => {
                let instance = self.existing_mut(iid)?;
                let removed = instance.attributes.remove(attribute).is_some();
                if removed {
                    effects.upserted.insert(iid.clone());
                }
                DataRows::Affected(u64::from(removed))
            }
            DataStatement::DeleteInstance { iid } => {
                if self.instances.contains_key(iid) {
                    self.delete_cascading(iid, &mut effects);
                    DataRows::Affected(1)
                } else {
                    DataRows::Affected(0)
                }
            }
            DataStatement::ReplaceRolePlayer { from, to } => {
                self.existing(to)?;
                let mut updated = Vec::new();
                for relation in self.instances.values().filter(|r| r.is_played_by(from)) {
                    let mut relation = relation.clone();
                    for rp in relation.role_players.iter_mut().filter(|rp| rp.player == *from) {
                        rp.player = to.clone();
                    }
                    conforms(&self.schema, &self.instances, &relation)
                        .map_err(StoreError::rejected)?;
                    updated.push(relation);
                }
                let affected = updated.len() as u64;
                for relation in updated {
                    effects.upserted.insert(relation.iid.clone());
                    self.instances.insert(relation.iid.clone(), relation);
                }
                DataRows::Affected(affected)
            }
            DataStatement::DeleteByAttribute { attribute, value } => {
                let doomed: Vec<String> = self
                    .instances
                    .values()
                    .filter(|i| i.values(attribute).contains(value))
                    .map(|i| i.iid.clone())
                    .collect();
                for iid in &doomed {
                    if self.instances.contains_key(iid) {
                        self.delete_cascading(iid, &mut effects);
                    }
                }
                DataRows::Affected(doomed.len() as u64)
            }
        };
        Ok((rows, effects))
    }

    fn require_type(&self, type_name: &str) -> Result<(), StoreError> {
        self.schema.definition_of(type_name)?;
        Ok(())
    }

    fn of_type<'a>(
        &'a self,
        type_name: &'a str,
        include_subtypes: bool,
    ) -> impl Iterator<Item = &'a Instance> + 'a {
        self.instances.values().filter(move |i| {
            if include_subtypes {
                self.schema.is_subtype_of(&i.type_name, type_name)
            } else {
                i.type_name == type_name
            }
        })
    }

    fn existing(&self, iid: &str) -> Result<&Instance, StoreError> {
        self.instances
            .get(iid)
            .ok_or_else(|| StoreError::rejected(format!("no instance with iid {iid}")))
    }

    fn existing_mut(&mut self, iid: &str) -> Result<&mut Instance, StoreError> {
        self.instances
            .get_mut(iid)
            .ok_or_else(|| StoreError::rejected(format!("no instance with iid {iid}")))
    }

    /// Delete an instance, detach it from relations, and delete relations left
    /// without any role player.
    fn delete_cascading(&mut self, iid: &str, effects: &mut Effects) {
        let mut pending = vec![iid.to_string()];
        while let Some(next) = pending.pop() {
            if self.instances.remove(&next).is_none() {
                continue;
            }
            effects.upserted.remove(&next);
            effects.removed.insert(next.clone());
            for relation in self.instances.values_mut() {
                if relation.is_played_by(&next) {
                    relation.role_players.retain(|rp| rp.player != next);
                    if relation.role_players.is_empty() {
                        pending.push(relation.iid.clone());
                    } else {
                        effects.upserted.insert(relation.iid.clone());
                    }
                }
            }
        }
    }
}

/// Check an instance against a schema. Returns the reason it does not conform.
fn conforms(
    schema: &SchemaState,
    instances: &BTreeMap<String, Instance>,
    instance: &Instance,
) -> Result<(), String> {
    let def = schema
        .get(&instance.type_name)
        .ok_or_else(|| format!("unknown type {}", instance.type_name))?;
    if !def.kind().is_thing() {
        return Err(format!(
            "{} is an attribute type and cannot be instantiated",
            instance.type_name
        ));
    }
    let owned = schema
        .effective_attributes_of(&instance.type_name)
        .map_err(|e| e.to_string())?;
    for (attribute, values) in &instance.attributes {
        if values.is_empty() {
            continue;
        }
        if !owned.contains(attribute) {
            return Err(format!("{} does not own {attribute}", instance.type_name));
        }
        let kind = schema
            .get(attribute)
            .and_then(TypeDef::value_kind)
            .ok_or_else(|| format!("unknown attribute type {attribute}"))?;
        if let Some(bad) = values.iter().find(|v| v.kind() != kind) {
            return Err(format!(
                "{attribute} expects {kind} values, got {} ({})",
                bad,
                bad.kind()
            ));
        }
    }
    if !instance.role_players.is_empty() {
        if def.kind() != TypeKind::Relation {
            return Err(format!("{} is not a relation type", instance.type_name));
        }
        let roles = schema
            .effective_relates_of(&instance.type_name)
            .map_err(|e| e.to_string())?;
        for rp in &instance.role_players {
            if !roles.contains(&rp.role) {
                return Err(format!("{} does not relate {}", instance.type_name, rp.role));
            }
            let player = instances
                .get(&rp.player)
                .ok_or_else(|| format!("role player {} does not exist", rp.player))?;
            if !schema.can_play(&player.type_name, &instance.type_name, &rp.role) {
                return Err(format!(
                    "{} cannot play {}:{}",
                    player.type_name, instance.type_name, rp.role
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeTypeDef, EntityTypeDef, RelationTypeDef, RoleRef, Value, ValueKind};
    use crate::store::RolePlayer;

    fn state() -> StoreState {
        StoreState::from_parts(
            vec![
                AttributeTypeDef::new("name", ValueKind::String).into(),
                EntityTypeDef::new("thing_a")
                    .with_owns("name")
                    .with_plays(RoleRef::new("on", "subject"))
                    .with_plays(RoleRef::new("on", "reference"))
                    .into(),
                RelationTypeDef::new("on")
                    .with_relates("subject")
                    .with_relates("reference")
                    .into(),
            ],
            vec![],
        )
        .unwrap()
    }

    fn insert(state: &mut StoreState, name: &str) -> String {
        let (rows, _) = state
            .apply_data(&DataStatement::InsertInstance {
                type_name: "thing_a".into(),
                attributes: BTreeMap::from([("name".to_string(), vec![Value::string(name)])]),
                role_players: vec![],
                provenance: None,
            })
            .unwrap();
        rows.into_inserted().unwrap()
    }

    #[test]
    fn test_insert_validates_ownership_and_kind() {
        let mut state = state();
        let err = state
            .apply_data(&DataStatement::InsertInstance {
                type_name: "thing_a".into(),
                attributes: BTreeMap::from([("name".to_string(), vec![Value::Long(1)])]),
                role_players: vec![],
                provenance: None,
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Rejected { .. }));
    }

    #[test]
    fn test_undefine_with_instances_is_rejected() {
        let mut state = state();
        let a = insert(&mut state, "a");
        let b = insert(&mut state, "b");
        state
            .apply_data(&DataStatement::InsertInstance {
                type_name: "on".into(),
                attributes: BTreeMap::new(),
                role_players: vec![RolePlayer::new("subject", &a), RolePlayer::new("reference", &b)],
                provenance: None,
            })
            .unwrap();

        let def = state.schema.get("on").cloned().unwrap();
        let remove_plays = SchemaStatement::RemovePlays {
            player: "thing_a".into(),
            role: RoleRef::new("on", "subject"),
        };
        assert!(state.apply_schema(&remove_plays).is_err());
        assert!(state
            .apply_schema(&SchemaStatement::UndefineType { definition: def })
            .is_err());
    }

    #[test]
    fn test_delete_cascades_to_empty_relations() {
        let mut state = state();
        let a = insert(&mut state, "a");
        let (rows, _) = state
            .apply_data(&DataStatement::InsertInstance {
                type_name: "on".into(),
                attributes: BTreeMap::new(),
                role_players: vec![RolePlayer::new("subject", &a)],
                provenance: None,
            })
            .unwrap();
        let rel = rows.into_inserted().unwrap();

        let (_, effects) = state
            .apply_data(&DataStatement::DeleteInstance { iid: a.clone() })
            .unwrap();
        assert!(effects.removed.contains(&a));
        assert!(effects.removed.contains(&rel));
        assert!(state.instance(&rel).is_none());
    }

    #[test]
    fn test_iids_resume_after_reload() {
        let mut state = state();
        insert(&mut state, "a");
        let reloaded = StoreState::from_parts(
            state.definitions(),
            state.instances.values().cloned().collect::<Vec<_>>(),
        )
        .unwrap();
        assert_eq!(reloaded.next_iid, 2);
    }
}
