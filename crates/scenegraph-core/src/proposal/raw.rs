//! Loosely structured analysis output and its conversion to strict types.
//!
//! The analysis collaborator returns JSON with three sections: data that fits
//! the current schema (`new_data`), requested schema changes
//! (`schema_changes`), and data that can only be stored after those changes
//! (`data_requiring_schema_change`, either a sectioned object or a plain list
//! of entities).

use super::{ChangeProposal, NewRelationType, Retype, TypeModification};
use crate::ingest::{EntityRecord, Observations, RelationRecord};
use crate::migration::MigrationError;
use crate::schema::typeql::{is_root_type, is_valid_identifier, sanitize_name};
use crate::schema::{AttributeTypeDef, EntityTypeDef, RelationTypeDef, RoleRef, ValueKind};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::warn;

/// Raw analysis document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawAnalysis {
    #[serde(default)]
    pub new_data: RawObservations,
    #[serde(default)]
    pub schema_changes: RawSchemaChanges,
    #[serde(default)]
    pub data_requiring_schema_change: RawPending,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawObservations {
    #[serde(default)]
    pub entities: Vec<RawEntity>,
    #[serde(default)]
    pub relations: Vec<RawRelation>,
}

/// Pending data in either the sectioned or the legacy list form.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawPending {
    Sections(RawObservations),
    Legacy(Vec<RawEntity>),
}

impl Default for RawPending {
    fn default() -> Self {
        RawPending::Sections(RawObservations::default())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawEntity {
    pub id: String,
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRelation {
    #[serde(rename = "type")]
    pub type_name: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub roles: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSchemaChanges {
    #[serde(default)]
    pub new_attribute_types: Vec<RawAttributeType>,
    #[serde(default)]
    pub new_entity_types: Vec<RawEntityType>,
    #[serde(default)]
    pub new_relation_types: Vec<RawRelationType>,
    #[serde(default)]
    pub modified_types: Vec<RawModification>,
    #[serde(default)]
    pub removed_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawAttributeType {
    pub name: String,
    #[serde(default)]
    pub value_type: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawEntityType {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub owns: Vec<String>,
    #[serde(default)]
    pub plays: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRelationType {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub roles: Vec<RawRole>,
    #[serde(default)]
    pub owns: Vec<String>,
}

/// A role given as a bare name or with its players.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawRole {
    Name(String),
    Detailed {
        name: String,
        #[serde(default)]
        players: Vec<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawModification {
    pub name: String,
    #[serde(default)]
    pub add_owns: Vec<String>,
    #[serde(default)]
    pub add_plays: Vec<String>,
    #[serde(default)]
    pub retype: Option<RawRetype>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawRetype {
    #[serde(default)]
    pub value_type: Option<String>,
    #[serde(default)]
    pub rename_to: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

/// Options applied while converting raw analysis output.
#[derive(Debug, Clone)]
pub struct BoundaryOptions {
    /// Supertype given to new entity types that declare none.
    pub default_entity_supertype: Option<String>,
}

impl Default for BoundaryOptions {
    fn default() -> Self {
        Self {
            default_entity_supertype: Some(super::base::PHYSICAL_OBJECT.to_string()),
        }
    }
}

/// Strictly typed analysis: the proposal plus the data records.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    /// Requested schema changes.
    pub proposal: ChangeProposal,
    /// Records that fit the schema before migration.
    pub fitting: Observations,
    /// Records that fit only after migration.
    pub pending: Observations,
    /// Inputs that were accepted after a fallback.
    pub warnings: Vec<String>,
}

impl Analysis {
    /// All records, fitting ones first.
    pub fn all_observations(&self) -> Observations {
        let mut all = self.fitting.clone();
        all.entities.extend(self.pending.entities.iter().cloned());
        all.relations.extend(self.pending.relations.iter().cloned());
        all
    }
}

impl RawAnalysis {
    /// Parse a raw analysis document.
    pub fn from_json(text: &str) -> Result<Self, MigrationError> {
        serde_json::from_str(text)
            .map_err(|e| MigrationError::validation(format!("malformed analysis: {e}")))
    }

    /// Convert into strict types.
    pub fn into_analysis(self, options: &BoundaryOptions) -> Result<Analysis, MigrationError> {
        let mut warnings = Vec::new();
        let proposal = convert_changes(self.schema_changes, options, &mut warnings)?;
        let fitting = convert_observations(self.new_data)?;
        let pending = match self.data_requiring_schema_change {
            RawPending::Sections(sections) => convert_observations(sections)?,
            RawPending::Legacy(entities) => convert_observations(RawObservations {
                entities,
                relations: Vec::new(),
            })?,
        };
        proposal.validate()?;
        Ok(Analysis {
            proposal,
            fitting,
            pending,
            warnings,
        })
    }
}

fn clean_name(raw: &str) -> Result<String, MigrationError> {
    let trimmed = raw.trim();
    let name = sanitize_name(trimmed).into_owned();
    if is_valid_identifier(&name) {
        Ok(name)
    } else {
        Err(MigrationError::validation(format!(
            "invalid type or role name: {raw:?}"
        )))
    }
}

fn clean_parent(raw: Option<&str>) -> Result<Option<String>, MigrationError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(parent) if is_root_type(parent) => Ok(None),
        Some(parent) => clean_name(parent).map(Some),
    }
}

fn clean_role(raw: &str) -> Result<RoleRef, MigrationError> {
    let role = RoleRef::parse(raw).ok_or_else(|| {
        MigrationError::validation(format!("role {raw:?} is not of the form relation:role"))
    })?;
    Ok(RoleRef::new(clean_name(&role.relation)?, clean_name(&role.role)?))
}

fn value_kind(raw: Option<&str>) -> Result<ValueKind, MigrationError> {
    match raw {
        None => Ok(ValueKind::String),
        Some(text) => ValueKind::parse_loose(text)
            .ok_or_else(|| MigrationError::validation(format!("unknown value type {text:?}"))),
    }
}

/// Value kind of a new attribute. Unknown kinds become strings.
fn attribute_kind(name: &str, raw: Option<&str>, warnings: &mut Vec<String>) -> ValueKind {
    match raw {
        None => ValueKind::String,
        Some(text) => ValueKind::parse_loose(text).unwrap_or_else(|| {
            warn!(attribute = %name, value_type = %text, "unknown value type, using string");
            warnings.push(format!(
                "attribute {name}: unknown value type {text:?}, defined as string"
            ));
            ValueKind::String
        }),
    }
}

fn convert_changes(
    raw: RawSchemaChanges,
    options: &BoundaryOptions,
    warnings: &mut Vec<String>,
) -> Result<ChangeProposal, MigrationError> {
    let mut proposal = ChangeProposal::new();

    let mut attributes: BTreeMap<String, AttributeTypeDef> = BTreeMap::new();
    for attr in raw.new_attribute_types {
        let name = clean_name(&attr.name)?;
        let kind = attribute_kind(&name, attr.value_type.as_deref(), warnings);
        let mut def = AttributeTypeDef::new(name.clone(), kind);
        def.supertype = clean_parent(attr.parent.as_deref())?;
        match attributes.get(&name) {
            Some(existing) if *existing != def => {
                return Err(MigrationError::validation(format!(
                    "attribute type {name} is declared twice with different definitions"
                )));
            }
            _ => {
                attributes.insert(name, def);
            }
        }
    }
    proposal.new_attribute_types = attributes.into_values().collect();

    let mut entities: BTreeMap<String, EntityTypeDef> = BTreeMap::new();
    for entity in raw.new_entity_types {
        let name = clean_name(&entity.name)?;
        let supertype = match &entity.parent {
            Some(_) => clean_parent(entity.parent.as_deref())?,
            None => options
                .default_entity_supertype
                .clone()
                .filter(|default| *default != name),
        };
        let def = entities
            .entry(name.clone())
            .or_insert_with(|| EntityTypeDef::new(name.clone()));
        if def.supertype.is_some() && def.supertype != supertype {
            return Err(MigrationError::validation(format!(
                "entity type {name} is declared twice with different parents"
            )));
        }
        def.supertype = supertype;
        for attr in &entity.owns {
            def.owns.insert(clean_name(attr)?);
        }
        for role in &entity.plays {
            def.plays.insert(clean_role(role)?);
        }
    }
    proposal.new_entity_types = entities.into_values().collect();

    let mut relations: BTreeMap<String, NewRelationType> = BTreeMap::new();
    for relation in raw.new_relation_types {
        let name = clean_name(&relation.name)?;
        let supertype = clean_parent(relation.parent.as_deref())?;
        let entry = relations
            .entry(name.clone())
            .or_insert_with(|| NewRelationType::new(RelationTypeDef::new(name.clone())));
        if entry.definition.supertype.is_some() && entry.definition.supertype != supertype {
            return Err(MigrationError::validation(format!(
                "relation type {name} is declared twice with different parents"
            )));
        }
        entry.definition.supertype = supertype;
        for attr in &relation.owns {
            entry.definition.owns.insert(clean_name(attr)?);
        }
        for role in relation.roles {
            let (role, players) = match role {
                RawRole::Name(role) => (role, Vec::new()),
                RawRole::Detailed { name, players } => (name, players),
            };
            let role = clean_name(&role)?;
            entry.definition.relates.insert(role.clone());
            for player in players {
                entry
                    .role_players
                    .entry(role.clone())
                    .or_default()
                    .insert(clean_name(&player)?);
            }
        }
    }
    proposal.new_relation_types = relations.into_values().collect();

    for raw_mod in raw.modified_types {
        let mut modification = TypeModification::new(clean_name(&raw_mod.name)?);
        for attr in &raw_mod.add_owns {
            modification.add_owns.insert(clean_name(attr)?);
        }
        for role in &raw_mod.add_plays {
            modification.add_plays.insert(clean_role(role)?);
        }
        modification.retype = match raw_mod.retype {
            None => None,
            Some(RawRetype {
                value_type: Some(kind),
                rename_to: None,
                ..
            }) => Some(Retype::ValueKind(value_kind(Some(&kind))?)),
            Some(RawRetype {
                value_type: None,
                rename_to: Some(into),
                parent,
            }) => Some(Retype::Reclassify {
                into: clean_name(&into)?,
                supertype: clean_parent(parent.as_deref())?,
            }),
            Some(_) => {
                return Err(MigrationError::validation(format!(
                    "retype of {} must give exactly one of value_type or rename_to",
                    modification.name
                )));
            }
        };
        proposal.modified_types.push(modification);
    }

    for removed in raw.removed_types {
        proposal.removed_types.insert(clean_name(&removed)?);
    }
    Ok(proposal)
}

fn convert_observations(raw: RawObservations) -> Result<Observations, MigrationError> {
    let entities = raw
        .entities
        .into_iter()
        .map(|entity| {
            Ok(EntityRecord {
                id: entity.id,
                type_name: clean_name(&entity.type_name)?,
                attributes: entity.attributes,
            })
        })
        .collect::<Result<Vec<_>, MigrationError>>()?;
    let relations = raw
        .relations
        .into_iter()
        .map(|relation| {
            Ok(RelationRecord {
                type_name: clean_name(&relation.type_name)?,
                from: relation.from,
                to: relation.to,
                from_role: relation.roles.get("from").cloned(),
                to_role: relation.roles.get("to").cloned(),
            })
        })
        .collect::<Result<Vec<_>, MigrationError>>()?;
    Ok(Observations {
        entities,
        relations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "new_data": {
            "entities": [{"id": "desk_main", "type": "physical_object", "attributes": {"color": "brown"}}],
            "relations": [{"type": "on", "from": "laptop_1", "to": "desk_main"}]
        },
        "schema_changes": {
            "new_attribute_types": [{"name": "brand", "value_type": "str"}],
            "new_entity_types": [
                {"name": "laptop", "parent": "physical_object", "owns": ["brand", "color"]},
                {"name": "desk"}
            ],
            "new_relation_types": [
                {"name": "in", "parent": "spatial_relation"},
                {"name": "holding", "parent": "relation", "roles": ["holder", {"name": "held", "players": ["laptop"]}]}
            ],
            "modified_types": [{"name": "physical_object", "add_owns": ["brand"], "add_plays": ["holding:holder"]}]
        },
        "data_requiring_schema_change": [
            {"id": "laptop_1", "type": "laptop", "attributes": {"brand": "acme"}}
        ]
    }"#;

    #[test]
    fn test_sample_conversion() {
        let analysis = RawAnalysis::from_json(SAMPLE)
            .unwrap()
            .into_analysis(&BoundaryOptions::default())
            .unwrap();
        let proposal = &analysis.proposal;

        assert_eq!(proposal.new_attribute_types[0].value_kind, ValueKind::String);
        let desk = proposal
            .new_entity_types
            .iter()
            .find(|e| e.name == "desk")
            .unwrap();
        assert_eq!(desk.supertype.as_deref(), Some("physical_object"));

        let names: Vec<&str> = proposal
            .new_relation_types
            .iter()
            .map(|r| r.definition.name.as_str())
            .collect();
        assert_eq!(names, vec!["contained_in", "holding"]);

        let holding = &proposal.new_relation_types[1];
        assert_eq!(holding.definition.supertype, None);
        assert!(holding.role_players["held"].contains("laptop"));
        assert!(holding.definition.relates.contains("holder"));

        assert!(proposal.modified_types[0]
            .add_plays
            .contains(&RoleRef::new("holding", "holder")));

        assert_eq!(analysis.fitting.entities.len(), 1);
        assert_eq!(analysis.fitting.relations[0].from_role, None);
        assert_eq!(analysis.pending.entities[0].type_name, "laptop");
    }

    #[test]
    fn test_unknown_value_type_falls_back_to_string() {
        let raw = r#"{"schema_changes": {"new_attribute_types": [{"name": "x", "value_type": "blob"}]}}"#;
        let analysis = RawAnalysis::from_json(raw)
            .unwrap()
            .into_analysis(&BoundaryOptions::default())
            .unwrap();
        assert_eq!(analysis.proposal.new_attribute_types[0].value_kind, ValueKind::String);
        assert_eq!(analysis.warnings.len(), 1);
        assert!(analysis.warnings[0].contains("\"blob\""));
    }

    #[test]
    fn test_unknown_retype_value_type_is_rejected() {
        let raw = r#"{"schema_changes": {"modified_types": [{"name": "size", "retype": {"value_type": "blob"}}]}}"#;
        let err = RawAnalysis::from_json(raw)
            .unwrap()
            .into_analysis(&BoundaryOptions::default())
            .unwrap_err();
        assert!(matches!(err, MigrationError::Validation { .. }));
    }

    #[test]
    fn test_retype_forms() {
        let raw = r#"{"schema_changes": {"modified_types": [
            {"name": "size", "retype": {"value_type": "double"}},
            {"name": "gadget", "retype": {"rename_to": "device"}}
        ]}}"#;
        let analysis = RawAnalysis::from_json(raw)
            .unwrap()
            .into_analysis(&BoundaryOptions::default())
            .unwrap();
        assert_eq!(
            analysis.proposal.modified_types[0].retype,
            Some(Retype::ValueKind(ValueKind::Double))
        );
        assert_eq!(
            analysis.proposal.modified_types[1].retype,
            Some(Retype::Reclassify {
                into: "device".into(),
                supertype: None
            })
        );
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let raw = r#"{"schema_changes": {"new_entity_types": [{"name": "coffee mug"}]}}"#;
        assert!(RawAnalysis::from_json(raw)
            .unwrap()
            .into_analysis(&BoundaryOptions::default())
            .is_err());
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            RawAnalysis::from_json("{not json"),
            Err(MigrationError::Validation { .. })
        ));
    }
}
