//! Observation ingest.
//!
//! Writes the entity and relation records produced by scene analysis once
//! the schema can hold them.

use crate::repository::SchemaRepository;
use crate::schema::{SchemaState, Value};
use crate::store::{DataStatement, Instance, RolePlayer, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Attribute holding an entity's record id.
pub const NAME_ATTRIBUTE: &str = "name";

/// Attribute tagging instances with the scene they came from.
pub const SCENE_ATTRIBUTE: &str = "scene_id";

/// An observed entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Record id, stored as the entity's name.
    pub id: String,
    /// Entity type.
    pub type_name: String,
    /// Raw attribute values.
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// An observed relation between two entity records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationRecord {
    /// Relation type.
    pub type_name: String,
    /// Id of the first entity.
    pub from: String,
    /// Id of the second entity.
    pub to: String,
    /// Role of the first entity, `subject` if absent.
    #[serde(default)]
    pub from_role: Option<String>,
    /// Role of the second entity, `reference` if absent.
    #[serde(default)]
    pub to_role: Option<String>,
}

/// A batch of observations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observations {
    /// Entities, inserted first.
    #[serde(default)]
    pub entities: Vec<EntityRecord>,
    /// Relations between entities of this or earlier batches.
    #[serde(default)]
    pub relations: Vec<RelationRecord>,
}

impl Observations {
    /// Whether the batch holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relations.is_empty()
    }
}

/// A record that could not be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestFailure {
    /// Entity id, or `from -type-> to` for relations.
    pub record: String,
    /// Why it failed.
    pub reason: String,
}

/// Outcome of an ingest run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Entities inserted.
    pub entities_inserted: usize,
    /// Relations inserted.
    pub relations_inserted: usize,
    /// Attribute values dropped because the type does not own them.
    pub attributes_dropped: usize,
    /// Records that failed.
    pub failures: Vec<IngestFailure>,
}

/// Inserts observation records into the store.
pub struct Ingestor {
    repository: Arc<SchemaRepository>,
}

impl Ingestor {
    /// Create an ingestor.
    pub fn new(repository: Arc<SchemaRepository>) -> Self {
        Self { repository }
    }

    /// Insert a batch. Failures are collected per record.
    #[instrument(skip(self, observations), fields(entities = observations.entities.len(), relations = observations.relations.len()))]
    pub async fn ingest(&self, observations: &Observations, scene_id: Option<&str>) -> IngestReport {
        let schema = self.repository.snapshot();
        let mut report = IngestReport::default();

        for entity in &observations.entities {
            match self.insert_entity(&schema, entity, scene_id, &mut report).await {
                Ok(iid) => {
                    debug!(record = %entity.id, iid = %iid, "inserted entity");
                    report.entities_inserted += 1;
                }
                Err(reason) => report.failures.push(IngestFailure {
                    record: entity.id.clone(),
                    reason,
                }),
            }
        }

        for relation in &observations.relations {
            match self.insert_relation(&schema, relation, scene_id).await {
                Ok(_) => report.relations_inserted += 1,
                Err(reason) => report.failures.push(IngestFailure {
                    record: format!("{} -{}-> {}", relation.from, relation.type_name, relation.to),
                    reason,
                }),
            }
        }

        if !report.failures.is_empty() {
            warn!(failures = report.failures.len(), "some records were not ingested");
        }
        info!(
            entities = report.entities_inserted,
            relations = report.relations_inserted,
            "ingested observations"
        );
        report
    }

    /// Delete everything tagged with `scene_id`. Returns the number of
    /// tagged instances removed.
    #[instrument(skip(self))]
    pub async fn delete_scene(&self, scene_id: &str) -> Result<u64, StoreError> {
        let deleted = self
            .repository
            .execute_data(&DataStatement::DeleteByAttribute {
                attribute: SCENE_ATTRIBUTE.to_string(),
                value: Value::string(scene_id),
            })
            .await?
            .into_count()?;
        info!(scene_id, deleted, "deleted scene");
        Ok(deleted)
    }

    async fn insert_entity(
        &self,
        schema: &SchemaState,
        entity: &EntityRecord,
        scene_id: Option<&str>,
        report: &mut IngestReport,
    ) -> Result<String, String> {
        let owned = schema
            .effective_attributes_of(&entity.type_name)
            .map_err(|e| e.to_string())?;

        let mut attributes = BTreeMap::new();
        for (attribute, raw) in &entity.attributes {
            if !owned.contains(attribute) {
                report.attributes_dropped += 1;
                debug!(record = %entity.id, attribute = %attribute, "type does not own attribute");
                continue;
            }
            let kind = schema
                .get(attribute)
                .and_then(|def| def.value_kind())
                .ok_or_else(|| format!("{attribute} is not an attribute type"))?;
            let value = Value::from_json(raw, kind)
                .ok_or_else(|| format!("{attribute}: {raw} is not a valid {kind}"))?;
            attributes.insert(attribute.clone(), vec![value]);
        }
        if owned.contains(NAME_ATTRIBUTE) {
            attributes.insert(NAME_ATTRIBUTE.to_string(), vec![Value::string(&entity.id)]);
        }
        if let Some(scene) = scene_id.filter(|_| owned.contains(SCENE_ATTRIBUTE)) {
            attributes.insert(SCENE_ATTRIBUTE.to_string(), vec![Value::string(scene)]);
        }

        self.repository
            .execute_data(&DataStatement::InsertInstance {
                type_name: entity.type_name.clone(),
                attributes,
                role_players: Vec::new(),
                provenance: None,
            })
            .await
            .and_then(|rows| rows.into_inserted())
            .map_err(|e| e.to_string())
    }

    async fn insert_relation(
        &self,
        schema: &SchemaState,
        relation: &RelationRecord,
        scene_id: Option<&str>,
    ) -> Result<String, String> {
        if !schema.contains(&relation.type_name) {
            return Err(format!("unknown relation type {}", relation.type_name));
        }
        let from = self.resolve(&relation.from, scene_id).await?;
        let to = self.resolve(&relation.to, scene_id).await?;
        let from_role = relation.from_role.as_deref().unwrap_or("subject");
        let to_role = relation.to_role.as_deref().unwrap_or("reference");

        let mut attributes = BTreeMap::new();
        if let Some(scene) = scene_id {
            let owns_scene = schema
                .effective_attributes_of(&relation.type_name)
                .is_ok_and(|owned| owned.contains(SCENE_ATTRIBUTE));
            if owns_scene {
                attributes.insert(SCENE_ATTRIBUTE.to_string(), vec![Value::string(scene)]);
            }
        }

        self.repository
            .execute_data(&DataStatement::InsertInstance {
                type_name: relation.type_name.clone(),
                attributes,
                role_players: vec![
                    RolePlayer::new(from_role, from.iid),
                    RolePlayer::new(to_role, to.iid),
                ],
                provenance: None,
            })
            .await
            .and_then(|rows| rows.into_inserted())
            .map_err(|e| e.to_string())
    }

    /// Find the entity named `id`, preferring one from the same scene.
    async fn resolve(&self, id: &str, scene_id: Option<&str>) -> Result<Instance, String> {
        let mut candidates = self
            .repository
            .execute_data(&DataStatement::FindByAttribute {
                type_name: None,
                attribute: NAME_ATTRIBUTE.to_string(),
                value: Value::string(id),
            })
            .await
            .and_then(|rows| rows.into_instances())
            .map_err(|e| e.to_string())?;
        if let Some(scene) = scene_id {
            let tag = Value::string(scene);
            if let Some(pos) = candidates
                .iter()
                .position(|c| c.values(SCENE_ATTRIBUTE).contains(&tag))
            {
                return Ok(candidates.swap_remove(pos));
            }
        }
        candidates
            .into_iter()
            .next()
            .ok_or_else(|| format!("no entity named {id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{MigrationExecutor, MigrationLog};
    use crate::config::EngineConfig;
    use crate::proposal::base_schema_proposal;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    async fn base_repository() -> Arc<SchemaRepository> {
        let store = Arc::new(MemoryStore::new());
        let repository = Arc::new(
            SchemaRepository::load(store, Duration::from_secs(5))
                .await
                .unwrap(),
        );
        let db = sled::Config::new().temporary(true).open().unwrap();
        let executor = MigrationExecutor::new(
            Arc::clone(&repository),
            MigrationLog::open(&db).unwrap(),
            EngineConfig::new(),
        );
        let plan = executor.plan(base_schema_proposal()).await.unwrap();
        executor.execute(&plan).await.unwrap().ensure_committed().unwrap();
        repository
    }

    fn table_on_floor() -> Observations {
        Observations {
            entities: vec![
                EntityRecord {
                    id: "table_1".into(),
                    type_name: "physical_object".into(),
                    attributes: BTreeMap::from([
                        ("color".into(), json!("brown")),
                        ("weight".into(), json!(12)),
                    ]),
                },
                EntityRecord {
                    id: "floor_1".into(),
                    type_name: "physical_object".into(),
                    attributes: BTreeMap::new(),
                },
            ],
            relations: vec![RelationRecord {
                type_name: "on".into(),
                from: "table_1".into(),
                to: "floor_1".into(),
                from_role: None,
                to_role: None,
            }],
        }
    }

    #[tokio::test]
    async fn test_ingest_and_delete_scene() {
        let repository = base_repository().await;
        let ingestor = Ingestor::new(Arc::clone(&repository));

        let report = ingestor.ingest(&table_on_floor(), Some("kitchen")).await;
        assert_eq!(report.entities_inserted, 2);
        assert_eq!(report.relations_inserted, 1);
        assert_eq!(report.attributes_dropped, 1);
        assert!(report.failures.is_empty());

        let tagged = repository
            .execute_data(&DataStatement::ReadOwners {
                attribute: SCENE_ATTRIBUTE.into(),
            })
            .await
            .unwrap()
            .into_instances()
            .unwrap();
        assert_eq!(tagged.len(), 2);

        assert_eq!(ingestor.delete_scene("kitchen").await.unwrap(), 2);
        let relations = repository
            .execute_data(&DataStatement::CountInstances {
                type_name: "spatial_relation".into(),
                include_subtypes: true,
            })
            .await
            .unwrap()
            .into_count()
            .unwrap();
        assert_eq!(relations, 0);
    }

    #[tokio::test]
    async fn test_bad_records_do_not_stop_batch() {
        let repository = base_repository().await;
        let ingestor = Ingestor::new(repository);
        let mut batch = table_on_floor();
        batch.entities.push(EntityRecord {
            id: "ghost".into(),
            type_name: "spaceship".into(),
            attributes: BTreeMap::new(),
        });
        batch.relations.push(RelationRecord {
            type_name: "on".into(),
            from: "table_1".into(),
            to: "nowhere".into(),
            from_role: None,
            to_role: None,
        });

        let report = ingestor.ingest(&batch, None).await;
        assert_eq!(report.entities_inserted, 2);
        assert_eq!(report.relations_inserted, 1);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].record, "ghost");
    }
}
