//! Embedded store persisted in sled.

use super::state::{Effects, StoreState};
use super::statement::{DataRows, DataStatement, Instance};
use super::{Store, StoreError};
use crate::error::Error;
use crate::schema::{SchemaStatement, TypeDef};
use async_trait::async_trait;
use parking_lot::Mutex;
use sled::transaction::{ConflictableTransactionResult, TransactionError, Transactional};
use std::path::Path;
use tracing::{debug, trace};

const SCHEMA_KEY: &[u8] = b"definitions";

/// A durable local store.
///
/// The schema lives in the `store:schema` tree, instances in
/// `store:instances` keyed by iid. Both are JSON encoded. A statement's
/// writes are committed in one transaction across the two trees.
pub struct SledStore {
    db: sled::Db,
    schema: sled::Tree,
    instances: sled::Tree,
    state: Mutex<StoreState>,
}

impl SledStore {
    /// Tree holding the schema.
    pub const SCHEMA_TREE: &'static str = "store:schema";
    /// Tree holding instances.
    pub const INSTANCE_TREE: &'static str = "store:instances";

    /// Open or create a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        Self::from_db(&db)
    }

    /// Open the store's trees inside an existing database.
    pub fn from_db(db: &sled::Db) -> Result<Self, StoreError> {
        let schema = db.open_tree(Self::SCHEMA_TREE)?;
        let instances = db.open_tree(Self::INSTANCE_TREE)?;
        let state = Self::load_state(&schema, &instances)?;
        debug!(instances = instances.len(), "opened sled store");
        Ok(Self {
            db: db.clone(),
            schema,
            instances,
            state: Mutex::new(state),
        })
    }

    /// The underlying database.
    pub fn db(&self) -> &sled::Db {
        &self.db
    }

    fn load_state(schema: &sled::Tree, instances: &sled::Tree) -> Result<StoreState, StoreError> {
        let definitions: Vec<TypeDef> = match schema.get(SCHEMA_KEY)? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(Error::from)?,
            None => Vec::new(),
        };
        let mut loaded = Vec::with_capacity(instances.len());
        for entry in instances.iter() {
            let (_, bytes) = entry?;
            let instance: Instance = serde_json::from_slice(&bytes).map_err(Error::from)?;
            loaded.push(instance);
        }
        StoreState::from_parts(definitions, loaded)
    }

    fn persist(&self, state: &StoreState, effects: &Effects) -> Result<(), StoreError> {
        let schema_bytes = if effects.schema_changed {
            Some(serde_json::to_vec(&state.definitions()).map_err(Error::from)?)
        } else {
            None
        };
        let mut upserts = Vec::with_capacity(effects.upserted.len());
        for iid in &effects.upserted {
            if let Some(instance) = state.instance(iid) {
                upserts.push((iid.clone(), serde_json::to_vec(instance).map_err(Error::from)?));
            }
        }

        (&self.schema, &self.instances)
            .transaction(|(schema, instances)| -> ConflictableTransactionResult<(), ()> {
                if let Some(bytes) = &schema_bytes {
                    schema.insert(SCHEMA_KEY, bytes.as_slice())?;
                }
                for iid in &effects.removed {
                    instances.remove(iid.as_bytes())?;
                }
                for (iid, bytes) in &upserts {
                    instances.insert(iid.as_bytes(), bytes.as_slice())?;
                }
                Ok(())
            })
            .map_err(|e| match e {
                TransactionError::Storage(err) => StoreError::from(err),
                TransactionError::Abort(()) => StoreError::Unavailable("transaction aborted".into()),
            })
    }

    /// Persist the outcome of a statement, reloading from disk if the write fails
    /// so memory never runs ahead of what is stored.
    fn commit(&self, state: &mut StoreState, effects: Effects) -> Result<(), StoreError> {
        if let Err(err) = self.persist(state, &effects) {
            *state = Self::load_state(&self.schema, &self.instances)?;
            return Err(err);
        }
        Ok(())
    }
}

#[async_trait]
impl Store for SledStore {
    async fn execute_schema_statement(
        &self,
        statement: &SchemaStatement,
    ) -> Result<(), StoreError> {
        trace!(type_name = statement.target(), kind = %statement.kind(), "schema statement");
        {
            let mut state = self.state.lock();
            let effects = state.apply_schema(statement)?;
            self.commit(&mut state, effects)?;
        }
        self.db.flush_async().await?;
        Ok(())
    }

    async fn current_schema(&self) -> Result<Vec<TypeDef>, StoreError> {
        Ok(self.state.lock().definitions())
    }

    async fn execute_data_statement(
        &self,
        statement: &DataStatement,
    ) -> Result<DataRows, StoreError> {
        trace!(%statement, "data statement");
        let mut state = self.state.lock();
        let (rows, effects) = state.apply_data(statement)?;
        if !statement.is_read() {
            self.commit(&mut state, effects)?;
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeTypeDef, EntityTypeDef, Value, ValueKind};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SledStore::open(dir.path()).unwrap();
            store
                .execute_schema_statement(&SchemaStatement::define(AttributeTypeDef::new(
                    "color",
                    ValueKind::String,
                )))
                .await
                .unwrap();
            store
                .execute_schema_statement(&SchemaStatement::define(
                    EntityTypeDef::new("chair").with_owns("color"),
                ))
                .await
                .unwrap();
            store
                .execute_data_statement(&DataStatement::InsertInstance {
                    type_name: "chair".into(),
                    attributes: BTreeMap::from([("color".to_string(), vec![Value::string("red")])]),
                    role_players: vec![],
                    provenance: None,
                })
                .await
                .unwrap();
        }

        let store = SledStore::open(dir.path()).unwrap();
        assert_eq!(store.current_schema().await.unwrap().len(), 2);
        let count = store
            .execute_data_statement(&DataStatement::CountInstances {
                type_name: "chair".into(),
                include_subtypes: false,
            })
            .await
            .unwrap()
            .into_count()
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_rejected_statement_is_not_persisted() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = SledStore::from_db(&db).unwrap();
        let err = store
            .execute_schema_statement(&SchemaStatement::define(
                EntityTypeDef::new("chair").with_owns("color"),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Schema(_)));
        assert!(store.current_schema().await.unwrap().is_empty());
        assert!(db.open_tree(SledStore::SCHEMA_TREE).unwrap().is_empty());
    }
}
