//! In-memory store.

use super::state::StoreState;
use super::statement::{DataRows, DataStatement, Instance};
use super::{Store, StoreError};
use crate::schema::{SchemaStatement, TypeDef};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::trace;

/// A volatile store, useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with a schema and instances.
    pub fn with_contents(
        definitions: Vec<TypeDef>,
        instances: impl IntoIterator<Item = Instance>,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            state: RwLock::new(StoreState::from_parts(definitions, instances)?),
        })
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn execute_schema_statement(
        &self,
        statement: &SchemaStatement,
    ) -> Result<(), StoreError> {
        trace!(type_name = statement.target(), kind = %statement.kind(), "schema statement");
        self.state.write().apply_schema(statement)?;
        Ok(())
    }

    async fn current_schema(&self) -> Result<Vec<TypeDef>, StoreError> {
        Ok(self.state.read().definitions())
    }

    async fn execute_data_statement(
        &self,
        statement: &DataStatement,
    ) -> Result<DataRows, StoreError> {
        trace!(%statement, "data statement");
        let (rows, _) = self.state.write().apply_data(statement)?;
        Ok(rows)
    }
}
