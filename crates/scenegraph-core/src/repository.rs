//! Schema repository.
//!
//! Owns the canonical in-memory [`SchemaState`] and is the only path through
//! which statements reach the store. The cached model changes only after a
//! plan commits, or when it is reloaded from the store.

use crate::migration::{MigrationError, MigrationPlan};
use crate::schema::{SchemaState, SchemaStatement};
use crate::store::{DataRows, DataStatement, Store, StoreError};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, instrument, warn};

/// Store access plus the cached schema model.
pub struct SchemaRepository {
    store: Arc<dyn Store>,
    model: RwLock<SchemaState>,
    migrations: Mutex<()>,
    timeout: Duration,
}

impl SchemaRepository {
    /// Load the schema from the store.
    #[instrument(skip(store))]
    pub async fn load(store: Arc<dyn Store>, timeout: Duration) -> Result<Self, MigrationError> {
        let model = Self::introspect(store.as_ref(), timeout).await?;
        debug!(types = model.len(), "loaded schema");
        Ok(Self {
            store,
            model: RwLock::new(model),
            migrations: Mutex::new(()),
            timeout,
        })
    }

    /// A copy of the current schema model.
    pub fn snapshot(&self) -> SchemaState {
        self.model.read().clone()
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Timeout applied to store calls.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Submit one schema statement.
    pub async fn persist(&self, statement: &SchemaStatement) -> Result<(), StoreError> {
        self.bounded(
            format!("schema statement on {}", statement.target()),
            self.store.execute_schema_statement(statement),
        )
        .await
    }

    /// Run one data statement.
    pub async fn execute_data(&self, statement: &DataStatement) -> Result<DataRows, StoreError> {
        self.bounded(statement.to_string(), self.store.execute_data_statement(statement))
            .await
    }

    /// Read the schema as the store currently reports it, without touching the model.
    pub async fn current_schema(&self) -> Result<SchemaState, MigrationError> {
        Self::introspect(self.store.as_ref(), self.timeout).await
    }

    /// Bring the model in line with a committed plan.
    ///
    /// Falls back to a reload if the statements do not replay cleanly.
    pub async fn apply_committed(&self, plan: &MigrationPlan) -> Result<(), MigrationError> {
        let replayed = {
            let mut next = self.model.read().clone();
            plan.operations()
                .iter()
                .try_for_each(|op| next.apply_statement(&op.payload))
                .map(|_| next)
        };
        match replayed {
            Ok(next) => {
                *self.model.write() = next;
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "committed plan did not replay on the cached schema, reloading");
                self.reload().await
            }
        }
    }

    /// Replace the model with the store's schema.
    pub async fn reload(&self) -> Result<(), MigrationError> {
        let model = self.current_schema().await?;
        *self.model.write() = model;
        Ok(())
    }

    /// Serialize migrations. Waiters are served in arrival order.
    pub async fn lock_migrations(&self) -> MutexGuard<'_, ()> {
        self.migrations.lock().await
    }

    async fn introspect(store: &dyn Store, timeout: Duration) -> Result<SchemaState, MigrationError> {
        let definitions = tokio::time::timeout(timeout, store.current_schema())
            .await
            .map_err(|_| StoreError::Timeout {
                operation: "schema introspection".to_string(),
                timeout,
            })??;
        Ok(SchemaState::from_definitions(definitions)?)
    }

    async fn bounded<T>(
        &self,
        operation: String,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                operation,
                timeout: self.timeout,
            }),
        }
    }
}
