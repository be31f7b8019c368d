//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use scenegraph_core::migration::{MigrationExecutor, MigrationLog};
use scenegraph_core::schema::{SchemaStatement, TypeDef, Value};
use scenegraph_core::store::{DataRows, DataStatement, MemoryStore, Store, StoreError};
use scenegraph_core::{EngineConfig, SchemaRepository};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Timeout used by stores under test.
pub const TEST_TIMEOUT: Duration = Duration::from_millis(200);

/// What goes wrong on a faulty call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The store refuses the statement.
    Reject,
    /// The call never returns and does not apply.
    HangBeforeApply,
    /// The statement applies but the reply never arrives.
    HangAfterApply,
}

/// A store that injects faults into chosen calls.
///
/// Schema statements and data writes are counted separately, starting at 1.
/// Reads are never faulted.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    schema_calls: AtomicUsize,
    data_writes: AtomicUsize,
    schema_faults: Mutex<BTreeMap<usize, Fault>>,
    data_faults: Mutex<BTreeMap<usize, Fault>>,
    log: Mutex<Vec<String>>,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inner(inner: MemoryStore) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    /// Fault the `n`th schema statement from now.
    pub fn fail_schema_call(&self, n: usize, fault: Fault) {
        let base = self.schema_calls.load(Ordering::SeqCst);
        self.schema_faults.lock().insert(base + n, fault);
    }

    /// Fault the `n`th data write from now.
    pub fn fail_data_write(&self, n: usize, fault: Fault) {
        let base = self.data_writes.load(Ordering::SeqCst);
        self.data_faults.lock().insert(base + n, fault);
    }

    /// Schema statements received, as TypeQL.
    pub fn schema_log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn schema_call_count(&self) -> usize {
        self.schema_calls.load(Ordering::SeqCst)
    }
}

async fn hang() {
    tokio::time::sleep(Duration::from_secs(60)).await;
}

#[async_trait]
impl Store for FlakyStore {
    async fn execute_schema_statement(&self, statement: &SchemaStatement) -> Result<(), StoreError> {
        let call = self.schema_calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.lock().push(statement.to_typeql());
        let fault = self.schema_faults.lock().remove(&call);
        match fault {
            Some(Fault::Reject) => Err(StoreError::rejected("injected failure")),
            Some(Fault::HangBeforeApply) => {
                hang().await;
                Err(StoreError::Unavailable("hung".into()))
            }
            Some(Fault::HangAfterApply) => {
                self.inner.execute_schema_statement(statement).await?;
                hang().await;
                Ok(())
            }
            None => self.inner.execute_schema_statement(statement).await,
        }
    }

    async fn current_schema(&self) -> Result<Vec<TypeDef>, StoreError> {
        self.inner.current_schema().await
    }

    async fn execute_data_statement(&self, statement: &DataStatement) -> Result<DataRows, StoreError> {
        if statement.is_read() {
            return self.inner.execute_data_statement(statement).await;
        }
        let call = self.data_writes.fetch_add(1, Ordering::SeqCst) + 1;
        let fault = self.data_faults.lock().remove(&call);
        match fault {
            Some(Fault::Reject) => Err(StoreError::rejected("injected failure")),
            Some(Fault::HangBeforeApply) => {
                hang().await;
                Err(StoreError::Unavailable("hung".into()))
            }
            Some(Fault::HangAfterApply) => {
                let rows = self.inner.execute_data_statement(statement).await?;
                hang().await;
                Ok(rows)
            }
            None => self.inner.execute_data_statement(statement).await,
        }
    }
}

/// An executor over `store` with a temporary migration log.
pub async fn executor(store: Arc<dyn Store>, config: EngineConfig) -> MigrationExecutor {
    let repository = SchemaRepository::load(store, TEST_TIMEOUT).await.unwrap();
    let db = sled::Config::new().temporary(true).open().unwrap();
    MigrationExecutor::new(Arc::new(repository), MigrationLog::open(&db).unwrap(), config)
}

/// Default config with the test timeout.
pub fn config() -> EngineConfig {
    EngineConfig::new().with_statement_timeout(TEST_TIMEOUT)
}

/// Insert an instance directly into the store.
pub async fn insert(
    store: &dyn Store,
    type_name: &str,
    attributes: &[(&str, Value)],
) -> String {
    let attributes = attributes
        .iter()
        .map(|(k, v)| (k.to_string(), vec![v.clone()]))
        .collect();
    store
        .execute_data_statement(&DataStatement::InsertInstance {
            type_name: type_name.to_string(),
            attributes,
            role_players: vec![],
            provenance: None,
        })
        .await
        .unwrap()
        .into_inserted()
        .unwrap()
}

/// Type names in the store's schema.
pub async fn type_names(store: &dyn Store) -> BTreeSet<String> {
    store
        .current_schema()
        .await
        .unwrap()
        .iter()
        .map(|def| def.name().to_string())
        .collect()
}
