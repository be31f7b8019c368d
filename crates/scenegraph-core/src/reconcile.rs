//! Reconciler facade.
//!
//! Wires the store, schema repository, migration executor and ingestor
//! together and exposes the end-to-end flow: turn an analysis into a plan,
//! execute it, then insert the observed data.

use crate::config::EngineConfig;
use crate::ingest::{IngestReport, Ingestor, Observations};
use crate::migration::{
    MigrationError, MigrationExecutor, MigrationLog, MigrationPlan, MigrationRecord,
    MigrationResult,
};
use crate::proposal::{base_schema_proposal, Analysis, ChangeProposal, RawAnalysis};
use crate::repository::SchemaRepository;
use crate::schema::SchemaState;
use crate::store::{SledStore, Store};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// The schema evolution engine behind one store.
pub struct Reconciler {
    repository: Arc<SchemaRepository>,
    executor: MigrationExecutor,
    ingestor: Ingestor,
}

impl Reconciler {
    /// Open a sled-backed store at `path`. The migration log lives in the
    /// same database.
    pub async fn open(path: impl AsRef<Path>, config: EngineConfig) -> Result<Self, MigrationError> {
        let store = SledStore::open(path)?;
        let log = MigrationLog::open(store.db())?;
        Self::new(Arc::new(store), log, config).await
    }

    /// Build a reconciler over any store.
    pub async fn new(
        store: Arc<dyn Store>,
        log: MigrationLog,
        config: EngineConfig,
    ) -> Result<Self, MigrationError> {
        let repository = Arc::new(SchemaRepository::load(store, config.statement_timeout).await?);
        if let Some(active) = log.active()? {
            warn!(
                migration_id = %active.id_hex(),
                "found an interrupted migration; resume or abandon it before applying new plans"
            );
        }
        Ok(Self {
            executor: MigrationExecutor::new(Arc::clone(&repository), log, config),
            ingestor: Ingestor::new(Arc::clone(&repository)),
            repository,
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        self.executor.config()
    }

    /// The schema repository.
    pub fn repository(&self) -> &Arc<SchemaRepository> {
        &self.repository
    }

    /// The current schema model.
    pub fn schema(&self) -> SchemaState {
        self.repository.snapshot()
    }

    /// The current schema as TypeQL.
    pub fn render_schema(&self) -> String {
        self.repository.snapshot().render()
    }

    /// Plan a proposal. Reads only.
    pub async fn plan(&self, proposal: ChangeProposal) -> Result<MigrationPlan, MigrationError> {
        self.executor.plan(proposal).await
    }

    /// Parse an analysis document and plan its schema changes.
    pub async fn plan_analysis(
        &self,
        json: &str,
    ) -> Result<(MigrationPlan, Analysis), MigrationError> {
        let analysis =
            RawAnalysis::from_json(json)?.into_analysis(&self.config().boundary_options())?;
        let plan = self
            .plan(analysis.proposal.clone())
            .await?
            .with_leading_warnings(&analysis.warnings);
        Ok((plan, analysis))
    }

    /// Human-readable plan description.
    pub fn preview(&self, plan: &MigrationPlan) -> String {
        MigrationExecutor::preview(plan)
    }

    /// Execute a plan.
    pub async fn execute(&self, plan: &MigrationPlan) -> Result<MigrationResult, MigrationError> {
        self.executor.execute(plan).await
    }

    /// Plan and execute the base scene schema.
    #[instrument(skip(self))]
    pub async fn bootstrap(&self) -> Result<MigrationResult, MigrationError> {
        let result = self.executor.apply(base_schema_proposal()).await?;
        if result.applied_operations.is_empty() {
            info!("base schema already in place");
        }
        result.ensure_committed()
    }

    /// Plan, execute and ingest an analysis in one go.
    ///
    /// Planning and execution share one hold of the migration lock. Data is
    /// ingested only when the migration commits.
    #[instrument(skip(self, json))]
    pub async fn apply_analysis(
        &self,
        json: &str,
        scene_id: Option<&str>,
    ) -> Result<(MigrationResult, IngestReport), MigrationError> {
        let analysis =
            RawAnalysis::from_json(json)?.into_analysis(&self.config().boundary_options())?;
        let mut result = self
            .executor
            .apply(analysis.proposal.clone())
            .await?
            .ensure_committed()?;
        result.warnings.splice(0..0, analysis.warnings.iter().cloned());
        let report = self.ingest(&analysis.all_observations(), scene_id).await;
        Ok((result, report))
    }

    /// Continue an interrupted migration, if there is one.
    pub async fn resume(&self) -> Result<Option<MigrationResult>, MigrationError> {
        self.executor.resume().await
    }

    /// Give up on an interrupted migration.
    pub fn abandon(&self) -> Result<Option<MigrationRecord>, MigrationError> {
        self.executor.log().abandon()
    }

    /// The migration log.
    pub fn migration_log(&self) -> &MigrationLog {
        self.executor.log()
    }

    /// The interrupted migration, if any.
    pub fn active_migration(&self) -> Result<Option<MigrationRecord>, MigrationError> {
        self.executor.log().active()
    }

    /// Every logged migration, oldest first.
    pub fn history(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        self.executor.log().list()
    }

    /// Insert observation records.
    pub async fn ingest(&self, observations: &Observations, scene_id: Option<&str>) -> IngestReport {
        self.ingestor.ingest(observations, scene_id).await
    }

    /// Delete the data tagged with a scene.
    pub async fn delete_scene(&self, scene_id: &str) -> Result<u64, MigrationError> {
        Ok(self.ingestor.delete_scene(scene_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationStatus;

    #[tokio::test]
    async fn test_bootstrap_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let reconciler = Reconciler::open(dir.path(), EngineConfig::new()).await.unwrap();

        let first = reconciler.bootstrap().await.unwrap();
        assert_eq!(first.status, MigrationStatus::Committed);
        assert!(reconciler.schema().contains("physical_object"));
        assert!(reconciler.render_schema().contains("spatial_relation"));

        let second = reconciler.bootstrap().await.unwrap();
        assert!(second.applied_operations.is_empty());
        assert_eq!(reconciler.history().unwrap().len(), 2);
    }
}
