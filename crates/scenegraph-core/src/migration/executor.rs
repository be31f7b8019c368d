//! Migration executor - plans proposals and applies plans to the store.
//!
//! Operations run one at a time in plan order. Each operation's data steps
//! and statement are tracked in an undo log so that a failure can be
//! compensated for the failing operation. Operations that already committed
//! are left in place and reported.

use super::data::{DataMigrationPlanner, InstanceCounts};
use super::error::MigrationError;
use super::log::{MigrationLog, MigrationRecord, MigrationStatus};
use super::normalize::ProposalNormalizer;
use super::plan::{Fingerprint, MigrationPlan, MigrationStep, Operation, StepPhase};
use super::resolve::DependencyResolver;
use crate::config::EngineConfig;
use crate::error::current_timestamp;
use crate::proposal::ChangeProposal;
use crate::repository::SchemaRepository;
use crate::schema::{OperationKind, SchemaState, SchemaStatement, Value};
use crate::store::{DataRows, DataStatement, Instance, Provenance, StoreError};
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Outcome of one compensation action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationOutcome {
    /// The action was carried out.
    Succeeded,
    /// The action failed.
    Failed(String),
    /// The action was not attempted.
    Skipped(String),
}

/// A compensation action taken after a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationAction {
    /// What was reverted.
    pub description: String,
    /// How it went.
    pub outcome: CompensationOutcome,
}

impl fmt::Display for CompensationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.outcome {
            CompensationOutcome::Succeeded => write!(f, "{}: ok", self.description),
            CompensationOutcome::Failed(err) => write!(f, "{}: failed ({err})", self.description),
            CompensationOutcome::Skipped(why) => write!(f, "{}: skipped ({why})", self.description),
        }
    }
}

/// Progress of one data step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    /// Owning operation id.
    pub operation: String,
    /// Step name.
    pub step: &'static str,
    /// Items processed in this run.
    pub processed: u64,
    /// Items counted at planning time.
    pub expected: u64,
}

/// Result of executing a plan.
#[derive(Debug)]
pub struct MigrationResult {
    /// Fingerprint of the executed plan.
    pub fingerprint: Fingerprint,
    /// Final status.
    pub status: MigrationStatus,
    /// Ids of the operations that committed.
    pub applied_operations: Vec<String>,
    /// The operation that failed.
    pub failing_operation: Option<Operation>,
    /// Why it failed.
    pub error: Option<MigrationError>,
    /// Compensation taken for the failing operation.
    pub compensation: Vec<CompensationAction>,
    /// Data step progress.
    pub step_reports: Vec<StepReport>,
    /// Ids of the operations never attempted.
    pub not_attempted: Vec<String>,
    /// Warnings from planning and execution.
    pub warnings: Vec<String>,
    /// Start time (microseconds since epoch).
    pub started_at: u64,
    /// End time (microseconds since epoch).
    pub finished_at: u64,
}

impl MigrationResult {
    /// Whether every operation committed.
    pub fn is_committed(&self) -> bool {
        self.status == MigrationStatus::Committed
    }

    /// Instances copied to a new type or whose values were converted.
    pub fn instances_migrated(&self) -> u64 {
        migrated(&self.step_reports)
    }

    /// Turn anything short of a commit into an error.
    pub fn ensure_committed(self) -> Result<Self, MigrationError> {
        if self.is_committed() {
            return Ok(self);
        }
        let failed = match (&self.failing_operation, &self.error) {
            (Some(op), Some(err)) => format!("{}: {err}", op.id),
            (Some(op), None) => op.id.clone(),
            (None, _) => "unknown".to_string(),
        };
        Err(MigrationError::PartialMigration {
            fingerprint: self.fingerprint.to_hex(),
            applied: self.applied_operations.len(),
            failed,
        })
    }
}

/// How to undo a piece of a data step.
#[derive(Debug, Clone)]
enum UndoAction {
    /// Point relations back at the source and delete the copy.
    RemoveCopy { copy: String, source: String },
    /// Put back values that were removed.
    RestoreValues {
        iid: String,
        attribute: String,
        values: Vec<Value>,
    },
    /// Remove values that were written.
    DropValues { iid: String, attribute: String },
    /// Something that cannot be undone happened.
    Irreversible(String),
}

/// Undo bookkeeping for the operation being executed.
struct OperationProgress {
    before: SchemaState,
    statement_committed: bool,
    undo: Vec<UndoAction>,
}

impl OperationProgress {
    fn new(before: SchemaState) -> Self {
        Self {
            before,
            statement_committed: false,
            undo: Vec::new(),
        }
    }
}

/// Plans and executes schema migrations.
pub struct MigrationExecutor {
    repository: Arc<SchemaRepository>,
    log: MigrationLog,
    config: EngineConfig,
}

impl MigrationExecutor {
    /// Create a new migration executor.
    pub fn new(repository: Arc<SchemaRepository>, log: MigrationLog, config: EngineConfig) -> Self {
        Self {
            repository,
            log,
            config,
        }
    }

    /// The schema repository.
    pub fn repository(&self) -> &Arc<SchemaRepository> {
        &self.repository
    }

    /// The migration log.
    pub fn log(&self) -> &MigrationLog {
        &self.log
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Plan a proposal against the current schema.
    ///
    /// Only reads from the store.
    #[instrument(skip(self, proposal))]
    pub async fn plan(&self, proposal: ChangeProposal) -> Result<MigrationPlan, MigrationError> {
        proposal.validate()?;
        let fingerprint = Fingerprint::of(&proposal)?;
        let state = self.repository.snapshot();
        let base_schema = Fingerprint::of_schema(&state)?;

        let changes = ProposalNormalizer::normalize(&state, &proposal)?;
        let operations = DependencyResolver::resolve(&state, &changes)?;
        let counts = InstanceCounts::gather(
            &self.repository,
            &state,
            DataMigrationPlanner::required_counts(&changes),
        )
        .await?;
        let data = DataMigrationPlanner::plan(&state, &changes, operations, &counts)?;

        let skipped = changes.skipped.iter().map(ToString::to_string).collect();
        let mut warnings = changes.warnings.clone();
        warnings.extend(data.warnings);

        let plan = MigrationPlan::new(
            Arc::new(proposal),
            fingerprint,
            base_schema,
            data.operations,
            skipped,
            warnings,
        );
        info!(
            fingerprint = %fingerprint.short(),
            operations = plan.operations().len(),
            skipped = plan.skipped().len(),
            data_steps = plan.data_migration_count(),
            "planned migration"
        );
        Ok(plan)
    }

    /// Human-readable description of a plan.
    pub fn preview(plan: &MigrationPlan) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "plan {}: {}", plan.fingerprint().short(), plan.summary());
        for op in plan.operations() {
            let marker = match op.kind {
                OperationKind::Define => '+',
                OperationKind::Redefine => '~',
                OperationKind::Undefine => '-',
            };
            let _ = writeln!(out, "{marker} {}", op.id);
            let _ = writeln!(out, "    {}", op.payload.to_typeql());
            for step in &op.migration_steps {
                let _ = writeln!(out, "  > {step}");
            }
        }
        for skipped in plan.skipped() {
            let _ = writeln!(out, "= {skipped}");
        }
        for warning in plan.warnings() {
            let _ = writeln!(out, "! {warning}");
        }
        out
    }

    /// Execute a plan.
    ///
    /// Returns an error only if the plan could not start. Failures during
    /// execution are reported in the result.
    ///
    /// A plan derived from an older schema is planned again. The fresh plan
    /// runs if it is empty or sends the same operations; otherwise the call
    /// fails with a conflict and nothing is touched.
    #[instrument(skip(self, plan), fields(fingerprint = %plan.fingerprint().short()))]
    pub async fn execute(&self, plan: &MigrationPlan) -> Result<MigrationResult, MigrationError> {
        let _guard = self.repository.lock_migrations().await;
        self.ensure_idle()?;

        let current = Fingerprint::of_schema(&self.repository.snapshot())?;
        if current == plan.base_schema() {
            return self.start(plan).await;
        }
        let fresh = self.plan(plan.proposal().clone()).await?;
        if !fresh.is_empty() && !fresh.same_operations(plan) {
            return Err(MigrationError::conflict(format!(
                "schema changed since plan {} was made; plan the proposal again",
                plan.fingerprint().short()
            )));
        }
        info!(
            operations = fresh.operations().len(),
            "schema changed since planning, running a fresh plan"
        );
        self.start(&fresh).await
    }

    /// Plan and execute a proposal under one hold of the migration lock.
    #[instrument(skip(self, proposal))]
    pub async fn apply(&self, proposal: ChangeProposal) -> Result<MigrationResult, MigrationError> {
        let _guard = self.repository.lock_migrations().await;
        self.ensure_idle()?;
        let plan = self.plan(proposal).await?;
        self.start(&plan).await
    }

    fn ensure_idle(&self) -> Result<(), MigrationError> {
        match self.log.active()? {
            Some(active) => Err(MigrationError::MigrationInProgress {
                migration_id: active.id_hex(),
            }),
            None => Ok(()),
        }
    }

    async fn start(&self, plan: &MigrationPlan) -> Result<MigrationResult, MigrationError> {
        self.check_destructive(plan)?;
        let record = MigrationRecord::begin(plan)?;
        self.run(plan, record).await
    }

    /// Re-plan and continue the migration left in progress, if any.
    #[instrument(skip(self))]
    pub async fn resume(&self) -> Result<Option<MigrationResult>, MigrationError> {
        let _guard = self.repository.lock_migrations().await;
        let Some(mut record) = self.log.active()? else {
            return Ok(None);
        };
        let proposal: ChangeProposal = serde_json::from_str(&record.proposal_json)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))?;

        // The store may be ahead of the cached model after an interruption.
        self.repository.reload().await?;
        let plan = self.plan(proposal).await?;
        if plan.fingerprint().to_hex() != record.fingerprint {
            return Err(MigrationError::conflict(format!(
                "logged proposal does not match fingerprint {}",
                record.fingerprint
            )));
        }
        self.check_destructive(&plan)?;
        info!(
            migration_id = %record.id_hex(),
            remaining = plan.operations().len(),
            "resuming migration"
        );
        record.operations = plan.operations().iter().map(|op| op.id.clone()).collect();
        record.failed = None;
        record.error = None;
        self.run(&plan, record).await.map(Some)
    }

    fn check_destructive(&self, plan: &MigrationPlan) -> Result<(), MigrationError> {
        if self.config.allow_destructive {
            return Ok(());
        }
        match plan.operations().iter().find(|op| op.is_destructive()) {
            Some(op) => Err(MigrationError::UnsafeOperation {
                operation: op.id.clone(),
                reason: "deletes stored data; enable allow_destructive to proceed".to_string(),
            }),
            None => Ok(()),
        }
    }

    async fn run(
        &self,
        plan: &MigrationPlan,
        mut record: MigrationRecord,
    ) -> Result<MigrationResult, MigrationError> {
        let started_at = current_timestamp();
        let fingerprint = plan.fingerprint().to_hex();
        self.log.save(&record)?;
        info!(
            migration_id = %record.id_hex(),
            operations = plan.operations().len(),
            destructive = plan.is_destructive(),
            "starting migration"
        );

        let mut working = self.repository.snapshot();
        let mut reports = Vec::new();
        let mut warnings = plan.warnings().to_vec();
        let mut applied = Vec::new();
        let mut failure = None;

        for (index, op) in plan.operations().iter().enumerate() {
            let mut progress = OperationProgress::new(working.clone());
            match self
                .apply_operation(op, &fingerprint, &mut working, &mut progress, &mut reports)
                .await
            {
                Ok(()) => {
                    debug!(operation = %op.id, "operation committed");
                    applied.push(op.id.clone());
                    record.applied.push(op.id.clone());
                    record.instances_migrated = migrated(&reports);
                    self.save_progress(&record, &mut warnings);
                }
                Err(err) => {
                    warn!(operation = %op.id, error = %err, "operation failed");
                    failure = Some((index, op, err, progress));
                    break;
                }
            }
        }

        for report in reports.iter().filter(|r| r.processed != r.expected) {
            warnings.push(format!(
                "{} {}: processed {} of {} counted at planning time",
                report.operation, report.step, report.processed, report.expected
            ));
        }

        let (status, failing_operation, error, compensation, not_attempted) = match failure {
            None => {
                if let Err(err) = self.repository.apply_committed(plan).await {
                    warn!(error = %err, "could not refresh schema after commit");
                }
                (MigrationStatus::Committed, None, None, Vec::new(), Vec::new())
            }
            Some((index, op, err, progress)) => {
                let (compensation, complete) = self.compensate(op, &progress).await;
                let status = if index == 0 && complete {
                    MigrationStatus::RolledBack
                } else {
                    MigrationStatus::PartiallyApplied
                };
                if let Err(reload) = self.repository.reload().await {
                    warn!(error = %reload, "could not reload schema after failed migration");
                }
                let not_attempted = plan.operations()[index + 1..]
                    .iter()
                    .map(|op| op.id.clone())
                    .collect();
                record.failed = Some(op.id.clone());
                record.error = Some(err.to_string());
                record.compensation = compensation.iter().map(ToString::to_string).collect();
                (status, Some(op.clone()), Some(err), compensation, not_attempted)
            }
        };

        record.instances_migrated = migrated(&reports);
        record.finish(status);
        self.save_progress(&record, &mut warnings);

        info!(
            migration_id = %record.id_hex(),
            status = %status,
            applied = applied.len(),
            instances_migrated = record.instances_migrated,
            "migration finished"
        );

        Ok(MigrationResult {
            fingerprint: plan.fingerprint(),
            status,
            applied_operations: applied,
            failing_operation,
            error,
            compensation,
            step_reports: reports,
            not_attempted,
            warnings,
            started_at,
            finished_at: current_timestamp(),
        })
    }

    /// Write a record after the store has been touched. Failures become warnings.
    fn save_progress(&self, record: &MigrationRecord, warnings: &mut Vec<String>) {
        if let Err(err) = self.log.save(record) {
            warn!(migration_id = %record.id_hex(), error = %err, "could not update migration log");
            warnings.push(format!(
                "migration log not updated for {}: {err}",
                record.id_hex()
            ));
        }
    }

    async fn apply_operation(
        &self,
        op: &Operation,
        fingerprint: &str,
        working: &mut SchemaState,
        progress: &mut OperationProgress,
        reports: &mut Vec<StepReport>,
    ) -> Result<(), MigrationError> {
        for step in op
            .migration_steps
            .iter()
            .filter(|s| s.phase() == StepPhase::BeforeStatement)
        {
            let report = self.run_step(op, step, fingerprint, working, progress).await?;
            reports.push(report);
        }

        self.run_statement(op).await?;
        progress.statement_committed = true;
        working.apply_statement(&op.payload)?;

        for step in op
            .migration_steps
            .iter()
            .filter(|s| s.phase() == StepPhase::AfterStatement)
        {
            let report = self.run_step(op, step, fingerprint, working, progress).await?;
            reports.push(report);
        }
        Ok(())
    }

    /// Submit a statement, retrying after timeouts where that is safe.
    async fn run_statement(&self, op: &Operation) -> Result<(), MigrationError> {
        let execution = |source: StoreError| MigrationError::Execution {
            operation: op.id.clone(),
            source,
        };
        let retries = match op.kind {
            OperationKind::Define | OperationKind::Redefine => self.config.max_define_retries,
            OperationKind::Undefine => 1,
        };
        let mut attempt = 0;
        loop {
            let err = match self.repository.persist(&op.payload).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_ambiguous() && attempt < retries => err,
                Err(err) => return Err(execution(err)),
            };
            attempt += 1;
            if op.kind == OperationKind::Undefine {
                let schema = self.repository.current_schema().await?;
                if removal_landed(&op.payload, &schema) {
                    debug!(operation = %op.id, "timed out statement had applied");
                    return Ok(());
                }
            }
            warn!(operation = %op.id, attempt, error = %err, "schema statement timed out, retrying");
        }
    }

    async fn run_step(
        &self,
        op: &Operation,
        step: &MigrationStep,
        fingerprint: &str,
        working: &SchemaState,
        progress: &mut OperationProgress,
    ) -> Result<StepReport, MigrationError> {
        let processed = match step {
            MigrationStep::MigrateInstances {
                from_type, to_type, ..
            } => {
                let sources = self.read_exact(&op.id, from_type).await?;
                let copies = self.copies(&op.id, fingerprint, to_type).await?;
                let mut processed = 0;
                for source in sources {
                    let copy = match copies.get(&source.iid) {
                        Some(copy) => copy.clone(),
                        None => {
                            let copy = self
                                .write(
                                    &op.id,
                                    DataStatement::InsertInstance {
                                        type_name: to_type.clone(),
                                        attributes: source.attributes.clone(),
                                        role_players: source.role_players.clone(),
                                        provenance: Some(Provenance {
                                            fingerprint: fingerprint.to_string(),
                                            source_iid: source.iid.clone(),
                                        }),
                                    },
                                )
                                .await?
                                .into_inserted()
                                .map_err(|source| MigrationError::Execution {
                                    operation: op.id.clone(),
                                    source,
                                })?;
                            progress.undo.push(UndoAction::RemoveCopy {
                                copy: copy.clone(),
                                source: source.iid.clone(),
                            });
                            copy
                        }
                    };
                    self.write(
                        &op.id,
                        DataStatement::ReplaceRolePlayer {
                            from: source.iid.clone(),
                            to: copy,
                        },
                    )
                    .await?;
                    processed += 1;
                }
                processed
            }
            MigrationStep::DeleteMigrated {
                from_type, to_type, ..
            } => {
                let sources = self.read_exact(&op.id, from_type).await?;
                let copies = self.copies(&op.id, fingerprint, to_type).await?;
                let uncopied = sources
                    .iter()
                    .filter(|s| !copies.contains_key(&s.iid))
                    .count();
                if uncopied > 0 {
                    return Err(MigrationError::conflict(format!(
                        "{uncopied} {from_type} instance(s) have no copy in {to_type}"
                    )));
                }
                if !sources.is_empty() {
                    progress.undo.push(UndoAction::Irreversible(format!(
                        "original {from_type} instances deleted"
                    )));
                }
                let mut processed = 0;
                for source in sources {
                    self.write(&op.id, DataStatement::DeleteInstance { iid: source.iid })
                        .await?;
                    processed += 1;
                }
                processed
            }
            MigrationStep::ConvertValues {
                from_attribute,
                to_attribute,
                to_kind,
                ..
            } => {
                let owners = self.owners(&op.id, from_attribute).await?;
                let mut converted = Vec::with_capacity(owners.len());
                for owner in owners.iter().filter(|o| !o.has(to_attribute)) {
                    let values = owner
                        .values(from_attribute)
                        .iter()
                        .map(|v| v.convert_to(*to_kind))
                        .collect::<Result<Vec<_>, _>>()
                        .map_err(|e| {
                            MigrationError::conflict(format!("{} on {}: {e}", from_attribute, owner.iid))
                        })?;
                    converted.push((owner.iid.clone(), values));
                }
                let mut processed = 0;
                for (iid, values) in converted {
                    self.write(
                        &op.id,
                        DataStatement::PutAttribute {
                            iid: iid.clone(),
                            attribute: to_attribute.clone(),
                            values,
                        },
                    )
                    .await?;
                    progress.undo.push(UndoAction::DropValues {
                        iid,
                        attribute: to_attribute.clone(),
                    });
                    processed += 1;
                }
                processed
            }
            MigrationStep::ClearConverted {
                attribute,
                converted_into,
                ..
            } => {
                let owners = self.owners(&op.id, attribute).await?;
                if let Some(stray) = owners.iter().find(|o| !o.has(converted_into)) {
                    return Err(MigrationError::conflict(format!(
                        "{} holds {attribute} without a converted {converted_into} value",
                        stray.iid
                    )));
                }
                self.remove_values(&op.id, owners, attribute, progress).await?
            }
            MigrationStep::PurgeInstances { type_name, .. } => {
                let doomed = self.read_exact(&op.id, type_name).await?;
                if !doomed.is_empty() {
                    progress
                        .undo
                        .push(UndoAction::Irreversible(format!("{type_name} instances purged")));
                }
                let mut processed = 0;
                for instance in doomed {
                    self.write(&op.id, DataStatement::DeleteInstance { iid: instance.iid })
                        .await?;
                    processed += 1;
                }
                processed
            }
            MigrationStep::PurgeValues {
                attribute, owner, ..
            } => {
                let holders = self
                    .owners(&op.id, attribute)
                    .await?
                    .into_iter()
                    .filter(|i| working.is_subtype_of(&i.type_name, owner))
                    .collect();
                self.remove_values(&op.id, holders, attribute, progress).await?
            }
        };
        debug!(operation = %op.id, step = step.name(), processed, "data step finished");
        Ok(StepReport {
            operation: op.id.clone(),
            step: step.name(),
            processed,
            expected: step.expected(),
        })
    }

    async fn remove_values(
        &self,
        operation: &str,
        holders: Vec<Instance>,
        attribute: &str,
        progress: &mut OperationProgress,
    ) -> Result<u64, MigrationError> {
        let mut processed = 0;
        for holder in holders {
            let values = holder.values(attribute).to_vec();
            self.write(
                operation,
                DataStatement::RemoveAttribute {
                    iid: holder.iid.clone(),
                    attribute: attribute.to_string(),
                },
            )
            .await?;
            progress.undo.push(UndoAction::RestoreValues {
                iid: holder.iid,
                attribute: attribute.to_string(),
                values,
            });
            processed += 1;
        }
        Ok(processed)
    }

    /// Revert what the failing operation did.
    ///
    /// Returns the actions taken and whether the operation is fully undone.
    async fn compensate(
        &self,
        op: &Operation,
        progress: &OperationProgress,
    ) -> (Vec<CompensationAction>, bool) {
        let mut actions = Vec::new();

        if let Some(reason) = progress.undo.iter().find_map(|u| match u {
            UndoAction::Irreversible(reason) => Some(reason.clone()),
            _ => None,
        }) {
            actions.push(CompensationAction {
                description: format!("revert data steps of {}", op.id),
                outcome: CompensationOutcome::Skipped(reason),
            });
            return (actions, false);
        }

        let mut complete = true;
        for undo in progress.undo.iter().rev() {
            let (description, statements) = match undo {
                UndoAction::RemoveCopy { copy, source } => (
                    format!("remove migrated copy {copy} of {source}"),
                    vec![
                        DataStatement::ReplaceRolePlayer {
                            from: copy.clone(),
                            to: source.clone(),
                        },
                        DataStatement::DeleteInstance { iid: copy.clone() },
                    ],
                ),
                UndoAction::RestoreValues {
                    iid,
                    attribute,
                    values,
                } => (
                    format!("restore {attribute} on {iid}"),
                    vec![DataStatement::PutAttribute {
                        iid: iid.clone(),
                        attribute: attribute.clone(),
                        values: values.clone(),
                    }],
                ),
                UndoAction::DropValues { iid, attribute } => (
                    format!("drop converted {attribute} on {iid}"),
                    vec![DataStatement::RemoveAttribute {
                        iid: iid.clone(),
                        attribute: attribute.clone(),
                    }],
                ),
                UndoAction::Irreversible(_) => continue,
            };
            let mut outcome = CompensationOutcome::Succeeded;
            for statement in &statements {
                if let Err(err) = self.repository.execute_data(statement).await {
                    outcome = CompensationOutcome::Failed(err.to_string());
                    complete = false;
                    break;
                }
            }
            actions.push(CompensationAction {
                description,
                outcome,
            });
        }

        if progress.statement_committed {
            if !complete {
                actions.push(CompensationAction {
                    description: format!("revert statement of {}", op.id),
                    outcome: CompensationOutcome::Skipped("data steps not reverted".to_string()),
                });
                return (actions, false);
            }
            for statement in op.payload.inverse(&progress.before) {
                let description = format!("apply {}", statement.to_typeql());
                let outcome = match self.repository.persist(&statement).await {
                    Ok(()) => CompensationOutcome::Succeeded,
                    Err(err) => {
                        complete = false;
                        CompensationOutcome::Failed(err.to_string())
                    }
                };
                actions.push(CompensationAction {
                    description,
                    outcome,
                });
            }
        }

        for action in &actions {
            debug!(operation = %op.id, action = %action, "compensation");
        }
        (actions, complete)
    }

    async fn submit(&self, operation: &str, statement: DataStatement) -> Result<DataRows, MigrationError> {
        self.repository
            .execute_data(&statement)
            .await
            .map_err(|source| MigrationError::Execution {
                operation: operation.to_string(),
                source,
            })
    }

    async fn read_instances(
        &self,
        operation: &str,
        statement: DataStatement,
    ) -> Result<Vec<Instance>, MigrationError> {
        self.submit(operation, statement)
            .await?
            .into_instances()
            .map_err(|source| MigrationError::Execution {
                operation: operation.to_string(),
                source,
            })
    }

    async fn read_exact(&self, operation: &str, type_name: &str) -> Result<Vec<Instance>, MigrationError> {
        self.read_instances(
            operation,
            DataStatement::ReadInstances {
                type_name: type_name.to_string(),
                include_subtypes: false,
            },
        )
        .await
    }

    async fn owners(&self, operation: &str, attribute: &str) -> Result<Vec<Instance>, MigrationError> {
        self.read_instances(
            operation,
            DataStatement::ReadOwners {
                attribute: attribute.to_string(),
            },
        )
        .await
    }

    /// Copies already written by this migration, keyed by source iid.
    async fn copies(
        &self,
        operation: &str,
        fingerprint: &str,
        type_name: &str,
    ) -> Result<BTreeMap<String, String>, MigrationError> {
        Ok(self
            .read_instances(
                operation,
                DataStatement::FindMigrated {
                    fingerprint: fingerprint.to_string(),
                    type_name: type_name.to_string(),
                },
            )
            .await?
            .into_iter()
            .filter_map(|copy| copy.provenance.map(|p| (p.source_iid, copy.iid)))
            .collect())
    }

    /// Run a data write. After a timeout, check whether it applied and
    /// retry once if it did not.
    async fn write(&self, operation: &str, statement: DataStatement) -> Result<DataRows, MigrationError> {
        let err = match self.repository.execute_data(&statement).await {
            Ok(rows) => return Ok(rows),
            Err(err) if err.is_ambiguous() => err,
            Err(source) => {
                return Err(MigrationError::Execution {
                    operation: operation.to_string(),
                    source,
                })
            }
        };
        if let Some(rows) = self.write_landed(operation, &statement).await? {
            debug!(operation, statement = %statement, "timed out write had applied");
            return Ok(rows);
        }
        warn!(operation, statement = %statement, error = %err, "data write timed out, retrying");
        self.submit(operation, statement).await
    }

    async fn write_landed(
        &self,
        operation: &str,
        statement: &DataStatement,
    ) -> Result<Option<DataRows>, MigrationError> {
        let fetch = |iid: &str| {
            self.read_instances(
                operation,
                DataStatement::GetInstance {
                    iid: iid.to_string(),
                },
            )
        };
        Ok(match statement {
            DataStatement::InsertInstance {
                type_name,
                provenance: Some(provenance),
                ..
            } => self
                .copies(operation, &provenance.fingerprint, type_name)
                .await?
                .remove(&provenance.source_iid)
                .map(DataRows::Inserted),
            DataStatement::DeleteInstance { iid } => fetch(iid)
                .await?
                .is_empty()
                .then_some(DataRows::Affected(1)),
            DataStatement::PutAttribute {
                iid,
                attribute,
                values,
            } => fetch(iid)
                .await?
                .first()
                .is_some_and(|i| i.values(attribute) == values.as_slice())
                .then_some(DataRows::Affected(1)),
            DataStatement::RemoveAttribute { iid, attribute } => fetch(iid)
                .await?
                .first()
                .map_or(true, |i| !i.has(attribute))
                .then_some(DataRows::Affected(1)),
            _ => None,
        })
    }
}

fn migrated(reports: &[StepReport]) -> u64 {
    reports
        .iter()
        .filter(|r| matches!(r.step, "migrate-instances" | "convert-values"))
        .map(|r| r.processed)
        .sum()
}

/// Whether a removal statement is reflected in `schema`.
fn removal_landed(statement: &SchemaStatement, schema: &SchemaState) -> bool {
    match statement {
        SchemaStatement::RemoveOwns { owner, attribute } => !schema.directly_owns(owner, attribute),
        SchemaStatement::RemovePlays { player, role } => !schema.directly_plays(player, role),
        SchemaStatement::RemoveRelates { relation, role } => schema
            .get(relation)
            .map_or(true, |def| !def.relates().contains(role)),
        SchemaStatement::UndefineType { definition } => !schema.contains(definition.name()),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::{Retype, TypeModification};
    use crate::schema::{AttributeTypeDef, EntityTypeDef, RoleRef, ValueKind};
    use crate::store::{MemoryStore, Store};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    async fn executor_with(store: Arc<MemoryStore>, config: EngineConfig) -> MigrationExecutor {
        let repository = SchemaRepository::load(store, Duration::from_secs(5))
            .await
            .unwrap();
        let db = sled::Config::new().temporary(true).open().unwrap();
        MigrationExecutor::new(Arc::new(repository), MigrationLog::open(&db).unwrap(), config)
    }

    fn furniture() -> ChangeProposal {
        ChangeProposal::new()
            .with_attribute(AttributeTypeDef::new("color", ValueKind::String))
            .with_entity(EntityTypeDef::new("chair").with_owns("color"))
    }

    #[tokio::test]
    async fn test_execute_commits_and_updates_model() {
        let store = Arc::new(MemoryStore::new());
        let executor = executor_with(Arc::clone(&store), EngineConfig::new()).await;
        let plan = executor.plan(furniture()).await.unwrap();
        assert_eq!(plan.operations().len(), 2);

        let result = executor.execute(&plan).await.unwrap();
        assert_eq!(result.status, MigrationStatus::Committed);
        assert_eq!(result.applied_operations, vec!["define:color", "define:chair"]);
        assert!(executor.repository().snapshot().directly_owns("chair", "color"));

        let schema = store.current_schema().await.unwrap();
        assert_eq!(schema.len(), 2);

        let history = executor.log().list().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, MigrationStatus::Committed);
    }

    #[tokio::test]
    async fn test_replanning_after_commit_is_empty() {
        let store = Arc::new(MemoryStore::new());
        let executor = executor_with(store, EngineConfig::new()).await;
        let plan = executor.plan(furniture()).await.unwrap();
        executor.execute(&plan).await.unwrap().ensure_committed().unwrap();

        let again = executor.plan(furniture()).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(again.skipped().len(), 2);
    }

    #[tokio::test]
    async fn test_preview_lists_operations() {
        let store = Arc::new(MemoryStore::new());
        let executor = executor_with(store, EngineConfig::new()).await;
        let plan = executor.plan(furniture()).await.unwrap();
        let preview = MigrationExecutor::preview(&plan);
        assert!(preview.contains("+ define:color"));
        assert!(preview.contains("+ define:chair"));
    }

    #[tokio::test]
    async fn test_reclassify_moves_instances() {
        let gadget_type = EntityTypeDef::new("gadget")
            .with_owns("color")
            .with_plays(RoleRef::new("near", "subject"));
        let store = Arc::new(MemoryStore::new());
        let executor = executor_with(Arc::clone(&store), EngineConfig::new()).await;
        let setup = ChangeProposal::new()
            .with_attribute(AttributeTypeDef::new("color", ValueKind::String))
            .with_relation(
                crate::schema::RelationTypeDef::new("near")
                    .with_relates("subject")
                    .with_relates("reference"),
            )
            .with_entity(gadget_type);
        let plan = executor.plan(setup).await.unwrap();
        executor.execute(&plan).await.unwrap().ensure_committed().unwrap();

        let gadget = store
            .execute_data_statement(&DataStatement::InsertInstance {
                type_name: "gadget".into(),
                attributes: BTreeMap::from([("color".into(), vec![Value::string("red")])]),
                role_players: vec![],
                provenance: None,
            })
            .await
            .unwrap()
            .into_inserted()
            .unwrap();

        let rename = ChangeProposal::new().with_modification(
            TypeModification::new("gadget").with_retype(Retype::Reclassify {
                into: "device".into(),
                supertype: None,
            }),
        );
        let plan = executor.plan(rename).await.unwrap();
        assert_eq!(plan.data_migration_count(), 1);
        let result = executor.execute(&plan).await.unwrap().ensure_committed().unwrap();
        assert_eq!(result.instances_migrated(), 1);

        let devices = store
            .execute_data_statement(&DataStatement::ReadInstances {
                type_name: "device".into(),
                include_subtypes: false,
            })
            .await
            .unwrap()
            .into_instances()
            .unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].values("color"), &[Value::string("red")]);
        assert_eq!(
            devices[0].provenance.as_ref().map(|p| p.source_iid.as_str()),
            Some(gadget.as_str())
        );
        assert!(!executor.repository().snapshot().contains("gadget"));
    }

    #[tokio::test]
    async fn test_destructive_plan_is_gated() {
        let store = Arc::new(MemoryStore::new());
        let executor = executor_with(Arc::clone(&store), EngineConfig::new()).await;
        let plan = executor.plan(furniture()).await.unwrap();
        executor.execute(&plan).await.unwrap();
        store
            .execute_data_statement(&DataStatement::InsertInstance {
                type_name: "chair".into(),
                attributes: BTreeMap::from([("color".into(), vec![Value::string("red")])]),
                role_players: vec![],
                provenance: None,
            })
            .await
            .unwrap();

        let removal = executor
            .plan(ChangeProposal::new().with_removal("color"))
            .await
            .unwrap();
        assert!(removal.is_destructive());
        let err = executor.execute(&removal).await.unwrap_err();
        assert!(matches!(err, MigrationError::UnsafeOperation { .. }));
        assert!(executor.log().active().unwrap().is_none());
    }

    #[test]
    fn test_removal_landed() {
        let schema = SchemaState::from_definitions(vec![
            AttributeTypeDef::new("color", ValueKind::String).into(),
            EntityTypeDef::new("chair").with_owns("color").into(),
        ])
        .unwrap();
        let unowns = SchemaStatement::RemoveOwns {
            owner: "chair".into(),
            attribute: "color".into(),
        };
        assert!(!removal_landed(&unowns, &schema));
        let undefine = SchemaStatement::UndefineType {
            definition: EntityTypeDef::new("table").into(),
        };
        assert!(removal_landed(&undefine, &schema));
    }
}
