//! Migration plan structures.

use super::error::MigrationError;
use crate::error::current_timestamp;
use crate::proposal::ChangeProposal;
use crate::schema::{OperationKind, SchemaState, SchemaStatement, TypeDef, ValueKind};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Content fingerprint of a change proposal or a schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint a proposal. List order inside the proposal does not matter.
    pub fn of(proposal: &ChangeProposal) -> Result<Self, MigrationError> {
        let canonical = proposal
            .canonical_json()
            .map_err(|e| MigrationError::Serialization(e.to_string()))?;
        Ok(Self(*blake3::hash(&canonical).as_bytes()))
    }

    /// Fingerprint the definitions of a schema.
    pub fn of_schema(state: &SchemaState) -> Result<Self, MigrationError> {
        let definitions: Vec<&TypeDef> = state.definitions().collect();
        let canonical = serde_json::to_vec(&definitions)
            .map_err(|e| MigrationError::Serialization(e.to_string()))?;
        Ok(Self(*blake3::hash(&canonical).as_bytes()))
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a hex encoding.
    pub fn from_hex(text: &str) -> Result<Self, MigrationError> {
        let bytes = hex::decode(text).map_err(|e| MigrationError::Deserialization(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| MigrationError::Deserialization("fingerprint must be 32 bytes".into()))?;
        Ok(Self(bytes))
    }

    /// Abbreviated form for display.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// When a step runs relative to its operation's schema statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPhase {
    /// Before the statement. Only destructive purges run here.
    BeforeStatement,
    /// After the statement has committed.
    AfterStatement,
}

/// A data-migration sub-step attached to an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStep {
    /// Copy every instance of `from_type` to `to_type` and relink its relations.
    MigrateInstances {
        from_type: String,
        to_type: String,
        expected: u64,
    },
    /// Delete instances of `from_type` that have a migrated copy in `to_type`.
    DeleteMigrated {
        from_type: String,
        to_type: String,
        expected: u64,
    },
    /// Write converted values of `from_attribute` into `to_attribute`.
    ConvertValues {
        from_attribute: String,
        to_attribute: String,
        to_kind: ValueKind,
        expected: u64,
    },
    /// Drop values of `attribute` from owners that already hold `converted_into`.
    ClearConverted {
        attribute: String,
        converted_into: String,
        expected: u64,
    },
    /// Delete every instance of a type (destructive).
    PurgeInstances { type_name: String, expected: u64 },
    /// Drop every value of `attribute` held by instances of `owner` (destructive).
    PurgeValues {
        attribute: String,
        owner: String,
        expected: u64,
    },
}

impl MigrationStep {
    /// Number of instances the planner expects the step to process.
    pub fn expected(&self) -> u64 {
        match self {
            MigrationStep::MigrateInstances { expected, .. }
            | MigrationStep::DeleteMigrated { expected, .. }
            | MigrationStep::ConvertValues { expected, .. }
            | MigrationStep::ClearConverted { expected, .. }
            | MigrationStep::PurgeInstances { expected, .. }
            | MigrationStep::PurgeValues { expected, .. } => *expected,
        }
    }

    /// When the step runs.
    pub fn phase(&self) -> StepPhase {
        if self.is_destructive() {
            StepPhase::BeforeStatement
        } else {
            StepPhase::AfterStatement
        }
    }

    /// Whether the step deletes data that has not been moved elsewhere.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            MigrationStep::PurgeInstances { .. } | MigrationStep::PurgeValues { .. }
        )
    }

    /// Short step name.
    pub fn name(&self) -> &'static str {
        match self {
            MigrationStep::MigrateInstances { .. } => "migrate-instances",
            MigrationStep::DeleteMigrated { .. } => "delete-old",
            MigrationStep::ConvertValues { .. } => "convert-values",
            MigrationStep::ClearConverted { .. } => "clear-converted",
            MigrationStep::PurgeInstances { .. } => "purge-instances",
            MigrationStep::PurgeValues { .. } => "purge-values",
        }
    }
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationStep::MigrateInstances {
                from_type,
                to_type,
                expected,
            } => write!(f, "migrate {expected} instance(s) {from_type} -> {to_type}"),
            MigrationStep::DeleteMigrated {
                from_type,
                expected,
                ..
            } => write!(f, "delete {expected} migrated {from_type} instance(s)"),
            MigrationStep::ConvertValues {
                from_attribute,
                to_attribute,
                to_kind,
                expected,
            } => write!(
                f,
                "convert {expected} {from_attribute} value set(s) to {to_kind} in {to_attribute}"
            ),
            MigrationStep::ClearConverted {
                attribute,
                expected,
                ..
            } => write!(f, "clear {expected} converted {attribute} value set(s)"),
            MigrationStep::PurgeInstances {
                type_name,
                expected,
            } => write!(f, "DELETE {expected} {type_name} instance(s)"),
            MigrationStep::PurgeValues {
                attribute,
                owner,
                expected,
            } => write!(f, "DROP {attribute} values from {expected} {owner} instance(s)"),
        }
    }
}

/// One schema statement in a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    /// Unique id, e.g. `define:chair` or `owns:chair:color`.
    pub id: String,
    /// Statement class.
    pub kind: OperationKind,
    /// Type affected.
    pub target: String,
    /// The statement.
    pub payload: SchemaStatement,
    /// Operations that must commit first.
    pub depends_on: BTreeSet<String>,
    /// Data-migration sub-steps.
    pub migration_steps: Vec<MigrationStep>,
}

impl Operation {
    /// Create an operation with no dependencies or steps.
    pub fn new(id: impl Into<String>, payload: SchemaStatement) -> Self {
        Self {
            id: id.into(),
            kind: payload.kind(),
            target: payload.target().to_string(),
            payload,
            depends_on: BTreeSet::new(),
            migration_steps: Vec::new(),
        }
    }

    /// Whether the operation carries data-migration steps.
    pub fn requires_data_migration(&self) -> bool {
        !self.migration_steps.is_empty()
    }

    /// Whether any step deletes unmoved data.
    pub fn is_destructive(&self) -> bool {
        self.migration_steps.iter().any(MigrationStep::is_destructive)
    }
}

/// An ordered, immutable sequence of operations derived from one proposal.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    proposal: Arc<ChangeProposal>,
    fingerprint: Fingerprint,
    base_schema: Fingerprint,
    operations: Vec<Operation>,
    skipped: Vec<String>,
    warnings: Vec<String>,
    created_at: u64,
}

impl MigrationPlan {
    pub(crate) fn new(
        proposal: Arc<ChangeProposal>,
        fingerprint: Fingerprint,
        base_schema: Fingerprint,
        operations: Vec<Operation>,
        skipped: Vec<String>,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            proposal,
            fingerprint,
            base_schema,
            operations,
            skipped,
            warnings,
            created_at: current_timestamp(),
        }
    }

    /// The proposal this plan was derived from.
    pub fn proposal(&self) -> &ChangeProposal {
        &self.proposal
    }

    /// Shared handle to the proposal.
    pub fn proposal_arc(&self) -> Arc<ChangeProposal> {
        Arc::clone(&self.proposal)
    }

    /// Fingerprint of the proposal.
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Put warnings from outside the planner ahead of the planner's own.
    pub(crate) fn with_leading_warnings(mut self, warnings: &[String]) -> Self {
        self.warnings.splice(0..0, warnings.iter().cloned());
        self
    }

    /// Fingerprint of the schema the plan was derived from.
    pub fn base_schema(&self) -> Fingerprint {
        self.base_schema
    }

    /// Whether two plans would send the same statements and data steps.
    pub fn same_operations(&self, other: &MigrationPlan) -> bool {
        self.operations.len() == other.operations.len()
            && self
                .operations
                .iter()
                .zip(&other.operations)
                .all(|(a, b)| a.id == b.id && a.payload == b.payload && a.migration_steps == b.migration_steps)
    }

    /// Operations in execution order.
    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    /// Look up an operation by id.
    pub fn operation(&self, id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }

    /// Requested changes dropped because they were already satisfied.
    pub fn skipped(&self) -> &[String] {
        &self.skipped
    }

    /// Planner warnings.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Creation time (microseconds since epoch).
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Whether there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Whether the plan deletes data without moving it.
    pub fn is_destructive(&self) -> bool {
        self.operations.iter().any(Operation::is_destructive)
    }

    /// Number of operations with data-migration steps.
    pub fn data_migration_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| op.requires_data_migration())
            .count()
    }

    /// One-line summary.
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "no schema changes required".to_string();
        }
        let count = |kind| self.operations.iter().filter(|op| op.kind == kind).count();
        format!(
            "{} operation(s): {} define, {} redefine, {} undefine; {} with data migration{}",
            self.operations.len(),
            count(OperationKind::Define),
            count(OperationKind::Redefine),
            count(OperationKind::Undefine),
            self.data_migration_count(),
            if self.is_destructive() { "; DESTRUCTIVE" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EntityTypeDef;

    #[test]
    fn test_fingerprint_hex_roundtrip() {
        let proposal = ChangeProposal::new().with_entity(EntityTypeDef::new("chair"));
        let fp = Fingerprint::of(&proposal).unwrap();
        assert_eq!(fp.to_hex().len(), 64);
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()).unwrap(), fp);
        assert_eq!(fp.short().len(), 12);
        assert!(Fingerprint::from_hex("abcd").is_err());
    }

    #[test]
    fn test_fingerprint_depends_on_content() {
        let a = ChangeProposal::new().with_entity(EntityTypeDef::new("chair"));
        let b = ChangeProposal::new().with_entity(EntityTypeDef::new("table"));
        assert_ne!(Fingerprint::of(&a).unwrap(), Fingerprint::of(&b).unwrap());
    }

    #[test]
    fn test_schema_fingerprint_tracks_definitions() {
        let empty = Fingerprint::of_schema(&SchemaState::new()).unwrap();
        assert_eq!(empty, Fingerprint::of_schema(&SchemaState::new()).unwrap());

        let chair = SchemaState::from_definitions([EntityTypeDef::new("chair").into()]).unwrap();
        let with_chair = Fingerprint::of_schema(&chair).unwrap();
        assert_ne!(empty, with_chair);

        let mut changed = chair.clone();
        changed
            .apply_statement(&SchemaStatement::DefineType {
                definition: EntityTypeDef::new("lamp").into(),
                owned_by: Default::default(),
                played_by: Default::default(),
            })
            .unwrap();
        assert_ne!(with_chair, Fingerprint::of_schema(&changed).unwrap());
    }

    #[test]
    fn test_step_phases() {
        let purge = MigrationStep::PurgeInstances {
            type_name: "gadget".into(),
            expected: 2,
        };
        assert!(purge.is_destructive());
        assert_eq!(purge.phase(), StepPhase::BeforeStatement);
        let migrate = MigrationStep::MigrateInstances {
            from_type: "gadget".into(),
            to_type: "device".into(),
            expected: 3,
        };
        assert_eq!(migrate.phase(), StepPhase::AfterStatement);
        assert_eq!(migrate.to_string(), "migrate 3 instance(s) gadget -> device");
    }

    #[test]
    fn test_operation_derives_kind_and_target() {
        let op = Operation::new(
            "define:chair",
            SchemaStatement::define(EntityTypeDef::new("chair")),
        );
        assert_eq!(op.kind, OperationKind::Define);
        assert_eq!(op.target, "chair");
        assert!(!op.requires_data_migration());
    }
}
