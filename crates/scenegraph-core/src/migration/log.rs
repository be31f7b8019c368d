//! Durable migration log.
//!
//! One record per executed plan, kept in its own sled tree so that an
//! interrupted migration can be detected, resumed or abandoned after a
//! restart.

use super::error::MigrationError;
use super::plan::{Fingerprint, MigrationPlan};
use crate::error::current_timestamp;
use rkyv::{Archive, Deserialize, Serialize};

/// Outcome of a migration as recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, Serialize, Deserialize)]
pub enum MigrationStatus {
    /// Execution started and has not reached a terminal state.
    InProgress,
    /// Every operation was applied.
    Committed,
    /// The first operation failed and was fully compensated.
    RolledBack,
    /// Some operations were applied before a failure.
    PartiallyApplied,
    /// An in-progress record that an operator gave up on.
    Abandoned,
}

impl MigrationStatus {
    /// Whether the migration can no longer make progress.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MigrationStatus::InProgress)
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationStatus::InProgress => write!(f, "in_progress"),
            MigrationStatus::Committed => write!(f, "committed"),
            MigrationStatus::RolledBack => write!(f, "rolled_back"),
            MigrationStatus::PartiallyApplied => write!(f, "partially_applied"),
            MigrationStatus::Abandoned => write!(f, "abandoned"),
        }
    }
}

/// A logged migration.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Timestamp prefix plus fingerprint prefix.
    pub id: [u8; 16],
    /// Hex fingerprint of the proposal.
    pub fingerprint: String,
    /// Current status.
    pub status: MigrationStatus,
    /// Canonical JSON of the proposal, used to re-plan on resume.
    pub proposal_json: String,
    /// Ids of the operations in plan order.
    pub operations: Vec<String>,
    /// Ids of the operations applied so far.
    pub applied: Vec<String>,
    /// Id of the operation that failed.
    pub failed: Option<String>,
    /// Error message if the migration failed.
    pub error: Option<String>,
    /// Compensation actions taken, with their outcome.
    pub compensation: Vec<String>,
    /// Instances copied or converted by data steps.
    pub instances_migrated: u64,
    /// Start time (microseconds since epoch).
    pub started_at: u64,
    /// End time (microseconds since epoch).
    pub finished_at: Option<u64>,
}

impl MigrationRecord {
    /// Start a record for `plan`.
    pub fn begin(plan: &MigrationPlan) -> Result<Self, MigrationError> {
        let proposal_json = plan
            .proposal()
            .canonical_json()
            .map_err(|e| MigrationError::Serialization(e.to_string()))?;
        let proposal_json = String::from_utf8(proposal_json)
            .map_err(|e| MigrationError::Serialization(e.to_string()))?;
        let started_at = current_timestamp();
        Ok(Self {
            id: Self::make_id(started_at, &plan.fingerprint()),
            fingerprint: plan.fingerprint().to_hex(),
            status: MigrationStatus::InProgress,
            proposal_json,
            operations: plan.operations().iter().map(|op| op.id.clone()).collect(),
            applied: Vec::new(),
            failed: None,
            error: None,
            compensation: Vec::new(),
            instances_migrated: 0,
            started_at,
            finished_at: None,
        })
    }

    /// Close the record with a terminal status.
    pub fn finish(&mut self, status: MigrationStatus) {
        self.status = status;
        self.finished_at = Some(current_timestamp());
    }

    /// Hex form of the id.
    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }

    /// Serialize the record to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize a record from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }

    fn make_id(started_at: u64, fingerprint: &Fingerprint) -> [u8; 16] {
        let mut id = [0u8; 16];
        id[..8].copy_from_slice(&started_at.to_be_bytes());
        id[8..].copy_from_slice(&fingerprint.as_bytes()[..8]);
        id
    }
}

/// Migration log backed by a sled tree.
pub struct MigrationLog {
    tree: sled::Tree,
}

impl MigrationLog {
    /// Tree name for migration records.
    pub const TREE_NAME: &'static str = "migration:log";

    /// Open or create the migration log.
    pub fn open(db: &sled::Db) -> Result<Self, MigrationError> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self { tree })
    }

    /// Save a record, replacing any previous version.
    pub fn save(&self, record: &MigrationRecord) -> Result<(), MigrationError> {
        let key = Self::migration_key(&record.id);
        let value = record.to_bytes()?;
        self.tree.insert(key, value)?;
        self.flush()
    }

    /// Load a record.
    pub fn load(&self, id: &[u8; 16]) -> Result<Option<MigrationRecord>, MigrationError> {
        let key = Self::migration_key(id);
        match self.tree.get(key)? {
            Some(bytes) => Ok(Some(MigrationRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All records, oldest first.
    pub fn list(&self) -> Result<Vec<MigrationRecord>, MigrationError> {
        let mut records = Vec::new();
        for result in self.tree.scan_prefix(b"migration:") {
            let (_, value) = result?;
            records.push(MigrationRecord::from_bytes(&value)?);
        }
        Ok(records)
    }

    /// The migration still in progress, if any.
    pub fn active(&self) -> Result<Option<MigrationRecord>, MigrationError> {
        Ok(self
            .list()?
            .into_iter()
            .find(|record| !record.status.is_terminal()))
    }

    /// Mark the active migration as abandoned and return it.
    pub fn abandon(&self) -> Result<Option<MigrationRecord>, MigrationError> {
        let Some(mut record) = self.active()? else {
            return Ok(None);
        };
        record.error.get_or_insert_with(|| "abandoned".to_string());
        record.finish(MigrationStatus::Abandoned);
        self.save(&record)?;
        Ok(Some(record))
    }

    /// Flush changes to disk.
    pub fn flush(&self) -> Result<(), MigrationError> {
        self.tree.flush()?;
        Ok(())
    }

    fn migration_key(id: &[u8; 16]) -> Vec<u8> {
        let mut key = Vec::with_capacity(26);
        key.extend_from_slice(b"migration:");
        key.extend_from_slice(id);
        key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{DependencyResolver, ProposalNormalizer};
    use crate::proposal::ChangeProposal;
    use crate::schema::{AttributeTypeDef, SchemaState, ValueKind};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn sample_plan() -> MigrationPlan {
        let proposal =
            ChangeProposal::new().with_attribute(AttributeTypeDef::new("color", ValueKind::String));
        let state = SchemaState::new();
        let changes = ProposalNormalizer::normalize(&state, &proposal).unwrap();
        let operations = DependencyResolver::resolve(&state, &changes).unwrap();
        let fingerprint = Fingerprint::of(&proposal).unwrap();
        let base = Fingerprint::of_schema(&state).unwrap();
        MigrationPlan::new(Arc::new(proposal), fingerprint, base, operations, vec![], vec![])
    }

    #[test]
    fn test_record_lifecycle() {
        let mut record = MigrationRecord::begin(&sample_plan()).unwrap();
        assert_eq!(record.status, MigrationStatus::InProgress);
        assert_eq!(record.operations, vec!["define:color".to_string()]);
        assert!(record.proposal_json.contains("color"));

        record.finish(MigrationStatus::Committed);
        assert!(record.status.is_terminal());
        assert!(record.finished_at.is_some());

        let restored = MigrationRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(restored.status, MigrationStatus::Committed);
        assert_eq!(restored.fingerprint, record.fingerprint);
    }

    #[test]
    fn test_log_active_and_abandon() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let log = MigrationLog::open(&db).unwrap();
        assert!(log.active().unwrap().is_none());

        let record = MigrationRecord::begin(&sample_plan()).unwrap();
        log.save(&record).unwrap();
        assert_eq!(log.active().unwrap().map(|r| r.id), Some(record.id));

        let abandoned = log.abandon().unwrap().unwrap();
        assert_eq!(abandoned.status, MigrationStatus::Abandoned);
        assert!(log.active().unwrap().is_none());
        assert_eq!(log.list().unwrap().len(), 1);
        assert_eq!(
            log.load(&record.id).unwrap().map(|r| r.status),
            Some(MigrationStatus::Abandoned)
        );
    }

    #[test]
    fn test_log_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let record = MigrationRecord::begin(&sample_plan()).unwrap();
        {
            let db = sled::open(dir.path()).unwrap();
            MigrationLog::open(&db).unwrap().save(&record).unwrap();
        }
        let db = sled::open(dir.path()).unwrap();
        let log = MigrationLog::open(&db).unwrap();
        assert_eq!(log.active().unwrap().map(|r| r.fingerprint), Some(record.fingerprint));
    }
}
