//! Scenegraph Core - schema evolution for scene graph knowledge stores.
//!
//! Scene analysis proposes new kinds of objects, attributes and relations.
//! This crate plans those proposals against the stored schema, orders the
//! resulting statements, migrates existing data where types change, and
//! records every run in a durable migration log.

pub mod config;
pub mod error;
pub mod ingest;
pub mod migration;
pub mod proposal;
pub mod reconcile;
pub mod repository;
pub mod schema;
pub mod store;

pub use config::EngineConfig;
pub use error::Error;
pub use ingest::{EntityRecord, IngestReport, Ingestor, Observations, RelationRecord};
pub use migration::{
    ErrorCategory, Fingerprint, MigrationError, MigrationExecutor, MigrationLog, MigrationPlan,
    MigrationRecord, MigrationResult, MigrationStatus, Operation,
};
pub use proposal::{base_schema_proposal, ChangeProposal, RawAnalysis};
pub use reconcile::Reconciler;
pub use repository::SchemaRepository;
pub use schema::{SchemaError, SchemaState, SchemaStatement, TypeDef, TypeKind, ValueKind};
pub use store::{DataStatement, MemoryStore, SledStore, Store, StoreError};
