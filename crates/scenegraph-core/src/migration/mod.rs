//! Schema migration engine.
//!
//! Turns a [`ChangeProposal`](crate::proposal::ChangeProposal) into a
//! [`MigrationPlan`] and applies it:
//!
//! 1. **Normalize** - the proposal is compared with the current schema;
//!    satisfied requests are skipped, the rest become [`Change`]s.
//! 2. **Resolve** - changes expand into schema statements ordered so that
//!    every statement's references exist when it runs.
//! 3. **Data** - reclassifications, value-kind changes and removals of types
//!    holding data get instance-level steps.
//! 4. **Execute** - statements run one at a time, each recorded in the
//!    migration log, with compensation for the failing operation.
//!
//! # Example
//!
//! ```ignore
//! use scenegraph_core::migration::{MigrationExecutor, MigrationLog};
//!
//! let executor = MigrationExecutor::new(repository, MigrationLog::open(&db)?, config);
//! let plan = executor.plan(proposal).await?;
//! println!("{}", MigrationExecutor::preview(&plan));
//! let result = executor.execute(&plan).await?.ensure_committed()?;
//! ```

pub mod data;
pub mod error;
pub mod executor;
pub mod log;
pub mod normalize;
pub mod plan;
pub mod resolve;

pub use data::{CountQuery, DataMigrationPlanner, DataPlan, InstanceCounts};
pub use error::{ErrorCategory, MigrationError};
pub use executor::{
    CompensationAction, CompensationOutcome, MigrationExecutor, MigrationResult, StepReport,
};
pub use log::{MigrationLog, MigrationRecord, MigrationStatus};
pub use normalize::{Change, ChangeClass, NormalizedChangeSet, ProposalNormalizer, SkippedChange};
pub use plan::{Fingerprint, MigrationPlan, MigrationStep, Operation, StepPhase};
pub use resolve::DependencyResolver;
