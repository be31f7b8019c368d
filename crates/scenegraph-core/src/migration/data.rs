//! Data migration planning.
//!
//! Attaches the instance-level steps a plan needs when it reclassifies,
//! retypes or removes types that hold data, and checks the resulting
//! statement sequence against the schema before anything runs.

use super::error::MigrationError;
use super::normalize::{Change, NormalizedChangeSet};
use super::plan::{MigrationStep, Operation};
use super::resolve::{define_id, undefine_id, unowns_id, value_id};
use crate::repository::SchemaRepository;
use crate::schema::{OperationKind, SchemaError, SchemaState, SchemaStatement};
use crate::store::DataStatement;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// A read the planner needs answered before it can size the data steps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CountQuery {
    /// Instances of exactly this type.
    Instances { type_name: String },
    /// Instances holding values of `attribute`, optionally limited to
    /// instances of `owner` and its subtypes.
    Holders {
        attribute: String,
        owner: Option<String>,
    },
}

/// Answers to [`CountQuery`]s.
#[derive(Debug, Clone, Default)]
pub struct InstanceCounts(BTreeMap<CountQuery, u64>);

impl InstanceCounts {
    /// No data anywhere.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an answer.
    pub fn with(mut self, query: CountQuery, count: u64) -> Self {
        self.0.insert(query, count);
        self
    }

    /// The answer to `query`, zero if unknown.
    pub fn get(&self, query: &CountQuery) -> u64 {
        self.0.get(query).copied().unwrap_or_default()
    }

    /// Answer every query with read-only statements.
    pub async fn gather(
        repository: &SchemaRepository,
        schema: &SchemaState,
        queries: BTreeSet<CountQuery>,
    ) -> Result<Self, MigrationError> {
        let mut counts = Self::new();
        for query in queries {
            let count = match &query {
                CountQuery::Instances { type_name } => {
                    if !schema.contains(type_name) {
                        0
                    } else {
                        repository
                            .execute_data(&DataStatement::CountInstances {
                                type_name: type_name.clone(),
                                include_subtypes: false,
                            })
                            .await?
                            .into_count()?
                    }
                }
                CountQuery::Holders { attribute, owner } => repository
                    .execute_data(&DataStatement::ReadOwners {
                        attribute: attribute.clone(),
                    })
                    .await?
                    .into_instances()?
                    .iter()
                    .filter(|i| {
                        owner
                            .as_deref()
                            .map_or(true, |o| schema.is_subtype_of(&i.type_name, o))
                    })
                    .count() as u64,
            };
            counts.0.insert(query, count);
        }
        Ok(counts)
    }
}

/// Result of data migration planning.
#[derive(Debug, Clone, Default)]
pub struct DataPlan {
    /// Operations with their data steps attached.
    pub operations: Vec<Operation>,
    /// Operations dropped or otherwise adjusted.
    pub warnings: Vec<String>,
}

/// Plans the data side of a migration.
pub struct DataMigrationPlanner;

impl DataMigrationPlanner {
    /// Reads needed to size the data steps of `changes`.
    pub fn required_counts(changes: &NormalizedChangeSet) -> BTreeSet<CountQuery> {
        let mut queries = BTreeSet::new();
        for change in &changes.changes {
            match change {
                Change::Reclassify { from, .. } => {
                    queries.insert(CountQuery::Instances {
                        type_name: from.name().to_string(),
                    });
                }
                Change::ChangeValueKind {
                    attribute, shadow, ..
                } => {
                    queries.insert(CountQuery::Holders {
                        attribute: attribute.clone(),
                        owner: None,
                    });
                    queries.insert(CountQuery::Holders {
                        attribute: shadow.clone(),
                        owner: None,
                    });
                }
                Change::RemoveType {
                    definition,
                    detach_owners,
                    ..
                } => {
                    if definition.kind().is_thing() {
                        queries.insert(CountQuery::Instances {
                            type_name: definition.name().to_string(),
                        });
                    }
                    for owner in detach_owners {
                        queries.insert(CountQuery::Holders {
                            attribute: definition.name().to_string(),
                            owner: Some(owner.clone()),
                        });
                    }
                }
                _ => {}
            }
        }
        queries
    }

    /// Attach data steps to `operations` and check the plan against `state`.
    pub fn plan(
        state: &SchemaState,
        changes: &NormalizedChangeSet,
        mut operations: Vec<Operation>,
        counts: &InstanceCounts,
    ) -> Result<DataPlan, MigrationError> {
        for change in &changes.changes {
            match change {
                Change::Reclassify { from, into, .. } => {
                    let expected = counts.get(&CountQuery::Instances {
                        type_name: from.name().to_string(),
                    });
                    if expected > 0 {
                        attach(
                            &mut operations,
                            &define_id(into.name()),
                            [
                                MigrationStep::MigrateInstances {
                                    from_type: from.name().to_string(),
                                    to_type: into.name().to_string(),
                                    expected,
                                },
                                MigrationStep::DeleteMigrated {
                                    from_type: from.name().to_string(),
                                    to_type: into.name().to_string(),
                                    expected,
                                },
                            ],
                        );
                    }
                }
                Change::ChangeValueKind {
                    attribute,
                    to,
                    shadow,
                    ..
                } => {
                    let holders = counts.get(&CountQuery::Holders {
                        attribute: attribute.clone(),
                        owner: None,
                    });
                    let staged = counts.get(&CountQuery::Holders {
                        attribute: shadow.clone(),
                        owner: None,
                    });
                    if holders > 0 {
                        attach(
                            &mut operations,
                            &define_id(shadow),
                            [
                                MigrationStep::ConvertValues {
                                    from_attribute: attribute.clone(),
                                    to_attribute: shadow.clone(),
                                    to_kind: *to,
                                    expected: holders,
                                },
                                MigrationStep::ClearConverted {
                                    attribute: attribute.clone(),
                                    converted_into: shadow.clone(),
                                    expected: holders,
                                },
                            ],
                        );
                    }
                    if holders + staged > 0 {
                        attach(
                            &mut operations,
                            &value_id(attribute),
                            [
                                MigrationStep::ConvertValues {
                                    from_attribute: shadow.clone(),
                                    to_attribute: attribute.clone(),
                                    to_kind: *to,
                                    expected: holders + staged,
                                },
                                MigrationStep::ClearConverted {
                                    attribute: shadow.clone(),
                                    converted_into: attribute.clone(),
                                    expected: holders + staged,
                                },
                            ],
                        );
                    }
                }
                Change::RemoveType {
                    definition,
                    detach_owners,
                    ..
                } => {
                    let name = definition.name();
                    for owner in detach_owners {
                        let expected = counts.get(&CountQuery::Holders {
                            attribute: name.to_string(),
                            owner: Some(owner.clone()),
                        });
                        if expected > 0 {
                            attach(
                                &mut operations,
                                &unowns_id(owner, name),
                                [MigrationStep::PurgeValues {
                                    attribute: name.to_string(),
                                    owner: owner.clone(),
                                    expected,
                                }],
                            );
                        }
                    }
                    if definition.kind().is_thing() {
                        let expected = counts.get(&CountQuery::Instances {
                            type_name: name.to_string(),
                        });
                        if expected > 0 {
                            // Instances go before the first statement that detaches the type.
                            let first = operations
                                .iter()
                                .find(|op| detaches(op, name))
                                .map(|op| op.id.clone())
                                .unwrap_or_else(|| undefine_id(name));
                            attach(
                                &mut operations,
                                &first,
                                [MigrationStep::PurgeInstances {
                                    type_name: name.to_string(),
                                    expected,
                                }],
                            );
                        }
                    }
                }
                _ => {}
            }
        }

        let warnings = check_statements(state, &mut operations)?;
        debug!(
            operations = operations.len(),
            with_data = operations.iter().filter(|op| op.requires_data_migration()).count(),
            "planned data migration"
        );
        Ok(DataPlan {
            operations,
            warnings,
        })
    }
}

fn attach<const N: usize>(operations: &mut [Operation], id: &str, steps: [MigrationStep; N]) {
    if let Some(op) = operations.iter_mut().find(|op| op.id == id) {
        op.migration_steps.extend(steps);
    }
}

/// Whether `op` is one of the statements removing relation type `name`.
fn detaches(op: &Operation, name: &str) -> bool {
    match &op.payload {
        SchemaStatement::RemovePlays { role, .. } => role.relation == name,
        SchemaStatement::UndefineType { definition } => definition.name() == name,
        _ => false,
    }
}

/// Replay the statements on a copy of the schema.
///
/// An undefine that would leave something dangling is dropped with a
/// warning. Any other failure means the plan cannot run.
fn check_statements(
    state: &SchemaState,
    operations: &mut Vec<Operation>,
) -> Result<Vec<String>, MigrationError> {
    let mut working = state.clone();
    let mut warnings = Vec::new();
    let mut dropped = BTreeSet::new();

    for op in operations.iter() {
        if op.depends_on.iter().any(|dep| dropped.contains(dep)) {
            dropped.insert(op.id.clone());
            warnings.push(format!("{} dropped: it depends on a dropped operation", op.id));
            continue;
        }
        match working.apply_statement(&op.payload) {
            Ok(()) => {}
            Err(SchemaError::HasDependents { name, dependents })
                if matches!(op.payload, SchemaStatement::UndefineType { .. }) =>
            {
                warn!(type_name = %name, ?dependents, "keeping type that is still referenced");
                warnings.push(format!(
                    "{name} is kept: still referenced by {}",
                    dependents.join(", ")
                ));
                dropped.insert(op.id.clone());
            }
            Err(err) => {
                return Err(MigrationError::dependency(format!(
                    "operation {} cannot be applied: {err}",
                    op.id
                )));
            }
        }
    }

    if !dropped.is_empty() {
        operations.retain(|op| !dropped.contains(&op.id));
    }
    if operations
        .iter()
        .any(|op| op.is_destructive() && op.kind != OperationKind::Undefine)
    {
        return Err(MigrationError::conflict(
            "destructive steps may only run before an undefine",
        ));
    }
    Ok(warnings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{DependencyResolver, ProposalNormalizer};
    use crate::proposal::{ChangeProposal, Retype, TypeModification};
    use crate::schema::{AttributeTypeDef, EntityTypeDef, TypeDef, ValueKind};
    use pretty_assertions::assert_eq;

    fn plan_with(
        state: &SchemaState,
        proposal: &ChangeProposal,
        counts: InstanceCounts,
    ) -> DataPlan {
        let changes = ProposalNormalizer::normalize(state, proposal).unwrap();
        let ops = DependencyResolver::resolve(state, &changes).unwrap();
        DataMigrationPlanner::plan(state, &changes, ops, &counts).unwrap()
    }

    fn gadget_state() -> SchemaState {
        SchemaState::from_definitions(vec![EntityTypeDef::new("gadget").into()]).unwrap()
    }

    fn rename_gadget() -> ChangeProposal {
        ChangeProposal::new().with_modification(
            TypeModification::new("gadget").with_retype(Retype::Reclassify {
                into: "device".into(),
                supertype: None,
            }),
        )
    }

    #[test]
    fn test_reclassification_steps() {
        let state = gadget_state();
        let changes = ProposalNormalizer::normalize(&state, &rename_gadget()).unwrap();
        assert_eq!(
            DataMigrationPlanner::required_counts(&changes),
            BTreeSet::from([CountQuery::Instances {
                type_name: "gadget".into()
            }])
        );

        let counts = InstanceCounts::new().with(
            CountQuery::Instances {
                type_name: "gadget".into(),
            },
            3,
        );
        let plan = plan_with(&state, &rename_gadget(), counts);
        let ops: Vec<&str> = plan.operations.iter().map(|op| op.id.as_str()).collect();
        assert_eq!(ops, vec!["define:device", "undefine:gadget"]);
        assert_eq!(
            plan.operations[0].migration_steps,
            vec![
                MigrationStep::MigrateInstances {
                    from_type: "gadget".into(),
                    to_type: "device".into(),
                    expected: 3
                },
                MigrationStep::DeleteMigrated {
                    from_type: "gadget".into(),
                    to_type: "device".into(),
                    expected: 3
                },
            ]
        );
        assert!(!plan.operations[1].requires_data_migration());
    }

    #[test]
    fn test_no_data_no_steps() {
        let plan = plan_with(&gadget_state(), &rename_gadget(), InstanceCounts::new());
        assert!(plan
            .operations
            .iter()
            .all(|op| !op.requires_data_migration()));
    }

    #[test]
    fn test_value_kind_steps() {
        let state = SchemaState::from_definitions(vec![
            AttributeTypeDef::new("size", ValueKind::String).into(),
            EntityTypeDef::new("box").with_owns("size").into(),
        ])
        .unwrap();
        let proposal = ChangeProposal::new().with_modification(
            TypeModification::new("size").with_retype(Retype::ValueKind(ValueKind::Long)),
        );
        let counts = InstanceCounts::new().with(
            CountQuery::Holders {
                attribute: "size".into(),
                owner: None,
            },
            4,
        );
        let plan = plan_with(&state, &proposal, counts);
        let shadow = &plan.operations[0];
        assert_eq!(shadow.id, "define:size__long");
        assert_eq!(shadow.migration_steps.len(), 2);
        let retype = &plan.operations[1];
        assert_eq!(retype.id, "value:size");
        assert_eq!(retype.migration_steps[0].expected(), 4);
    }

    #[test]
    fn test_removal_with_data_is_destructive() {
        let state = SchemaState::from_definitions(vec![
            AttributeTypeDef::new("color", ValueKind::String).into(),
            EntityTypeDef::new("chair").with_owns("color").into(),
        ])
        .unwrap();
        let proposal = ChangeProposal::new().with_removal("color");
        let counts = InstanceCounts::new().with(
            CountQuery::Holders {
                attribute: "color".into(),
                owner: Some("chair".into()),
            },
            2,
        );
        let plan = plan_with(&state, &proposal, counts);
        let detach = &plan.operations[0];
        assert_eq!(detach.id, "unowns:chair:color");
        assert!(detach.is_destructive());
    }

    #[test]
    fn test_referenced_undefine_is_dropped() {
        let state = SchemaState::from_definitions(vec![
            AttributeTypeDef::new("color", ValueKind::String).into(),
            EntityTypeDef::new("chair").with_owns("color").into(),
        ])
        .unwrap();
        let undefine = Operation::new(
            "undefine:color",
            SchemaStatement::UndefineType {
                definition: TypeDef::from(AttributeTypeDef::new("color", ValueKind::String)),
            },
        );
        let mut ops = vec![undefine];
        let warnings = check_statements(&state, &mut ops).unwrap();
        assert!(ops.is_empty());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("chair owns color"));
    }
}
