//! End-to-end tests against the sled-backed store.

use scenegraph_core::migration::MigrationStatus;
use scenegraph_core::store::DataStatement;
use scenegraph_core::{EngineConfig, ErrorCategory, MigrationError, Reconciler};

const OFFICE: &str = r#"{
    "new_data": {
        "entities": [{"id": "desk_main", "type": "physical_object", "attributes": {"color": "brown"}}],
        "relations": [{"type": "on", "from": "laptop_1", "to": "desk_main"}]
    },
    "schema_changes": {
        "new_attribute_types": [{"name": "brand", "value_type": "str"}],
        "new_entity_types": [{"name": "laptop", "owns": ["brand", "color"]}]
    },
    "data_requiring_schema_change": [
        {"id": "laptop_1", "type": "laptop", "attributes": {"brand": "acme"}}
    ]
}"#;

#[tokio::test]
async fn test_schema_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    {
        let reconciler = Reconciler::open(dir.path(), EngineConfig::new())
            .await
            .unwrap();
        reconciler.bootstrap().await.unwrap();
    }

    let reconciler = Reconciler::open(dir.path(), EngineConfig::new())
        .await
        .unwrap();
    let schema = reconciler.schema();
    assert!(schema.contains("physical_object"));
    assert!(schema.can_play("physical_object", "on", "subject"));
    let history = reconciler.history().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, MigrationStatus::Committed);

    let plan = reconciler
        .plan(scenegraph_core::base_schema_proposal())
        .await
        .unwrap();
    assert!(plan.is_empty());
}

#[tokio::test]
async fn test_analysis_is_migrated_then_ingested() {
    let dir = tempfile::tempdir().unwrap();
    let reconciler = Reconciler::open(dir.path(), EngineConfig::new())
        .await
        .unwrap();
    reconciler.bootstrap().await.unwrap();

    let (plan, _) = reconciler.plan_analysis(OFFICE).await.unwrap();
    let ids: Vec<&str> = plan.operations().iter().map(|op| op.id.as_str()).collect();
    assert_eq!(ids, vec!["define:brand", "define:laptop"]);
    assert!(reconciler.preview(&plan).contains("laptop sub physical_object"));

    let (result, report) = reconciler
        .apply_analysis(OFFICE, Some("office"))
        .await
        .unwrap();
    assert_eq!(result.status, MigrationStatus::Committed);
    assert_eq!(report.entities_inserted, 2);
    assert_eq!(report.relations_inserted, 1);
    assert!(report.failures.is_empty());

    let laptops = reconciler
        .repository()
        .execute_data(&DataStatement::CountInstances {
            type_name: "laptop".into(),
            include_subtypes: false,
        })
        .await
        .unwrap()
        .into_count()
        .unwrap();
    assert_eq!(laptops, 1);

    assert_eq!(reconciler.delete_scene("office").await.unwrap(), 2);
}

#[tokio::test]
async fn test_malformed_analysis_is_a_validation_error() {
    let dir = tempfile::tempdir().unwrap();
    let reconciler = Reconciler::open(dir.path(), EngineConfig::new())
        .await
        .unwrap();
    let err = reconciler
        .plan_analysis(r#"{"schema_changes": {"new_entity_types": [{"name": "bad name!"}]}}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, MigrationError::Validation { .. }));
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert!(reconciler.history().unwrap().is_empty());
}

#[tokio::test]
async fn test_abandon_clears_active_migration() {
    let dir = tempfile::tempdir().unwrap();
    let reconciler = Reconciler::open(dir.path(), EngineConfig::new())
        .await
        .unwrap();
    assert!(reconciler.abandon().unwrap().is_none());

    let plan = reconciler
        .plan(scenegraph_core::base_schema_proposal())
        .await
        .unwrap();
    // A record left behind by a crashed process.
    let record = scenegraph_core::MigrationRecord::begin(&plan).unwrap();
    reconciler.migration_log().save(&record).unwrap();

    let err = reconciler.execute(&plan).await.unwrap_err();
    assert!(matches!(err, MigrationError::MigrationInProgress { .. }));

    let abandoned = reconciler.abandon().unwrap().unwrap();
    assert_eq!(abandoned.id, record.id);
    assert_eq!(abandoned.status, MigrationStatus::Abandoned);
    assert!(reconciler.active_migration().unwrap().is_none());

    let result = reconciler.execute(&plan).await.unwrap();
    assert_eq!(result.status, MigrationStatus::Committed);
    assert_eq!(reconciler.history().unwrap().len(), 2);
}

#[tokio::test]
async fn test_concurrent_analyses_migrate_once() {
    let dir = tempfile::tempdir().unwrap();
    let reconciler = Reconciler::open(dir.path(), EngineConfig::new())
        .await
        .unwrap();
    reconciler.bootstrap().await.unwrap();

    let (first, second) = tokio::join!(
        reconciler.apply_analysis(OFFICE, None),
        reconciler.apply_analysis(OFFICE, None),
    );
    let (first, _) = first.unwrap();
    let (second, _) = second.unwrap();
    let mut applied = vec![first.applied_operations.len(), second.applied_operations.len()];
    applied.sort();
    assert_eq!(applied, vec![0, 2]);
    assert_eq!(first.status, MigrationStatus::Committed);
    assert_eq!(second.status, MigrationStatus::Committed);
    assert!(reconciler.schema().contains("laptop"));
}

#[tokio::test]
async fn test_unknown_value_type_is_reported() {
    let analysis = r#"{
        "schema_changes": {
            "new_attribute_types": [{"name": "serial", "value_type": "uuid"}],
            "new_entity_types": [{"name": "router", "owns": ["serial"]}]
        }
    }"#;
    let dir = tempfile::tempdir().unwrap();
    let reconciler = Reconciler::open(dir.path(), EngineConfig::new())
        .await
        .unwrap();
    reconciler.bootstrap().await.unwrap();

    let (plan, _) = reconciler.plan_analysis(analysis).await.unwrap();
    assert!(plan.warnings()[0].contains("\"uuid\""));
    assert!(plan.operations()[0].payload.to_typeql().contains("value string"));

    let (result, _) = reconciler.apply_analysis(analysis, None).await.unwrap();
    assert_eq!(result.status, MigrationStatus::Committed);
    assert!(result.warnings[0].contains("serial"));
}
