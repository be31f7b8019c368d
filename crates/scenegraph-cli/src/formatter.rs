//! Output formatters for plans, results and schema listings.

use clap::ValueEnum;
use comfy_table::{Cell, Table};
use scenegraph_core::ingest::IngestReport;
use scenegraph_core::{MigrationPlan, MigrationRecord, MigrationResult, SchemaState, TypeDef};
use serde_json::json;

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter: Send + Sync {
    /// Format the current schema.
    fn format_schema(&self, schema: &SchemaState) -> String;

    /// Format a plan preview.
    fn format_plan(&self, plan: &MigrationPlan) -> String;

    /// Format the outcome of an execution.
    fn format_result(&self, result: &MigrationResult) -> String;

    /// Format logged migrations.
    fn format_history(&self, records: &[MigrationRecord]) -> String;

    /// Format an ingest report.
    fn format_ingest(&self, report: &IngestReport) -> String;

    /// Format a simple message.
    fn format_message(&self, message: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_schema(&self, schema: &SchemaState) -> String {
        if schema.is_empty() {
            return "Schema is empty; run `scenegraph init`".to_string();
        }
        let mut table = Table::new();
        table.set_header(vec!["Type", "Kind", "Supertype", "Value", "Owns", "Plays", "Relates"]);
        for def in schema.ordered_definitions() {
            table.add_row(vec![
                Cell::new(def.name()),
                Cell::new(def.kind()),
                Cell::new(def.supertype().unwrap_or("")),
                Cell::new(def.value_kind().map(|v| v.to_string()).unwrap_or_default()),
                Cell::new(join(def.owns())),
                Cell::new(join(def.plays())),
                Cell::new(join(def.relates())),
            ]);
        }
        format!("{}\n{} type(s)", table, schema.len())
    }

    fn format_plan(&self, plan: &MigrationPlan) -> String {
        let mut output = format!("Plan {}: {}", plan.fingerprint().short(), plan.summary());
        if !plan.is_empty() {
            let mut table = Table::new();
            table.set_header(vec!["Operation", "Kind", "Statement", "Depends on", "Data steps"]);
            for op in plan.operations() {
                let steps: Vec<String> = op.migration_steps.iter().map(|s| s.to_string()).collect();
                table.add_row(vec![
                    Cell::new(&op.id),
                    Cell::new(op.kind),
                    Cell::new(op.payload.to_typeql()),
                    Cell::new(join(&op.depends_on)),
                    Cell::new(steps.join("\n")),
                ]);
            }
            output.push('\n');
            output.push_str(&table.to_string());
        }
        for skipped in plan.skipped() {
            output.push_str(&format!("\nskipped: {}", skipped));
        }
        for warning in plan.warnings() {
            output.push_str(&format!("\nwarning: {}", warning));
        }
        output
    }

    fn format_result(&self, result: &MigrationResult) -> String {
        let mut output = format!(
            "Migration {} {} ({} operation(s) applied, {} instance(s) migrated)",
            result.fingerprint.short(),
            result.status,
            result.applied_operations.len(),
            result.instances_migrated()
        );
        if let Some(op) = &result.failing_operation {
            output.push_str(&format!("\nfailed at: {}", op.id));
        }
        if let Some(error) = &result.error {
            output.push_str(&format!("\nerror ({}): {}", error.category(), error));
        }
        if !result.step_reports.is_empty() {
            let mut table = Table::new();
            table.set_header(vec!["Operation", "Step", "Processed", "Expected"]);
            for report in &result.step_reports {
                table.add_row(vec![
                    Cell::new(&report.operation),
                    Cell::new(report.step),
                    Cell::new(report.processed),
                    Cell::new(report.expected),
                ]);
            }
            output.push('\n');
            output.push_str(&table.to_string());
        }
        if !result.compensation.is_empty() {
            output.push_str("\ncompensation:");
            for action in &result.compensation {
                output.push_str(&format!("\n  {}", action));
            }
        }
        if !result.not_attempted.is_empty() {
            output.push_str(&format!("\nnot attempted: {}", result.not_attempted.join(", ")));
        }
        for warning in &result.warnings {
            output.push_str(&format!("\nwarning: {}", warning));
        }
        output
    }

    fn format_history(&self, records: &[MigrationRecord]) -> String {
        if records.is_empty() {
            return "No migrations recorded".to_string();
        }
        let mut table = Table::new();
        table.set_header(vec!["Id", "Fingerprint", "Status", "Applied", "Migrated", "Started", "Error"]);
        for record in records {
            table.add_row(vec![
                Cell::new(record.id_hex()),
                Cell::new(short_hex(&record.fingerprint)),
                Cell::new(record.status),
                Cell::new(format!("{}/{}", record.applied.len(), record.operations.len())),
                Cell::new(record.instances_migrated),
                Cell::new(format_timestamp(record.started_at)),
                Cell::new(record.error.as_deref().unwrap_or("")),
            ]);
        }
        format!("{}\n{} migration(s)", table, records.len())
    }

    fn format_ingest(&self, report: &IngestReport) -> String {
        let mut output = format!(
            "Inserted {} entity(ies) and {} relation(s); dropped {} attribute value(s)",
            report.entities_inserted, report.relations_inserted, report.attributes_dropped
        );
        if !report.failures.is_empty() {
            let mut table = Table::new();
            table.set_header(vec!["Record", "Reason"]);
            for failure in &report.failures {
                table.add_row(vec![&failure.record, &failure.reason]);
            }
            output.push('\n');
            output.push_str(&table.to_string());
        }
        output
    }

    fn format_message(&self, message: &str) -> String {
        message.to_string()
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_schema(&self, schema: &SchemaState) -> String {
        let defs: Vec<&TypeDef> = schema.ordered_definitions();
        pretty(&json!(defs))
    }

    fn format_plan(&self, plan: &MigrationPlan) -> String {
        let operations: Vec<serde_json::Value> = plan
            .operations()
            .iter()
            .map(|op| {
                json!({
                    "id": op.id,
                    "kind": op.kind.to_string(),
                    "target": op.target,
                    "statement": op.payload.to_typeql(),
                    "depends_on": op.depends_on,
                    "migration_steps": op.migration_steps.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                })
            })
            .collect();
        pretty(&json!({
            "fingerprint": plan.fingerprint().to_hex(),
            "summary": plan.summary(),
            "destructive": plan.is_destructive(),
            "operations": operations,
            "skipped": plan.skipped(),
            "warnings": plan.warnings(),
        }))
    }

    fn format_result(&self, result: &MigrationResult) -> String {
        let steps: Vec<serde_json::Value> = result
            .step_reports
            .iter()
            .map(|r| {
                json!({
                    "operation": r.operation,
                    "step": r.step,
                    "processed": r.processed,
                    "expected": r.expected,
                })
            })
            .collect();
        pretty(&json!({
            "fingerprint": result.fingerprint.to_hex(),
            "status": result.status.to_string(),
            "applied_operations": result.applied_operations,
            "failing_operation": result.failing_operation.as_ref().map(|op| op.id.clone()),
            "error": result.error.as_ref().map(|e| json!({
                "category": e.category().to_string(),
                "message": e.to_string(),
            })),
            "compensation": result.compensation.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
            "step_reports": steps,
            "not_attempted": result.not_attempted,
            "warnings": result.warnings,
            "instances_migrated": result.instances_migrated(),
        }))
    }

    fn format_history(&self, records: &[MigrationRecord]) -> String {
        let rows: Vec<serde_json::Value> = records
            .iter()
            .map(|record| {
                json!({
                    "id": record.id_hex(),
                    "fingerprint": record.fingerprint,
                    "status": record.status.to_string(),
                    "operations": record.operations,
                    "applied": record.applied,
                    "failed": record.failed,
                    "error": record.error,
                    "compensation": record.compensation,
                    "instances_migrated": record.instances_migrated,
                    "started_at": record.started_at,
                    "finished_at": record.finished_at,
                })
            })
            .collect();
        pretty(&json!(rows))
    }

    fn format_ingest(&self, report: &IngestReport) -> String {
        let failures: Vec<serde_json::Value> = report
            .failures
            .iter()
            .map(|f| json!({ "record": f.record, "reason": f.reason }))
            .collect();
        pretty(&json!({
            "entities_inserted": report.entities_inserted,
            "relations_inserted": report.relations_inserted,
            "attributes_dropped": report.attributes_dropped,
            "failures": failures,
        }))
    }

    fn format_message(&self, message: &str) -> String {
        json!({ "message": message }).to_string()
    }
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

/// Comma-separated list of displayable items.
fn join<T: std::fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    items
        .into_iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn short_hex(hex: &str) -> &str {
    hex.get(..12).unwrap_or(hex)
}

/// Microsecond timestamp as Unix seconds.
fn format_timestamp(micros: u64) -> String {
    format!("{}", micros / 1_000_000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use scenegraph_core::ingest::IngestFailure;

    #[test]
    fn test_join() {
        let items = ["color", "name"];
        assert_eq!(join(items), "color, name");
        assert_eq!(join(Vec::<String>::new()), "");
    }

    #[test]
    fn test_short_hex() {
        assert_eq!(short_hex("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_hex("abc"), "abc");
    }

    #[test]
    fn test_empty_schema_hint() {
        let output = TableFormatter.format_schema(&SchemaState::new());
        assert!(output.contains("scenegraph init"));
        assert_eq!(JsonFormatter.format_schema(&SchemaState::new()), "[]");
    }

    #[test]
    fn test_ingest_failures_listed() {
        let report = IngestReport {
            entities_inserted: 2,
            relations_inserted: 0,
            attributes_dropped: 1,
            failures: vec![IngestFailure {
                record: "on(laptop_1, desk)".to_string(),
                reason: "unknown endpoint desk".to_string(),
            }],
        };
        let table = TableFormatter.format_ingest(&report);
        assert!(table.starts_with("Inserted 2 entity(ies)"));
        assert!(table.contains("unknown endpoint desk"));

        let json: serde_json::Value =
            serde_json::from_str(&JsonFormatter.format_ingest(&report)).unwrap();
        assert_eq!(json["failures"][0]["record"], "on(laptop_1, desk)");
    }
}
