//! Subcommand handling.

use crate::formatter::{self, Formatter};
use crate::prompt;
use crate::{Args, Command};
use scenegraph_core::{ErrorCategory, MigrationError, MigrationResult, Reconciler};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

/// Errors surfaced by the command-line client.
#[derive(Debug, Error)]
pub enum CliError {
    /// Planning or executing a migration failed.
    #[error(transparent)]
    Migration(#[from] MigrationError),

    /// An input file could not be read.
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The confirmation prompt failed.
    #[error("prompt failed: {0}")]
    Prompt(#[from] rustyline::error::ReadlineError),

    /// The operator declined the plan.
    #[error("migration cancelled")]
    Declined,
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Migration(e) => match e.category() {
                ErrorCategory::Validation | ErrorCategory::Conflict | ErrorCategory::Dependency => 2,
                ErrorCategory::Execution => 3,
                ErrorCategory::PartialMigration => 4,
                ErrorCategory::Internal => 1,
            },
            CliError::Io { .. } => 2,
            CliError::Prompt(_) => 1,
            CliError::Declined => 5,
        }
    }
}

/// Run one subcommand against the store at the configured path.
pub async fn run(args: Args) -> Result<(), CliError> {
    let config = args.to_config();
    let path = args.data_path();
    info!(path = %path.display(), "opening store");
    let reconciler = Reconciler::open(&path, config).await?;
    let formatter = formatter::create_formatter(args.format);

    match args.command {
        Command::Init => {
            let result = reconciler.bootstrap().await?;
            println!("{}", formatter.format_result(&result));
        }
        Command::Schema => {
            println!("{}", formatter.format_schema(&reconciler.schema()));
        }
        Command::Plan { file } => {
            let json = read_file(&file)?;
            let (plan, _) = reconciler.plan_analysis(&json).await?;
            println!("{}", formatter.format_plan(&plan));
        }
        Command::Apply { file, yes, scene_id } => {
            apply(&reconciler, &*formatter, &file, yes, scene_id.as_deref()).await?;
        }
        Command::History => {
            println!("{}", formatter.format_history(&reconciler.history()?));
        }
        Command::Resume => match reconciler.resume().await? {
            Some(result) => {
                println!("{}", formatter.format_result(&result));
                finish(result)?;
            }
            None => println!("{}", formatter.format_message("No interrupted migration")),
        },
        Command::Abandon => match reconciler.abandon()? {
            Some(record) => println!(
                "{}",
                formatter.format_message(&format!("Abandoned migration {}", record.id_hex()))
            ),
            None => println!("{}", formatter.format_message("No interrupted migration")),
        },
        Command::ClearScene { scene_id } => {
            let deleted = reconciler.delete_scene(&scene_id).await?;
            println!(
                "{}",
                formatter.format_message(&format!(
                    "Deleted {} instance(s) tagged with scene {}",
                    deleted, scene_id
                ))
            );
        }
    }

    Ok(())
}

/// Preview, confirm, execute, then ingest the analysis data.
async fn apply(
    reconciler: &Reconciler,
    formatter: &dyn Formatter,
    file: &Path,
    yes: bool,
    scene_id: Option<&str>,
) -> Result<(), CliError> {
    let json = read_file(file)?;
    let (plan, analysis) = reconciler.plan_analysis(&json).await?;
    println!("{}", formatter.format_plan(&plan));

    if !plan.is_empty() {
        if !yes && !prompt::confirm("Apply these schema changes?")? {
            return Err(CliError::Declined);
        }
        let result = reconciler.execute(&plan).await?;
        println!("{}", formatter.format_result(&result));
        finish(result)?;
    }

    let observations = analysis.all_observations();
    if !observations.is_empty() {
        let report = reconciler.ingest(&observations, scene_id).await;
        println!("{}", formatter.format_ingest(&report));
    }
    Ok(())
}

fn finish(result: MigrationResult) -> Result<(), CliError> {
    result.ensure_committed()?;
    Ok(())
}

fn read_file(path: &Path) -> Result<String, CliError> {
    std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_follow_error_category() {
        let err = CliError::from(MigrationError::validation("bad name"));
        assert_eq!(err.exit_code(), 2);
        assert_eq!(CliError::Declined.exit_code(), 5);
    }

    #[test]
    fn test_missing_file() {
        let err = read_file(Path::new("/nonexistent/analysis.json")).unwrap_err();
        assert!(matches!(err, CliError::Io { .. }));
        assert!(err.to_string().contains("analysis.json"));
    }
}
