//! Scenegraph Command-Line Client
//!
//! Previews, confirms and applies schema changes proposed by scene
//! analysis against a local scene graph store.

mod commands;
mod formatter;
mod prompt;

use clap::{Parser, Subcommand};
use formatter::OutputFormat;
use scenegraph_core::EngineConfig;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::filter::LevelFilter;

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Scenegraph Command-Line Client
#[derive(Parser, Debug)]
#[command(name = "scenegraph")]
#[command(version, about = "Schema reconciliation for scene graph stores")]
pub struct Args {
    /// Directory holding the store and migration log
    #[arg(long, env = "SCENEGRAPH_DATA_PATH")]
    pub data_path: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "table", value_enum, env = "SCENEGRAPH_FORMAT")]
    pub format: OutputFormat,

    /// Per-statement timeout in seconds
    #[arg(long, default_value_t = 30, env = "SCENEGRAPH_TIMEOUT")]
    pub timeout: u64,

    /// Allow plans that delete live data
    #[arg(long, env = "SCENEGRAPH_ALLOW_DESTRUCTIVE")]
    pub allow_destructive: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the base scene schema
    Init,
    /// Print the current schema
    Schema,
    /// Preview the migration an analysis file would need
    Plan {
        /// Analysis JSON file
        file: PathBuf,
    },
    /// Migrate the schema for an analysis file and insert its data
    Apply {
        /// Analysis JSON file
        file: PathBuf,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
        /// Tag inserted data with a scene id
        #[arg(long)]
        scene_id: Option<String>,
    },
    /// List logged migrations
    History,
    /// Continue an interrupted migration
    Resume,
    /// Give up on an interrupted migration
    Abandon,
    /// Delete the data tagged with a scene id
    ClearScene {
        /// Scene id
        scene_id: String,
    },
}

impl Args {
    /// Engine configuration for these arguments.
    pub fn to_config(&self) -> EngineConfig {
        EngineConfig::new()
            .with_statement_timeout(Duration::from_secs(self.timeout))
            .with_allow_destructive(self.allow_destructive)
    }

    /// Store directory, defaulting to the user's data directory.
    pub fn data_path(&self) -> PathBuf {
        self.data_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("scenegraph")
        })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(
                    "scenegraph=info"
                        .parse()
                        .unwrap_or_else(|_| LevelFilter::INFO.into()),
                )
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    if let Err(e) = commands::run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_apply() {
        let args = Args::try_parse_from([
            "scenegraph",
            "--timeout",
            "5",
            "--allow-destructive",
            "apply",
            "scene.json",
            "--yes",
            "--scene-id",
            "kitchen",
        ])
        .unwrap();

        let config = args.to_config();
        assert_eq!(config.statement_timeout, Duration::from_secs(5));
        assert!(config.allow_destructive);
        match args.command {
            Command::Apply { file, yes, scene_id } => {
                assert_eq!(file, PathBuf::from("scene.json"));
                assert!(yes);
                assert_eq!(scene_id.as_deref(), Some("kitchen"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_explicit_data_path() {
        let args =
            Args::try_parse_from(["scenegraph", "--data-path", "/tmp/sg", "--format", "json", "schema"])
                .unwrap();
        assert_eq!(args.data_path(), PathBuf::from("/tmp/sg"));
        assert_eq!(args.format, OutputFormat::Json);
    }
}
