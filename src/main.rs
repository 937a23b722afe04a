//! # askdb CLI
//!
//! Ask natural-language questions against a configured database.
//!
//! ```bash
//! askdb --config ./askdb.toml index --db company
//! askdb --config ./askdb.toml ask --db company "Who earns the most?"
//! askdb --config ./askdb.toml schema --db company
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use askdb::config;
use askdb::models::ConversationTurn;
use askdb::Harness;

#[derive(Parser)]
#[command(
    name = "askdb",
    about = "Natural-language-to-SQL retrieval and generation harness",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./askdb.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the value and catalog indices for a database.
    ///
    /// Reads the live schema, profiles the textual columns, and stores
    /// MinHash signatures plus embedding vectors through the backend.
    Index {
        /// Database id (file stem for sqlite, schema name for mysql).
        #[arg(long)]
        db: String,
    },

    /// Clear both indices for a database.
    ClearIndex {
        /// Database id.
        #[arg(long)]
        db: String,
    },

    /// Ask a question against a database.
    ///
    /// Prints the final response and, with `--json`, the full structured
    /// result including SQL, rows, and execution history.
    Ask {
        /// The natural-language question.
        question: String,

        /// Database id.
        #[arg(long)]
        db: String,

        /// Optional hint or evidence to steer generation.
        #[arg(long, default_value = "")]
        hint: String,

        /// Print the full JSON response instead of just the narration.
        #[arg(long)]
        json: bool,
    },

    /// Print the introspected schema of a database.
    Schema {
        /// Database id.
        #[arg(long)]
        db: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Index { db } => {
            let harness = Harness::new(cfg, &db)?;
            let (report, vectors) = harness.build_indexes().await?;
            println!(
                "Indexed {} columns ({} values, {} skipped), stored {} vectors.",
                report.columns_indexed, report.values_indexed, report.columns_skipped, vectors
            );
        }
        Commands::ClearIndex { db } => {
            let harness = Harness::new(cfg, &db)?;
            harness.clear_indexes().await?;
            println!("Indices cleared for {db}.");
        }
        Commands::Ask {
            question,
            db,
            hint,
            json,
        } => {
            let harness = Harness::new(cfg, &db)?;
            let response = harness
                .ask(&question, &hint, &db, Vec::<ConversationTurn>::new())
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                println!("{}", response.response);
                if let Some(sql) = &response.sql {
                    eprintln!("-- {sql}");
                }
            }
        }
        Commands::Schema { db } => {
            let harness = Harness::new(cfg, &db)?;
            let schema = harness.backend().schema().await?;
            for (table, columns) in schema {
                println!("{table}: {}", columns.join(", "));
            }
        }
    }

    Ok(())
}
