//! Keel Executable
//!
//! Creates a database or opens one (running recovery) and reports on it.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use keel_core::{Config, Database, MemorySize};
use tracing_subscriber::{filter::EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "keel", version, about = "Page-oriented transactional storage engine")]
struct Cli {
    #[arg(long, global = true, value_name = "FILE", help = "JSON config file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a new, empty database
    Create {
        #[arg(value_name = "PATH", help = "Base path of the database files")]
        path: Option<PathBuf>,
    },
    /// Open a database, recover it, and print its statistics
    Open {
        #[arg(value_name = "PATH", help = "Base path of the database files")]
        path: Option<PathBuf>,

        #[arg(long, value_name = "SIZE", help = "Page cache budget, e.g. 64MB")]
        mem: Option<MemorySize>,
    },
}

fn main() -> anyhow::Result<()> {
    let default_filter = if cfg!(debug_assertions) {
        "keel=debug,keel_core=debug"
    } else {
        "keel=info,keel_core=info"
    };
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Create { path } => {
            let config = resolve_config(cli.config, path, None)?;
            let db = Database::create(&config)
                .with_context(|| format!("creating database at {}", config.path.display()))?;
            db.close()?;
            println!("Created {}", config.path.display());
        }
        Command::Open { path, mem } => {
            let config = resolve_config(cli.config, path, mem)?;
            let db = Database::open(&config)
                .with_context(|| format!("opening database at {}", config.path.display()))?;

            if !db.clean_shutdown() {
                println!("Previous run did not shut down cleanly; recovery was applied");
            }
            let report = db.recovery_report();
            println!(
                "Recovery: {} log records, {} redone, {} undone, {} transactions aborted",
                report.records,
                report.redone,
                report.undone,
                report.aborted.len()
            );
            println!("{}", serde_json::to_string_pretty(&db.stats())?);

            db.close()?;
        }
    }

    Ok(())
}

/// Merge the config file (if any) with command-line overrides.
fn resolve_config(
    file: Option<PathBuf>,
    path: Option<PathBuf>,
    mem: Option<MemorySize>,
) -> anyhow::Result<Config> {
    let mut config = match (file, path) {
        (Some(file), path) => {
            let mut config = Config::load(&file)
                .with_context(|| format!("loading config {}", file.display()))?;
            if let Some(path) = path {
                config.path = path;
            }
            config
        }
        (None, Some(path)) => Config::new(path),
        (None, None) => bail!("a database PATH or --config file is required"),
    };

    if let Some(mem) = mem {
        config.memory = mem;
    }
    Ok(config)
}
