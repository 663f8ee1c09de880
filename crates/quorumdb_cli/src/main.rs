//! QuorumDB CLI
//!
//! Operator tools for QuorumDB replicas.
//!
//! # Commands
//!
//! - `inspect` - Show log metadata and the recovered collections
//! - `verify` - Check every envelope of a log file
//! - `dump-log` - Print log entries for debugging
//! - `serve` - Run a replica over TCP

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// QuorumDB command-line tools.
#[derive(Parser)]
#[command(name = "quorumdb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the replica data directory
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show log metadata and the recovered collections
    Inspect {
        /// List collections with their key counts
        #[arg(short, long)]
        collections: bool,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Check every envelope of the log
    Verify,

    /// Print log entries for debugging
    DumpLog {
        /// Maximum number of entries to print
        #[arg(short, long)]
        limit: Option<usize>,

        /// Skip records below this sequence
        #[arg(long, default_value = "1")]
        from_seq: u64,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Run a replica over TCP until interrupted
    Serve {
        /// This replica's id
        #[arg(long)]
        id: u32,

        /// Every member as `id=host:port`, this replica included
        #[arg(long, value_delimiter = ',', required = true)]
        members: Vec<String>,

        /// Heartbeat interval in milliseconds
        #[arg(long, default_value = "100")]
        heartbeat_ms: u64,

        /// Base election timeout in milliseconds
        #[arg(long, default_value = "500")]
        election_ms: u64,

        /// Replication timeout in milliseconds
        #[arg(long, default_value = "2000")]
        replication_ms: u64,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Inspect {
            collections,
            format,
        } => {
            let path = cli.path.ok_or("Data directory required for inspect")?;
            commands::inspect::run(&path, collections, &format)?;
        }
        Commands::Verify => {
            let path = cli.path.ok_or("Data directory required for verify")?;
            commands::verify::run(&path)?;
        }
        Commands::DumpLog {
            limit,
            from_seq,
            format,
        } => {
            let path = cli.path.ok_or("Data directory required for dump-log")?;
            commands::dump_log::run(&path, limit, from_seq, &format)?;
        }
        Commands::Serve {
            id,
            members,
            heartbeat_ms,
            election_ms,
            replication_ms,
        } => {
            let path = cli.path.ok_or("Data directory required for serve")?;
            let options = commands::serve::ServeOptions {
                id,
                members: commands::serve::parse_members(&members)?,
                heartbeat_ms,
                election_ms,
                replication_ms,
            };
            commands::serve::run(&path, &options)?;
        }
        Commands::Version => {
            println!("QuorumDB CLI v{}", env!("CARGO_PKG_VERSION"));
            println!("QuorumDB Core v{}", quorumdb_core::VERSION);
            println!("Wire protocol v{}", quorumdb_protocol::PROTOCOL_VERSION);
        }
    }

    Ok(())
}
