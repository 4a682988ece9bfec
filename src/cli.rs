use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "agency", version, about = "Orchestration server for a team of CLI coding agents")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP API and the agent manager
    Serve {
        /// Directory holding agents/<name>/AGENT.md role definitions
        #[arg(long)]
        agency_dir: Option<PathBuf>,

        /// Directory for the database and session transcripts
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Working directory handed to agent processes
        #[arg(long)]
        projects_dir: Option<PathBuf>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to bind
        #[arg(short, long)]
        port: Option<u16>,

        /// Enable the orchestration cycle at startup
        #[arg(long)]
        auto_orchestrate: bool,

        /// Orchestration cycle interval in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Path to config file (overrides default search)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Create the agency directory layout and stub role definitions
    Init {
        /// Directory to initialize
        #[arg(long)]
        agency_dir: Option<PathBuf>,
    },
}
