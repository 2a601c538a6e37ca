use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// archtarget - archive target runtime
#[derive(Parser, Debug)]
#[command(name = "archtarget")]
#[command(about = "Validate archive targets, probe their free space and run transfers")]
#[command(version)]
pub struct Cli {
    /// Operator configuration file (archiving target and env)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Extra target definitions, merged over the built-ins by id
    #[arg(long, global = true)]
    pub definitions: Option<PathBuf>,

    /// Target to use instead of `archiving.target` from the config
    #[arg(short, long, global = true)]
    pub target: Option<String>,

    /// Variable override, repeatable (KEY=VALUE)
    #[arg(short, long = "env", value_name = "KEY=VALUE", global = true)]
    pub env: Vec<String>,

    /// Dry-run mode: render and log transfers without running them.
    ///
    /// Disk space probes are read-only and still execute.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// More log output (repeat for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, conflicts_with = "quiet")]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List known targets and their mandatory variables
    Targets,
    /// Show a target's variables and backends
    Show {
        /// Target id
        id: String,
    },
    /// Load configuration and definitions, resolve env and render every template
    Validate,
    /// Print the rendered probe, transfer and process identity of the target
    Render {
        /// Source file bound into the transfer
        #[arg(long, default_value = "/path/to/source")]
        source: PathBuf,
        /// Destination bound into the transfer
        #[arg(long, default_value = "/path/to/destination")]
        destination: PathBuf,
    },
    /// Run the disk space probe of the target
    Probe {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Transfer one file to the target
    Transfer {
        /// File to transfer
        source: PathBuf,
        /// Destination on the target
        destination: PathBuf,
        /// Append transfer output to this file instead of the log. The
        /// transfer then keeps running if this command is killed.
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// List in-flight transfers for every configured target
    Processes {
        /// Print the matches as JSON
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
