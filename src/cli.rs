use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "maildex",
    about = "Full-text index and search for local email archives"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors, and hide progress bars
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Index new and changed messages (incremental)
    Index(IndexArgs),
    /// Drop the index and re-index every message
    Rebuild(RebuildArgs),
    /// Search indexed messages
    Search(SearchArgs),
    /// Show index statistics and health
    Status(StatusArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Index --

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// Archive directory (defaults to the one used last time)
    #[arg(short, long)]
    pub archive: Option<PathBuf>,

    /// Re-extract every message instead of only changed ones
    #[arg(long)]
    pub full: bool,

    /// Also index message bodies
    #[arg(long)]
    pub content: bool,
}

// -- Rebuild --

#[derive(Debug, Parser)]
pub struct RebuildArgs {
    /// Archive directory (defaults to the one used last time)
    #[arg(short, long)]
    pub archive: Option<PathBuf>,

    /// Also index message bodies
    #[arg(long)]
    pub content: bool,

    /// Do not ask for confirmation
    #[arg(short, long)]
    pub yes: bool,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query, e.g. `from:alice budget -draft`
    #[arg(allow_hyphen_values = true)]
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "100")]
    pub take: usize,

    /// Number of results to skip
    #[arg(long, default_value = "0")]
    pub skip: usize,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Verify checksums and read back every document
    #[arg(long)]
    pub deep: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "maildex",
            &mut std::io::stdout(),
        );
    }
}
