//! CLI definitions using clap.

use std::path::PathBuf;

use clap::Parser;

/// Bub - a parallel planner/executor build engine for C-family source trees
#[derive(Parser)]
#[command(name = "bub")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log each statement as it is processed
    #[arg(short = 's', long)]
    pub statements: bool,

    /// Log dependency-cache activity
    #[arg(short = 'd', long)]
    pub deps: bool,

    /// Log why each rebuilt action was dirty
    #[arg(long)]
    pub culprit: bool,

    /// Verbose engine diagnostics
    #[arg(short = 'v', long)]
    pub details: bool,

    /// Log action dispatch and completion
    #[arg(short = 'a', long)]
    pub actions: bool,

    /// Number of parallel jobs
    #[arg(short = 'j', long, value_name = "N")]
    pub jobs: Option<usize>,

    /// Soft timeout for test actions, in seconds
    #[arg(short = 't', long, value_name = "SECS")]
    pub test: Option<u64>,

    /// Remove all build outputs and exit
    #[arg(short = 'c', long)]
    pub clean: bool,

    /// Build directory (defaults to the current directory)
    pub build_dir: Option<PathBuf>,
}
