//! CLI parse: clap types for draftbench. No behavior; definitions only.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Draftbench - sandboxed workbenches with draft, publish and checkpoint history
#[derive(Parser)]
#[command(name = "draftbench")]
#[command(about = "Workbench engine: drafts, checkpoints and an agentic workshop over JSON-RPC")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Workbenches directory (overrides configuration)
    #[arg(long)]
    pub workbenches_dir: Option<PathBuf>,

    /// Configuration file path (overrides default config loading)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging (default: off, except for `serve`)
    #[arg(long, default_value = "false")]
    pub verbose: bool,

    /// Log level (trace, debug, info, warn, error, off)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format (json, text)
    #[arg(long)]
    pub log_format: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve JSON-RPC on stdin/stdout
    Serve,
    /// Workbench commands
    Workbench {
        #[command(subcommand)]
        command: WorkbenchCommands,
    },
    /// Draft commands
    Draft {
        #[command(subcommand)]
        command: DraftCommands,
    },
    /// Checkpoint commands
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommands,
    },
    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum WorkbenchCommands {
    /// Create a workbench
    Create {
        /// Display name
        name: String,
    },
    /// List workbenches
    List {
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Delete a workbench and everything in it
    Delete {
        workbench_id: String,
    },
    /// Copy files into the published tree
    AddFiles {
        workbench_id: String,
        /// Files to copy
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// List files of a tree
    Files {
        workbench_id: String,
        /// List the draft tree instead of the published one
        #[arg(long)]
        draft: bool,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
}

#[derive(Subcommand)]
pub enum DraftCommands {
    /// Show the draft state
    State {
        workbench_id: String,
    },
    /// Create a draft from the published tree
    Create {
        workbench_id: String,
    },
    /// Publish the draft
    Publish {
        workbench_id: String,
        /// Allow publishing a draft that removes files
        #[arg(long)]
        confirm_deletions: bool,
    },
    /// Discard the draft
    Discard {
        workbench_id: String,
    },
}

#[derive(Subcommand)]
pub enum CheckpointCommands {
    /// List checkpoints, newest first
    List {
        workbench_id: String,
        /// Output format (text or json)
        #[arg(long, default_value = "text")]
        format: String,
    },
    /// Create a manual checkpoint
    Create {
        workbench_id: String,
        /// Description shown in the history
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Restore the published tree to a checkpoint
    Restore {
        workbench_id: String,
        checkpoint_id: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the effective configuration
    Validate,
}
