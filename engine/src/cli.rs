//! CLI interface for Quill
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags for running and inspecting agent
//! tasks.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Quill document agent
///
/// Runs document-generation tasks through a plan-act-observe loop backed by
/// an OpenAI-compatible model and records every step in a local SQLite store.
#[derive(Parser, Debug)]
#[command(name = "quill")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create a task and wait for it to finish
    Run {
        /// Document the task writes into
        #[arg(long = "document", value_name = "ID")]
        document_id: i64,

        /// Restrict the run to one section
        #[arg(long = "section", value_name = "ID")]
        section_id: Option<i64>,

        /// Knowledge base to retrieve from
        #[arg(long = "kb", value_name = "ID")]
        knowledge_base_id: Option<i64>,

        /// Run mode (STANDARD or FAST_DRAFT)
        #[arg(long, default_value = "STANDARD")]
        mode: String,

        /// What the document should cover
        #[arg(long)]
        requirement: Option<String>,

        /// Opaque project parameters, usually JSON
        #[arg(long)]
        params: Option<String>,

        /// Write the composed markdown to this file
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Show a task with its steps
    Show {
        /// Task ID
        task_id: i64,
    },

    /// List the newest tasks of a document
    List {
        #[arg(long = "document", value_name = "ID")]
        document_id: i64,

        /// Number of tasks to show (clamped to 1..=50, default: 10)
        #[arg(short, long)]
        limit: Option<i64>,
    },

    /// Fail steps and tasks left RUNNING by an interrupted process
    Recover,
}
