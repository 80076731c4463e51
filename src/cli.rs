// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "quill",
    about = "LLM coding agent: streams a reply, runs authorized tools over your working directory",
    version
)]
pub struct Cli {
    /// The prompt to process.  Reads stdin when omitted.
    pub prompt: Option<String>,

    /// Explicit config file (merged over the discovered layers)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Working directory for tools (default: current directory)
    #[arg(short = 'C', long, value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Model override, e.g. "gpt-4o" (keeps the configured provider)
    #[arg(short, long)]
    pub model: Option<String>,

    /// Auto-approve every permission request for this run
    #[arg(long)]
    pub yolo: bool,

    /// Increase log verbosity (-v debug, -vv trace) on stderr
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the merged configuration as YAML
    ShowConfig,
    /// List the registered tools
    ListTools,
}
