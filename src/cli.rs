// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "otto",
    version,
    about = "A terminal AI coding agent for local OpenAI-compatible models"
)]
pub struct Cli {
    /// One-shot prompt.  Omit to start an interactive session.
    pub prompt: Option<String>,

    /// Explicit config file (otherwise the standard search paths are merged)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Model name override
    #[arg(long)]
    pub model: Option<String>,

    /// Chat endpoint base URL override, e.g. http://localhost:8080/v1
    #[arg(long)]
    pub base_url: Option<String>,

    /// Start in plan mode (read-only tool catalog)
    #[arg(long, conflicts_with = "sandbox")]
    pub plan: bool,

    /// Start in sandbox mode (read-only tool catalog)
    #[arg(long)]
    pub sandbox: bool,

    /// Restrict file-affecting tools to paths under this directory
    #[arg(long)]
    pub restrict_dir: Option<PathBuf>,

    /// Maximum model↔tool iterations per user turn
    #[arg(long)]
    pub max_iterations: Option<u32>,

    /// Approve every tool call without asking (deny patterns still apply)
    #[arg(long)]
    pub yes: bool,

    /// Resume a saved session by id (see `otto sessions`)
    #[arg(long)]
    pub resume: Option<String>,

    /// Log to stderr (or set OTTO_LOG_FILE for a file)
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the merged configuration as YAML
    ShowConfig,
    /// List models reported by the endpoint's /models route
    ListModels,
    /// List saved sessions
    Sessions,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn bare_invocation_is_interactive() {
        let cli = Cli::parse_from(["otto"]);
        assert!(cli.prompt.is_none());
        assert!(cli.command.is_none());
    }

    #[test]
    fn positional_prompt_is_one_shot() {
        let cli = Cli::parse_from(["otto", "fix the tests"]);
        assert_eq!(cli.prompt.as_deref(), Some("fix the tests"));
    }

    #[test]
    fn plan_and_sandbox_conflict() {
        assert!(Cli::try_parse_from(["otto", "--plan", "--sandbox"]).is_err());
    }

    #[test]
    fn overrides_parse() {
        let cli = Cli::parse_from([
            "otto",
            "--model",
            "qwen2.5-coder",
            "--base-url",
            "http://localhost:1234/v1",
            "--max-iterations",
            "7",
        ]);
        assert_eq!(cli.model.as_deref(), Some("qwen2.5-coder"));
        assert_eq!(cli.base_url.as_deref(), Some("http://localhost:1234/v1"));
        assert_eq!(cli.max_iterations, Some(7));
    }

    #[test]
    fn show_config_subcommand() {
        let cli = Cli::parse_from(["otto", "show-config"]);
        assert!(matches!(cli.command, Some(Commands::ShowConfig)));
    }
}
