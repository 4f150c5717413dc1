// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;
mod session;

use std::io::Write;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use otto_config::{AgentMode, Config};
use otto_core::{Agent, AgentEvent, SessionStore};
use otto_mcp::McpClient;
use otto_model::ModelProvider;
use otto_tools::{
    register_background_tools, register_builtins, ApprovalDecision, ApprovalHandler,
    BackgroundProcessTable, CheckpointStore, Dispatcher, DispatcherOptions, HookRunner,
    OutputSink, PermissionEngine, RiskLevel, ToolRegistry,
};
use session::FileSessionStore;

/// Window within which a second Ctrl-C terminates the process.
const INTERRUPT_EXIT_WINDOW: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(cmd) = &cli.command {
        let config = load_config(&cli)?;
        match cmd {
            Commands::ShowConfig => {
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                return Ok(());
            }
            Commands::ListModels => {
                let provider = otto_model::from_config(&config.model);
                for m in provider.list_models().await? {
                    println!("{}", m.id);
                }
                return Ok(());
            }
            Commands::Sessions => {
                for s in FileSessionStore::default_location().list() {
                    println!("{}  {:>4} messages  {}", s.id, s.message_count, s.title);
                }
                return Ok(());
            }
        }
    }

    let config = load_config(&cli)?;
    let (mut agent, background) = build_agent(&cli, &config).await?;

    let store = FileSessionStore::default_location();
    if let Some(id) = &cli.resume {
        match store.load(id) {
            Some(conv) => {
                eprintln!("[resumed session {id} with {} messages]", conv.len());
                *agent.conversation_mut() = conv;
            }
            None => anyhow::bail!("no saved session with id '{id}'"),
        }
    }

    let (tx, rx) = mpsc::channel::<AgentEvent>(256);
    let printer = tokio::spawn(print_events(rx));

    let result = match &cli.prompt {
        Some(prompt) => run_one_shot(&mut agent, prompt, tx).await,
        None => run_interactive(&mut agent, tx).await,
    };

    save_session(&store, &agent);
    background.kill_all().await;
    let _ = printer.await;
    result
}

/// Persist the conversation, titled by its first user message.
fn save_session(store: &FileSessionStore, agent: &Agent) {
    let conv = agent.conversation();
    if conv.is_empty() {
        return;
    }
    let title: String = conv
        .messages()
        .iter()
        .find_map(|m| m.as_text())
        .unwrap_or("untitled")
        .chars()
        .take(60)
        .collect();
    store.save(&conv.id, conv, &title);
}

fn init_logging(verbose: bool) {
    // Logging corrupts interactive output, so it stays off unless the user
    // opts in with --verbose (stderr) or OTTO_LOG_FILE (file).
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "info" } else { "off" }));
    if let Ok(path) = std::env::var("OTTO_LOG_FILE") {
        if let Ok(file) = std::fs::File::create(path) {
            tracing_subscriber::registry()
                .with(fmt::layer().with_writer(file).with_ansi(false))
                .with(filter)
                .init();
            return;
        }
    }
    if verbose {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = otto_config::load(cli.config.as_deref())?;
    if let Some(model) = &cli.model {
        config.model.name = model.clone();
    }
    if let Some(base_url) = &cli.base_url {
        config.model.base_url = base_url.clone();
    }
    if let Some(n) = cli.max_iterations {
        config.agent.max_iterations = n;
    }
    if let Some(dir) = &cli.restrict_dir {
        config.agent.restrict_dir = Some(dir.to_string_lossy().into_owned());
    }
    if cli.yes {
        config.permissions.auto_approve_all = true;
    }
    Ok(config)
}

/// Forwards incremental tool output (e.g. a long build) to the terminal.
struct StderrLineSink;

impl OutputSink for StderrLineSink {
    fn line(&self, line: &str) {
        eprintln!("  | {line}");
    }
}

/// Prompt on the terminal for tool approval.
struct TerminalApprovalHandler;

#[async_trait::async_trait]
impl ApprovalHandler for TerminalApprovalHandler {
    async fn request_approval(
        &self,
        tool: &str,
        risk: RiskLevel,
        args: &serde_json::Value,
    ) -> ApprovalDecision {
        let tool = tool.to_string();
        let args = args.clone();
        tokio::task::spawn_blocking(move || {
            eprintln!("\notto wants to run {tool} ({risk:?}) with {args}");
            eprint!("allow? [y]es / [a]lways this session / [N]o: ");
            let _ = std::io::stderr().flush();
            let mut line = String::new();
            if std::io::stdin().read_line(&mut line).is_err() {
                return ApprovalDecision::Denied;
            }
            match line.trim().to_lowercase().as_str() {
                "y" | "yes" => ApprovalDecision::Approved,
                "a" | "always" => ApprovalDecision::ApproveAll,
                _ => ApprovalDecision::Denied,
            }
        })
        .await
        .unwrap_or(ApprovalDecision::Denied)
    }
}

async fn build_agent(
    cli: &Cli,
    config: &Config,
) -> anyhow::Result<(Agent, Arc<BackgroundProcessTable>)> {
    let provider = otto_model::from_config(&config.model);

    let mut registry = ToolRegistry::new();
    register_builtins(&mut registry, &config.permissions.disabled_tools);
    let background = Arc::new(BackgroundProcessTable::new());
    register_background_tools(&mut registry, Arc::clone(&background));

    // Connect configured MCP servers and proxy their tools in.  A server
    // that fails to come up is reported and skipped; the session still works
    // with the remaining tools.
    for (name, server_cfg) in &config.mcp_servers {
        match McpClient::spawn(name, server_cfg) {
            Ok(client) => {
                if let Err(e) = client.initialize().await {
                    eprintln!("warning: mcp server '{name}' failed to initialize: {e}");
                    continue;
                }
                match otto_mcp::register_server_tools(&mut registry, client).await {
                    Ok(n) => tracing::info!(server = %name, tools = n, "mcp server connected"),
                    Err(e) => eprintln!("warning: mcp server '{name}' tool listing failed: {e}"),
                }
            }
            Err(e) => eprintln!("warning: could not spawn mcp server '{name}': {e}"),
        }
    }
    let registry = Arc::new(registry);

    let handler: Option<Box<dyn ApprovalHandler>> = if config.permissions.auto_approve_all {
        None
    } else {
        Some(Box::new(TerminalApprovalHandler))
    };
    let permissions = Arc::new(PermissionEngine::from_config(&config.permissions, handler));

    let checkpoint_root = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("otto/checkpoints");
    let options = DispatcherOptions {
        max_parallel: config.agent.max_parallel_tool_calls,
        default_timeout_secs: config.agent.tool_timeout_secs,
        restrict_dir: config.agent.restrict_dir.as_ref().map(|d| {
            std::path::PathBuf::from(shellexpand::tilde(d).into_owned())
        }),
        ..Default::default()
    };
    let dispatcher = Arc::new(
        Dispatcher::new(
            Arc::clone(&registry),
            permissions,
            Arc::new(HookRunner::new(config.hooks.clone())),
            Arc::new(CheckpointStore::new(checkpoint_root)),
            options,
        )
        .with_sink(Arc::new(StderrLineSink)),
    );

    let mut agent = Agent::new(
        provider,
        registry,
        dispatcher,
        config.agent.clone(),
        config.model.clone(),
    );
    if cli.plan {
        agent.set_mode(AgentMode::Plan);
    } else if cli.sandbox {
        agent.set_mode(AgentMode::Sandbox);
    }
    Ok((agent, background))
}

/// Render agent events to the terminal.
async fn print_events(mut rx: mpsc::Receiver<AgentEvent>) {
    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::TextDelta(t) => {
                print!("{t}");
                let _ = std::io::stdout().flush();
            }
            AgentEvent::ToolCallStarted(call) => {
                eprintln!("\n→ {}({})", call.name, call.args);
            }
            AgentEvent::ToolCallFinished { tool_name, is_error, .. } => {
                if is_error {
                    eprintln!("✗ {tool_name} failed");
                } else {
                    eprintln!("✓ {tool_name}");
                }
            }
            AgentEvent::ContextCompacted { tokens_before, tokens_after } => {
                eprintln!("[context compacted: ~{tokens_before} → ~{tokens_after} tokens]");
            }
            AgentEvent::StreamIdle => {
                eprintln!("[model stream idle; ending iteration]");
            }
            AgentEvent::Aborted { .. } => {
                eprintln!("\n[cancelled]");
            }
            AgentEvent::TurnComplete => {
                println!();
            }
            _ => {}
        }
    }
}

async fn run_one_shot(
    agent: &mut Agent,
    prompt: &str,
    tx: mpsc::Sender<AgentEvent>,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let outcome = agent
        .run_until_quiet(prompt, tx, cancel)
        .await
        .context("agent run failed")?;
    if outcome.cancelled {
        std::process::exit(130);
    }
    Ok(())
}

async fn run_interactive(agent: &mut Agent, tx: mpsc::Sender<AgentEvent>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut last_interrupt: Option<Instant> = None;

    eprintln!("otto {} — {} mode. Ctrl-C twice to exit.", env!("CARGO_PKG_VERSION"), agent.mode());
    loop {
        eprint!("> ");
        let _ = std::io::stderr().flush();

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                if within_exit_window(&mut last_interrupt) {
                    return Ok(());
                }
                eprintln!("\n(press Ctrl-C again within 2s to exit)");
                continue;
            }
        };
        let Some(line) = line else {
            // stdin closed
            return Ok(());
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "/quit" || input == "/exit" {
            return Ok(());
        }
        if input == "/rewind" {
            let removed = agent.conversation_mut().remove_last_turns(1);
            eprintln!("[rewound {removed} messages]");
            continue;
        }

        // First Ctrl-C during a generation cancels it; a second within the
        // window exits the process.
        let cancel = CancellationToken::new();
        let run = agent.run_until_quiet(input, tx.clone(), cancel.clone());
        tokio::pin!(run);
        loop {
            tokio::select! {
                result = &mut run => {
                    if let Err(e) = result {
                        eprintln!("error: {e:#}");
                    }
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    if within_exit_window(&mut last_interrupt) {
                        return Ok(());
                    }
                    cancel.cancel();
                }
            }
        }
    }
}

/// Returns true when a previous interrupt happened within the exit window;
/// otherwise records this one and returns false.
fn within_exit_window(last: &mut Option<Instant>) -> bool {
    let now = Instant::now();
    let exit = last
        .map(|t| now.duration_since(t) < INTERRUPT_EXIT_WINDOW)
        .unwrap_or(false);
    *last = Some(now);
    exit
}
