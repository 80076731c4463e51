// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use quill_config::Config;
use quill_core::{AgentEvent, AgentTool, AgenticFetchTool, SessionAgent, SessionAgentCall, SubAgentDeps};
use quill_model::LanguageModel;
use quill_store::{FileHistoryStore, MessageStore, SessionStore};
use quill_tools::{
    commands_blocker, BackgroundShellManager, BashTool, BlockFunc, DownloadTool, EditTool,
    FetchTool, FileGuard, GlobTool, GrepTool, JobKillTool, JobOutputTool, LsTool, MultiEditTool,
    PermissionService, SourcegraphTool, TodosTool, ToolRegistry, ViewTool, WebFetchTool,
    WebSearchTool, WriteTool,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = quill_config::load(cli.config.as_deref())?;
    if cli.yolo {
        config.permissions.yolo = true;
    }
    if let Some(model) = &cli.model {
        config.model.name = model.clone();
    }

    match &cli.command {
        Some(Commands::ShowConfig) => {
            println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
            return Ok(());
        }
        Some(Commands::ListTools) => {
            let wiring = build(&config, std::env::current_dir()?)?;
            for schema in wiring.tools.schemas() {
                let first_line = schema.description.lines().next().unwrap_or("");
                println!("{:<16} {first_line}", schema.name);
            }
            return Ok(());
        }
        None => {}
    }

    let prompt = match &cli.prompt {
        Some(p) => p.clone(),
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("reading prompt from stdin")?;
            buf
        }
    };

    let working_dir = match &cli.working_dir {
        Some(d) => d.clone(),
        None => std::env::current_dir()?,
    };
    let wiring = build(&config, working_dir)?;

    let session = wiring.sessions.create(prompt.lines().next().unwrap_or("session"));
    tracing::debug!(session = %session.id, "created session");

    // Ctrl-C cancels the run; background shells are killed on the way out.
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }

    let (events_tx, mut events_rx) = mpsc::channel::<AgentEvent>(256);
    let printer = tokio::spawn(async move {
        use std::io::Write;
        while let Some(event) = events_rx.recv().await {
            match event {
                AgentEvent::TextDelta(t) => {
                    print!("{t}");
                    let _ = std::io::stdout().flush();
                }
                AgentEvent::ToolCallStarted { name, .. } => {
                    eprintln!("· running {name}");
                }
                AgentEvent::ToolCallFinished { name, is_error, .. } => {
                    if is_error {
                        eprintln!("· {name} failed");
                    }
                }
                AgentEvent::SummarizeStarted => {
                    eprintln!("· summarizing conversation");
                }
                AgentEvent::Usage { total_cost, .. } => {
                    tracing::debug!(total_cost, "usage update");
                }
                _ => {}
            }
        }
    });

    let call = SessionAgentCall {
        session_id: session.id.clone(),
        prompt,
        ..Default::default()
    };
    let result = wiring.agent.run(cancel, call, events_tx).await;

    let _ = printer.await;
    wiring
        .shells
        .kill_all(std::time::Duration::from_secs(5))
        .await;

    match result {
        Ok(_) => {
            println!();
            let session = wiring.sessions.get(&session.id)?;
            eprintln!("[cost: ${:.4}]", session.cost);
            Ok(())
        }
        Err(quill_core::AgentError::RequestCancelled) => {
            eprintln!("\n[canceled]");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

struct Wiring {
    agent: SessionAgent,
    tools: Arc<ToolRegistry>,
    sessions: Arc<SessionStore>,
    shells: Arc<BackgroundShellManager>,
}

/// Assemble stores, services, and the full tool registry.
fn build(config: &Config, working_dir: PathBuf) -> anyhow::Result<Wiring> {
    let sessions = SessionStore::new();
    let messages = MessageStore::new();
    let guard = Arc::new(FileGuard::new(FileHistoryStore::new()));
    let permissions = PermissionService::new(&config.permissions);
    let shells = BackgroundShellManager::new();

    let model: Arc<dyn LanguageModel> = quill_model::from_config(&config.model)?.into();
    let small_model: Arc<dyn LanguageModel> = quill_model::from_config(config.small_model())?.into();

    let blockers: Vec<BlockFunc> = if config.tools.blocked_commands.is_empty() {
        vec![]
    } else {
        let cmds: Vec<&str> = config.tools.blocked_commands.iter().map(String::as_str).collect();
        vec![commands_blocker(&cmds)]
    };
    let skills_paths: Vec<PathBuf> = config.tools.skills_paths.iter().map(PathBuf::from).collect();

    let register_common = |reg: &mut ToolRegistry| {
        reg.register(ViewTool {
            guard: Arc::clone(&guard),
            permissions: Arc::clone(&permissions),
            skills_paths: skills_paths.clone(),
        });
        reg.register(EditTool { guard: Arc::clone(&guard), permissions: Arc::clone(&permissions) });
        reg.register(MultiEditTool {
            guard: Arc::clone(&guard),
            permissions: Arc::clone(&permissions),
        });
        reg.register(WriteTool { guard: Arc::clone(&guard), permissions: Arc::clone(&permissions) });
        reg.register(GrepTool);
        reg.register(GlobTool);
        reg.register(LsTool { max_files: config.tools.max_ls_files });
        reg.register(BashTool {
            manager: Arc::clone(&shells),
            permissions: Arc::clone(&permissions),
            blockers: blockers.clone(),
            sync_wait: std::time::Duration::from_secs(config.tools.bash_sync_wait_secs),
        });
        reg.register(JobOutputTool { manager: Arc::clone(&shells) });
        reg.register(JobKillTool { manager: Arc::clone(&shells) });
        reg.register(FetchTool {
            permissions: Arc::clone(&permissions),
            default_timeout_secs: config.tools.fetch_timeout_secs,
        });
        reg.register(DownloadTool { permissions: Arc::clone(&permissions) });
        reg.register(WebFetchTool);
        reg.register(WebSearchTool { api_key: None });
        reg.register(SourcegraphTool { endpoint: config.tools.sourcegraph_url.clone() });
    };

    // Sub-agents get the common tools but cannot spawn further sub-agents
    // and do not own the parent's todo list.
    let mut restricted = ToolRegistry::new();
    register_common(&mut restricted);

    let deps = Arc::new(SubAgentDeps {
        sessions: Arc::clone(&sessions),
        messages: Arc::clone(&messages),
        permissions: Arc::clone(&permissions),
        small_model: Arc::clone(&small_model),
        config: Arc::new(config.agent.clone()),
        working_dir: working_dir.clone(),
        restricted_tools: Arc::new(restricted),
    });

    let mut registry = ToolRegistry::new();
    register_common(&mut registry);
    registry.register(TodosTool { sessions: Arc::clone(&sessions) });
    registry.register(AgentTool { deps: Arc::clone(&deps) });
    registry.register(AgenticFetchTool { deps });
    let registry = Arc::new(registry);

    let agent = SessionAgent::new(
        Arc::clone(&sessions),
        messages,
        Arc::clone(&registry),
        model,
        small_model,
        Arc::new(config.agent.clone()),
        working_dir,
    );

    Ok(Wiring { agent, tools: registry, sessions, shells })
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
