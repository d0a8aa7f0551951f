//! relay - headless driver for the relay agent runtime

mod boundary;
mod config;
mod hooks;
mod prompt;
mod replay;
mod settings;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use relay_agent::{AgentEvent, ControllerConfig, OperatingMode, PermissionArbiter, TurnController};
use relay_ai::Message;
use relay_tools::{ToolOptions, builtin_registry};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

use crate::boundary::Boundary;
use crate::config::Config;
use crate::hooks::CommandHookEngine;
use crate::replay::ReplayTransport;
use crate::settings::LayeredSettings;

/// relay - interactive agent runtime
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Model id sent with each request (overrides the config file)
    #[arg(short, long)]
    model: Option<String>,

    /// JSON file of scripted assistant turns to play back
    #[arg(long, value_name = "FILE")]
    replay: Option<PathBuf>,

    /// Pause between replayed fragments, in milliseconds
    #[arg(long, default_value_t = 0)]
    replay_delay_ms: u64,

    /// Run a single prompt and exit once the turn settles
    #[arg(short = 'c', long)]
    command: Option<String>,

    /// Working directory
    #[arg(short, long)]
    working_dir: Option<String>,

    /// Operating mode to start in
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Restore a conversation log saved as a JSON array of messages
    #[arg(long, value_name = "FILE")]
    resume: Option<PathBuf>,

    /// Append every controller event to this file as JSON lines
    #[arg(long, value_name = "FILE")]
    transcript: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Write an example config file and exit
    #[arg(long)]
    init_config: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
    Normal,
    Auto,
    Plan,
}

impl From<ModeArg> for OperatingMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Normal => OperatingMode::Normal,
            ModeArg::Auto => OperatingMode::AutoAccept,
            ModeArg::Plan => OperatingMode::Plan,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.verbose {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relay=debug"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    if args.init_config {
        match Config::init() {
            Ok(path) => {
                println!("Config file created at: {}", path.display());
                println!("\nExample config:\n{}", config::example_config());
            }
            Err(e) => {
                eprintln!("Error creating config: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let cfg = Config::load();

    if let Some(ref dir) = args.working_dir {
        std::env::set_current_dir(dir).with_context(|| format!("Cannot enter {}", dir))?;
    }
    let cwd = std::env::current_dir()?;

    let Some(ref script) = args.replay else {
        eprintln!("Error: No model transport configured");
        eprintln!();
        eprintln!("Play back scripted turns with: relay --replay turns.json");
        std::process::exit(1);
    };
    let transport = ReplayTransport::from_file(script)?
        .with_delay(Duration::from_millis(args.replay_delay_ms));

    let mut model = cfg.model.model_info();
    if let Some(id) = args.model {
        model.name = id.clone();
        model.id = id;
    }

    let registry = builtin_registry(&ToolOptions {
        cwd: cwd.clone(),
        trusted_domains: cfg.tools.trusted_domains.clone(),
    });
    let system_prompt = cfg
        .model
        .load_system_prompt()
        .unwrap_or_else(|| prompt::build_system_prompt(registry.names(), &cwd));

    let arbiter = PermissionArbiter::new(
        Arc::new(LayeredSettings::load(&cwd, &cfg.permissions)),
        Arc::new(
            CommandHookEngine::new(cfg.hooks.pre_tool_use.clone(), &cwd)
                .with_timeout(Duration::from_secs(cfg.hooks.timeout_secs)),
        ),
    );
    let config = ControllerConfig::new(model)
        .with_system_prompt(system_prompt)
        .with_compaction(cfg.compaction.clone());
    let mut controller = TurnController::new(config, Arc::new(transport), registry, arbiter);

    if let Some(mode) = args.mode {
        controller.set_mode(mode.into());
    }
    if let Some(ref path) = args.resume {
        let messages = load_messages(path)?;
        println!("Resuming {} ({} messages)", path.display(), messages.len());
        controller.set_messages(messages)?;
    }

    let recorder = args
        .transcript
        .map(|path| tokio::spawn(record_events(path, controller.subscribe())));
    let events = controller.subscribe();
    let handle = controller.handle();
    let running = tokio::spawn(controller.run());

    let interrupt = handle.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let input = tokio::io::BufReader::new(tokio::io::stdin());
    let mut boundary =
        Boundary::new(std::io::stdout(), handle.clone()).with_usage(std::io::stdout().is_terminal());
    let outcome = match args.command {
        Some(ref command) => boundary.run_once(command, events, input).await,
        None => boundary.run(events, input).await,
    };

    handle.shutdown();
    running.await?;
    if let Some(recorder) = recorder {
        if let Err(e) = recorder.await? {
            eprintln!("Warning: transcript incomplete: {}", e);
        }
    }
    outcome
}

fn load_messages(path: &Path) -> anyhow::Result<Vec<Message>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid conversation log {}", path.display()))
}

/// Write each event as one JSON line until the controller goes away
async fn record_events(path: PathBuf, mut events: broadcast::Receiver<AgentEvent>) -> anyhow::Result<()> {
    let mut file = tokio::fs::File::create(&path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;
    loop {
        match events.recv().await {
            Ok(event) => {
                let mut line = serde_json::to_string(&event)?;
                line.push('\n');
                file.write_all(line.as_bytes()).await?;
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Transcript skipped {} events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    file.flush().await?;
    Ok(())
}
