//! Demo runtime binary: wires every `roundtable-*` crate into one running
//! multi-agent chat room against a real (OpenAI-compatible or
//! provider-native) chat endpoint.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use roundtable_core::{Agent, ChatRoom, RoundtableConfig};
use roundtable_scheduler::TurnManager;
use roundtable_sync::{ChannelLock, PauseController, TransportGate};
use roundtable_text::DetectorRegistry;
use roundtable_tools::{LocalFileWriter, LocalToolAdapter, ToolAdapter};
use roundtable_transport::{ChatTransport, ToolDefinition};
use roundtable_turn::TurnEngine;

/// Seat N agents at a shared chat room and run the turn scheduler until
/// interrupted.
#[derive(Parser, Debug)]
#[command(name = "roundtable", about = "Multi-agent turn orchestration runtime")]
struct Cli {
    /// Path to a roundtable.toml config file. Falls back to defaults +
    /// ROUNDTABLE_*-prefixed env overrides when omitted.
    #[arg(long, env = "ROUNDTABLE_CONFIG")]
    config: Option<String>,

    /// Agent ids to seat in the room, in scheduling order.
    #[arg(long, value_delimiter = ',', default_value = "alice,bob")]
    agents: Vec<String>,

    /// Model identifier every agent requests.
    #[arg(long, env = "ROUNDTABLE_MODEL", default_value = "llama3")]
    model: String,

    /// Provider base URL(s), comma-separated; first is primary, the rest
    /// are fallbacks tried in order on connect failure.
    #[arg(long, env = "ROUNDTABLE_BASE_URL", value_delimiter = ',', default_value = "http://localhost:11434")]
    base_url: Vec<String>,

    /// System prompt shared by every agent.
    #[arg(
        long,
        default_value = "You are one of several agents collaborating in a shared chat room. Be concise."
    )]
    system_prompt: String,

    /// Project root file writes are confined to.
    #[arg(long, default_value = ".")]
    workspace_root: String,
}

fn sh_tool_definition() -> ToolDefinition {
    ToolDefinition {
        name: "sh".to_string(),
        description: "Execute a shell command in the sandbox and return its output.".to_string(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "cmd": { "type": "string", "description": "The shell command to run." }
            },
            "required": ["cmd"]
        }),
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = RoundtableConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "config load failed, using defaults");
        RoundtableConfig::default()
    });
    let config = Arc::new(config);

    let room = Arc::new(ChatRoom::new(config.room.fresh_window_ms));
    for id in &cli.agents {
        room.add_model(Agent::new(id.clone(), cli.model.clone(), config.turn.soc_cap_chars))?;
    }

    let lock = ChannelLock::new(Duration::from_millis(config.sync.lock_max_ms));
    let gate = TransportGate::new(
        config.sync.transport_cap,
        Duration::from_millis(config.sync.transport_cooldown_ms),
    );
    let connect_stages: Vec<Duration> = config
        .transport
        .connect_stages_ms
        .iter()
        .map(|ms| Duration::from_millis(*ms))
        .collect();
    let transport = Arc::new(ChatTransport::new(cli.base_url.clone(), connect_stages));
    transport.preflight(false).await;

    let tool_adapter: Arc<dyn ToolAdapter> = Arc::new(LocalToolAdapter::default());
    let file_writer = Arc::new(LocalFileWriter::new(cli.workspace_root.clone()));
    let detectors = Arc::new(DetectorRegistry::default_panel());
    let pause = Arc::new(PauseController::new());
    let tools = Arc::new(vec![sh_tool_definition()]);

    let engine = Arc::new(TurnEngine {
        room: room.clone(),
        lock,
        gate,
        transport,
        tool_adapter,
        file_writer,
        detectors,
        pause,
        tools,
        config: config.clone(),
    });

    let manager = Arc::new(TurnManager::new(
        engine,
        config.clone(),
        cli.agents.clone(),
        cli.system_prompt.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = tokio::spawn(manager.run(shutdown_rx));

    info!(agents = ?cli.agents, base_url = ?cli.base_url, "roundtable: scheduler running");

    let mut scheduler_task = scheduler_task;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("roundtable: received SIGINT, shutting down");
            let _ = shutdown_tx.send(true);
            let _ = scheduler_task.await;
            std::process::exit(130);
        }
        res = &mut scheduler_task => {
            res?;
        }
    }

    Ok(())
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "roundtable=info".into()),
        )
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "roundtable: failed to start tokio runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(cli)) {
        tracing::error!(error = %e, "roundtable: unhandled error");
        std::process::exit(1);
    }
}
