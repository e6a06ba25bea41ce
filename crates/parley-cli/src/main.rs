use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use parley_agents::tools::ShellTool;
use parley_agents::{AgentRuntime, CooldownTable, ModelFailover, OpenAiProvider};
use parley_channels::{ChannelLifecycle, ChannelSender, ConsoleChannel, ConsoleSender};
use parley_common::ConversationId;
use parley_config::{AppConfig, ConfigLoader};
use parley_db::InMemorySessionStore;
use parley_gateway::Orchestrator;
use parley_security::ApprovalGate;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Parley: per-conversation orchestration for a tool-using assistant
#[derive(Parser, Debug)]
#[command(name = "parley", version, about)]
struct Cli {
    /// Config file (YAML or TOML). Defaults to ~/.parley/config.yml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, env = "PARLEY_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Chat from the terminal; each line is one message
    Chat(ChatArgs),
    /// Print the effective configuration
    Config,
}

#[derive(Parser, Debug)]
struct ChatArgs {
    /// Conversation id for this session
    #[arg(long, default_value = "console")]
    conversation: String,

    /// Override the primary model
    #[arg(short, long)]
    model: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout is the chat surface.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    dotenvy::dotenv().ok();

    let loader = match &cli.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load().context("failed to load configuration")?;

    match cli.command {
        Commands::Chat(args) => chat(config, args).await,
        Commands::Config => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
    }
}

async fn chat(mut config: AppConfig, args: ChatArgs) -> anyhow::Result<()> {
    if let Some(model) = args.model {
        config.failover.primary_model = model;
    }

    let Some(api_key) = config
        .llm
        .api_key
        .clone()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    else {
        bail!("no API key configured: set PARLEY_API_KEY, OPENAI_API_KEY or llm.api_key");
    };

    let sender: Arc<dyn ChannelSender> = Arc::new(ConsoleSender::default());
    let gate = Arc::new(ApprovalGate::new(
        Arc::clone(&sender),
        config.approval.timeout(),
    ));

    let provider = Arc::new(OpenAiProvider::new(api_key, config.llm.base_url.clone()));
    let failover = ModelFailover::new(
        provider,
        Arc::new(CooldownTable::new()),
        config.failover.cooldown(),
        config.failover.request_timeout(),
    );

    let mut runtime = AgentRuntime::new(failover);
    runtime.set_models(
        config.failover.primary_model.clone(),
        config.failover.fallback_models.clone(),
    );
    if let Some(prompt) = &config.agent.system_prompt {
        runtime.set_system_prompt(prompt.clone());
    }
    runtime.set_max_iterations(config.agent.max_iterations);
    if let Some(max_tokens) = config.agent.max_tokens {
        runtime.set_max_tokens(max_tokens);
    }
    if config.agent.tool_notifications {
        runtime.set_tool_notifier(Arc::clone(&sender));
    }
    runtime.register_tool(Box::new(ShellTool::new(
        Arc::clone(&gate),
        Duration::from_secs(config.agent.shell_timeout_secs),
    )));

    let orchestrator = Orchestrator::new(
        &config,
        runtime,
        Arc::clone(&sender),
        Arc::new(InMemorySessionStore::new()),
        gate,
    );

    let mut channel = ConsoleChannel::new(
        ConversationId::new(args.conversation),
        "local".to_string(),
        orchestrator.on_message_fn(),
    );
    channel.connect().await?;
    info!(
        model = %config.failover.primary_model,
        "{} ready, type a message (Ctrl+C to quit)",
        channel.display_name()
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    info!("shutting down");
    orchestrator.shutdown();
    channel.disconnect().await?;
    Ok(())
}
