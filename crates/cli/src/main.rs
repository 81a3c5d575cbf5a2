use std::sync::Arc;

use {
    clap::{Parser, Subcommand},
    opsentry_approval::ApprovalManager,
    opsentry_common::types::NullCollector,
    opsentry_gateway::state::AppState,
    opsentry_modelgw::{HttpModelGateway, ModelGateway},
    opsentry_preferences::PreferenceStore,
    opsentry_sandbox::SandboxExecutor,
    opsentry_validator::CommandValidator,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "opsentry", about = "opsentry — local developer-assistance daemon")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,
    /// Port to listen on (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Base URL of the model vendor endpoint the gateway invokes.
    #[arg(long, global = true, env = "OPSENTRY_MODEL_GATEWAY_URL", default_value = "http://127.0.0.1:11434")]
    model_gateway_url: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default when no subcommand is provided).
    Serve,
    /// Print the effective configuration as TOML.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the path config would be loaded from or written to.
    Path,
    /// Print the effective (discovered + default-filled) configuration.
    Show,
    /// Write the effective configuration to the user-global config path.
    Init,
}

fn init_telemetry(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry.with(fmt::layer().json().with_target(true).with_thread_ids(false)).init();
    } else {
        registry.with(fmt::layer().with_target(false).with_thread_ids(false).with_ansi(true)).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "opsentry starting");

    match cli.command {
        None | Some(Commands::Serve) => serve(cli).await,
        Some(Commands::Config { action }) => handle_config(action),
    }
}

async fn serve(cli: Cli) -> anyhow::Result<()> {
    let config = opsentry_config::discover_and_load();

    let host = cli.bind.unwrap_or_else(|| config.api_host.clone());
    let port = cli.port.unwrap_or(config.api_port);

    let preferences_path = opsentry_config::data_dir()
        .map(|dir| dir.join("preferences.json"))
        .unwrap_or_else(|| std::path::PathBuf::from("opsentry-preferences.json"));
    let preferences = PreferenceStore::load(preferences_path);

    let approvals = Arc::new(
        ApprovalManager::new(preferences, config.auto_approve_safe, config.learn_preferences)
            .with_timeout(std::time::Duration::from_secs(config.approval_timeout)),
    );
    let validator = CommandValidator::new(config.allowed_commands.clone(), config.blocked_commands.clone());
    let sandbox = SandboxExecutor::new(validator.clone(), std::time::Duration::from_secs(config.max_execution_time));
    let model_gateway: Arc<dyn ModelGateway> = Arc::new(HttpModelGateway::new(cli.model_gateway_url.clone()));

    let engine = opsentry_engine::JobEngine::new(approvals, validator, config.clone(), model_gateway, sandbox);
    let state = AppState { engine, collector: Arc::new(NullCollector), default_approval_timeout: config.approval_timeout };

    opsentry_gateway::serve(&host, port, state).await
}

fn handle_config(action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Path => {
            println!("{}", opsentry_config::find_or_default_config_path().display());
        },
        ConfigAction::Show => {
            let config = opsentry_config::discover_and_load();
            println!("{}", toml::to_string_pretty(&config)?);
        },
        ConfigAction::Init => {
            let config = opsentry_config::discover_and_load();
            let path = opsentry_config::save_config(&config)?;
            println!("wrote {}", path.display());
        },
    }
    Ok(())
}
