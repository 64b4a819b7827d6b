use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use pith::channels::telegram::TelegramChannel;
use pith::config::{resolve_config_path, Config};
use pith::error::PithError;
use pith::events::EventBus;
use pith::models::openai::OpenAiModel;
use pith::runtime::Runtime;
use pith::store::Store;
use pith::tools::builtins::register_builtins;
use pith::tools::ToolRegistry;

#[derive(Parser, Debug)]
#[command(name = "pith", version, about = "Single-user, self-extending agent runtime")]
struct Cli {
    /// Path to configuration file (defaults to PITH_CONFIG or
    /// ~/.config/pith/config.yaml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the server (default)
    Run,
    /// Query a running server's status endpoint
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    {
        use tracing_subscriber::layer::SubscriberExt;
        use tracing_subscriber::util::SubscriberInitExt;

        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(resolve_config_path);

    let result = match cli.command {
        Some(Command::Status) => show_status(&config_path).await,
        Some(Command::Run) | None => run(&config_path).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ PithError::Config(_)) => {
            eprintln!("error: {e}");
            ExitCode::from(1)
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(2)
        }
    }
}

async fn run(config_path: &std::path::Path) -> Result<(), PithError> {
    info!(path = %config_path.display(), "loading configuration");
    let cfg = Arc::new(Config::load(config_path)?);

    let workspace = cfg.workspace_path();
    std::fs::create_dir_all(&workspace)
        .map_err(|e| PithError::Config(format!("cannot create workspace: {e}")))?;
    std::fs::create_dir_all(cfg.extensions_tools_dir())
        .map_err(|e| PithError::Config(format!("cannot create extensions dir: {e}")))?;
    std::fs::create_dir_all(cfg.extensions_channels_dir())
        .map_err(|e| PithError::Config(format!("cannot create channels dir: {e}")))?;
    std::fs::create_dir_all(cfg.log_dir())
        .map_err(|e| PithError::Config(format!("cannot create log dir: {e}")))?;

    // Store — fatal when the schema cannot initialise.
    let store = Arc::new(Store::open(&cfg.memory_db_path())?);
    store.set_log_dir(&cfg.log_dir());

    // Registry: built-ins first, then extension scan, then remote tools.
    let registry = Arc::new(ToolRegistry::new());
    register_builtins(&registry, &cfg.runtime.tool)?;
    for (path, result) in pith::extensions::scan_dir(
        &registry,
        &cfg.extensions_tools_dir(),
        &cfg.runtime.tool,
    ) {
        match result {
            Ok(name) => info!(tool = %name, "extension tool loaded"),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "extension tool skipped");
                let _ = store.log_event(
                    "extension_reload",
                    "error",
                    &serde_json::json!({
                        "path": path.display().to_string(),
                        "kind": e.kind_str(),
                        "detail": e.to_string(),
                    }),
                );
            }
        }
    }
    pith::mcp::discover_and_register(&registry, &cfg.mcp.servers, &cfg.runtime.tool).await;
    info!(
        total = registry.len(),
        "tool registry initialised"
    );

    let model = Arc::new(OpenAiModel::from_config(&cfg.model)?);
    let bus = Arc::new(EventBus::new(256));
    let runtime = Runtime::new(cfg.clone(), store.clone(), registry.clone(), model, bus.clone());

    // Hot reload of extension tools.
    let _watcher = pith::watcher::spawn_extension_watcher(
        registry.clone(),
        store.clone(),
        bus.clone(),
        cfg.extensions_tools_dir(),
        cfg.runtime.tool.clone(),
    )?;

    // API listener — bind failure is fatal at startup.
    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .map_err(|e| PithError::Config(format!("bad server address: {e}")))?;
    let server = pith::server::start_server(addr, runtime.clone())
        .await
        .map_err(|e| PithError::Config(format!("cannot bind {addr}: {e}")))?;

    let cancel = CancellationToken::new();

    // Channels.
    let mut channel_handles = Vec::new();
    if let Some(tg) = &cfg.channels.telegram {
        match std::env::var(&tg.bot_token_env) {
            Ok(token) if !token.is_empty() => {
                let channel = TelegramChannel::new(&token, store.clone())?;
                channel_handles.push(pith::channels::spawn_channel(
                    Box::new(channel),
                    runtime.clone(),
                    cancel.clone(),
                ));
                info!("telegram channel enabled");
            }
            _ => warn!(
                env = %tg.bot_token_env,
                "telegram configured but token env var is unset, channel disabled"
            ),
        }
    }

    // Healthy sentinel: touched while the store answers.
    let sentinel_store = store.clone();
    let sentinel_path = workspace.join(".pith").join("healthy");
    let sentinel_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Some(parent) = sentinel_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        loop {
            tokio::select! {
                _ = sentinel_cancel.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_secs(30)) => {
                    if sentinel_store.healthcheck() {
                        let _ = std::fs::write(&sentinel_path, chrono::Utc::now().to_rfc3339());
                    }
                }
            }
        }
    });

    info!(addr = %server.addr, "pith ready");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| PithError::Config(format!("signal handler: {e}")))?;
    info!("received Ctrl-C, shutting down");

    cancel.cancel();
    for handle in channel_handles {
        let _ = handle.await;
    }
    server.handle.abort();

    info!("shutdown complete");
    Ok(())
}

async fn show_status(config_path: &std::path::Path) -> Result<(), PithError> {
    let cfg = Config::load(config_path)?;
    let url = format!("http://127.0.0.1:{}/status", cfg.server.port);
    let resp = reqwest::get(&url)
        .await
        .map_err(|e| PithError::Channel(format!("cannot reach {url}: {e}")))?;
    let body: serde_json::Value = resp
        .json()
        .await
        .map_err(|e| PithError::Channel(format!("bad status body: {e}")))?;
    println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
    Ok(())
}
