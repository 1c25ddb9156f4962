use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use secrecy::SecretString;

use folio_engine::capabilities::CapabilitySet;
use folio_engine::tools::create_default_registry;
use folio_engine::{
    ContinuationConfig, ContinuationResolver, SessionStore, SessionStoreConfig, TurnConfig,
    TurnOrchestrator,
};
use folio_runtime::{OpenAiConfig, OpenAiRuntime};
use folio_server::ServerConfig;
use folio_store::Database;
use folio_telemetry::{folio_home, init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "folio", version, about = "Conversational document editing agent")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP server.
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    #[arg(long, env = "FOLIO_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "FOLIO_PORT", default_value_t = 9181)]
    port: u16,

    /// Session database. Defaults to ~/.folio/folio.db.
    #[arg(long, env = "FOLIO_DB_PATH")]
    db_path: Option<PathBuf>,

    #[arg(long, env = "FOLIO_LOG_LEVEL", default_value = "info")]
    log_level: tracing::Level,

    /// Human-readable logs instead of JSON lines.
    #[arg(long, env = "FOLIO_PRETTY_LOGS")]
    pretty_logs: bool,

    #[arg(long, env = "FOLIO_OPENAI_BASE_URL")]
    openai_base_url: Option<String>,

    #[arg(long, env = "FOLIO_OPENAI_MODEL")]
    openai_model: Option<String>,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: String,

    /// Seconds a turn waits for a busy session.
    #[arg(long, env = "FOLIO_LEASE_TIMEOUT_SECS", default_value_t = 30)]
    lease_timeout_secs: u64,

    #[arg(long, env = "FOLIO_MAX_STEPS", default_value_t = 25)]
    max_steps: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Cli::parse().command {
        Command::Serve(args) => serve(args).await,
    }
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let home = folio_home();
    let _telemetry = init_telemetry(TelemetryConfig {
        log_level: args.log_level,
        json: !args.pretty_logs,
        log_db_path: home.join("logs.db"),
        ..Default::default()
    });

    let db_path = args.db_path.unwrap_or_else(|| home.join("folio.db"));
    let db = Database::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;

    let lease_timeout = Duration::from_secs(args.lease_timeout_secs);
    let store = Arc::new(SessionStore::new(
        db.clone(),
        Arc::new(CapabilitySet::builtin()),
        SessionStoreConfig { lease_timeout },
    ));

    let mut openai = OpenAiConfig::new(SecretString::from(args.openai_api_key));
    if let Some(base_url) = args.openai_base_url {
        openai.base_url = base_url;
    }
    if let Some(model) = args.openai_model {
        openai.model = model;
    }
    let runtime = OpenAiRuntime::new(openai).context("failed to build runtime client")?;
    tracing::info!(model = runtime.model(), "runtime configured");

    let orchestrator = Arc::new(TurnOrchestrator::new(
        Arc::new(runtime),
        store,
        Arc::new(create_default_registry()),
        ContinuationResolver::new(db, ContinuationConfig::default()),
        TurnConfig {
            max_steps: args.max_steps,
            ..Default::default()
        },
    ));

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        ..Default::default()
    };
    let handle = folio_server::start(config, Arc::clone(&orchestrator))
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "folio ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    let cancelled = orchestrator.cancel_all();
    tracing::info!(cancelled, "shutting down");
    handle.shutdown().await;
    Ok(())
}
