//! whatsmux CLI entry point.
//!
//! Provides `serve`, `check-config` and `grant-credits` subcommands.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use whatsmux::bridge::HttpBridgeConnector;
use whatsmux::config::{config_dir, load_config_or_default, Config};
use whatsmux::credentials::{load_credentials, PlatformCredentials};
use whatsmux::events::EventPublisher;
use whatsmux::router::{spawn_auto_reply, Router, TransportRegistry};
use whatsmux::server::{self, ApiAuth, AppState};
use whatsmux::session::{ReconnectPolicy, SessionManager};
use whatsmux::store::MessageStore;
use whatsmux::transport::bridge::BridgeTransport;
use whatsmux::transport::cloud::{CloudApi, CloudTransport, HttpCloudApi, TemplateSettings};
use whatsmux::transport::fallback::FallbackTransport;
use whatsmux::types::{UserKind, UserRef};

/// Capacity of the session-to-router inbound channel.
const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// whatsmux: multi-tenant WhatsApp messaging core.
#[derive(Parser)]
#[command(name = "whatsmux", version, about)]
struct Cli {
    /// Config file (default: ~/.whatsmux/config.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API, webhook receiver and bridge sessions.
    Serve,
    /// Parse the config and print a summary.
    CheckConfig,
    /// Add shared fallback credits to a user's balance.
    GrantCredits {
        /// Platform user id.
        #[arg(long)]
        user: String,
        /// Account kind.
        #[arg(long, default_value = "user", value_parser = parse_user_kind)]
        kind: UserKind,
        /// Credits to add.
        #[arg(long)]
        amount: i64,
    },
}

fn parse_user_kind(s: &str) -> Result<UserKind, String> {
    UserKind::parse(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = config_dir()?;
    let config_path = cli.config.unwrap_or_else(|| root.join("config.toml"));

    match cli.command {
        Command::Serve => handle_serve(&root, &config_path).await,
        Command::CheckConfig => handle_check_config(&root, &config_path),
        Command::GrantCredits { user, kind, amount } => {
            handle_grant_credits(&root, &config_path, UserRef::new(user, kind), amount).await
        }
    }
}

/// Run the service until ctrl-c.
async fn handle_serve(root: &Path, config_path: &Path) -> anyhow::Result<()> {
    let config = load_config_or_default(config_path)?;

    let logs_dir = config.logging.dir.clone().unwrap_or_else(|| root.join("logs"));
    let _logging_guard = whatsmux::logging::init_production(&logs_dir, &config.logging.level)?;

    let env_path = root.join(".env");
    let credentials = load_credentials(&env_path)
        .with_context(|| format!("failed to load {}", env_path.display()))?;
    let platform = Arc::new(PlatformCredentials::from_credentials(
        &credentials,
        &config.platform_credential_keys(),
    ));
    if platform.fallback.is_none() {
        warn!("shared fallback sender not configured, fallback sends will fail");
    }

    let store = open_store(root, &config).await?;
    let events = EventPublisher::new(config.router.event_buffer);

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
    let connector = Arc::new(HttpBridgeConnector::new(
        config.bridge.base_url.clone(),
        config.bridge.poll_timeout(),
    ));
    if !connector.ping().await {
        warn!(
            bridge = connector.base_url(),
            "bridge sidecar not reachable, bridge sessions will retry"
        );
    }
    let sessions = Arc::new(SessionManager::new(
        connector,
        store.clone(),
        events.clone(),
        inbound_tx,
        ReconnectPolicy::from_config(&config.reconnect),
    ));

    let api: Arc<dyn CloudApi> = Arc::new(HttpCloudApi::new(
        config.cloud.api_base.clone(),
        config.cloud.api_version.clone(),
    ));
    let template = TemplateSettings {
        name: config.cloud.default_template.clone(),
        language: config.cloud.template_language.clone(),
    };
    let mut registry = TransportRegistry::new();
    registry
        .register(Arc::new(CloudTransport::new(
            Arc::clone(&api),
            store.clone(),
            template.clone(),
        )))
        .register(Arc::new(BridgeTransport::new(Arc::clone(&sessions))))
        .register(Arc::new(FallbackTransport::new(
            api,
            store.clone(),
            Arc::clone(&platform),
            template,
        )));

    let fallback_number = platform.fallback.as_ref().map(|c| c.phone_number_id.clone());
    let router = Arc::new(
        Router::new(
            store.clone(),
            registry,
            Arc::clone(&sessions),
            events.clone(),
            config.router.send_timeout(),
        )
        .with_fallback_number(fallback_number),
    );

    let ingest_task = tokio::spawn(Arc::clone(&router).run_ingest(inbound_rx));
    let auto_reply_task = spawn_auto_reply(Arc::clone(&router), &events);

    // Paired devices keep their credentials across restarts; reconnect them.
    if let Err(e) = sessions.resume_all().await {
        warn!(error = %e, "failed to resume bridge sessions");
    }

    let state = AppState {
        router: Arc::clone(&router),
        platform: Arc::clone(&platform),
        auth: ApiAuth::new(platform.api_token.clone()),
    };
    if !state.auth.is_enabled() {
        warn!("no api token configured, /v1 is unauthenticated");
    }

    info!(
        bind = %config.server.bind,
        bridge = %config.bridge.base_url,
        "whatsmux started"
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
        }
        info!("shutdown requested");
    };
    let served = server::serve(&config.server.bind, state, shutdown).await;

    sessions.shutdown_all().await;
    auto_reply_task.abort();
    ingest_task.abort();
    store.close().await;
    info!("whatsmux stopped");
    served
}

/// Parse the config and print what it resolves to.
fn handle_check_config(root: &Path, config_path: &Path) -> anyhow::Result<()> {
    whatsmux::logging::init_cli();
    let config = load_config_or_default(config_path)?;
    let credentials = load_credentials(&root.join(".env"))?;
    let platform =
        PlatformCredentials::from_credentials(&credentials, &config.platform_credential_keys());

    println!("config:            {}", config_path.display());
    println!("bind:              {}", config.server.bind);
    println!("database:          {}", database_path(root, &config).display());
    println!("cloud api:         {}/{}", config.cloud.api_base, config.cloud.api_version);
    println!("bridge sidecar:    {}", config.bridge.base_url);
    println!("send timeout:      {}s", config.router.send_timeout().as_secs());
    println!(
        "reconnect:         {}ms..{}ms, max attempts {}",
        config.reconnect.initial_backoff_ms,
        config.reconnect.max_backoff_ms,
        if config.reconnect.max_attempts == 0 {
            "unlimited".to_owned()
        } else {
            config.reconnect.max_attempts.to_string()
        }
    );
    println!("fallback sender:   {}", configured(platform.fallback.is_some()));
    println!("webhook verify:    {}", configured(platform.webhook_verify_token.is_some()));
    println!("webhook signature: {}", configured(platform.webhook_app_secret.is_some()));
    println!("api token:         {}", configured(platform.api_token.is_some()));
    Ok(())
}

/// Add credits and print the new balance.
async fn handle_grant_credits(
    root: &Path,
    config_path: &Path,
    user: UserRef,
    amount: i64,
) -> anyhow::Result<()> {
    whatsmux::logging::init_cli();
    let config = load_config_or_default(config_path)?;
    let store = open_store(root, &config).await?;
    let balance = store
        .grant_credits(&user, amount)
        .await
        .with_context(|| format!("failed to grant credits to {user}"))?;
    store.close().await;
    println!("{user}: balance {balance}");
    Ok(())
}

fn database_path(root: &Path, config: &Config) -> PathBuf {
    config
        .database
        .path
        .clone()
        .unwrap_or_else(|| root.join("whatsmux.db"))
}

async fn open_store(root: &Path, config: &Config) -> anyhow::Result<MessageStore> {
    let path = database_path(root, config);
    MessageStore::open(&path)
        .await
        .with_context(|| format!("failed to open database at {}", path.display()))
}

fn configured(present: bool) -> &'static str {
    if present {
        "configured"
    } else {
        "not configured"
    }
}
