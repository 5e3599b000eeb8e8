use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use ag_domain::config::{Config, ConfigSeverity};
use ag_gateway::cli::{self, Cli, Command, ConfigCommand};
use ag_gateway::state::AppState;
use ag_llm::LlmClient;
use ag_protocol::device::DeviceStore;
use ag_sessions::{IdentityResolver, LifecycleManager, SessionStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let (config, _config_path) = cli::load_config(cli.config.as_ref())?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Doctor) => {
            let (config, config_path) = cli::load_config(cli.config.as_ref())?;
            if !cli::doctor(&config, config_path.as_ref()) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let (config, _config_path) = cli::load_config(cli.config.as_ref())?;
            if !cli::validate(&config) {
                std::process::exit(1);
            }
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let (config, _config_path) = cli::load_config(cli.config.as_ref())?;
            cli::show(&config);
            Ok(())
        }
        Some(Command::Version) => {
            println!("agentgate {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing (serve mode only).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ag_gateway=debug")),
        )
        .json()
        .init();
}

/// Start the gateway with the given configuration.
async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("agentgate starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    let state_dir = config.state.state_dir.clone();
    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("creating state dir {}", state_dir.display()))?;

    // ── Session store + identity links ───────────────────────────────
    let store = Arc::new(SessionStore::new(&state_dir).context("initializing session store")?);
    let identity = Arc::new(
        IdentityResolver::from_config(&config.session.identity_links)
            .with_file(&state_dir.join("identity_links.json")),
    );
    let lifecycle = Arc::new(LifecycleManager::new(config.session.lifecycle.clone()));
    tracing::info!(
        default_agent = %config.session.default_agent,
        dm_scope = ?config.session.dm_scope,
        identity_links = identity.len(),
        "session routing ready"
    );

    // ── Device store ─────────────────────────────────────────────────
    let devices = Arc::new(DeviceStore::load(&state_dir).context("loading device store")?);

    // ── Event fabric ─────────────────────────────────────────────────
    let bus = Arc::new(ag_gateway::server::broadcast::EventBus::new());
    let dedupe = Arc::new(ag_gateway::server::dedupe::DedupeCache::new());
    let presence = Arc::new(ag_gateway::server::presence::PresenceRegistry::new());
    let heartbeat = Arc::new(ag_gateway::server::heartbeat::HeartbeatQueue::new());
    tracing::info!("event fabric ready");

    // ── Runtime ──────────────────────────────────────────────────────
    let agents = Arc::new(ag_gateway::runtime::agents::AgentSessions::new());
    let chat = Arc::new(ag_gateway::runtime::chat_queue::ChatQueue::new());
    let tools = Arc::new(ag_gateway::runtime::tools::ToolRegistry::new());
    let hooks = Arc::new(ag_gateway::hooks::HookRegistry::new());

    // The LLM wire client is an external collaborator; embedders swap
    // this for a real provider adapter. Without one, turns fail cleanly.
    let llm: Arc<dyn LlmClient> = Arc::new(ag_llm::NullClient);
    tracing::warn!(
        "no LLM client embedded — gateway will run but agent turns will \
         fail until a provider adapter is wired in"
    );

    // ── Cron ─────────────────────────────────────────────────────────
    let cron_store =
        ag_gateway::cron::store::CronStore::load(&state_dir, config.cron.run_log_cap)
            .context("loading cron store")?;
    let cron = Arc::new(ag_gateway::cron::service::CronService::new(cron_store));

    // ── Channels & workspace ─────────────────────────────────────────
    let channels = Arc::new(ag_gateway::channels::ChannelManager::new());
    let workspace = Arc::new(ag_gateway::workspace::WorkspaceReader::new(
        config.agent.workspace_dir.clone(),
    ));
    let seeds = Arc::new(
        ag_gateway::workspace::SeedTracker::load(&state_dir)
            .context("loading workspace seed state")?,
    );
    {
        let files = workspace.read_bootstrap_files(&config.agent.bootstrap_files);
        match seeds.record_seen(&files) {
            Ok(0) => {}
            Ok(n) => tracing::info!(files = n, "bootstrap files seeded"),
            Err(e) => tracing::warn!(error = %e, "bootstrap seed tracking failed"),
        }
    }

    let state = AppState {
        config: config.clone(),
        store,
        identity,
        lifecycle,
        devices,
        bus: bus.clone(),
        dedupe,
        presence,
        heartbeat: heartbeat.clone(),
        agents,
        chat: chat.clone(),
        tools,
        hooks,
        llm,
        cron: cron.clone(),
        channels: channels.clone(),
        workspace,
        seeds,
    };

    // ── Background loops ─────────────────────────────────────────────
    heartbeat.clone().start(bus.clone());
    tracing::info!("heartbeat started (30s tick)");

    if config.cron.enabled {
        let cron_state = state.clone();
        tokio::spawn(cron.clone().run_loop(cron_state));
        tracing::info!(jobs = cron.store.job_count(), "cron scheduler started");
    } else {
        tracing::info!("cron disabled by config");
    }

    channels.start(&state).await;
    tracing::info!(channels = channels.channel_names().len(), "channel manager started");

    // Periodic maintenance: aborted-run TTL and seq-tracker bounds.
    {
        let chat = chat.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                let pruned = chat.prune_aborted();
                if pruned > 0 {
                    tracing::debug!(pruned, "aborted-run entries pruned");
                }
            }
        });
    }

    // ── Router ───────────────────────────────────────────────────────
    let cors_layer = build_cors_layer(&config.server.cors);
    let app = ag_gateway::server::ws::router(state)
        .layer(cors_layer)
        .layer(tower::limit::ConcurrencyLimitLayer::new(256));

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "agentgate listening");

    let shutdown_bus = bus.clone();
    let shutdown_channels = channels.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown requested");
        shutdown_bus.publish("shutdown", serde_json::json!({ "reason": "signal" }));
        // Stop adapters and flush pending debounce batches.
        shutdown_channels.stop().await;
    })
    .await
    .context("axum server error")?;

    Ok(())
}

/// Build a [`CorsLayer`] from the configured allowed origins.
///
/// Origins may carry a trailing `:*` wildcard for the port segment
/// (e.g. `http://localhost:*`). A literal `"*"` allows all origins.
fn build_cors_layer(cors: &ag_domain::config::CorsConfig) -> CorsLayer {
    use axum::http::header;

    if cors.allowed_origins.len() == 1 && cors.allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let mut exact: Vec<HeaderValue> = Vec::new();
    let mut wildcard_prefixes: Vec<String> = Vec::new();
    for origin in &cors.allowed_origins {
        if origin.ends_with(":*") {
            wildcard_prefixes.push(origin.trim_end_matches('*').to_owned());
        } else if let Ok(hv) = origin.parse::<HeaderValue>() {
            exact.push(hv);
        } else {
            tracing::warn!(origin = %origin, "invalid CORS origin, skipping");
        }
    }

    let allow_origin = if wildcard_prefixes.is_empty() {
        AllowOrigin::list(exact)
    } else {
        AllowOrigin::predicate(move |origin, _| {
            let origin_str = origin.to_str().unwrap_or("");
            if exact.iter().any(|e| e.as_bytes() == origin.as_bytes()) {
                return true;
            }
            // The port remainder must be digits only, so a prefix match
            // cannot be extended into another host.
            wildcard_prefixes.iter().any(|prefix| {
                origin_str
                    .strip_prefix(prefix.as_str())
                    .map(|port| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false)
            })
        })
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}
