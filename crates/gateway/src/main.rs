use std::sync::Arc;

use anyhow::Context;
use axum::http::{HeaderValue, Method};
use clap::Parser;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::EnvFilter;

use tal_domain::config::{Config, ConfigSeverity};
use tal_gateway::cli::{load_config, Cli, Command, ConfigCommand};
use tal_gateway::runtime::bus::EventBus;
use tal_gateway::runtime::redact::{Redactor, Tokenizer};
use tal_gateway::runtime::schedule_runner;
use tal_gateway::runtime::schedules::JobStore;
use tal_gateway::state::AppState;
use tal_providers::AnthropicClient;
use tal_sessions::{ClientStore, PlaybookStore, SessionStore, UserStore};
use tal_tools::{Executor, TaskRegistry, ToolRegistry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::Config(ConfigCommand::Validate)) => {
            let config = load_config(&cli.config)?;
            let issues = config.validate();
            for issue in &issues {
                let tag = match issue.severity {
                    ConfigSeverity::Warning => "warning",
                    ConfigSeverity::Error => "error",
                };
                println!("{tag}: {issue}");
            }
            if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
                std::process::exit(1);
            }
            println!("configuration ok");
            Ok(())
        }
        Some(Command::Config(ConfigCommand::Show)) => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Command::Version) => {
            println!("talon {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tal_gateway=debug")),
        )
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("talon starting");

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

    // ── Stores ───────────────────────────────────────────────────────
    let data_dir = &config.data.data_dir;
    let sessions = Arc::new(
        SessionStore::load(data_dir).context("loading sessions")?,
    );
    let clients = Arc::new(ClientStore::load(data_dir).context("loading clients")?);
    let users = Arc::new(UserStore::load(data_dir).context("loading users")?);
    let playbooks = Arc::new(
        PlaybookStore::load(&config.data.playbook_dir).context("loading playbooks")?,
    );
    let jobs = Arc::new(JobStore::load(data_dir).context("loading schedules")?);

    // ── Tool catalog + executor ──────────────────────────────────────
    let tools = Arc::new(
        ToolRegistry::load(&config.data.tool_definitions).context("loading tool definitions")?,
    );
    let tasks = Arc::new(TaskRegistry::new());
    let executor = Arc::new(Executor::new(
        tasks.clone(),
        config.exec.clone(),
        config.data.artifact_dir.clone(),
    ));
    tracing::info!(tools = tools.names().len(), "executor ready");

    // ── LLM client ───────────────────────────────────────────────────
    let llm = Arc::new(
        AnthropicClient::from_config(&config.llm).context("initializing LLM client")?,
    );
    tracing::info!(model = %config.llm.model, "LLM client ready");

    // ── App state ────────────────────────────────────────────────────
    let state = AppState {
        config: config.clone(),
        llm,
        sessions,
        clients,
        users,
        playbooks,
        tools,
        executor,
        tasks: tasks.clone(),
        jobs,
        bus: Arc::new(EventBus::new()),
        tokenizer: Arc::new(Tokenizer::new()),
        redactor: Arc::new(Redactor::new()),
    };

    // ── Schedule runner ──────────────────────────────────────────────
    {
        let state = state.clone();
        let tick = std::time::Duration::from_secs(config.schedule.tick_sec.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                schedule_runner::tick(&state).await;
            }
        });
    }
    tracing::info!(tick_sec = config.schedule.tick_sec, "schedule runner started");

    // ── Terminal-task eviction sweep ─────────────────────────────────
    {
        let tasks = tasks.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(3_600));
            loop {
                interval.tick().await;
                tasks.evict_terminal(chrono::Duration::hours(24));
            }
        });
    }

    // ── Router ───────────────────────────────────────────────────────
    let app = tal_gateway::api::router()
        .layer(build_cors_layer(&config.server.allowed_origins))
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            config.server.max_concurrent_requests,
        ))
        .with_state(state.clone());

    // ── Bind ─────────────────────────────────────────────────────────
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "talon listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .context("axum server error")?;

    Ok(())
}

/// Wait for ctrl-c, then best-effort terminate in-flight process groups.
async fn shutdown_signal(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
    for task in state.tasks.list() {
        if !task.status.is_terminal() {
            state.executor.kill(&task.task_id);
        }
    }
}

/// Build a CORS layer from the configured origins. A single `"*"` allows
/// all origins.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    use axum::http::header;

    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];

    if allowed_origins.len() == 1 && allowed_origins[0] == "*" {
        tracing::warn!("CORS configured with wildcard \"*\" — all origins allowed");
        return CorsLayer::new()
            .allow_origin(tower_http::cors::Any)
            .allow_methods(methods)
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(hv) => Some(hv),
            Err(_) => {
                tracing::warn!(origin = %o, "invalid CORS origin, skipping");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(methods)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_credentials(true)
}
