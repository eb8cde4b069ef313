use std::sync::Arc;

use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;

use taskforge::agent::RunnerPoller;
use taskforge::api::{AppState, api_routes};
use taskforge::config::{GitHubConfig, PrPolicyConfig, RunnerConfig, ServerConfig};
use taskforge::pr::gateway::PrActionGateway;
use taskforge::pr::github::GitHubProvider;
use taskforge::service::dispatch::DispatchService;
use taskforge::service::retry::RetryService;
use taskforge::service::runners::RunnerService;
use taskforge::service::tasks::TaskService;
use taskforge::store::{LibSqlStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    // Initialize tracing; optionally tee into a daily rolling file.
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let mut _log_guard = None;
    if let Some(log_dir) = &config.log_dir {
        let appender = tracing_appender::rolling::daily(log_dir, "taskforge.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        _log_guard = Some(guard);
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_writer(writer)
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter())
            .with_target(false)
            .init();
    }

    eprintln!("🛠  taskforge v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://{}", config.bind_addr);
    eprintln!("   Database: {}", config.db_path.display());

    // ── Store ───────────────────────────────────────────────────────────
    let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_local(&config.db_path).await?);

    // Seed the bootstrap user so runners and clients can authenticate.
    if let Some(api_key) = &config.bootstrap_api_key {
        store.upsert_user("admin", api_key.expose_secret()).await?;
        eprintln!("   Bootstrap user: admin");
    }

    // ── Services ────────────────────────────────────────────────────────
    let policy = PrPolicyConfig::from_env();
    eprintln!(
        "   PR writes: {}",
        if policy.write_enabled { "enabled" } else { "disabled" }
    );
    eprintln!(
        "   Session resume: {}",
        if config.resume_enabled { "enabled" } else { "disabled" }
    );

    let github_token = GitHubConfig::from_env().map(|c| c.token);
    let provider = Arc::new(GitHubProvider::new(github_token));

    let state = AppState {
        store: Arc::clone(&store),
        dispatch: Arc::new(DispatchService::new(
            Arc::clone(&store),
            config.resume_enabled,
        )),
        tasks: Arc::new(TaskService::new(Arc::clone(&store))),
        runners: Arc::new(RunnerService::new(Arc::clone(&store))),
        retry: Arc::new(RetryService::new(
            Arc::clone(&store),
            config.resume_enabled,
        )),
        gateway: Arc::new(PrActionGateway::new(Arc::clone(&store), provider, policy)),
    };

    // ── HTTP server ─────────────────────────────────────────────────────
    let app = api_routes(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "API server started");
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    // ── Embedded runner (optional) ──────────────────────────────────────
    // Enabled when TASKFORGE_RUNNER_ID is set, the same way optional
    // subsystems are switched on elsewhere.
    let shutdown = CancellationToken::new();
    if let Some(runner_config) = RunnerConfig::from_env()? {
        eprintln!(
            "   Runner: {} ({} workspaces, polling {})",
            runner_config.runner_id,
            runner_config.workspaces.len(),
            runner_config.server_url,
        );
        let poller = RunnerPoller::new(runner_config);
        let runner_shutdown = shutdown.clone();
        tokio::spawn(async move {
            poller.run(runner_shutdown).await;
        });
    } else {
        eprintln!("   Runner: disabled");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    shutdown.cancel();
    server.abort();

    Ok(())
}
