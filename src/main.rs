use std::sync::Arc;

use tower_http::cors::CorsLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use inbox_pilot::admin::{AppState, admin_routes};
use inbox_pilot::completion::create_openai_service;
use inbox_pilot::config::Config;
use inbox_pilot::observe::Observer;
use inbox_pilot::pipeline::{DualWriter, OverrideStore, ThreadPipeline};
use inbox_pilot::scheduler::Scheduler;
use inbox_pilot::shutdown::install_signal_handler;
use inbox_pilot::source::{HttpSource, MessageSource};
use inbox_pilot::store::{DashboardStore, LibSqlBackend, LibSqlDashboard, OperationalStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        eprintln!("  export OPENAI_API_KEY=sk-... SOURCE_BASE_URL=http://...");
        std::process::exit(1);
    });

    // Initialize tracing: stderr plus a daily log file.
    std::fs::create_dir_all(&config.log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "inbox-pilot.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(non_blocking),
        )
        .init();

    eprintln!("📬 Inbox Pilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.completion.model);
    eprintln!("   Source: {}", config.source.base_url);
    eprintln!("   Admin API: http://0.0.0.0:{}/health", config.admin_port);
    eprintln!("   Logs: {}", config.log_dir.display());

    // ── Stores ───────────────────────────────────────────────────────────
    let operational_path = &config.stores.operational_path;
    let store: Arc<dyn OperationalStore> = Arc::new(
        LibSqlBackend::new_local(operational_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open operational store at {}: {}",
                    operational_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Operational store: {}", operational_path.display());

    let dashboard: Option<Arc<dyn DashboardStore>> = match &config.stores.dashboard_path {
        Some(path) => {
            let dashboard = LibSqlDashboard::new_local(path).await.unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open dashboard store at {}: {}",
                    path.display(),
                    e
                );
                std::process::exit(1);
            });
            eprintln!("   Dashboard store: {}", path.display());
            Some(Arc::new(dashboard) as Arc<dyn DashboardStore>)
        }
        None => {
            eprintln!("   Dashboard store: disabled");
            None
        }
    };

    // ── Capabilities ─────────────────────────────────────────────────────
    let http_source = HttpSource::new(&config.source);
    if let Err(e) = http_source.verify().await {
        eprintln!("Error: Message source unavailable: {}", e);
        std::process::exit(1);
    }
    let source: Arc<dyn MessageSource> = Arc::new(http_source);
    let completion = create_openai_service(&config.completion)?;

    // ── Pipeline ─────────────────────────────────────────────────────────
    let observer = Arc::new(Observer::new());
    let overrides = Arc::new(OverrideStore::new(
        Arc::clone(&store),
        completion,
        config.pipeline.call_timeout,
        config.pipeline.response_prefix.clone(),
    ));
    let writer = DualWriter::new(Arc::clone(&store), dashboard.clone(), Arc::clone(&observer));
    let pipeline = Arc::new(ThreadPipeline::new(
        source,
        Arc::clone(&store),
        Arc::clone(&overrides),
        writer,
        Arc::clone(&observer),
        config.pipeline.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        pipeline,
        Arc::clone(&observer),
        config.pending_lane.clone(),
        config.inbox_lane.clone(),
    ));

    let cancel = install_signal_handler();
    let counters = Arc::clone(&observer);

    // ── Admin API ────────────────────────────────────────────────────────
    let app = admin_routes(AppState {
        overrides,
        store,
        dashboard,
        observer,
    })
    .layer(CorsLayer::permissive());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.admin_port)).await?;
    tracing::info!(port = config.admin_port, "Admin API started");
    let admin_cancel = cancel.clone();
    let admin = tokio::spawn(async move {
        let shutdown = async move { admin_cancel.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!("Admin API stopped: {e}");
        }
    });

    // ── Lanes ────────────────────────────────────────────────────────────
    eprintln!("   Lanes: pending-intake, inbox. Ctrl+C to stop.\n");
    for handle in scheduler.spawn(&cancel) {
        if let Err(e) = handle.await {
            tracing::error!("Lane task failed: {e}");
        }
    }
    cancel.cancel();
    admin.await.ok();

    tracing::info!(counters = ?counters.snapshot(), "Shutdown complete");
    Ok(())
}
