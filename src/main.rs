use std::sync::Arc;

use taskhub::api::task_routes;
use taskhub::config::TaskhubConfig;
use taskhub::intent::KeywordIntentParser;
use taskhub::processors::ProcessorRegistry;
use taskhub::scheduler::{Scheduler, spawn_scheduler};
use taskhub::store::{LibSqlStore, TaskStore};
use taskhub::tasks::TaskService;
use taskhub::worker::{WorkerDeps, WorkerPool};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = TaskhubConfig::from_env();

    let port: u16 = std::env::var("TASKHUB_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    let db_path =
        std::env::var("TASKHUB_DB_PATH").unwrap_or_else(|_| "./data/taskhub.db".to_string());

    eprintln!("⚙️  taskhub v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API:      http://0.0.0.0:{port}");
    eprintln!("   Event WS: ws://0.0.0.0:{port}/ws/events");
    eprintln!("   Database: {db_path}");
    eprintln!("   Workers:  {}", config.worker.worker_count);

    // ── Store ───────────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlStore::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {db_path}: {e}");
                std::process::exit(1);
            }),
    );

    // ── Processors ──────────────────────────────────────────────────────
    // Registration is the single place capabilities are wired in; anything
    // unmatched falls back to the default processor.
    let registry = Arc::new(ProcessorRegistry::new());
    eprintln!("   Processors: {} registered", registry.count());

    // ── Service ─────────────────────────────────────────────────────────
    let parser = Arc::new(KeywordIntentParser::new());
    let service = TaskService::new(store, registry, parser, &config);

    // ── Startup recovery: lanes do not survive a restart ────────────────
    match service.recover_queued().await {
        Ok(recovered) if recovered > 0 => {
            eprintln!("   Recovered {recovered} queued tasks from store");
        }
        Ok(_) => {}
        Err(e) => {
            eprintln!("   Warning: queued-task recovery failed: {e}");
        }
    }

    // ── Worker pool ─────────────────────────────────────────────────────
    let mut pool = WorkerPool::new(WorkerDeps {
        service: Arc::clone(&service),
        config: config.worker.clone(),
    });
    pool.start();

    // ── Scheduler ───────────────────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&service),
        config.scheduler.clone(),
        &config.worker,
    ));
    let _scheduler_handle = spawn_scheduler(scheduler);
    eprintln!(
        "   Scheduler: scanning every {}s\n",
        config.scheduler.scan_interval.as_secs()
    );

    // ── HTTP / WS server ────────────────────────────────────────────────
    let app = task_routes(Arc::clone(&service));
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "taskhub server started");
    axum::serve(listener, app).await?;

    pool.stop().await;
    Ok(())
}
