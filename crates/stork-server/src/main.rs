mod cleanup;
mod config;
mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stork_crypto::DeviceIdentity;
use stork_db::Database;
use stork_transfer::{
    BatchOrchestrator, EngineContext, HttpTransport, InboundService, ReceivedFile, Receiver, ReceiverConfig, SendOptions, Sender,
    TracingObserver,
};
use stork_types::{BatchFileStatus, BatchStatus};
use tracing::{error, info, warn};

use crate::config::Config;
use crate::routes::AppState;

const USAGE: &str = "usage: stork [serve] | stork send <peer-url> <path>...";

/// Per-request timeout for everything except `initTransfer`.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stork=debug,stork_transfer=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.first().map(String::as_str) {
        None | Some("serve") => serve(config).await,
        Some("send") if args.len() >= 3 => {
            let paths: Vec<PathBuf> = args[2..].iter().map(PathBuf::from).collect();
            send(config, &args[1], &paths).await
        }
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    }
}

fn build_context(config: &Config) -> anyhow::Result<Arc<EngineContext>> {
    let identity = DeviceIdentity::load_or_create(&config.identity_path())?;
    let db = Arc::new(Database::open(&config.db_path())?);
    let ctx = EngineContext::with_database(
        config.settings.clone(),
        &config.device_name,
        config.port,
        identity,
        db,
    )?;
    if let Some(pin) = &config.pin {
        ctx.pin.set_pin(pin)?;
    }
    info!(device_id = ctx.device_id(), name = %ctx.device_name, "Device identity loaded");
    Ok(Arc::new(ctx))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let ctx = build_context(&config)?;

    let receiver = Receiver::new(
        ReceiverConfig {
            partial_dir: config.partial_dir(),
            download_dir: config.download_dir.clone(),
            stale_after: config.settings.resume_stale_after,
        },
        ctx.clone(),
        Arc::new(TracingObserver),
    )
    .on_file_received(Box::new(|file: &ReceivedFile| {
        info!(
            transfer_id = %file.transfer_id,
            peer = %file.peer,
            size = file.size,
            "Saved {}",
            file.path.display()
        );
    }));
    let service = Arc::new(InboundService::new(ctx, receiver));

    // Sweep once at startup so partials from a previous run are checked.
    if let Err(e) = cleanup::cleanup_once(&service).await {
        warn!("Startup cleanup failed: {}", e);
    }
    tokio::spawn(cleanup::run_cleanup_loop(service.clone(), config.cleanup_interval));

    let app = routes::router(AppState { service });

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Stork listening on {}", addr);
    info!("Downloads go to {}", config.download_dir.display());

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn send(config: Config, target: &str, paths: &[PathBuf]) -> anyhow::Result<()> {
    let ctx = build_context(&config)?;

    // initTransfer may block on the receiver's approval prompt.
    let init_timeout = config.settings.approval_timeout + REQUEST_TIMEOUT;
    let transport = HttpTransport::new(target, REQUEST_TIMEOUT, init_timeout)?;
    let sender = Arc::new(Sender::new(transport, ctx, target));

    let options = SendOptions {
        chunk_size: config.chunk_size,
        pin: config.remote_pin.clone(),
        ..SendOptions::default()
    };
    let orchestrator = Arc::new(
        BatchOrchestrator::new(sender, options, Arc::new(TracingObserver))
            .with_concurrency(config.batch_concurrency),
    );

    let batch_id = orchestrator.start_batch(paths)?;
    let batch = tokio::select! {
        result = orchestrator.wait_for_batch(batch_id) => result?,
        _ = shutdown_signal() => {
            orchestrator.cancel_batch(batch_id)?;
            orchestrator.wait_for_batch(batch_id).await?
        }
    };

    let completed = batch.files.iter().filter(|f| f.status == BatchFileStatus::Completed).count();
    info!(
        batch_id = %batch.id,
        completed,
        total = batch.files.len(),
        progress = batch.progress(),
        "Batch finished: {:?}",
        batch.status
    );
    for file in batch.files.iter().filter(|f| f.status != BatchFileStatus::Completed) {
        error!(
            file = %file.relative_path,
            status = ?file.status,
            error = file.error.as_deref().unwrap_or(""),
            "Not delivered"
        );
    }

    if batch.status != BatchStatus::Completed {
        anyhow::bail!("batch {} ended as {:?}", batch.id, batch.status);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
