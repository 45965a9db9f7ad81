use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use relay_queue::{DownstreamClient, RedisBackend, RelayConfig, RelayWorker};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env for local development; deployments inject env vars directly
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Missing queue URL or shared secret is fatal: refuse to start rather
    // than run without a queue or without authentication
    let config = RelayConfig::from_env().context("Invalid relay configuration")?;
    info!(?config, "starting relay worker");

    let backend = Arc::new(
        RedisBackend::connect(&config.redis_url)
            .await
            .context("Failed to connect to queue store")?,
    );

    let client = DownstreamClient::new(
        &config.downstream_url,
        config.shared_secret.clone(),
        config.request_timeout,
    )
    .context("Failed to build downstream client")?;

    let reaper_cancel = CancellationToken::new();
    let reaper = tokio::spawn(reap_loop(
        backend.clone(),
        config.queue_name.clone(),
        reaper_cancel.clone(),
    ));

    let worker = RelayWorker::new(
        config.queue_name.clone(),
        backend.clone(),
        Arc::new(client),
    )
    .with_options(config.worker_options());
    let handle = worker.start();

    shutdown_signal().await?;
    info!("termination signal received; shutting down");

    if let Err(e) = handle.shutdown().await {
        warn!(error = %e, "worker did not shut down cleanly");
    }

    reaper_cancel.cancel();
    let _ = reaper.await;

    info!("relay worker stopped");
    Ok(())
}

/// Periodically return expired claims to the queue so jobs abandoned by a
/// crashed worker (or one killed past its grace period) get redelivered
async fn reap_loop(backend: Arc<RedisBackend>, queue: String, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = backend.reap_expired_claims(&queue).await {
                    warn!(error = %e, "claim reaper cycle failed");
                }
            }
        }
    }
}

/// Resolve on SIGTERM or SIGINT
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for SIGINT")?;
            }
            _ = sigterm.recv() => {}
        }

        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for ctrl-c")?;
        Ok(())
    }
}
