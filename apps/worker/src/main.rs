mod bundle;
mod config;
mod render;
mod runner;
mod telemetry;
mod transcode;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = config::load_config()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let telemetry = telemetry::WorkerTelemetry::new();

    tracing::info!("worker starting");
    tracing::info!(
        gpu_class = cfg.gpu_class.as_str(),
        scratch = %cfg.scratch_root.display(),
        render_timeout_secs = cfg.render_timeout.as_secs(),
        "config loaded"
    );

    let shutdown = CancellationToken::new();

    let mut join_set = tokio::task::JoinSet::new();
    {
        let shutdown = shutdown.clone();
        let telemetry = telemetry.clone();
        join_set.spawn(async move {
            let worker = runner::Worker::new(cfg, telemetry).await?;
            worker.run(shutdown).await
        });
    }

    tracing::info!("worker started");

    let mut fatal: Option<anyhow::Error> = None;
    tokio::select! {
        res = shutdown_signal() => {
            res?;
            tracing::info!("shutdown requested");
        },
        res = join_set.join_next() => {
            if let Some(res) = res {
                let res = res.context("worker task panicked")?;
                match res {
                    Ok(()) => fatal = Some(anyhow::anyhow!("worker task exited unexpectedly")),
                    Err(e) => fatal = Some(e.context("worker task failed")),
                }
            }
        }
    }

    shutdown.cancel();

    while let Some(res) = join_set.join_next().await {
        let res = res.context("worker task panicked")?;
        if let Err(e) = res {
            fatal.get_or_insert_with(|| e.context("worker task failed"));
        }
    }

    fatal.map_or(Ok(()), Err)
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("ctrl-c")?;
        Ok(())
    }
}
