mod config;
mod http;

use anyhow::{Context, Result};
use dispatch::auth;
use dispatch::bus::Bus;
use dispatch::controller::Controller;
use dispatch::ledger::Ledger;
use dispatch::mailer::{Mailer, NullMailer, SmtpMailer};
use dispatch::storage::{ObjectStore, S3Store};
use dispatch::store::Db;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cfg = config::load_config()?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("gateway starting");
    tracing::info!(
        bind = %cfg.bind_addr,
        api_base_url = %cfg.urls.api_base_url,
        "config loaded"
    );

    let db = Db::connect(&cfg.db_url, 10).await?;
    db.migrate().await?;
    auth::bootstrap_admin(&db, &cfg.bootstrap_admin_email, &cfg.bootstrap_api_key)
        .await
        .map_err(|e| anyhow::anyhow!("bootstrap admin: {e}"))?;

    let bus = Bus::connect(&cfg.redis_url).await?;
    let s3 = S3Store::connect(&cfg.s3).await?;
    s3.ensure_bucket().await.context("ensure bucket")?;
    let store: Arc<dyn ObjectStore> = Arc::new(s3);
    let mailer: Arc<dyn Mailer> = match &cfg.smtp {
        Some(smtp) => Arc::new(SmtpMailer::new(smtp)?),
        None => Arc::new(NullMailer),
    };

    let controller = Controller::new(
        db.clone(),
        Ledger::new(db.pool().clone()),
        bus,
        store,
        mailer,
        cfg.pricing.clone(),
        cfg.lemon.clone(),
        cfg.urls.clone(),
        cfg.max_attempts,
    );

    let state = Arc::new(http::AppState {
        controller,
        jwt: cfg.jwt.clone(),
    });
    let app = http::router(state);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("bind {}", cfg.bind_addr))?;

    let shutdown = CancellationToken::new();

    let mut join_set: tokio::task::JoinSet<Result<()>> = tokio::task::JoinSet::new();
    {
        let shutdown = shutdown.clone();
        join_set.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
                .context("serve http")
        });
    }

    tracing::info!("gateway started");

    let mut fatal: Option<anyhow::Error> = None;
    tokio::select! {
        res = shutdown_signal() => {
            res?;
            tracing::info!("shutdown requested");
        },
        res = join_set.join_next() => {
            if let Some(res) = res {
                let res = res.context("gateway task panicked")?;
                match res {
                    Ok(()) => fatal = Some(anyhow::anyhow!("gateway task exited unexpectedly")),
                    Err(e) => fatal = Some(e.context("gateway task failed")),
                }
            }
        }
    }

    shutdown.cancel();

    while let Some(res) = join_set.join_next().await {
        let res = res.context("gateway task panicked")?;
        if let Err(e) = res {
            fatal.get_or_insert_with(|| e.context("gateway task failed"));
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
