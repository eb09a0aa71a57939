use anyhow::Context;
use huddle::{AppState, app, config::Config, db::Store};
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("huddle=debug,tower_http=info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let store = Store::connect(&config.database_url, config.db_max_connections, config.db_busy_timeout)
        .await
        .with_context(|| format!("failed to open database at {}", config.database_url))?;
    store.init().await.context("failed to create tables")?;

    // no channel survives a restart
    let closed = store.close_orphaned_participations().await?;
    if closed > 0 {
        info!(closed, "closed participations left open by a previous run");
    }

    let bind_address = config.bind_address.clone();
    let app = app(AppState::new(store.clone(), config));

    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!(%bind_address, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.pool().close().await;
    info!("shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
