//! Service entry point.

use slackvault::{AppContext, Config};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("slackvault=info")),
        )
        .init();

    let config = Config::from_env()?;
    let bind = format!("{}:{}", config.bind, config.port);
    let context = AppContext::initialise(config).await?;

    let router = slackvault::api::router(context);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(%bind, "listening");
    axum::serve(listener, router).await?;

    Ok(())
}
