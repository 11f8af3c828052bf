use anyhow::Result;
use clap::Parser;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let boot = mrelay_core::bootstrap(cli::Cli::parse().into_patch()).await?;
    let app = mrelay_router::relay_router(boot.pipeline.clone());

    let bind = format!("{}:{}", boot.global.host, boot.global.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(event = "listening", bind = %bind);
    axum::serve(listener, app).await?;
    Ok(())
}
