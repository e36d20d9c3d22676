//! devcrew - HTTP Server Entry Point
//!
//! Serves the run API and webhooks, and executes queued runs.

use devcrew::{api, config::Config};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "devcrew=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        "Loaded configuration: model={} review_model={} repository={}",
        config.default_model,
        config.review_model,
        config.github.repository.as_deref().unwrap_or("(per request)")
    );
    if config.webhook_secret.is_none() {
        info!("WEBHOOK_SECRET not set; webhook signatures are not checked");
    }

    api::serve(config).await
}
