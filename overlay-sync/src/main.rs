//! Notification watcher: polls one resource and logs items as they appear.

use std::path::PathBuf;
use std::sync::Arc;

use overlay_sync::{HttpRemote, NotificationSink, StaticToken, SyncConfig, SyncView, TracingSink};
use shared_types::ResourceScope;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Load the nearest `.env` walking up from the working directory. Returns
/// the file tried and whether it loaded; `None` when there is none.
fn load_env_file() -> Option<(PathBuf, Result<(), dotenvy::Error>)> {
    let mut current = std::env::current_dir().ok()?;
    loop {
        let candidate = current.join(".env");
        if candidate.exists() {
            let loaded = dotenvy::from_path(&candidate);
            return Some((candidate, loaded));
        }
        if !current.pop() {
            return None;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Before the subscriber so RUST_LOG from .env takes effect.
    let env_file = load_env_file();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "overlay_sync=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match env_file {
        Some((path, Ok(()))) => {
            tracing::info!(path = %path.display(), "Loaded environment from .env");
        }
        Some((path, Err(e))) => {
            tracing::warn!(path = %path.display(), error = %e, "Failed to load .env file");
        }
        None => {}
    }

    let config = SyncConfig::from_env()?;
    let resource =
        std::env::var("OVERLAY_WATCH_RESOURCE").unwrap_or_else(|_| "notifications".to_string());

    if config.api_token.is_none() {
        tracing::warn!("OVERLAY_API_TOKEN is not set; polls will be skipped");
    }
    tracing::info!(
        base_url = %config.api_base_url,
        resource = %resource,
        interval_ms = config.poll_interval.as_millis() as u64,
        "overlay-sync watcher starting"
    );

    let remote = Arc::new(HttpRemote::new(config.api_base_url.clone()));
    let auth = Arc::new(StaticToken::new(config.api_token.clone()));
    let sink = Arc::new(TracingSink);
    let interval = config.poll_interval;

    let view = SyncView::new(remote, auth, sink.clone(), config);
    let scope = ResourceScope::new(resource);
    view.start_polling(scope, interval, move |scope, items| {
        sink.new_items(scope, items)
    })
    .await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    view.teardown();
    Ok(())
}
