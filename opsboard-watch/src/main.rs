//! Opsboard Watch - headless runner for the ops dashboard sync engine
//!
//! Keeps a live fleet view without a browser:
//! - Restores the persisted session (or bootstraps one from `OPSBOARD_TOKEN`)
//! - Refreshes the profile so the permission gate has something to decide on
//! - Mounts the dashboard (poll + push + history) and logs a summary on every change
//! - Exits on forced logout (expiry, 401) or Ctrl-C

mod summary;

use anyhow::{bail, Context, Result};
use opsboard_sync::models::UserProfile;
use opsboard_sync::session::SessionToken;
use opsboard_sync::{
    load_config, Dashboard, HttpApi, LocalStore, Preferences, SessionEvent, SessionManager,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Session from the environment first, then from local storage
async fn open_session(session: &SessionManager) -> Result<()> {
    if let Ok(token) = std::env::var("OPSBOARD_TOKEN") {
        let token = token.trim();
        if !token.is_empty() {
            let subject = SessionToken::decode(token)
                .subject
                .unwrap_or_else(|| "unknown".to_string());
            session
                .set_session(UserProfile::pending(subject), token)
                .await;
            if !session.is_active() {
                bail!("OPSBOARD_TOKEN is already expired");
            }
            return Ok(());
        }
    }
    if session.restore().await {
        info!("restored persisted session");
        return Ok(());
    }
    bail!("no usable session: set OPSBOARD_TOKEN or sign in through the dashboard first")
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("opsboard=info")),
        )
        .init();

    info!("opsboard-watch v{} starting", env!("CARGO_PKG_VERSION"));

    let config = load_config().await;
    let storage_path = config
        .storage_path()
        .context("cannot locate local state file")?;
    let storage = LocalStore::open(&storage_path)
        .await
        .with_context(|| format!("failed to open {}", storage_path.display()))?;
    let prefs = Preferences::new(storage.clone());
    debug!(
        theme = ?prefs.theme(),
        sidebar_collapsed = prefs.sidebar_collapsed(),
        path = %storage_path.display(),
        "local state loaded"
    );

    let session = SessionManager::new(Some(storage));
    let mut events = session.subscribe();
    open_session(&session).await?;

    let api = HttpApi::new(&config.api, session.clone()).context("failed to build HTTP client")?;
    let dashboard = Dashboard::new(config, session.clone(), api);

    match session.refresh_profile(dashboard.api.as_ref()).await {
        Ok(profile) => info!(user = %profile.id, role = ?profile.role, "profile loaded"),
        Err(e) if e.is_unauthorized() => bail!("backend rejected the session: {e}"),
        Err(e) => warn!(error = %e, "profile refresh failed, using stored permissions"),
    }

    let view = dashboard.mount().await;
    let mut changes = dashboard.store.subscribe();
    let mut last_line = String::new();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = dashboard.store.snapshot();
                let line = summary::summary_line(&snapshot);
                if line != last_line {
                    info!(
                        refreshed = %summary::format_refreshed(snapshot.last_refreshed_at),
                        trend = ?summary::online_trend(&view.history()),
                        "{line}"
                    );
                    last_line = line;
                }
            }
            event = events.recv() => match event {
                Ok(SessionEvent::SignedOut { reason }) => {
                    warn!(?reason, "signed out, stopping");
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => debug!(skipped, "session events lagged"),
                Err(RecvError::Closed) => break,
            },
            _ = &mut shutdown => {
                info!("interrupted");
                break;
            }
        }
    }

    view.unmount();
    dashboard.push.disconnect();
    info!("opsboard-watch stopped");
    Ok(())
}
