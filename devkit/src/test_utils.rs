/*!
Test Harness pour le moteur de synchronisation

Facilite l'écriture de tests d'intégration avec:
- Session déjà ouverte (profil + token) sur un `LocalStore` en mémoire
- `MockApi` relié à la session (un 401 simulé la ferme)
- Config dont le canal push vise un broker injoignable (pas de bruit réseau)
- Attente d'une condition sur le State Store avec timeout
*/

use crate::builders::{ProfileBuilder, TokenBuilder};
use crate::mock_api::MockApi;
use anyhow::Result;
use opsboard_sync::config::PushConf;
use opsboard_sync::models::UserProfile;
use opsboard_sync::{Dashboard, DashboardConfig, LocalStore, SessionManager, Snapshot, StateStore};
use std::time::Duration;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

pub struct TestHarness {
    pub api: MockApi,
    pub session: SessionManager,
    pub storage: LocalStore,
    pub config: DashboardConfig,
}

impl TestHarness {
    /// Harness sans session
    pub fn new() -> Self {
        init_tracing();
        let storage = LocalStore::in_memory();
        let session = SessionManager::new(Some(storage.clone()));
        Self {
            api: MockApi::new().with_session(session.clone()),
            session,
            storage,
            config: offline_config(),
        }
    }

    /// Harness avec session ouverte sur un token sans expiration
    pub async fn signed_in(profile: UserProfile) -> Self {
        let harness = Self::new();
        let token = TokenBuilder::new().subject(&profile.id).build();
        harness.api.set_profile(profile.clone());
        harness.session.set_session(profile, token).await;
        harness
    }

    /// Opérateur autorisé sur toutes les sources
    pub async fn operator() -> Self {
        Self::signed_in(ProfileBuilder::new("u1").allow_all().build()).await
    }

    pub fn dashboard(&self) -> Dashboard<MockApi> {
        Dashboard::new(self.config.clone(), self.session.clone(), self.api.clone())
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Config par défaut, canal push dirigé vers un port fermé
pub fn offline_config() -> DashboardConfig {
    DashboardConfig {
        push: PushConf {
            broker_host: "127.0.0.1".into(),
            broker_port: 1,
            reconnect_delay_secs: 3600,
            ..PushConf::default()
        },
        ..DashboardConfig::default()
    }
}

/// Attend que `predicate` soit vrai sur le snapshot courant
pub async fn wait_for_store<F>(store: &StateStore, limit: Duration, predicate: F) -> Result<Snapshot>
where
    F: Fn(&Snapshot) -> bool,
{
    let mut changes = store.subscribe();
    let waited = timeout(limit, async {
        loop {
            let snapshot = store.snapshot();
            if predicate(&snapshot) {
                return Ok(snapshot);
            }
            if changes.changed().await.is_err() {
                anyhow::bail!("state store dropped");
            }
        }
    })
    .await;
    match waited {
        Ok(result) => result,
        Err(_) => anyhow::bail!("store condition not reached within {limit:?}"),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("opsboard=debug")),
        )
        .with_test_writer()
        .try_init();
}
