/*!
Mock de l'API dashboard pour tests sans backend

Implémente `DashboardApi` en mémoire :
- Données scriptées par ressource, modifiables entre deux cycles de poll
- Échecs injectables (une fois ou jusqu'à `recover`)
- Latence simulée par ressource (compatible avec le temps tokio en pause)
- Compteur d'appels par endpoint pour vérifier qu'une source refusée n'est jamais requêtée
*/

use opsboard_sync::models::{
    Alert, Device, Incident, LicenseItem, LicenseStats, Listing, SyntheticsSummary, UserProfile,
};
use opsboard_sync::{ApiError, DashboardApi, SessionManager};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Devices,
    Incidents,
    Alerts,
    Synthetics,
    LicenseStats,
    Licenses,
    Profile,
    SetMonitoring,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Devices => "/devices",
            Endpoint::Incidents => "/incidents",
            Endpoint::Alerts => "/alerts/active",
            Endpoint::Synthetics => "/synthetics/stats",
            Endpoint::LicenseStats => "/licenses/stats",
            Endpoint::Licenses => "/licenses",
            Endpoint::Profile => "/auth/me",
            Endpoint::SetMonitoring => "/devices/:id",
        }
    }
}

/// Échec simulé ; converti en `ApiError` à chaque appel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Status(u16),
    Unauthorized,
}

impl Failure {
    fn to_error(self, endpoint: Endpoint) -> ApiError {
        let path = endpoint.path().to_string();
        match self {
            Failure::Status(status) => ApiError::Status { status, path },
            Failure::Unauthorized => ApiError::Unauthorized { path },
        }
    }
}

#[derive(Default)]
struct Data {
    devices: Vec<Device>,
    incidents: Listing<Incident>,
    alerts: Vec<Alert>,
    synthetics: SyntheticsSummary,
    license_stats: LicenseStats,
    licenses: Vec<LicenseItem>,
    profile: Option<UserProfile>,
}

#[derive(Default)]
struct Script {
    once: HashMap<Endpoint, VecDeque<Failure>>,
    always: HashMap<Endpoint, Failure>,
    delays: HashMap<Endpoint, Duration>,
    gates: HashMap<Endpoint, Arc<Notify>>,
}

#[derive(Default)]
struct MockInner {
    data: Mutex<Data>,
    script: Mutex<Script>,
    calls: Mutex<Vec<Endpoint>>,
    monitoring: Mutex<Vec<(String, bool)>>,
    session: Mutex<Option<SessionManager>>,
}

/// API en mémoire partageable entre le test et le code testé
#[derive(Clone, Default)]
pub struct MockApi {
    inner: Arc<MockInner>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Un 401 simulé efface cette session, comme le ferait le client HTTP
    pub fn with_session(self, session: SessionManager) -> Self {
        *self.inner.session.lock() = Some(session);
        self
    }

    // ===== Données =====

    pub fn set_devices(&self, devices: Vec<Device>) {
        self.inner.data.lock().devices = devices;
    }

    pub fn set_incidents(&self, items: Vec<Incident>, total: Option<u64>) {
        self.inner.data.lock().incidents = Listing { items, total };
    }

    pub fn set_alerts(&self, alerts: Vec<Alert>) {
        self.inner.data.lock().alerts = alerts;
    }

    pub fn set_synthetics(&self, summary: SyntheticsSummary) {
        self.inner.data.lock().synthetics = summary;
    }

    pub fn set_licenses(&self, stats: LicenseStats, items: Vec<LicenseItem>) {
        let mut data = self.inner.data.lock();
        data.license_stats = stats;
        data.licenses = items;
    }

    pub fn set_profile(&self, profile: UserProfile) {
        self.inner.data.lock().profile = Some(profile);
    }

    // ===== Script =====

    pub fn fail_once(&self, endpoint: Endpoint, failure: Failure) {
        self.inner
            .script
            .lock()
            .once
            .entry(endpoint)
            .or_default()
            .push_back(failure);
    }

    pub fn fail_always(&self, endpoint: Endpoint, failure: Failure) {
        self.inner.script.lock().always.insert(endpoint, failure);
    }

    pub fn recover(&self, endpoint: Endpoint) {
        let mut script = self.inner.script.lock();
        script.always.remove(&endpoint);
        script.once.remove(&endpoint);
    }

    pub fn delay(&self, endpoint: Endpoint, delay: Duration) {
        self.inner.script.lock().delays.insert(endpoint, delay);
    }

    /// L'appel reste bloqué jusqu'à `notify_one()` sur le `Notify` retourné
    pub fn gate(&self, endpoint: Endpoint) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.inner.script.lock().gates.insert(endpoint, gate.clone());
        gate
    }

    // ===== Assertions =====

    pub fn calls(&self, endpoint: Endpoint) -> usize {
        self.inner
            .calls
            .lock()
            .iter()
            .filter(|called| **called == endpoint)
            .count()
    }

    pub fn total_calls(&self) -> usize {
        self.inner.calls.lock().len()
    }

    pub fn call_log(&self) -> Vec<Endpoint> {
        self.inner.calls.lock().clone()
    }

    pub fn monitoring_changes(&self) -> Vec<(String, bool)> {
        self.inner.monitoring.lock().clone()
    }

    pub fn reset_calls(&self) {
        self.inner.calls.lock().clear();
    }

    /// Enregistre l'appel puis applique latence, verrou et échec scriptés
    async fn enter(&self, endpoint: Endpoint) -> Result<(), ApiError> {
        self.inner.calls.lock().push(endpoint);
        let (delay, gate) = {
            let script = self.inner.script.lock();
            (
                script.delays.get(&endpoint).copied(),
                script.gates.get(&endpoint).cloned(),
            )
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let failure = {
            let mut script = self.inner.script.lock();
            match script.once.get_mut(&endpoint).and_then(VecDeque::pop_front) {
                Some(failure) => Some(failure),
                None => script.always.get(&endpoint).copied(),
            }
        };
        let Some(failure) = failure else {
            return Ok(());
        };

        debug!(?endpoint, ?failure, "mock api failing call");
        if failure == Failure::Unauthorized {
            let session = self.inner.session.lock().clone();
            if let Some(session) = session {
                session.handle_unauthorized().await;
            }
        }
        Err(failure.to_error(endpoint))
    }
}

impl DashboardApi for MockApi {
    async fn fetch_devices(&self) -> Result<Vec<Device>, ApiError> {
        self.enter(Endpoint::Devices).await?;
        Ok(self.inner.data.lock().devices.clone())
    }

    async fn fetch_incidents(&self, limit: u32) -> Result<Listing<Incident>, ApiError> {
        self.enter(Endpoint::Incidents).await?;
        let data = self.inner.data.lock();
        Ok(Listing {
            items: data
                .incidents
                .items
                .iter()
                .take(limit as usize)
                .cloned()
                .collect(),
            total: data.incidents.total,
        })
    }

    async fn fetch_alerts(&self, limit: u32) -> Result<Vec<Alert>, ApiError> {
        self.enter(Endpoint::Alerts).await?;
        let data = self.inner.data.lock();
        Ok(data.alerts.iter().take(limit as usize).cloned().collect())
    }

    async fn fetch_synthetics(&self, window_hours: u32) -> Result<SyntheticsSummary, ApiError> {
        self.enter(Endpoint::Synthetics).await?;
        let mut summary = self.inner.data.lock().synthetics.clone();
        summary.window_hours.get_or_insert(window_hours);
        Ok(summary)
    }

    async fn fetch_license_stats(&self) -> Result<LicenseStats, ApiError> {
        self.enter(Endpoint::LicenseStats).await?;
        Ok(self.inner.data.lock().license_stats.clone())
    }

    async fn fetch_licenses(&self) -> Result<Vec<LicenseItem>, ApiError> {
        self.enter(Endpoint::Licenses).await?;
        Ok(self.inner.data.lock().licenses.clone())
    }

    async fn fetch_profile(&self) -> Result<UserProfile, ApiError> {
        self.enter(Endpoint::Profile).await?;
        self.inner
            .data
            .lock()
            .profile
            .clone()
            .ok_or_else(|| ApiError::Invalid {
                path: Endpoint::Profile.path().into(),
                reason: "no profile scripted".into(),
            })
    }

    async fn set_monitoring(&self, device_id: &str, enabled: bool) -> Result<(), ApiError> {
        self.enter(Endpoint::SetMonitoring).await?;
        self.inner
            .monitoring
            .lock()
            .push((device_id.to_string(), enabled));
        if let Some(device) = self
            .inner
            .data
            .lock()
            .devices
            .iter_mut()
            .find(|d| d.device_id == device_id)
        {
            device.monitoring_enabled = enabled;
        }
        Ok(())
    }
}
