/**
 * POLL ORCHESTRATOR - Rafraîchissement périodique de tous les domaines autorisés
 *
 * RÔLE :
 * Lance un fetch indépendant par domaine (devices, incidents, alertes,
 * synthetics, licences), attend qu'ils se terminent tous et commite chaque
 * succès dans le State Store.
 *
 * FONCTIONNEMENT :
 * - Le permission gate est consulté avant chaque cycle : une source refusée n'est
 *   jamais requêtée, sa tranche reçoit la valeur neutre
 * - Isolation par source : un échec laisse la valeur précédente en place (Stale)
 *   sans retarder ni annuler les autres
 * - Chaque source commite dès que son fetch se termine
 * - Une source déjà en vol est sautée ; un résultat plus ancien que le dernier
 *   commit de sa source est écarté
 * - La génération du cycle vient du store : un cycle commencé avant une
 *   déconnexion (store vidé) n'y écrit plus rien
 * - `last_refreshed_at` est posé une fois tous les fetchs terminés
 * - Pas de backoff : une source Stale est retentée au tick suivant
 */

use crate::api::DashboardApi;
use crate::config::PollConf;
use crate::error::ApiError;
use crate::models::LicenseSummary;
use crate::permissions::{authorized_sources, Source};
use crate::session::SessionManager;
use crate::store::{SliceUpdate, SourceState, StateStore};
use crate::task::ScheduledTask;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    Committed,
    Stale(String),
    Denied,
    Skipped,
    Discarded,
}

#[derive(Debug, Clone)]
pub struct RefreshReport {
    pub generation: u64,
    pub outcomes: BTreeMap<Source, SourceOutcome>,
    pub refreshed_at: OffsetDateTime,
}

impl RefreshReport {
    pub fn outcome(&self, source: Source) -> Option<&SourceOutcome> {
        self.outcomes.get(&source)
    }

    pub fn stale_sources(&self) -> Vec<Source> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, SourceOutcome::Stale(_)))
            .map(|(source, _)| *source)
            .collect()
    }

    pub fn committed_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|outcome| **outcome == SourceOutcome::Committed)
            .count()
    }
}

/// Marque une source en vol ; le drop la libère même si le fetch est annulé
struct InFlight<'a> {
    sources: &'a Mutex<BTreeSet<Source>>,
    source: Source,
}

impl<'a> InFlight<'a> {
    fn acquire(sources: &'a Mutex<BTreeSet<Source>>, source: Source) -> Option<Self> {
        let inserted = sources.lock().insert(source);
        if inserted {
            Some(Self { sources, source })
        } else {
            None
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.sources.lock().remove(&self.source);
    }
}

struct PollInner<A> {
    api: Arc<A>,
    store: StateStore,
    session: SessionManager,
    settings: PollConf,
    in_flight: Mutex<BTreeSet<Source>>,
}

pub struct PollOrchestrator<A> {
    inner: Arc<PollInner<A>>,
}

impl<A> Clone for PollOrchestrator<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: DashboardApi> PollOrchestrator<A> {
    pub fn new(api: Arc<A>, store: StateStore, session: SessionManager, settings: PollConf) -> Self {
        Self {
            inner: Arc::new(PollInner {
                api,
                store,
                session,
                settings,
                in_flight: Mutex::new(BTreeSet::new()),
            }),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.inner.store
    }

    /// Un cycle complet. Peut être appelé en parallèle d'un cycle en cours.
    pub async fn refresh(&self) -> RefreshReport {
        let generation = self.inner.store.next_generation();
        let allowed = authorized_sources(self.inner.session.profile().as_ref());
        let api = &*self.inner.api;
        let settings = &self.inner.settings;
        debug!(generation, authorized = allowed.len(), "poll cycle started");

        // les blocs async sont paresseux : une source refusée ne part jamais sur le réseau
        let (devices, incidents, alerts, synthetics, licenses) = tokio::join!(
            self.run_source(generation, Source::Devices, &allowed, async {
                api.fetch_devices().await.map(SliceUpdate::Devices)
            }),
            self.run_source(generation, Source::Incidents, &allowed, async {
                api.fetch_incidents(settings.incident_limit)
                    .await
                    .map(SliceUpdate::Incidents)
            }),
            self.run_source(generation, Source::Alerts, &allowed, async {
                api.fetch_alerts(settings.alert_limit)
                    .await
                    .map(SliceUpdate::Alerts)
            }),
            self.run_source(generation, Source::Synthetics, &allowed, async {
                api.fetch_synthetics(settings.synthetics_window_hours)
                    .await
                    .map(SliceUpdate::Synthetics)
            }),
            self.run_source(generation, Source::Licenses, &allowed, async {
                let (stats, items) =
                    tokio::try_join!(api.fetch_license_stats(), api.fetch_licenses())?;
                Ok::<_, ApiError>(SliceUpdate::Licenses(LicenseSummary { stats, items }))
            }),
        );

        let refreshed_at = OffsetDateTime::now_utc();
        if !self.inner.store.mark_refreshed(generation, refreshed_at) {
            debug!(generation, "store cleared during the cycle, results dropped");
        }

        let outcomes = BTreeMap::from([
            (Source::Devices, devices),
            (Source::Incidents, incidents),
            (Source::Alerts, alerts),
            (Source::Synthetics, synthetics),
            (Source::Licenses, licenses),
        ]);
        let report = RefreshReport {
            generation,
            outcomes,
            refreshed_at,
        };
        let stale = report.stale_sources();
        if stale.is_empty() {
            debug!(generation, committed = report.committed_count(), "poll cycle done");
        } else {
            info!(generation, ?stale, "poll cycle done with stale sources");
        }
        report
    }

    async fn run_source<F>(
        &self,
        generation: u64,
        source: Source,
        allowed: &BTreeSet<Source>,
        fetch: F,
    ) -> SourceOutcome
    where
        F: Future<Output = Result<SliceUpdate, ApiError>>,
    {
        let store = &self.inner.store;
        if !allowed.contains(&source) {
            store.commit(generation, SliceUpdate::neutral(source));
            store.set_cycle_state(generation, source, SourceState::Idle);
            return SourceOutcome::Denied;
        }

        let Some(_guard) = InFlight::acquire(&self.inner.in_flight, source) else {
            debug!(%source, generation, "source already in flight, skipped");
            return SourceOutcome::Skipped;
        };

        store.set_cycle_state(generation, source, SourceState::Fetching);
        match fetch.await {
            Ok(update) => {
                if store.commit(generation, update) {
                    store.set_cycle_state(generation, source, SourceState::Committed);
                    SourceOutcome::Committed
                } else {
                    SourceOutcome::Discarded
                }
            }
            Err(e) => {
                if e.is_unauthorized() {
                    debug!(%source, "fetch rejected with 401, session already cleared");
                } else {
                    warn!(%source, error = %e, "fetch failed, keeping previous value");
                }
                store.set_cycle_state(generation, source, SourceState::Stale);
                SourceOutcome::Stale(e.to_string())
            }
        }
    }

    /// Boucle périodique ; le premier tick a lieu après `period`, le cycle
    /// initial étant lancé par le montage
    pub fn spawn(&self, period: Duration) -> ScheduledTask {
        let poller = self.clone();
        ScheduledTask::spawn("poll-orchestrator", async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                poller.refresh().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Alert, Device, DeviceStatus, Incident, LicenseItem, LicenseStats, Listing, Severity,
        SyntheticsSummary, UserProfile,
    };
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// API minimale : devices configurables, incidents en échec, compteur d'appels
    #[derive(Default)]
    struct StubApi {
        devices: Mutex<Vec<Device>>,
        calls: Mutex<HashMap<&'static str, usize>>,
        device_gate: Option<Arc<Notify>>,
        in_devices: AtomicUsize,
    }

    impl StubApi {
        fn hit(&self, name: &'static str) {
            *self.calls.lock().entry(name).or_default() += 1;
        }

        fn calls(&self, name: &str) -> usize {
            self.calls.lock().get(name).copied().unwrap_or(0)
        }
    }

    impl DashboardApi for StubApi {
        async fn fetch_devices(&self) -> Result<Vec<Device>, ApiError> {
            self.hit("devices");
            self.in_devices.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.device_gate {
                gate.notified().await;
            }
            Ok(self.devices.lock().clone())
        }

        async fn fetch_incidents(&self, _limit: u32) -> Result<Listing<Incident>, ApiError> {
            self.hit("incidents");
            Err(ApiError::Status {
                status: 503,
                path: "/incidents".into(),
            })
        }

        async fn fetch_alerts(&self, _limit: u32) -> Result<Vec<Alert>, ApiError> {
            self.hit("alerts");
            Ok(vec![Alert {
                id: "a1".into(),
                device_id: "d1".into(),
                severity: Severity::Critical,
                alert_type: "offline".into(),
                first_triggered: None,
                last_notified: None,
                assigned_user_ids: Vec::new(),
            }])
        }

        async fn fetch_synthetics(&self, window_hours: u32) -> Result<SyntheticsSummary, ApiError> {
            self.hit("synthetics");
            Ok(SyntheticsSummary {
                total: 2,
                up: 2,
                window_hours: Some(window_hours),
                ..Default::default()
            })
        }

        async fn fetch_license_stats(&self) -> Result<LicenseStats, ApiError> {
            self.hit("license_stats");
            Ok(LicenseStats {
                total: 3,
                critical: Some(1),
                ..Default::default()
            })
        }

        async fn fetch_licenses(&self) -> Result<Vec<LicenseItem>, ApiError> {
            self.hit("licenses");
            Ok(Vec::new())
        }

        async fn fetch_profile(&self) -> Result<UserProfile, ApiError> {
            Ok(UserProfile::pending("u1"))
        }

        async fn set_monitoring(&self, _device_id: &str, _enabled: bool) -> Result<(), ApiError> {
            Ok(())
        }
    }

    fn device(id: &str) -> Device {
        Device {
            device_id: id.into(),
            name: id.into(),
            status: DeviceStatus::Online,
            last_seen: None,
            uptime_seconds: 10,
            monitoring_enabled: true,
        }
    }

    fn profile(keys: &[&str]) -> UserProfile {
        UserProfile {
            id: "u1".into(),
            role: Some("operator".into()),
            permissions: keys.iter().map(|k| (k.to_string(), true)).collect(),
            ..Default::default()
        }
    }

    async fn orchestrator(api: StubApi, keys: &[&str]) -> PollOrchestrator<StubApi> {
        let session = SessionManager::new(None);
        session.set_session(profile(keys), "opaque-token").await;
        PollOrchestrator::new(Arc::new(api), StateStore::new(), session, PollConf::default())
    }

    const ALL_KEYS: [&str; 5] = [
        "devices.view",
        "incidents.view",
        "alerts.view",
        "synthetics.view",
        "licenses.view",
    ];

    #[tokio::test]
    async fn test_report_lists_every_source() {
        let api = StubApi::default();
        api.devices.lock().push(device("d1"));
        let poller = orchestrator(api, &ALL_KEYS).await;

        let report = poller.refresh().await;
        assert_eq!(report.generation, 1);
        assert_eq!(report.outcomes.len(), 5);
        assert_eq!(report.outcome(Source::Devices), Some(&SourceOutcome::Committed));
        assert_eq!(report.stale_sources(), vec![Source::Incidents]);
        assert_eq!(report.committed_count(), 4);

        let snapshot = poller.store().snapshot();
        assert_eq!(snapshot.source_state(Source::Incidents), SourceState::Stale);
        assert_eq!(snapshot.source_state(Source::Licenses), SourceState::Committed);
        assert_eq!(snapshot.synthetics.window_hours, Some(24));
        assert_eq!(snapshot.licenses.critical_count(), 1);
        assert_eq!(snapshot.last_refreshed_at, Some(report.refreshed_at));
    }

    #[tokio::test]
    async fn test_denied_sources_are_never_requested() {
        let poller = orchestrator(StubApi::default(), &["devices.view"]).await;
        let report = poller.refresh().await;

        assert_eq!(report.outcome(Source::Alerts), Some(&SourceOutcome::Denied));
        assert_eq!(report.outcome(Source::Licenses), Some(&SourceOutcome::Denied));
        let api = &poller.inner.api;
        assert_eq!(api.calls("devices"), 1);
        assert_eq!(api.calls("alerts"), 0);
        assert_eq!(api.calls("incidents"), 0);
        assert_eq!(api.calls("license_stats"), 0);
        assert!(poller.store().snapshot().alerts.is_empty());
    }

    #[tokio::test]
    async fn test_overlapping_refresh_skips_in_flight_source() {
        let gate = Arc::new(Notify::new());
        let api = StubApi {
            device_gate: Some(gate.clone()),
            ..Default::default()
        };
        api.devices.lock().push(device("d1"));
        let poller = orchestrator(api, &ALL_KEYS).await;

        let first = tokio::spawn({
            let poller = poller.clone();
            async move { poller.refresh().await }
        });
        while poller.inner.api.in_devices.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second = poller.refresh().await;
        assert_eq!(second.outcome(Source::Devices), Some(&SourceOutcome::Skipped));
        assert_eq!(second.outcome(Source::Alerts), Some(&SourceOutcome::Committed));

        gate.notify_one();
        let first = first.await.unwrap();
        assert_eq!(first.outcome(Source::Devices), Some(&SourceOutcome::Committed));
        assert_eq!(poller.inner.api.calls("devices"), 1);
        assert!(poller.store().device("d1").is_some());
    }

    #[tokio::test]
    async fn test_cycle_started_before_clear_writes_nothing() {
        let gate = Arc::new(Notify::new());
        let api = StubApi {
            device_gate: Some(gate.clone()),
            ..Default::default()
        };
        api.devices.lock().push(device("d1"));
        let poller = orchestrator(api, &ALL_KEYS).await;

        let cycle = tokio::spawn({
            let poller = poller.clone();
            async move { poller.refresh().await }
        });
        while poller.inner.api.in_devices.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        poller.store().clear();
        gate.notify_one();

        let report = cycle.await.unwrap();
        assert_eq!(report.outcome(Source::Devices), Some(&SourceOutcome::Discarded));
        let snapshot = poller.store().snapshot();
        assert!(snapshot.devices.is_empty());
        assert!(snapshot.last_refreshed_at.is_none());
        assert_eq!(snapshot.source_state(Source::Devices), SourceState::Idle);
        assert!(poller.store().admits(poller.store().next_generation()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_task_waits_one_period_then_repeats() {
        let poller = orchestrator(StubApi::default(), &ALL_KEYS).await;
        let task = poller.spawn(Duration::from_secs(30));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(poller.inner.api.calls("devices"), 0);
        tokio::time::sleep(Duration::from_secs(32)).await;
        assert_eq!(poller.inner.api.calls("devices"), 2);

        drop(task);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(poller.inner.api.calls("devices"), 2);
    }
}
