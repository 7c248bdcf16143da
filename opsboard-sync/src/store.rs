/**
 * STATE STORE - Vue opérationnelle canonique en mémoire
 *
 * RÔLE :
 * Unique écrivain de toutes les entités : fusionne les snapshots du poll
 * orchestrator (remplacement complet par domaine) et les deltas du canal push
 * (patch partiel par device_id). Notifie les abonnés à chaque changement.
 *
 * FONCTIONNEMENT :
 * - Chaque mutation est un remplacement/patch synchrone sous un verrou court :
 *   aucun état intermédiaire n'est observable
 * - Les générations de cycle sont émises par le store lui-même ; chaque domaine
 *   retient la génération de son dernier commit et un résultat plus ancien
 *   arrivé en retard est écarté
 * - `clear()` relève un plancher : tout cycle émis avant le clear ne peut plus
 *   rien écrire (ni tranche, ni état de source, ni horodatage)
 * - Un delta pour un device inconnu est ignoré (le push ne crée jamais d'entité)
 * - `last_seen` ne recule jamais suite à un delta
 */

use crate::models::{
    Alert, Device, DeviceDelta, DeviceStatus, Incident, IncidentStatus, LicenseSummary, Listing,
    Severity, SyntheticsSummary,
};
use crate::permissions::Source;
use crate::state::{new_state, Revision, Shared};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::debug;

/// Cycle de vie d'une source : Idle → Fetching → Committed | Stale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceState {
    Idle,
    Fetching,
    Committed,
    Stale,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub devices: HashMap<String, Device>,
    pub alerts: HashMap<String, Alert>,
    pub incidents: HashMap<String, Incident>,
    pub incident_total: Option<u64>,
    pub synthetics: SyntheticsSummary,
    pub licenses: LicenseSummary,
    pub last_refreshed_at: Option<OffsetDateTime>,
    pub sources: BTreeMap<Source, SourceState>,
}

/// Compteurs lus par le history sampler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub online: u64,
    pub devices: u64,
    pub down_monitors: u64,
    pub active_alerts: u64,
    pub critical_alerts: u64,
    pub open_incidents: u64,
    pub critical_licenses: u64,
}

impl Snapshot {
    pub fn counters(&self) -> Counters {
        Counters {
            online: self
                .devices
                .values()
                .filter(|d| d.status == DeviceStatus::Online)
                .count() as u64,
            devices: self.devices.len() as u64,
            down_monitors: self.synthetics.down,
            active_alerts: self.alerts.len() as u64,
            critical_alerts: self
                .alerts
                .values()
                .filter(|a| a.severity == Severity::Critical)
                .count() as u64,
            open_incidents: self
                .incidents
                .values()
                .filter(|i| i.status == IncidentStatus::Open)
                .count() as u64,
            critical_licenses: self.licenses.critical_count(),
        }
    }

    pub fn source_state(&self, source: Source) -> SourceState {
        self.sources.get(&source).copied().unwrap_or(SourceState::Idle)
    }
}

/// Résultat d'un fetch réussi, prêt à remplacer une tranche du store
#[derive(Debug, Clone)]
pub enum SliceUpdate {
    Devices(Vec<Device>),
    Incidents(Listing<Incident>),
    Alerts(Vec<Alert>),
    Synthetics(SyntheticsSummary),
    Licenses(LicenseSummary),
}

impl SliceUpdate {
    pub fn source(&self) -> Source {
        match self {
            SliceUpdate::Devices(_) => Source::Devices,
            SliceUpdate::Incidents(_) => Source::Incidents,
            SliceUpdate::Alerts(_) => Source::Alerts,
            SliceUpdate::Synthetics(_) => Source::Synthetics,
            SliceUpdate::Licenses(_) => Source::Licenses,
        }
    }

    /// Valeur neutre commitée pour une source refusée par le permission gate
    pub fn neutral(source: Source) -> Self {
        match source {
            Source::Devices => SliceUpdate::Devices(Vec::new()),
            Source::Incidents => SliceUpdate::Incidents(Listing::default()),
            Source::Alerts => SliceUpdate::Alerts(Vec::new()),
            Source::Synthetics => SliceUpdate::Synthetics(SyntheticsSummary::default()),
            Source::Licenses => SliceUpdate::Licenses(LicenseSummary::default()),
        }
    }
}

struct StoreInner {
    snapshot: Snapshot,
    generations: HashMap<Source, u64>,
    issued: u64,
    floor: u64,
}

impl StoreInner {
    fn admits(&self, generation: u64) -> bool {
        generation > self.floor
    }
}

#[derive(Clone)]
pub struct StateStore {
    inner: Shared<StoreInner>,
    revision: Revision,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            inner: new_state(StoreInner {
                snapshot: Snapshot::default(),
                generations: HashMap::new(),
                issued: 0,
                floor: 0,
            }),
            revision: Revision::new(),
        }
    }

    /// Copie cohérente de tout l'état
    pub fn snapshot(&self) -> Snapshot {
        self.inner.lock().snapshot.clone()
    }

    pub fn read<R>(&self, f: impl FnOnce(&Snapshot) -> R) -> R {
        f(&self.inner.lock().snapshot)
    }

    pub fn device(&self, device_id: &str) -> Option<Device> {
        self.read(|s| s.devices.get(device_id).cloned())
    }

    pub fn counters(&self) -> Counters {
        self.read(Snapshot::counters)
    }

    /// Le récepteur voit la révision courante ; `changed()` attend le prochain commit
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn revision(&self) -> u64 {
        self.revision.current()
    }

    /// Génération d'un nouveau cycle de poll, toujours supérieure aux précédentes
    pub fn next_generation(&self) -> u64 {
        let mut inner = self.inner.lock();
        inner.issued += 1;
        inner.issued
    }

    /// `false` si le store a été vidé depuis l'émission de `generation`
    pub fn admits(&self, generation: u64) -> bool {
        self.inner.lock().admits(generation)
    }

    /// Remplace la tranche correspondante. Retourne `false` si `generation` est
    /// antérieure au dernier commit de cette source.
    pub fn commit(&self, generation: u64, update: SliceUpdate) -> bool {
        let source = update.source();
        {
            let mut inner = self.inner.lock();
            if !inner.admits(generation) {
                debug!(%source, generation, "discarding poll result issued before clear");
                return false;
            }
            let last = inner.generations.get(&source).copied().unwrap_or(0);
            if generation < last {
                debug!(%source, generation, last, "discarding out-of-order poll result");
                return false;
            }
            inner.generations.insert(source, generation);
            inner.issued = inner.issued.max(generation);

            let snapshot = &mut inner.snapshot;
            match update {
                SliceUpdate::Devices(devices) => {
                    snapshot.devices = devices
                        .into_iter()
                        .map(|d| (d.device_id.clone(), d))
                        .collect();
                }
                SliceUpdate::Incidents(listing) => {
                    snapshot.incident_total = listing.total;
                    snapshot.incidents =
                        listing.items.into_iter().map(|i| (i.id.clone(), i)).collect();
                }
                SliceUpdate::Alerts(alerts) => {
                    snapshot.alerts = alerts.into_iter().map(|a| (a.id.clone(), a)).collect();
                }
                SliceUpdate::Synthetics(summary) => snapshot.synthetics = summary,
                SliceUpdate::Licenses(summary) => snapshot.licenses = summary,
            }
        }
        self.revision.bump();
        true
    }

    /// Patch partiel d'un device existant. Retourne `false` si le device est inconnu.
    pub fn apply_delta(&self, delta: &DeviceDelta, arrived_at: OffsetDateTime) -> bool {
        {
            let mut inner = self.inner.lock();
            let Some(device) = inner.snapshot.devices.get_mut(&delta.device_id) else {
                debug!(device_id = %delta.device_id, "dropping delta for unknown device");
                return false;
            };
            if let Some(status) = delta.status {
                device.status = status;
            }
            if let Some(uptime) = delta.uptime_seconds {
                device.uptime_seconds = uptime;
            }
            device.last_seen = Some(match device.last_seen {
                Some(previous) if previous > arrived_at => previous,
                _ => arrived_at,
            });
        }
        self.revision.bump();
        true
    }

    pub fn set_source_state(&self, source: Source, state: SourceState) {
        let changed = {
            let mut inner = self.inner.lock();
            inner.snapshot.sources.insert(source, state) != Some(state)
        };
        if changed {
            self.revision.bump();
        }
    }

    /// Variante liée à un cycle : ignorée si le store a été vidé depuis
    pub fn set_cycle_state(&self, generation: u64, source: Source, state: SourceState) -> bool {
        let changed = {
            let mut inner = self.inner.lock();
            if !inner.admits(generation) {
                return false;
            }
            inner.snapshot.sources.insert(source, state) != Some(state)
        };
        if changed {
            self.revision.bump();
        }
        true
    }

    /// Horodate la fin du cycle `generation`, sauf si le store a été vidé depuis
    pub fn mark_refreshed(&self, generation: u64, at: OffsetDateTime) -> bool {
        {
            let mut inner = self.inner.lock();
            if !inner.admits(generation) {
                return false;
            }
            inner.snapshot.last_refreshed_at = Some(at);
        }
        self.revision.bump();
        true
    }

    /// Vide toutes les tranches (déconnexion). Les cycles déjà émis sont périmés.
    pub fn clear(&self) {
        {
            let mut inner = self.inner.lock();
            inner.snapshot = Snapshot::default();
            inner.generations.clear();
            inner.floor = inner.issued;
        }
        self.revision.bump();
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn device(id: &str, status: DeviceStatus, uptime: u64) -> Device {
        Device {
            device_id: id.into(),
            name: format!("dev-{id}"),
            status,
            last_seen: Some(datetime!(2024-05-01 10:00 UTC)),
            uptime_seconds: uptime,
            monitoring_enabled: true,
        }
    }

    #[test]
    fn test_delta_only_touches_present_fields() {
        let store = StateStore::new();
        store.commit(1, SliceUpdate::Devices(vec![device("d1", DeviceStatus::Online, 500)]));

        let delta = DeviceDelta {
            device_id: "d1".into(),
            status: Some(DeviceStatus::Warning),
            uptime_seconds: None,
        };
        let arrived = datetime!(2024-05-01 10:05 UTC);
        assert!(store.apply_delta(&delta, arrived));

        let d1 = store.device("d1").unwrap();
        assert_eq!(d1.status, DeviceStatus::Warning);
        assert_eq!(d1.uptime_seconds, 500);
        assert_eq!(d1.name, "dev-d1");
        assert_eq!(d1.last_seen, Some(arrived));
    }

    #[test]
    fn test_last_seen_never_moves_backward() {
        let store = StateStore::new();
        store.commit(1, SliceUpdate::Devices(vec![device("d1", DeviceStatus::Online, 1)]));
        let delta = DeviceDelta {
            device_id: "d1".into(),
            status: None,
            uptime_seconds: Some(2),
        };
        store.apply_delta(&delta, datetime!(2024-05-01 09:00 UTC));
        let d1 = store.device("d1").unwrap();
        assert_eq!(d1.last_seen, Some(datetime!(2024-05-01 10:00 UTC)));
        assert_eq!(d1.uptime_seconds, 2);
    }

    #[test]
    fn test_unknown_device_delta_leaves_map_unchanged() {
        let store = StateStore::new();
        store.commit(1, SliceUpdate::Devices(vec![device("d1", DeviceStatus::Online, 1)]));
        let before = store.snapshot();
        let revision = store.revision();

        let delta = DeviceDelta {
            device_id: "ghost".into(),
            status: Some(DeviceStatus::Offline),
            uptime_seconds: None,
        };
        assert!(!store.apply_delta(&delta, OffsetDateTime::now_utc()));
        assert_eq!(store.snapshot().devices, before.devices);
        assert_eq!(store.revision(), revision);
    }

    #[test]
    fn test_older_generation_is_discarded() {
        let store = StateStore::new();
        assert!(store.commit(5, SliceUpdate::Alerts(Vec::new())));
        let late = vec![Alert {
            id: "a1".into(),
            device_id: "d1".into(),
            severity: Severity::Critical,
            alert_type: "offline".into(),
            first_triggered: None,
            last_notified: None,
            assigned_user_ids: Vec::new(),
        }];
        assert!(!store.commit(4, SliceUpdate::Alerts(late)));
        assert!(store.snapshot().alerts.is_empty());
        // les autres sources gardent leur propre séquence
        assert!(store.commit(1, SliceUpdate::Synthetics(SyntheticsSummary::default())));
    }

    #[test]
    fn test_clear_rejects_cycles_issued_before_it() {
        let store = StateStore::new();
        let before = store.next_generation();
        assert!(store.commit(before, SliceUpdate::Devices(vec![device("d1", DeviceStatus::Online, 1)])));
        let in_flight = store.next_generation();

        store.clear();
        assert!(!store.admits(in_flight));
        assert!(!store.commit(in_flight, SliceUpdate::Devices(vec![device("d2", DeviceStatus::Online, 1)])));
        assert!(!store.set_cycle_state(in_flight, Source::Devices, SourceState::Committed));
        assert!(!store.mark_refreshed(in_flight, OffsetDateTime::now_utc()));
        let snapshot = store.snapshot();
        assert!(snapshot.devices.is_empty());
        assert!(snapshot.last_refreshed_at.is_none());
        assert_eq!(snapshot.source_state(Source::Devices), SourceState::Idle);

        // un cycle émis après le clear écrit normalement
        let after = store.next_generation();
        assert!(after > in_flight);
        assert!(store.commit(after, SliceUpdate::Devices(vec![device("d3", DeviceStatus::Online, 1)])));
        assert!(store.device("d3").is_some());
    }

    #[test]
    fn test_counters() {
        let store = StateStore::new();
        store.commit(
            1,
            SliceUpdate::Devices(vec![
                device("a", DeviceStatus::Online, 1),
                device("b", DeviceStatus::Offline, 1),
                device("c", DeviceStatus::Online, 1),
            ]),
        );
        store.commit(
            1,
            SliceUpdate::Synthetics(SyntheticsSummary {
                total: 4,
                up: 3,
                down: 1,
                ..Default::default()
            }),
        );
        let counters = store.counters();
        assert_eq!(counters.online, 2);
        assert_eq!(counters.devices, 3);
        assert_eq!(counters.down_monitors, 1);
        assert_eq!(counters.active_alerts, 0);
    }

    #[tokio::test]
    async fn test_subscribers_are_notified_on_commit() {
        let store = StateStore::new();
        let mut rx = store.subscribe();
        store.commit(1, SliceUpdate::Devices(Vec::new()));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), store.revision());
    }
}
