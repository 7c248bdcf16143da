//! Propriétés de bout en bout du moteur : merge, isolation des échecs,
//! historique borné, deltas push, permissions fail-closed, remplacement complet.

use opsboard_devkit::builders::{alert, device, fleet, incident};
use opsboard_devkit::{DeltaBuilder, Endpoint, Failure, MockApi, ProfileBuilder, TestHarness};
use opsboard_sync::models::{DeviceStatus, Severity, SyntheticsSummary, UserProfile};
use opsboard_sync::permissions::{authorized, DEVICES_VIEW};
use opsboard_sync::push::DEVICE_UPDATE;
use opsboard_sync::{
    HistorySampler, PollOrchestrator, SessionManager, SliceUpdate, Snapshot, Source, SourceOutcome,
    SourceState, StateStore,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn orchestrator(harness: &TestHarness, store: &StateStore) -> PollOrchestrator<MockApi> {
    PollOrchestrator::new(
        Arc::new(harness.api.clone()),
        store.clone(),
        harness.session.clone(),
        harness.config.poll.clone(),
    )
}

/// Contenu métier du snapshot, sans l'horodatage du cycle
fn content(snapshot: &Snapshot) -> Snapshot {
    Snapshot {
        last_refreshed_at: None,
        ..snapshot.clone()
    }
}

#[tokio::test]
async fn test_same_poll_snapshot_twice_is_idempotent() {
    let harness = TestHarness::operator().await;
    harness.api.set_devices(fleet(4, DeviceStatus::Online));
    harness.api.set_alerts(vec![alert("a1", "dev-01", Severity::Critical)]);
    harness.api.set_incidents(vec![incident("i1", Severity::Warning)], Some(9));
    let store = StateStore::new();
    let poller = orchestrator(&harness, &store);

    poller.refresh().await;
    let once = content(&store.snapshot());
    poller.refresh().await;
    let twice = content(&store.snapshot());

    assert_eq!(once, twice);
    assert_eq!(twice.devices.len(), 4);
    assert_eq!(twice.incident_total, Some(9));
}

#[test]
fn test_direct_commit_twice_is_idempotent() {
    let store = StateStore::new();
    let devices = fleet(3, DeviceStatus::Warning);
    store.commit(1, SliceUpdate::Devices(devices.clone()));
    let once = store.snapshot();
    store.commit(2, SliceUpdate::Devices(devices));
    assert_eq!(store.snapshot(), once);
}

#[tokio::test]
async fn test_failed_incidents_keep_previous_slice() {
    let harness = TestHarness::operator().await;
    harness.api.set_devices(fleet(2, DeviceStatus::Online));
    harness.api.set_alerts(vec![alert("a1", "dev-01", Severity::Warning)]);
    harness.api.set_incidents(vec![incident("i-old", Severity::Critical)], None);
    let store = StateStore::new();
    let poller = orchestrator(&harness, &store);
    poller.refresh().await;

    harness.api.set_devices(fleet(5, DeviceStatus::Offline));
    harness.api.set_alerts(vec![
        alert("a2", "dev-02", Severity::Critical),
        alert("a3", "dev-03", Severity::Info),
    ]);
    harness.api.set_incidents(vec![incident("i-new", Severity::Info)], None);
    harness.api.fail_once(Endpoint::Incidents, Failure::Status(503));

    let report = poller.refresh().await;
    assert!(matches!(
        report.outcome(Source::Incidents),
        Some(SourceOutcome::Stale(_))
    ));
    assert_eq!(report.outcome(Source::Devices), Some(&SourceOutcome::Committed));

    let snapshot = store.snapshot();
    assert_eq!(snapshot.devices.len(), 5);
    assert!(snapshot.devices.values().all(|d| d.status == DeviceStatus::Offline));
    let mut alert_ids: Vec<&str> = snapshot.alerts.keys().map(String::as_str).collect();
    alert_ids.sort();
    assert_eq!(alert_ids, ["a2", "a3"]);
    assert!(snapshot.incidents.contains_key("i-old"));
    assert!(!snapshot.incidents.contains_key("i-new"));
    assert_eq!(snapshot.source_state(Source::Incidents), SourceState::Stale);

    // pas de backoff : le tick suivant retente et rattrape
    poller.refresh().await;
    let snapshot = store.snapshot();
    assert!(snapshot.incidents.contains_key("i-new"));
    assert_eq!(snapshot.source_state(Source::Incidents), SourceState::Committed);
}

#[tokio::test]
async fn test_slow_source_does_not_hold_back_others() {
    let harness = TestHarness::operator().await;
    harness.api.set_devices(fleet(3, DeviceStatus::Online));
    let gate = harness.api.gate(Endpoint::Licenses);
    let store = StateStore::new();
    let poller = orchestrator(&harness, &store);

    let cycle = tokio::spawn({
        let poller = poller.clone();
        async move { poller.refresh().await }
    });
    let snapshot = opsboard_devkit::wait_for_store(&store, Duration::from_secs(2), |s| {
        s.source_state(Source::Devices) == SourceState::Committed
    })
    .await
    .unwrap();
    assert_eq!(snapshot.devices.len(), 3);
    assert_eq!(snapshot.source_state(Source::Licenses), SourceState::Fetching);
    assert!(snapshot.last_refreshed_at.is_none());

    gate.notify_one();
    let report = cycle.await.unwrap();
    assert_eq!(report.committed_count(), 5);
    assert!(store.snapshot().last_refreshed_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn test_history_holds_the_36_most_recent_points() {
    let store = StateStore::new();
    let sampler = HistorySampler::new(store.clone(), 36);
    let task = sampler.spawn(Duration::from_secs(10));

    for n in 1..=50u64 {
        store.commit(n, SliceUpdate::Devices(fleet(n as usize, DeviceStatus::Online)));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(sampler.history().len() <= 36);
    }
    drop(task);

    let points = sampler.history();
    assert_eq!(points.len(), 36);
    // chaque point lit le nombre de devices commité juste avant son tick
    let online: Vec<u64> = points.iter().map(|p| p.online_count).collect();
    assert_eq!(online, (15..=50).collect::<Vec<u64>>());
    assert!(points.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
}

#[tokio::test]
async fn test_partial_delta_preserves_other_fields() {
    let harness = TestHarness::signed_in(ProfileBuilder::new("u1").allow(DEVICES_VIEW).build()).await;
    let mut d1 = device("d1", DeviceStatus::Online);
    d1.uptime_seconds = 500;
    harness.api.set_devices(vec![d1]);
    let dashboard = harness.dashboard();
    let view = dashboard.mount().await;

    let payload = DeltaBuilder::new("d1").status("warning").to_bytes();
    assert!(dashboard.push.dispatch(DEVICE_UPDATE, &payload));

    let d1 = view.store().device("d1").unwrap();
    assert_eq!(d1.status, DeviceStatus::Warning);
    assert_eq!(d1.uptime_seconds, 500);
    assert_eq!(d1.name, "host-d1");
    assert!(d1.last_seen.is_some());

    let payload = DeltaBuilder::new("d1").uptime(720.0).to_bytes();
    dashboard.push.dispatch(DEVICE_UPDATE, &payload);
    let d1 = view.store().device("d1").unwrap();
    assert_eq!(d1.status, DeviceStatus::Warning);
    assert_eq!(d1.uptime_seconds, 720);

    view.unmount();
    dashboard.push.disconnect();
}

#[tokio::test]
async fn test_unknown_device_delta_is_dropped() {
    let harness = TestHarness::signed_in(ProfileBuilder::new("u1").allow(DEVICES_VIEW).build()).await;
    harness.api.set_devices(fleet(2, DeviceStatus::Online));
    let dashboard = harness.dashboard();
    let view = dashboard.mount().await;
    let before = view.store().snapshot().devices;
    let revision = view.store().revision();

    let payload = DeltaBuilder::new("ghost").status("offline").uptime(3.0).to_bytes();
    dashboard.push.dispatch(DEVICE_UPDATE, &payload);

    assert_eq!(view.store().snapshot().devices, before);
    assert_eq!(view.store().revision(), revision);
    assert!(view.store().device("ghost").is_none());

    view.unmount();
    dashboard.push.disconnect();
}

#[test]
fn test_empty_permission_map_denies() {
    let profile = UserProfile {
        id: "u1".into(),
        role: Some("operator".into()),
        permissions: HashMap::new(),
        ..Default::default()
    };
    assert!(!authorized("devices.view", Some(&profile)));
    assert!(!authorized("devices.view", None));

    let no_role = ProfileBuilder::new("u2").role(None).allow(DEVICES_VIEW).build();
    assert!(!authorized("devices.view", Some(&no_role)));
}

#[tokio::test]
async fn test_profile_without_permissions_fetches_nothing() {
    let harness = TestHarness::signed_in(ProfileBuilder::new("u1").build()).await;
    let store = StateStore::new();
    let report = orchestrator(&harness, &store).refresh().await;

    assert!(report.outcomes.values().all(|o| *o == SourceOutcome::Denied));
    assert_eq!(harness.api.total_calls(), 0);
}

#[tokio::test]
async fn test_signed_out_session_fetches_nothing() {
    let harness = TestHarness::new();
    let store = StateStore::new();
    let poller = PollOrchestrator::new(
        Arc::new(harness.api.clone()),
        store.clone(),
        SessionManager::new(None),
        harness.config.poll.clone(),
    );
    poller.refresh().await;
    assert_eq!(harness.api.total_calls(), 0);
}

#[tokio::test]
async fn test_second_tick_replaces_whole_device_map() {
    let harness = TestHarness::operator().await;
    harness.api.set_devices(fleet(10, DeviceStatus::Online));
    harness.api.set_synthetics(SyntheticsSummary {
        total: 3,
        up: 3,
        ..Default::default()
    });
    let store = StateStore::new();
    let poller = orchestrator(&harness, &store);

    poller.refresh().await;
    assert_eq!(store.counters().online, 10);

    let mut second = fleet(10, DeviceStatus::Online);
    for d in second.iter_mut().skip(7) {
        d.status = DeviceStatus::Offline;
    }
    harness.api.set_devices(second);
    poller.refresh().await;

    let snapshot = store.snapshot();
    assert_eq!(snapshot.devices.len(), 10);
    let online = snapshot
        .devices
        .values()
        .filter(|d| d.status == DeviceStatus::Online)
        .count();
    let offline: Vec<&str> = {
        let mut ids: Vec<&str> = snapshot
            .devices
            .values()
            .filter(|d| d.status == DeviceStatus::Offline)
            .map(|d| d.device_id.as_str())
            .collect();
        ids.sort();
        ids
    };
    assert_eq!(online, 7);
    assert_eq!(offline, ["dev-08", "dev-09", "dev-10"]);

    // un device retiré côté backend disparaît aussi
    harness.api.set_devices(fleet(4, DeviceStatus::Online));
    poller.refresh().await;
    assert_eq!(store.snapshot().devices.len(), 4);
}
