//! One-line fleet summaries printed by the runner on every store change.

use opsboard_sync::models::HistoryPoint;
use opsboard_sync::{Snapshot, Source, SourceState};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// `devices 7/10 online | monitors 1/4 down | alerts 3 (1 critical) | incidents 2 open | licenses 1 critical`
pub fn summary_line(snapshot: &Snapshot) -> String {
    let counters = snapshot.counters();
    let incidents = match snapshot.incident_total {
        Some(total) if total > counters.open_incidents => {
            format!("incidents {} open (of {total})", counters.open_incidents)
        }
        _ => format!("incidents {} open", counters.open_incidents),
    };
    let mut line = format!(
        "devices {}/{} online | monitors {}/{} down | alerts {} ({} critical) | {} | licenses {} critical",
        counters.online,
        counters.devices,
        counters.down_monitors,
        snapshot.synthetics.total,
        counters.active_alerts,
        counters.critical_alerts,
        incidents,
        counters.critical_licenses,
    );

    let stale = stale_sources(snapshot);
    if !stale.is_empty() {
        line.push_str(" | stale: ");
        line.push_str(&stale.join(","));
    }
    line
}

fn stale_sources(snapshot: &Snapshot) -> Vec<&'static str> {
    Source::ALL
        .iter()
        .filter(|source| snapshot.source_state(**source) == SourceState::Stale)
        .map(Source::name)
        .collect()
}

pub fn format_refreshed(at: Option<OffsetDateTime>) -> String {
    match at.map(|t| t.format(&Rfc3339)) {
        Some(Ok(formatted)) => formatted,
        _ => "never".to_string(),
    }
}

/// Online-count trend over the sampled window, oldest to newest
pub fn online_trend(points: &[HistoryPoint]) -> Option<i64> {
    let first = points.first()?;
    let last = points.last()?;
    Some(last.online_count as i64 - first.online_count as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsboard_sync::models::{Device, DeviceStatus, SyntheticsSummary};
    use opsboard_sync::{SliceUpdate, StateStore};

    fn device(id: &str, status: DeviceStatus) -> Device {
        Device {
            device_id: id.into(),
            name: id.into(),
            status,
            last_seen: None,
            uptime_seconds: 0,
            monitoring_enabled: true,
        }
    }

    #[test]
    fn test_summary_line_counts() {
        let store = StateStore::new();
        store.commit(
            1,
            SliceUpdate::Devices(vec![
                device("a", DeviceStatus::Online),
                device("b", DeviceStatus::Offline),
            ]),
        );
        store.commit(
            1,
            SliceUpdate::Synthetics(SyntheticsSummary {
                total: 4,
                down: 1,
                ..Default::default()
            }),
        );
        store.set_source_state(Source::Alerts, SourceState::Stale);

        let line = summary_line(&store.snapshot());
        assert!(line.starts_with("devices 1/2 online | monitors 1/4 down"));
        assert!(line.ends_with("| stale: alerts"));
    }

    #[test]
    fn test_format_refreshed() {
        assert_eq!(format_refreshed(None), "never");
        let at = OffsetDateTime::from_unix_timestamp(0).unwrap();
        assert_eq!(format_refreshed(Some(at)), "1970-01-01T00:00:00Z");
    }
}
