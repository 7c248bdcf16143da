/**
 * MODÈLES - Entités typées du dashboard d'exploitation
 *
 * RÔLE :
 * Définit les entités canoniques (Device, Alert, Incident, licences, synthetics,
 * profil utilisateur, points d'historique) et leur conversion depuis les payloads
 * JSON du backend.
 *
 * FONCTIONNEMENT :
 * - Les structs `*Wire` acceptent le JSON tel qu'il arrive (champs optionnels, ids
 *   numériques ou texte, timestamps RFC 3339 ou epoch)
 * - `from_wire` valide et convertit : un enregistrement sans identifiant est rejeté,
 *   une valeur d'énumération inconnue prend une valeur par défaut documentée
 * - Le reste du coeur ne manipule que les types validés
 */

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
    Warning,
    NotMonitored,
}

impl DeviceStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "online" | "up" => Some(Self::Online),
            "offline" | "down" => Some(Self::Offline),
            "warning" | "degraded" => Some(Self::Warning),
            "not_monitored" | "unmonitored" => Some(Self::NotMonitored),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Warning => "warning",
            Self::NotMonitored => "not_monitored",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    /// Valeur inconnue ou absente → `Info`
    pub fn parse_or_info(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()) {
            Some(s) if s == "critical" || s == "high" => Self::Critical,
            Some(s) if s == "warning" || s == "medium" => Self::Warning,
            _ => Self::Info,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub device_id: String,
    pub name: String,
    pub status: DeviceStatus,
    pub last_seen: Option<OffsetDateTime>,
    pub uptime_seconds: u64,
    pub monitoring_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Alert {
    pub id: String,
    pub device_id: String,
    pub severity: Severity,
    pub alert_type: String,
    pub first_triggered: Option<OffsetDateTime>,
    pub last_notified: Option<OffsetDateTime>,
    pub assigned_user_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incident {
    pub id: String,
    pub status: IncidentStatus,
    pub severity: Severity,
    pub target_id: String,
    pub target_type: String,
    pub started_at: Option<OffsetDateTime>,
    pub resolved_at: Option<OffsetDateTime>,
}

/// Agrégat des moniteurs web (synthetics) sur une fenêtre glissante
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyntheticsSummary {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub up: u64,
    #[serde(default)]
    pub down: u64,
    #[serde(default)]
    pub paused: u64,
    #[serde(default)]
    pub avg_response_ms: Option<f64>,
    #[serde(default)]
    pub uptime_percent: Option<f64>,
    #[serde(default)]
    pub window_hours: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseRisk {
    #[default]
    Ok,
    Warning,
    Critical,
}

/// Fenêtre sous laquelle une licence sans niveau de risque passe en warning
pub const LICENSE_EXPIRING_WITHIN: time::Duration = time::Duration::days(30);

impl LicenseRisk {
    /// Niveau de risque d'une licence que le backend n'a pas classée :
    /// expirée (statut ou date passée) → critique, échéance sous 30 jours → warning
    pub fn from_expiry(status: &str, expires_at: Option<OffsetDateTime>, now: OffsetDateTime) -> Self {
        if status.eq_ignore_ascii_case("expired") {
            return LicenseRisk::Critical;
        }
        match expires_at {
            Some(at) if at <= now => LicenseRisk::Critical,
            Some(at) if at - now <= LICENSE_EXPIRING_WITHIN => LicenseRisk::Warning,
            _ => LicenseRisk::Ok,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LicenseStats {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub active: u64,
    #[serde(default)]
    pub expiring_soon: u64,
    #[serde(default)]
    pub expired: u64,
    #[serde(default)]
    pub critical: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LicenseItem {
    pub id: String,
    pub name: String,
    pub status: String,
    pub expires_at: Option<OffsetDateTime>,
    pub risk: LicenseRisk,
}

/// Vue licences : stats de l'endpoint dédié + liste détaillée
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LicenseSummary {
    pub stats: LicenseStats,
    pub items: Vec<LicenseItem>,
}

impl LicenseSummary {
    /// Compteur `critical` des stats s'il existe, sinon décompte de la liste
    pub fn critical_count(&self) -> u64 {
        self.stats.critical.unwrap_or_else(|| {
            self.items
                .iter()
                .filter(|item| item.risk == LicenseRisk::Critical)
                .count() as u64
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: String,
    pub role: Option<String>,
    #[serde(default)]
    pub permissions: HashMap<String, bool>,
    #[serde(default)]
    pub assigned_device_ids: Vec<String>,
    #[serde(default)]
    pub assigned_monitor_ids: Vec<String>,
}

impl UserProfile {
    /// Profil minimal juste après login, avant le fetch `/auth/me`
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HistoryPoint {
    pub timestamp: OffsetDateTime,
    pub online_count: u64,
    pub down_monitor_count: u64,
    pub active_alert_count: u64,
    pub critical_license_count: u64,
}

/// Mise à jour partielle d'un device reçue par le canal push
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDelta {
    pub device_id: String,
    pub status: Option<DeviceStatus>,
    pub uptime_seconds: Option<u64>,
}

/// Résultat d'un listing avec le compteur `x-total-count` éventuel
#[derive(Debug, Clone, PartialEq)]
pub struct Listing<T> {
    pub items: Vec<T>,
    pub total: Option<u64>,
}

impl<T> Default for Listing<T> {
    fn default() -> Self {
        Self { items: Vec::new(), total: None }
    }
}

// ===== Payloads bruts =====

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WireId {
    Text(String),
    Number(i64),
}

impl WireId {
    fn into_key(self) -> Option<String> {
        match self {
            WireId::Text(s) if s.trim().is_empty() => None,
            WireId::Text(s) => Some(s),
            WireId::Number(n) => Some(n.to_string()),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WireTime {
    Text(String),
    Seconds(f64),
}

impl WireTime {
    pub fn to_datetime(&self) -> Option<OffsetDateTime> {
        match self {
            WireTime::Text(s) => OffsetDateTime::parse(s, &Rfc3339).ok(),
            WireTime::Seconds(secs) => epoch_seconds(*secs),
        }
    }
}

pub(crate) fn epoch_seconds(secs: f64) -> Option<OffsetDateTime> {
    if !secs.is_finite() {
        return None;
    }
    OffsetDateTime::from_unix_timestamp_nanos((secs * 1_000_000_000.0) as i128).ok()
}

fn wire_time(value: &Option<WireTime>) -> Option<OffsetDateTime> {
    value.as_ref().and_then(WireTime::to_datetime)
}

/// Corps de liste : tableau nu ou enveloppe `{items: [...]}` / `{data: [...]}`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ListBody<T> {
    Bare(Vec<T>),
    Wrapped {
        #[serde(alias = "data", alias = "results")]
        items: Vec<T>,
    },
}

impl<T> ListBody<T> {
    pub fn into_items(self) -> Vec<T> {
        match self {
            ListBody::Bare(items) => items,
            ListBody::Wrapped { items } => items,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DeviceWire {
    #[serde(alias = "id")]
    pub device_id: Option<WireId>,
    pub name: Option<String>,
    pub status: Option<String>,
    pub last_seen: Option<WireTime>,
    #[serde(alias = "uptime")]
    pub uptime_seconds: Option<f64>,
    pub monitoring_enabled: Option<bool>,
}

impl Device {
    /// Statut inconnu → `offline` ; pas d'identifiant → rejet
    pub fn from_wire(wire: DeviceWire) -> Option<Self> {
        let device_id = wire.device_id.and_then(WireId::into_key)?;
        let status = match wire.status.as_deref() {
            Some(raw) => DeviceStatus::parse(raw).unwrap_or_else(|| {
                debug!(device_id = %device_id, status = raw, "unknown device status, using offline");
                DeviceStatus::Offline
            }),
            None => DeviceStatus::Offline,
        };
        Some(Self {
            name: wire.name.unwrap_or_else(|| device_id.clone()),
            status,
            last_seen: wire_time(&wire.last_seen),
            uptime_seconds: wire.uptime_seconds.map(non_negative).unwrap_or(0),
            monitoring_enabled: wire.monitoring_enabled.unwrap_or(true),
            device_id,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct AlertWire {
    pub id: Option<WireId>,
    pub device_id: Option<WireId>,
    pub severity: Option<String>,
    #[serde(alias = "type")]
    pub alert_type: Option<String>,
    pub first_triggered: Option<WireTime>,
    pub last_notified: Option<WireTime>,
    #[serde(default)]
    pub assigned_user_ids: Vec<WireId>,
}

impl Alert {
    pub fn from_wire(wire: AlertWire) -> Option<Self> {
        let id = wire.id.and_then(WireId::into_key)?;
        Some(Self {
            id,
            device_id: wire.device_id.and_then(WireId::into_key).unwrap_or_default(),
            severity: Severity::parse_or_info(wire.severity.as_deref()),
            alert_type: wire.alert_type.unwrap_or_default(),
            first_triggered: wire_time(&wire.first_triggered),
            last_notified: wire_time(&wire.last_notified),
            assigned_user_ids: wire
                .assigned_user_ids
                .into_iter()
                .filter_map(WireId::into_key)
                .collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct IncidentWire {
    pub id: Option<WireId>,
    pub status: Option<String>,
    pub severity: Option<String>,
    pub target_id: Option<WireId>,
    pub target_type: Option<String>,
    pub started_at: Option<WireTime>,
    pub resolved_at: Option<WireTime>,
}

impl Incident {
    /// Statut inconnu → `open`
    pub fn from_wire(wire: IncidentWire) -> Option<Self> {
        let id = wire.id.and_then(WireId::into_key)?;
        let status = match wire.status.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("resolved") | Some("closed") => IncidentStatus::Resolved,
            _ => IncidentStatus::Open,
        };
        Some(Self {
            id,
            status,
            severity: Severity::parse_or_info(wire.severity.as_deref()),
            target_id: wire.target_id.and_then(WireId::into_key).unwrap_or_default(),
            target_type: wire.target_type.unwrap_or_default(),
            started_at: wire_time(&wire.started_at),
            resolved_at: wire_time(&wire.resolved_at),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct LicenseItemWire {
    pub id: Option<WireId>,
    #[serde(alias = "product")]
    pub name: Option<String>,
    pub status: Option<String>,
    #[serde(alias = "expiry_date")]
    pub expires_at: Option<WireTime>,
    #[serde(alias = "risk_level")]
    pub risk: Option<String>,
}

impl LicenseItem {
    pub fn from_wire(wire: LicenseItemWire) -> Option<Self> {
        let id = wire.id.and_then(WireId::into_key)?;
        let status = wire.status.unwrap_or_else(|| "unknown".into());
        let expires_at = wire_time(&wire.expires_at);
        let risk = match wire.risk.as_deref().map(str::to_ascii_lowercase).as_deref() {
            Some("critical") | Some("high") => LicenseRisk::Critical,
            Some("warning") | Some("medium") => LicenseRisk::Warning,
            Some(_) => LicenseRisk::Ok,
            None => LicenseRisk::from_expiry(&status, expires_at, OffsetDateTime::now_utc()),
        };
        Some(Self {
            name: wire.name.unwrap_or_else(|| id.clone()),
            id,
            status,
            expires_at,
            risk,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum PermissionsWire {
    Map(HashMap<String, bool>),
    List(Vec<String>),
}

#[derive(Debug, Deserialize)]
pub struct ProfileWire {
    pub id: Option<WireId>,
    pub role: Option<String>,
    pub permissions: Option<PermissionsWire>,
    #[serde(default, alias = "assigned_devices")]
    pub assigned_device_ids: Vec<WireId>,
    #[serde(default, alias = "assigned_monitors")]
    pub assigned_monitor_ids: Vec<WireId>,
}

/// `/auth/me` renvoie le profil nu ou sous une clé `user`
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ProfileBody {
    Wrapped { user: ProfileWire },
    Bare(ProfileWire),
}

impl UserProfile {
    pub fn from_wire(body: ProfileBody) -> Option<Self> {
        let wire = match body {
            ProfileBody::Wrapped { user } => user,
            ProfileBody::Bare(wire) => wire,
        };
        let id = wire.id.and_then(WireId::into_key)?;
        let permissions = match wire.permissions {
            Some(PermissionsWire::Map(map)) => map,
            Some(PermissionsWire::List(keys)) => keys.into_iter().map(|k| (k, true)).collect(),
            None => HashMap::new(),
        };
        Some(Self {
            id,
            role: wire.role.filter(|r| !r.trim().is_empty()),
            permissions,
            assigned_device_ids: wire
                .assigned_device_ids
                .into_iter()
                .filter_map(WireId::into_key)
                .collect(),
            assigned_monitor_ids: wire
                .assigned_monitor_ids
                .into_iter()
                .filter_map(WireId::into_key)
                .collect(),
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct MetricsWire {
    pub uptime: Option<f64>,
}

/// Payload de l'événement `device:update`
#[derive(Debug, Deserialize)]
pub struct DeviceUpdateWire {
    pub device_id: Option<WireId>,
    pub status: Option<String>,
    pub metrics: Option<MetricsWire>,
}

impl DeviceDelta {
    /// Un statut inconnu est ignoré (champ considéré absent)
    pub fn from_wire(wire: DeviceUpdateWire) -> Option<Self> {
        let device_id = wire.device_id.and_then(WireId::into_key)?;
        let status = wire.status.as_deref().and_then(|raw| {
            let parsed = DeviceStatus::parse(raw);
            if parsed.is_none() {
                warn!(device_id = %device_id, status = raw, "ignoring unknown status in device delta");
            }
            parsed
        });
        let uptime_seconds = wire.metrics.and_then(|m| m.uptime).map(non_negative);
        Some(Self {
            device_id,
            status,
            uptime_seconds,
        })
    }
}

/// Convertit une liste brute en entités, en journalisant les rejets
pub fn convert_all<W, T>(kind: &str, wires: Vec<W>, convert: impl Fn(W) -> Option<T>) -> Vec<T> {
    let received = wires.len();
    let items: Vec<T> = wires.into_iter().filter_map(convert).collect();
    if items.len() < received {
        warn!(kind, rejected = received - items.len(), "dropped records without identifier");
    }
    items
}

fn non_negative(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value as u64
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    #[test]
    fn test_device_from_wire_coerces_fields() {
        let wire: DeviceWire = serde_json::from_value(json!({
            "id": 42,
            "status": "WARNING",
            "last_seen": "2024-05-01T10:00:00Z",
            "uptime": 120.7
        }))
        .unwrap();
        let device = Device::from_wire(wire).unwrap();
        assert_eq!(device.device_id, "42");
        assert_eq!(device.name, "42");
        assert_eq!(device.status, DeviceStatus::Warning);
        assert_eq!(device.uptime_seconds, 120);
        assert!(device.monitoring_enabled);
        assert_eq!(device.last_seen.unwrap().unix_timestamp(), 1_714_557_600);
    }

    #[test]
    fn test_device_without_id_is_rejected() {
        let wire: DeviceWire = serde_json::from_value(json!({"name": "orphan"})).unwrap();
        assert!(Device::from_wire(wire).is_none());
    }

    #[test]
    fn test_unknown_device_status_defaults_to_offline() {
        let wire: DeviceWire =
            serde_json::from_value(json!({"device_id": "d1", "status": "exploded"})).unwrap();
        assert_eq!(Device::from_wire(wire).unwrap().status, DeviceStatus::Offline);
    }

    #[test]
    fn test_list_body_accepts_both_shapes() {
        let bare: ListBody<DeviceWire> = serde_json::from_value(json!([{"id": "a"}])).unwrap();
        let wrapped: ListBody<DeviceWire> =
            serde_json::from_value(json!({"data": [{"id": "a"}, {"id": "b"}]})).unwrap();
        assert_eq!(bare.into_items().len(), 1);
        assert_eq!(wrapped.into_items().len(), 2);
    }

    #[test]
    fn test_delta_tolerates_missing_optional_fields() {
        let wire: DeviceUpdateWire = serde_json::from_value(json!({"device_id": "d1"})).unwrap();
        let delta = DeviceDelta::from_wire(wire).unwrap();
        assert_eq!(delta.status, None);
        assert_eq!(delta.uptime_seconds, None);

        let wire: DeviceUpdateWire = serde_json::from_value(json!({
            "device_id": "d1", "status": "bogus", "metrics": {"uptime": 900}
        }))
        .unwrap();
        let delta = DeviceDelta::from_wire(wire).unwrap();
        assert_eq!(delta.status, None);
        assert_eq!(delta.uptime_seconds, Some(900));
    }

    #[test]
    fn test_profile_accepts_permission_list() {
        let body: ProfileBody = serde_json::from_value(json!({
            "user": {"id": 7, "role": "operator", "permissions": ["devices.view"]}
        }))
        .unwrap();
        let profile = UserProfile::from_wire(body).unwrap();
        assert_eq!(profile.id, "7");
        assert_eq!(profile.permissions.get("devices.view"), Some(&true));
    }

    #[test]
    fn test_expired_license_without_risk_is_critical() {
        let wire: LicenseItemWire =
            serde_json::from_value(json!({"id": "l1", "status": "expired"})).unwrap();
        let item = LicenseItem::from_wire(wire).unwrap();
        assert_eq!(item.risk, LicenseRisk::Critical);

        let summary = LicenseSummary {
            stats: LicenseStats::default(),
            items: vec![item],
        };
        assert_eq!(summary.critical_count(), 1);
    }

    #[test]
    fn test_license_risk_derived_from_expiry_date() {
        let now = datetime!(2024-05-01 12:00 UTC);
        let at = |days: i64| Some(now + time::Duration::days(days));

        assert_eq!(LicenseRisk::from_expiry("active", at(-1), now), LicenseRisk::Critical);
        assert_eq!(LicenseRisk::from_expiry("active", Some(now), now), LicenseRisk::Critical);
        assert_eq!(LicenseRisk::from_expiry("active", at(10), now), LicenseRisk::Warning);
        assert_eq!(LicenseRisk::from_expiry("active", at(30), now), LicenseRisk::Warning);
        assert_eq!(LicenseRisk::from_expiry("active", at(31), now), LicenseRisk::Ok);
        assert_eq!(LicenseRisk::from_expiry("active", None, now), LicenseRisk::Ok);
        assert_eq!(LicenseRisk::from_expiry("EXPIRED", at(90), now), LicenseRisk::Critical);

        // date passée côté wire, statut encore "active", pas de risk_level
        let wire: LicenseItemWire = serde_json::from_value(
            json!({"id": "l2", "status": "active", "expiry_date": "2001-01-01T00:00:00Z"}),
        )
        .unwrap();
        assert_eq!(LicenseItem::from_wire(wire).unwrap().risk, LicenseRisk::Critical);

        // un niveau explicite l'emporte sur la date
        let wire: LicenseItemWire = serde_json::from_value(
            json!({"id": "l3", "expiry_date": "2001-01-01T00:00:00Z", "risk_level": "low"}),
        )
        .unwrap();
        assert_eq!(LicenseItem::from_wire(wire).unwrap().risk, LicenseRisk::Ok);
    }
}
