/*!
Builders d'entités, de tokens et de payloads pour les tests

- `TokenBuilder` : token trois segments avec claims `sub`/`iat`/`exp`
- `ProfileBuilder` : profil avec rôle et table de permissions
- `DeltaBuilder` : payload `device:update` (JSON brut ou `DeviceDelta` typé)
- Fonctions courtes pour devices, alertes, incidents, licences
*/

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use opsboard_sync::models::{
    Alert, Device, DeviceDelta, DeviceStatus, Incident, IncidentStatus, LicenseItem, LicenseRisk,
    Severity, UserProfile,
};
use opsboard_sync::permissions::Source;
use serde_json::{json, Map, Value};
use std::time::Duration;
use time::OffsetDateTime;

#[derive(Debug, Clone, Default)]
pub struct TokenBuilder {
    claims: Map<String, Value>,
}

impl TokenBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subject(mut self, subject: &str) -> Self {
        self.claims.insert("sub".into(), json!(subject));
        self
    }

    pub fn issued_at(mut self, at: OffsetDateTime) -> Self {
        self.claims.insert("iat".into(), json!(at.unix_timestamp()));
        self
    }

    pub fn expires_at(mut self, at: OffsetDateTime) -> Self {
        self.claims.insert("exp".into(), json!(at.unix_timestamp()));
        self
    }

    /// `exp` relatif à l'horloge murale courante
    pub fn expires_in(self, delay: Duration) -> Self {
        self.expires_at(OffsetDateTime::now_utc() + delay)
    }

    pub fn expired(self) -> Self {
        self.expires_at(OffsetDateTime::now_utc() - Duration::from_secs(60))
    }

    pub fn claim(mut self, key: &str, value: Value) -> Self {
        self.claims.insert(key.into(), value);
        self
    }

    pub fn build(&self) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let claims = URL_SAFE_NO_PAD.encode(Value::Object(self.claims.clone()).to_string());
        format!("{header}.{claims}.devkit-signature")
    }
}

#[derive(Debug, Clone)]
pub struct ProfileBuilder {
    profile: UserProfile,
}

impl ProfileBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            profile: UserProfile {
                id: id.into(),
                role: Some("operator".into()),
                ..Default::default()
            },
        }
    }

    pub fn role(mut self, role: Option<&str>) -> Self {
        self.profile.role = role.map(str::to_string);
        self
    }

    pub fn allow(mut self, key: &str) -> Self {
        self.profile.permissions.insert(key.into(), true);
        self
    }

    pub fn deny(mut self, key: &str) -> Self {
        self.profile.permissions.insert(key.into(), false);
        self
    }

    pub fn allow_sources(mut self, sources: &[Source]) -> Self {
        for source in sources {
            self = self.allow(source.permission_key());
        }
        self
    }

    pub fn allow_all(self) -> Self {
        self.allow_sources(&Source::ALL)
    }

    pub fn build(self) -> UserProfile {
        self.profile
    }

    /// Forme renvoyée par `GET /auth/me`
    pub fn to_json(&self) -> Value {
        json!({
            "user": {
                "id": self.profile.id,
                "role": self.profile.role,
                "permissions": self.profile.permissions,
                "assigned_device_ids": self.profile.assigned_device_ids,
                "assigned_monitor_ids": self.profile.assigned_monitor_ids,
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct DeltaBuilder {
    device_id: String,
    status: Option<String>,
    uptime: Option<f64>,
}

impl DeltaBuilder {
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.into(),
            status: None,
            uptime: None,
        }
    }

    pub fn status(mut self, status: &str) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn uptime(mut self, seconds: f64) -> Self {
        self.uptime = Some(seconds);
        self
    }

    /// Payload tel qu'émis sur `device:update` ; les champs absents sont omis
    pub fn to_json(&self) -> Value {
        let mut payload = Map::new();
        payload.insert("device_id".into(), json!(self.device_id));
        if let Some(status) = &self.status {
            payload.insert("status".into(), json!(status));
        }
        if let Some(uptime) = self.uptime {
            payload.insert("metrics".into(), json!({ "uptime": uptime }));
        }
        Value::Object(payload)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_json().to_string().into_bytes()
    }

    pub fn build(&self) -> DeviceDelta {
        DeviceDelta {
            device_id: self.device_id.clone(),
            status: self.status.as_deref().and_then(DeviceStatus::parse),
            uptime_seconds: self.uptime.map(|u| u.max(0.0) as u64),
        }
    }
}

pub fn device(id: &str, status: DeviceStatus) -> Device {
    Device {
        device_id: id.into(),
        name: format!("host-{id}"),
        status,
        last_seen: None,
        uptime_seconds: 0,
        monitoring_enabled: true,
    }
}

/// `count` devices `dev-01`, `dev-02`... dans le même statut
pub fn fleet(count: usize, status: DeviceStatus) -> Vec<Device> {
    (1..=count)
        .map(|n| device(&format!("dev-{n:02}"), status))
        .collect()
}

pub fn alert(id: &str, device_id: &str, severity: Severity) -> Alert {
    Alert {
        id: id.into(),
        device_id: device_id.into(),
        severity,
        alert_type: "offline".into(),
        first_triggered: None,
        last_notified: None,
        assigned_user_ids: Vec::new(),
    }
}

pub fn incident(id: &str, severity: Severity) -> Incident {
    Incident {
        id: id.into(),
        status: IncidentStatus::Open,
        severity,
        target_id: "dev-01".into(),
        target_type: "device".into(),
        started_at: None,
        resolved_at: None,
    }
}

pub fn license(id: &str, risk: LicenseRisk) -> LicenseItem {
    LicenseItem {
        id: id.into(),
        name: format!("license-{id}"),
        status: "active".into(),
        expires_at: None,
        risk,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opsboard_sync::get_expiry;

    #[test]
    fn test_token_expiry_is_decodable() {
        let at = OffsetDateTime::from_unix_timestamp(1_900_000_000).unwrap();
        let token = TokenBuilder::new().subject("alice").expires_at(at).build();
        assert_eq!(get_expiry(&token), Some(at));
        assert_eq!(get_expiry(&TokenBuilder::new().build()), None);
    }

    #[test]
    fn test_delta_omits_absent_fields() {
        let delta = DeltaBuilder::new("d1").status("warning");
        assert_eq!(delta.to_json(), json!({"device_id": "d1", "status": "warning"}));
        assert_eq!(delta.build().status, Some(DeviceStatus::Warning));
        assert_eq!(delta.build().uptime_seconds, None);
    }

    #[test]
    fn test_fleet_ids() {
        let ids: Vec<String> = fleet(3, DeviceStatus::Online)
            .into_iter()
            .map(|d| d.device_id)
            .collect();
        assert_eq!(ids, ["dev-01", "dev-02", "dev-03"]);
    }
}
