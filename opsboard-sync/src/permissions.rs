/**
 * PERMISSION GATE - Autorisation des sources de données
 *
 * RÔLE :
 * Fonction pure (profil, clé de permission) → bool, consultée avant chaque fetch
 * REST et avant l'abonnement push : une source non autorisée n'est jamais demandée.
 *
 * RÈGLES :
 * - Pas de profil, pas de rôle → refus (fail-closed)
 * - `dashboard.view` (coque minimale) est accordé dès qu'un rôle existe
 * - Toute autre clé exige une entrée `true` dans la table de permissions
 */

use crate::models::UserProfile;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

pub const DASHBOARD_VIEW: &str = "dashboard.view";
pub const DEVICES_VIEW: &str = "devices.view";
pub const INCIDENTS_VIEW: &str = "incidents.view";
pub const ALERTS_VIEW: &str = "alerts.view";
pub const SYNTHETICS_VIEW: &str = "synthetics.view";
pub const LICENSES_VIEW: &str = "licenses.view";

pub fn authorized(permission_key: &str, profile: Option<&UserProfile>) -> bool {
    let Some(profile) = profile else {
        return false;
    };
    let has_role = profile
        .role
        .as_deref()
        .is_some_and(|role| !role.trim().is_empty());
    if !has_role {
        return false;
    }
    if permission_key == DASHBOARD_VIEW {
        return true;
    }
    profile
        .permissions
        .get(permission_key)
        .copied()
        .unwrap_or(false)
}

/// Domaines de données rafraîchis par le poll orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Devices,
    Incidents,
    Alerts,
    Synthetics,
    Licenses,
}

impl Source {
    pub const ALL: [Source; 5] = [
        Source::Devices,
        Source::Incidents,
        Source::Alerts,
        Source::Synthetics,
        Source::Licenses,
    ];

    pub fn permission_key(&self) -> &'static str {
        match self {
            Source::Devices => DEVICES_VIEW,
            Source::Incidents => INCIDENTS_VIEW,
            Source::Alerts => ALERTS_VIEW,
            Source::Synthetics => SYNTHETICS_VIEW,
            Source::Licenses => LICENSES_VIEW,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Source::Devices => "devices",
            Source::Incidents => "incidents",
            Source::Alerts => "alerts",
            Source::Synthetics => "synthetics",
            Source::Licenses => "licenses",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn authorized_sources(profile: Option<&UserProfile>) -> BTreeSet<Source> {
    Source::ALL
        .into_iter()
        .filter(|source| authorized(source.permission_key(), profile))
        .collect()
}

/// Le canal push ne transporte que des deltas de devices
pub fn may_subscribe_push(profile: Option<&UserProfile>) -> bool {
    authorized(DEVICES_VIEW, profile)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn profile(role: Option<&str>, granted: &[&str]) -> UserProfile {
        UserProfile {
            id: "u1".into(),
            role: role.map(String::from),
            permissions: granted.iter().map(|k| (k.to_string(), true)).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_permission_map_denies() {
        let p = profile(Some("operator"), &[]);
        assert!(!authorized("devices.view", Some(&p)));
    }

    #[test]
    fn test_missing_profile_or_role_denies_everything() {
        assert!(!authorized(DASHBOARD_VIEW, None));
        let p = profile(None, &[DEVICES_VIEW]);
        assert!(!authorized(DEVICES_VIEW, Some(&p)));
        assert!(!authorized(DASHBOARD_VIEW, Some(&p)));
    }

    #[test]
    fn test_shell_is_allowed_before_permissions_load() {
        let p = profile(Some("viewer"), &[]);
        assert!(authorized(DASHBOARD_VIEW, Some(&p)));
        assert!(authorized_sources(Some(&p)).is_empty());
    }

    #[test]
    fn test_explicit_false_denies() {
        let mut permissions = HashMap::new();
        permissions.insert(ALERTS_VIEW.to_string(), false);
        permissions.insert(DEVICES_VIEW.to_string(), true);
        let p = UserProfile {
            role: Some("operator".into()),
            permissions,
            ..Default::default()
        };
        let sources = authorized_sources(Some(&p));
        assert!(sources.contains(&Source::Devices));
        assert!(!sources.contains(&Source::Alerts));
        assert!(may_subscribe_push(Some(&p)));
    }
}
