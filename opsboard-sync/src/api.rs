/**
 * API REST - Client des ressources backend consommées par le dashboard
 *
 * RÔLE :
 * `DashboardApi` est la frontière avec le backend : une méthode par ressource.
 * `HttpApi` l'implémente avec reqwest ; les tests utilisent un mock du devkit.
 *
 * FONCTIONNEMENT :
 * - Header `Authorization: Bearer <token>` sur chaque appel
 * - 401 → effacement immédiat de la session puis `ApiError::Unauthorized`
 * - Non-2xx → `ApiError::Status` ; corps illisible → `ApiError::Decode`
 * - Les corps JSON sont convertis en entités validées (voir `models`)
 * - Les identifiants placés dans le chemin sont encodés comme segment d'URL
 * - Les timeouts sont ceux du client HTTP, aucun timeout supplémentaire ici
 */

use crate::config::ApiConf;
use crate::error::ApiError;
use crate::models::{
    convert_all, Alert, AlertWire, Device, DeviceWire, Incident, IncidentWire, LicenseItem,
    LicenseItemWire, LicenseStats, ListBody, Listing, ProfileBody, SyntheticsSummary, UserProfile,
};
use crate::session::SessionManager;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::{IntoUrl, Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

pub trait DashboardApi: Send + Sync + 'static {
    /// `GET /devices`
    fn fetch_devices(&self) -> impl Future<Output = Result<Vec<Device>, ApiError>> + Send;

    /// `GET /incidents?status=open&limit=N`
    fn fetch_incidents(
        &self,
        limit: u32,
    ) -> impl Future<Output = Result<Listing<Incident>, ApiError>> + Send;

    /// `GET /alerts/active?limit=N`
    fn fetch_alerts(&self, limit: u32) -> impl Future<Output = Result<Vec<Alert>, ApiError>> + Send;

    /// `GET /synthetics/stats?window_hours=H`
    fn fetch_synthetics(
        &self,
        window_hours: u32,
    ) -> impl Future<Output = Result<SyntheticsSummary, ApiError>> + Send;

    /// `GET /licenses/stats`
    fn fetch_license_stats(&self) -> impl Future<Output = Result<LicenseStats, ApiError>> + Send;

    /// `GET /licenses`
    fn fetch_licenses(&self) -> impl Future<Output = Result<Vec<LicenseItem>, ApiError>> + Send;

    /// `GET /auth/me`
    fn fetch_profile(&self) -> impl Future<Output = Result<UserProfile, ApiError>> + Send;

    /// `PATCH /devices/:id` (bascule du monitoring)
    fn set_monitoring(
        &self,
        device_id: &str,
        enabled: bool,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;
}

#[derive(Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    session: SessionManager,
}

impl HttpApi {
    pub fn new(config: &ApiConf, session: SessionManager) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .user_agent(concat!("opsboard-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            session,
        })
    }

    /// `<base>/devices/<id>`, l'id encodé en un seul segment
    fn device_url(&self, device_id: &str) -> Result<Url, ApiError> {
        let bad_url = |reason: String| ApiError::BadUrl {
            url: self.base_url.clone(),
            reason,
        };
        let mut url = Url::parse(&self.base_url).map_err(|e| bad_url(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| bad_url("base URL cannot carry a path".into()))?
            .pop_if_empty()
            .push("devices")
            .push(device_id);
        Ok(url)
    }

    fn request(&self, method: Method, url: impl IntoUrl) -> Result<RequestBuilder, ApiError> {
        let token = self.session.bearer().ok_or(ApiError::NoSession)?;
        Ok(self
            .client
            .request(method, url)
            .header(AUTHORIZATION, format!("Bearer {token}")))
    }

    async fn send(&self, builder: RequestBuilder, path: &str) -> Result<reqwest::Response, ApiError> {
        let response = builder.send().await?;
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            self.session.handle_unauthorized().await;
            return Err(ApiError::Unauthorized { path: path.to_string() });
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<(T, HeaderMap), ApiError> {
        let builder = self.request(Method::GET, format!("{}{}", self.base_url, path))?;
        let response = self.send(builder, path).await?;
        let headers = response.headers().clone();
        let bytes = response.bytes().await?;
        debug!(path, bytes = bytes.len(), "fetched");
        Ok((serde_json::from_slice(&bytes)?, headers))
    }
}

fn total_count(headers: &HeaderMap) -> Option<u64> {
    headers
        .get("x-total-count")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

impl DashboardApi for HttpApi {
    async fn fetch_devices(&self) -> Result<Vec<Device>, ApiError> {
        let (body, _) = self.get_json::<ListBody<DeviceWire>>("/devices").await?;
        Ok(convert_all("device", body.into_items(), Device::from_wire))
    }

    async fn fetch_incidents(&self, limit: u32) -> Result<Listing<Incident>, ApiError> {
        let path = format!("/incidents?status=open&limit={limit}");
        let (body, headers) = self.get_json::<ListBody<IncidentWire>>(&path).await?;
        Ok(Listing {
            items: convert_all("incident", body.into_items(), Incident::from_wire),
            total: total_count(&headers),
        })
    }

    async fn fetch_alerts(&self, limit: u32) -> Result<Vec<Alert>, ApiError> {
        let path = format!("/alerts/active?limit={limit}");
        let (body, _) = self.get_json::<ListBody<AlertWire>>(&path).await?;
        Ok(convert_all("alert", body.into_items(), Alert::from_wire))
    }

    async fn fetch_synthetics(&self, window_hours: u32) -> Result<SyntheticsSummary, ApiError> {
        let path = format!("/synthetics/stats?window_hours={window_hours}");
        let (mut summary, _) = self.get_json::<SyntheticsSummary>(&path).await?;
        summary.window_hours.get_or_insert(window_hours);
        Ok(summary)
    }

    async fn fetch_license_stats(&self) -> Result<LicenseStats, ApiError> {
        let (stats, _) = self.get_json::<LicenseStats>("/licenses/stats").await?;
        Ok(stats)
    }

    async fn fetch_licenses(&self) -> Result<Vec<LicenseItem>, ApiError> {
        let (body, _) = self.get_json::<ListBody<LicenseItemWire>>("/licenses").await?;
        Ok(convert_all("license", body.into_items(), LicenseItem::from_wire))
    }

    async fn fetch_profile(&self) -> Result<UserProfile, ApiError> {
        let (body, _) = self.get_json::<ProfileBody>("/auth/me").await?;
        UserProfile::from_wire(body).ok_or_else(|| ApiError::Invalid {
            path: "/auth/me".into(),
            reason: "profile without id".into(),
        })
    }

    async fn set_monitoring(&self, device_id: &str, enabled: bool) -> Result<(), ApiError> {
        let url = self.device_url(device_id)?;
        let path = url.path().to_string();
        let builder = self
            .request(Method::PATCH, url)?
            .json(&serde_json::json!({ "monitoring_enabled": enabled }));
        self.send(builder, &path).await?;
        Ok(())
    }
}
