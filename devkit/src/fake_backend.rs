/*!
Faux backend HTTP (axum) pour tester `HttpApi` de bout en bout

Sert les ressources consommées par le dashboard sur `127.0.0.1:<port éphémère>` :
- Contrôle `Authorization: Bearer <token>` en middleware, 401 sinon
- Corps JSON bruts configurables (formes enveloppées, ids numériques...)
- Header `x-total-count` optionnel sur `/incidents`
- Statut forcé par chemin pour simuler les pannes d'une seule source
- Journal des requêtes (chemin + query) et des headers d'auth reçus
*/

use anyhow::Result;
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct BackendState {
    token: Mutex<String>,
    bodies: Mutex<HashMap<&'static str, Value>>,
    incident_total: Mutex<Option<u64>>,
    forced_status: Mutex<HashMap<String, u16>>,
    requests: Mutex<Vec<String>>,
    auth_headers: Mutex<Vec<Option<String>>>,
    patches: Mutex<Vec<(String, Value)>>,
}

type SharedBackend = Arc<BackendState>;

pub struct FakeBackend {
    state: SharedBackend,
    addr: SocketAddr,
    server: JoinHandle<()>,
}

impl FakeBackend {
    /// Démarre le serveur ; seul `token` est accepté en bearer
    pub async fn start(token: &str) -> Result<Self> {
        let state = Arc::new(BackendState {
            token: Mutex::new(token.to_string()),
            bodies: Mutex::new(default_bodies()),
            incident_total: Mutex::new(None),
            forced_status: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            auth_headers: Mutex::new(Vec::new()),
            patches: Mutex::new(Vec::new()),
        });

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let router = build_router(state.clone());
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!(error = %e, "fake backend stopped");
            }
        });
        info!(%addr, "fake backend listening");

        Ok(Self {
            state,
            addr,
            server,
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_token(&self, token: &str) {
        *self.state.token.lock() = token.to_string();
    }

    pub fn set_devices(&self, body: Value) {
        self.state.bodies.lock().insert("devices", body);
    }

    pub fn set_incidents(&self, body: Value, total: Option<u64>) {
        self.state.bodies.lock().insert("incidents", body);
        *self.state.incident_total.lock() = total;
    }

    pub fn set_alerts(&self, body: Value) {
        self.state.bodies.lock().insert("alerts", body);
    }

    pub fn set_synthetics(&self, body: Value) {
        self.state.bodies.lock().insert("synthetics", body);
    }

    pub fn set_license_stats(&self, body: Value) {
        self.state.bodies.lock().insert("license_stats", body);
    }

    pub fn set_licenses(&self, body: Value) {
        self.state.bodies.lock().insert("licenses", body);
    }

    pub fn set_profile(&self, body: Value) {
        self.state.bodies.lock().insert("profile", body);
    }

    /// Toute requête sur `path` (sans query) répond `status`
    pub fn force_status(&self, path: &str, status: u16) {
        self.state.forced_status.lock().insert(path.to_string(), status);
    }

    pub fn clear_forced(&self) {
        self.state.forced_status.lock().clear();
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().clone()
    }

    pub fn request_count(&self, path: &str) -> usize {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|r| r.split('?').next() == Some(path))
            .count()
    }

    pub fn auth_headers(&self) -> Vec<Option<String>> {
        self.state.auth_headers.lock().clone()
    }

    pub fn patches(&self) -> Vec<(String, Value)> {
        self.state.patches.lock().clone()
    }
}

impl Drop for FakeBackend {
    fn drop(&mut self) {
        self.server.abort();
    }
}

fn default_bodies() -> HashMap<&'static str, Value> {
    HashMap::from([
        ("devices", json!([])),
        ("incidents", json!([])),
        ("alerts", json!([])),
        ("synthetics", json!({})),
        ("license_stats", json!({})),
        ("licenses", json!([])),
        ("profile", json!({"id": "u1", "role": "operator", "permissions": {}})),
    ])
}

fn build_router(state: SharedBackend) -> Router {
    Router::new()
        .route("/devices", get(|s: State<SharedBackend>| body(s, "devices")))
        .route("/devices/{id}", patch(patch_device))
        .route("/incidents", get(get_incidents))
        .route("/alerts/active", get(|s: State<SharedBackend>| body(s, "alerts")))
        .route("/synthetics/stats", get(|s: State<SharedBackend>| body(s, "synthetics")))
        .route("/licenses/stats", get(|s: State<SharedBackend>| body(s, "license_stats")))
        .route("/licenses", get(|s: State<SharedBackend>| body(s, "licenses")))
        .route("/auth/me", get(|s: State<SharedBackend>| body(s, "profile")))
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .with_state(state)
}

/// Journalise puis vérifie le bearer et les statuts forcés
async fn require_bearer(
    State(state): State<SharedBackend>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = req.uri().path().to_string();
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| path.clone());
    let auth = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.requests.lock().push(target);
    state.auth_headers.lock().push(auth.clone());

    let expected = format!("Bearer {}", state.token.lock());
    if auth.as_deref() != Some(expected.as_str()) {
        debug!(%path, "fake backend rejecting bearer");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let forced = state.forced_status.lock().get(&path).copied();
    if let Some(status) = forced {
        return Err(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR));
    }
    Ok(next.run(req).await)
}

async fn body(State(state): State<SharedBackend>, key: &'static str) -> Json<Value> {
    let value = state.bodies.lock().get(key).cloned().unwrap_or(Value::Null);
    Json(value)
}

async fn get_incidents(State(state): State<SharedBackend>) -> Response {
    let value = state
        .bodies
        .lock()
        .get("incidents")
        .cloned()
        .unwrap_or(Value::Null);
    let total = *state.incident_total.lock();

    let mut headers = HeaderMap::new();
    if let Some(total) = total {
        if let Ok(v) = HeaderValue::from_str(&total.to_string()) {
            headers.insert("x-total-count", v);
        }
    }
    (headers, Json(value)).into_response()
}

async fn patch_device(
    State(state): State<SharedBackend>,
    Path(id): Path<String>,
    Json(payload): Json<Value>,
) -> StatusCode {
    state.patches.lock().push((id, payload));
    StatusCode::NO_CONTENT
}
