/**
 * SESSION MANAGER - Token d'authentification, profil et expiration forcée
 *
 * RÔLE :
 * Détient le token bearer et le profil utilisateur, décode l'expiration du token
 * et programme une déconnexion à l'instant exact de cette expiration.
 *
 * FONCTIONNEMENT :
 * - Le token a trois segments ; celui du milieu est du JSON en base64url qui
 *   porte `exp` (secondes epoch)
 * - Décodage impossible → pas d'expiration connue, la session dure jusqu'au
 *   logout explicite ou au premier 401
 * - Expiration déjà passée → session effacée immédiatement
 * - Chaque nouveau token annule le timer précédent ; un timer ne peut effacer que
 *   la session pour laquelle il a été armé (compteur de génération)
 * - Tout 401 efface la session sans condition
 * - Le couple token/profil est persisté dans le `LocalStore` et réhydraté au démarrage
 */

use crate::api::DashboardApi;
use crate::error::ApiError;
use crate::models::{epoch_seconds, UserProfile};
use crate::storage::{LocalStore, AUTH_PROFILE_KEY, AUTH_TOKEN_KEY};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use time::OffsetDateTime;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token must have three segments")]
    Malformed,
    #[error("claims segment is not base64url: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("claims segment is not JSON: {0}")]
    Claims(#[from] serde_json::Error),
    #[error("no usable exp claim")]
    MissingExpiry,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    pub sub: Option<Value>,
    pub iat: Option<Value>,
    pub exp: Option<Value>,
}

pub fn decode_claims(token: &str) -> Result<Claims, TokenError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 || segments[1].is_empty() {
        return Err(TokenError::Malformed);
    }
    let bytes = URL_SAFE_NO_PAD.decode(segments[1].trim_end_matches('='))?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn claim_time(value: Option<&Value>) -> Option<OffsetDateTime> {
    value.and_then(Value::as_f64).and_then(epoch_seconds)
}

fn expiry_of(token: &str) -> Result<OffsetDateTime, TokenError> {
    let claims = decode_claims(token)?;
    claim_time(claims.exp.as_ref()).ok_or(TokenError::MissingExpiry)
}

/// Expiration du token, ou `None` si elle ne peut pas être déterminée
pub fn get_expiry(token: &str) -> Option<OffsetDateTime> {
    match expiry_of(token) {
        Ok(exp) => Some(exp),
        Err(e) => {
            debug!(error = %e, "token expiry unavailable, auto-logout disabled");
            None
        }
    }
}

/// Token bearer et champs décodés ; immuable une fois construit
#[derive(Debug, Clone, PartialEq)]
pub struct SessionToken {
    pub raw: String,
    pub subject: Option<String>,
    pub issued_at: Option<OffsetDateTime>,
    pub expires_at: Option<OffsetDateTime>,
}

impl SessionToken {
    pub fn decode(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        let claims = decode_claims(&raw).unwrap_or_default();
        let subject = claims.sub.as_ref().and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        Self {
            subject,
            issued_at: claim_time(claims.iat.as_ref()),
            expires_at: get_expiry(&raw),
            raw,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Session {
    pub token: SessionToken,
    pub profile: UserProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutReason {
    Explicit,
    Expired,
    Unauthorized,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    SignedIn { subject: Option<String> },
    ProfileRefreshed,
    SignedOut { reason: SignOutReason },
}

struct SessionInner {
    current: Mutex<Option<Session>>,
    expiry_timer: Mutex<Option<JoinHandle<()>>>,
    generation: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
    storage: Option<LocalStore>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(storage: Option<LocalStore>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(SessionInner {
                current: Mutex::new(None),
                expiry_timer: Mutex::new(None),
                generation: AtomicU64::new(0),
                events,
                storage,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.inner.current.lock().is_some()
    }

    pub fn bearer(&self) -> Option<String> {
        self.inner.current.lock().as_ref().map(|s| s.token.raw.clone())
    }

    pub fn profile(&self) -> Option<UserProfile> {
        self.inner.current.lock().as_ref().map(|s| s.profile.clone())
    }

    pub fn expires_at(&self) -> Option<OffsetDateTime> {
        self.inner
            .current
            .lock()
            .as_ref()
            .and_then(|s| s.token.expires_at)
    }

    /// Remplace la session en bloc et ré-arme le timer d'expiration
    pub async fn set_session(&self, profile: UserProfile, token: impl Into<String>) {
        let token = SessionToken::decode(token);
        let subject = token.subject.clone();
        let expires_at = token.expires_at;
        let generation = self.install(Session {
            token: token.clone(),
            profile: profile.clone(),
        });

        self.persist(Some((token.raw.as_str(), &profile))).await;
        info!(subject = ?subject, expires_at = ?expires_at, "session started");
        let _ = self.inner.events.send(SessionEvent::SignedIn { subject });

        self.arm_expiry(generation, expires_at).await;
    }

    /// Efface la session courante. Retourne `false` s'il n'y en avait pas.
    pub async fn clear_session(&self, reason: SignOutReason) -> bool {
        self.clear_if(None, reason).await
    }

    /// Réaction à un 401 sur n'importe quelle requête
    pub async fn handle_unauthorized(&self) {
        if self.clear_session(SignOutReason::Unauthorized).await {
            warn!("backend rejected the session (401), signed out");
        }
    }

    /// Réhydrate la session persistée. Retourne `true` si une session est active ensuite.
    pub async fn restore(&self) -> bool {
        let Some(storage) = &self.inner.storage else {
            return false;
        };
        let Some(token) = storage.get_as::<String>(AUTH_TOKEN_KEY) else {
            return false;
        };
        let profile = storage
            .get_as::<UserProfile>(AUTH_PROFILE_KEY)
            .unwrap_or_default();
        debug!("restoring persisted session");
        self.set_session(profile, token).await;
        self.is_active()
    }

    /// Un seul `GET /auth/me` pour peupler la table de permissions
    pub async fn refresh_profile<A: DashboardApi>(&self, api: &A) -> Result<UserProfile, ApiError> {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let profile = api.fetch_profile().await?;
        let token = {
            let mut current = self.inner.current.lock();
            // une autre session a pu s'installer pendant le fetch
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                return Err(ApiError::NoSession);
            }
            let Some(session) = current.as_mut() else {
                return Err(ApiError::NoSession);
            };
            session.profile = profile.clone();
            session.token.raw.clone()
        };
        self.persist(Some((token.as_str(), &profile))).await;
        debug!(permissions = profile.permissions.len(), "profile refreshed");
        let _ = self.inner.events.send(SessionEvent::ProfileRefreshed);
        Ok(profile)
    }

    fn install(&self, session: Session) -> u64 {
        let mut current = self.inner.current.lock();
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *current = Some(session);
        if let Some(previous) = self.inner.expiry_timer.lock().take() {
            previous.abort();
        }
        generation
    }

    async fn arm_expiry(&self, generation: u64, expires_at: Option<OffsetDateTime>) {
        let Some(expires_at) = expires_at else {
            return;
        };
        let remaining = expires_at - OffsetDateTime::now_utc();
        let delay = match std::time::Duration::try_from(remaining) {
            Ok(delay) if !delay.is_zero() => delay,
            _ => {
                self.clear_if(Some(generation), SignOutReason::Expired).await;
                return;
            }
        };

        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // on retire notre propre handle pour ne pas s'auto-annuler pendant le clear
            inner.expiry_timer.lock().take();
            SessionManager { inner }
                .clear_if(Some(generation), SignOutReason::Expired)
                .await;
        });

        let mut slot = self.inner.expiry_timer.lock();
        if self.inner.generation.load(Ordering::SeqCst) == generation {
            if let Some(previous) = slot.replace(handle) {
                previous.abort();
            }
        } else {
            handle.abort();
        }
    }

    async fn clear_if(&self, generation: Option<u64>, reason: SignOutReason) -> bool {
        let cleared = {
            let mut current = self.inner.current.lock();
            let matches = generation
                .map_or(true, |g| g == self.inner.generation.load(Ordering::SeqCst));
            if !matches || current.is_none() {
                false
            } else {
                *current = None;
                self.inner.generation.fetch_add(1, Ordering::SeqCst);
                if let Some(timer) = self.inner.expiry_timer.lock().take() {
                    timer.abort();
                }
                true
            }
        };
        if !cleared {
            return false;
        }

        self.persist(None).await;
        info!(?reason, "session cleared");
        let _ = self.inner.events.send(SessionEvent::SignedOut { reason });
        true
    }

    async fn persist(&self, session: Option<(&str, &UserProfile)>) {
        let Some(storage) = &self.inner.storage else {
            return;
        };
        let result = match session {
            Some((token, profile)) => {
                match storage.set(AUTH_TOKEN_KEY, Value::String(token.to_string())).await {
                    Ok(()) => storage.set_as(AUTH_PROFILE_KEY, profile).await,
                    Err(e) => Err(e),
                }
            }
            None => match storage.remove(AUTH_TOKEN_KEY).await {
                Ok(()) => storage.remove(AUTH_PROFILE_KEY).await,
                Err(e) => Err(e),
            },
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to persist session state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token_with(claims: Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap());
        format!("{header}.{body}.signature")
    }

    fn operator() -> UserProfile {
        UserProfile {
            id: "u1".into(),
            role: Some("operator".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_get_expiry_reads_exp_seconds() {
        let token = token_with(json!({"sub": "alice", "exp": 1_900_000_000}));
        assert_eq!(get_expiry(&token).unwrap().unix_timestamp(), 1_900_000_000);
    }

    #[test]
    fn test_get_expiry_malformed_tokens() {
        assert!(get_expiry("not-a-token").is_none());
        assert!(get_expiry("a.%%%.c").is_none());
        assert!(get_expiry(&token_with(json!({"sub": "alice"}))).is_none());
        assert!(get_expiry(&token_with(json!({"exp": "tomorrow"}))).is_none());
        assert!(matches!(decode_claims("a.b"), Err(TokenError::Malformed)));
    }

    #[test]
    fn test_decode_token_fields() {
        let token = SessionToken::decode(token_with(json!({"sub": 12, "iat": 1_700_000_000})));
        assert_eq!(token.subject.as_deref(), Some("12"));
        assert_eq!(token.issued_at.unwrap().unix_timestamp(), 1_700_000_000);
        assert!(token.expires_at.is_none());
    }

    #[tokio::test]
    async fn test_expired_token_clears_immediately() {
        let manager = SessionManager::new(None);
        let mut events = manager.subscribe();
        let past = OffsetDateTime::now_utc().unix_timestamp() - 60;
        manager
            .set_session(operator(), token_with(json!({"exp": past})))
            .await;

        assert!(!manager.is_active());
        assert!(matches!(events.recv().await, Ok(SessionEvent::SignedIn { .. })));
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::SignedOut { reason: SignOutReason::Expired }
        );
    }

    #[tokio::test]
    async fn test_token_without_expiry_persists_until_unauthorized() {
        let manager = SessionManager::new(None);
        manager.set_session(operator(), "opaque-token").await;
        assert!(manager.is_active());
        assert!(manager.expires_at().is_none());

        manager.handle_unauthorized().await;
        assert!(!manager.is_active());
        assert!(!manager.clear_session(SignOutReason::Explicit).await);
    }

    #[tokio::test]
    async fn test_session_is_persisted_and_restored() {
        let storage = LocalStore::in_memory();
        let manager = SessionManager::new(Some(storage.clone()));
        manager.set_session(operator(), "opaque-token").await;

        let restored = SessionManager::new(Some(storage.clone()));
        assert!(restored.restore().await);
        assert_eq!(restored.bearer().as_deref(), Some("opaque-token"));
        assert_eq!(restored.profile().unwrap().role.as_deref(), Some("operator"));

        restored.clear_session(SignOutReason::Explicit).await;
        assert!(storage.get(AUTH_TOKEN_KEY).is_none());
        assert!(!SessionManager::new(Some(storage)).restore().await);
    }
}
