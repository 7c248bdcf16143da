/**
 * LOCAL STORE - Substrat clé/valeur persistant du client
 *
 * RÔLE :
 * Persiste le couple token/profil de session et les préférences d'interface
 * (sidebar repliée, thème) dans un fichier JSON, réhydraté au démarrage.
 *
 * FONCTIONNEMENT :
 * - Les entrées vivent en mémoire (lecture synchrone)
 * - Chaque `set`/`remove` réécrit le fichier (écriture tmp + rename)
 * - Fichier absent → store vide ; fichier illisible → warning et store vide
 */

use crate::error::StorageError;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

pub const AUTH_TOKEN_KEY: &str = "auth.token";
pub const AUTH_PROFILE_KEY: &str = "auth.profile";
pub const SIDEBAR_COLLAPSED_KEY: &str = "ui.sidebar_collapsed";
pub const THEME_KEY: &str = "ui.theme";

struct StoreInner {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, Value>>,
    write_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<StoreInner>,
}

impl LocalStore {
    /// Charge le fichier s'il existe
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let entries = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            match serde_json::from_str::<BTreeMap<String, Value>>(&content) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unreadable local state, starting fresh");
                    BTreeMap::new()
                }
            }
        } else {
            debug!(path = %path.display(), "no local state file yet");
            BTreeMap::new()
        };

        Ok(Self::build(Some(path), entries))
    }

    /// Store sans fichier (tests, sessions éphémères)
    pub fn in_memory() -> Self {
        Self::build(None, BTreeMap::new())
    }

    fn build(path: Option<PathBuf>, entries: BTreeMap<String, Value>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                path,
                entries: Mutex::new(entries),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.inner.entries.lock().get(key).cloned()
    }

    /// Lecture typée ; une valeur de forme inattendue est traitée comme absente
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key, error = %e, "ignoring malformed local entry");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: Value) -> Result<(), StorageError> {
        self.inner.entries.lock().insert(key.to_string(), value);
        self.flush().await
    }

    pub async fn set_as<T: Serialize>(&self, key: &str, value: &T) -> Result<(), StorageError> {
        let value = serde_json::to_value(value)?;
        self.set(key, value).await
    }

    pub async fn remove(&self, key: &str) -> Result<(), StorageError> {
        let removed = self.inner.entries.lock().remove(key).is_some();
        if removed {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), StorageError> {
        let Some(path) = &self.inner.path else {
            return Ok(());
        };
        let _guard = self.inner.write_lock.lock().await;
        let content = {
            let entries = self.inner.entries.lock();
            serde_json::to_string_pretty(&*entries)?
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    #[default]
    Light,
    Dark,
}

/// Préférences d'interface stockées à côté de la session
#[derive(Clone)]
pub struct Preferences {
    store: LocalStore,
}

impl Preferences {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub fn sidebar_collapsed(&self) -> bool {
        self.store.get_as(SIDEBAR_COLLAPSED_KEY).unwrap_or(false)
    }

    pub async fn set_sidebar_collapsed(&self, collapsed: bool) -> Result<(), StorageError> {
        self.store.set(SIDEBAR_COLLAPSED_KEY, Value::Bool(collapsed)).await
    }

    pub fn theme(&self) -> Theme {
        self.store.get_as(THEME_KEY).unwrap_or_default()
    }

    pub async fn set_theme(&self, theme: Theme) -> Result<(), StorageError> {
        self.store.set_as(THEME_KEY, &theme).await
    }
}
