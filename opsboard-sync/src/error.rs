//! Erreurs du coeur de synchronisation

/// Échecs d'un appel REST vers le backend
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("unauthorized (401) on {path}")]
    Unauthorized { path: String },
    #[error("{path} answered HTTP {status}")]
    Status { status: u16, path: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("invalid payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid payload from {path}: {reason}")]
    Invalid { path: String, reason: String },
    #[error("cannot build request URL from {url}: {reason}")]
    BadUrl { url: String, reason: String },
    #[error("no active session")]
    NoSession,
}

impl ApiError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized { .. })
    }
}

/// Erreurs du stockage local clé/valeur
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("no data directory available for local state")]
    NoDataDir,
}
