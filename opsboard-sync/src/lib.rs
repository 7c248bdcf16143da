/**
 * OPSBOARD SYNC - Moteur de synchronisation d'état du dashboard opérationnel
 *
 * RÔLE : Maintient une vue cohérente et fraîche de la flotte (devices, incidents,
 * alertes, moniteurs synthetics, licences) à partir du poll REST et des deltas push.
 *
 * ARCHITECTURE : Session + permission gate en amont, poll orchestrator et canal push
 * comme écrivains, State Store unique, history sampler en lecture seule.
 */

pub mod api;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod history;
pub mod models;
pub mod permissions;
pub mod poll;
pub mod push;
pub mod session;
pub mod state;
pub mod storage;
pub mod store;
pub mod task;

pub use api::{DashboardApi, HttpApi};
pub use config::{load_config, load_config_from, DashboardConfig};
pub use dashboard::{Dashboard, MountedDashboard};
pub use error::{ApiError, ConfigError, StorageError};
pub use history::{HistoryBuffer, HistorySampler};
pub use permissions::{authorized, Source};
pub use poll::{PollOrchestrator, RefreshReport, SourceOutcome};
pub use push::{DeltaSubscription, PushClient};
pub use session::{get_expiry, SessionEvent, SessionManager, SignOutReason};
pub use storage::{LocalStore, Preferences, Theme};
pub use store::{Counters, SliceUpdate, Snapshot, SourceState, StateStore};
pub use task::ScheduledTask;
