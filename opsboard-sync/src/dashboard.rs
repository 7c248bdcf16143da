//! Montage du dashboard : assemble poll, push et historique autour d'un State Store
//! et garantit leur arrêt au démontage ou à la fin de session.

use crate::api::DashboardApi;
use crate::config::DashboardConfig;
use crate::history::HistorySampler;
use crate::models::HistoryPoint;
use crate::permissions::{authorized_sources, may_subscribe_push};
use crate::poll::{PollOrchestrator, RefreshReport};
use crate::push::{DeltaSubscription, PushClient};
use crate::session::{SessionEvent, SessionManager};
use crate::store::StateStore;
use crate::task::ScheduledTask;
use parking_lot::Mutex;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Contexte partagé par toutes les vues montées
pub struct Dashboard<A> {
    pub config: DashboardConfig,
    pub session: SessionManager,
    pub api: Arc<A>,
    pub push: PushClient,
    pub store: StateStore,
}

impl<A> Clone for Dashboard<A> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            session: self.session.clone(),
            api: self.api.clone(),
            push: self.push.clone(),
            store: self.store.clone(),
        }
    }
}

impl<A: DashboardApi> Dashboard<A> {
    pub fn new(config: DashboardConfig, session: SessionManager, api: A) -> Self {
        let push = PushClient::new(config.push.clone());
        Self {
            config,
            session,
            api: Arc::new(api),
            push,
            store: StateStore::new(),
        }
    }

    /// Cycle initial, puis timers de poll et d'historique, puis handler push si autorisé
    pub async fn mount(&self) -> MountedDashboard<A> {
        let profile = self.session.profile();
        let sources = authorized_sources(profile.as_ref());
        info!(?sources, "mounting dashboard");

        // abonné avant le premier fetch : un 401 pendant le montage est vu par le watcher
        let events = self.session.subscribe();

        let poller = PollOrchestrator::new(
            self.api.clone(),
            self.store.clone(),
            self.session.clone(),
            self.config.poll.clone(),
        );
        let initial = poller.refresh().await;
        let poll_task = poller.spawn(self.config.poll.interval());

        let mounted = Arc::new(Mounted {
            tasks: Mutex::new(Vec::new()),
            subscription: Mutex::new(None),
            push: self.push.clone(),
            store: self.store.clone(),
        });
        if may_subscribe_push(profile.as_ref()) {
            mounted.subscribe_push();
        } else {
            debug!("push channel not authorized for this profile");
        }

        let sampler = HistorySampler::new(self.store.clone(), self.config.history.capacity);
        let history_task = sampler.spawn(self.config.history.interval());
        mounted.tasks.lock().extend([poll_task, history_task]);

        let watcher = tokio::spawn(watch_session(
            events,
            self.session.clone(),
            mounted.clone(),
        ));

        MountedDashboard {
            poller,
            sampler,
            mounted,
            watcher: Some(watcher),
            initial,
        }
    }
}

/// Ressources à libérer au démontage, partagées avec le watcher de session
struct Mounted {
    tasks: Mutex<Vec<ScheduledTask>>,
    subscription: Mutex<Option<DeltaSubscription>>,
    push: PushClient,
    store: StateStore,
}

impl Mounted {
    fn subscribe_push(&self) {
        let store = self.store.clone();
        let subscription = self.push.on_delta(move |delta| {
            store.apply_delta(&delta, OffsetDateTime::now_utc());
        });
        *self.subscription.lock() = Some(subscription);
        self.push.connect();
    }

    fn is_active(&self) -> bool {
        !self.tasks.lock().is_empty()
    }

    /// Arrête les timers et retire le handler push. Retourne `false` si déjà fait.
    fn teardown(&self) -> bool {
        let tasks: Vec<ScheduledTask> = self.tasks.lock().drain(..).collect();
        let subscription = self.subscription.lock().take();
        let was_active = !tasks.is_empty() || subscription.is_some();
        drop(tasks);
        drop(subscription);
        was_active
    }

    /// Après un refresh de profil, le droit au push peut avoir changé
    fn sync_push(&self, allowed: bool) {
        if !self.is_active() {
            return;
        }
        let subscribed = self.subscription.lock().is_some();
        if allowed && !subscribed {
            info!("push channel now authorized, subscribing");
            self.subscribe_push();
        } else if !allowed && subscribed {
            info!("push channel no longer authorized, handler removed");
            self.subscription.lock().take();
        }
    }
}

async fn watch_session(
    mut events: broadcast::Receiver<SessionEvent>,
    session: SessionManager,
    mounted: Arc<Mounted>,
) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::SignedOut { reason }) => {
                info!(?reason, "session ended, unmounting dashboard");
                break;
            }
            Ok(SessionEvent::ProfileRefreshed) => {
                mounted.sync_push(may_subscribe_push(session.profile().as_ref()));
            }
            Ok(SessionEvent::SignedIn { .. }) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "session events lagged");
                if !session.is_active() {
                    break;
                }
            }
            Err(RecvError::Closed) => return,
        }
    }
    mounted.teardown();
    mounted.store.clear();
}

/// Vue montée. `unmount()` ou le drop arrêtent tout ce que `mount()` a démarré ;
/// la connexion push elle-même reste ouverte.
pub struct MountedDashboard<A> {
    poller: PollOrchestrator<A>,
    sampler: HistorySampler,
    mounted: Arc<Mounted>,
    watcher: Option<JoinHandle<()>>,
    initial: RefreshReport,
}

impl<A: DashboardApi> MountedDashboard<A> {
    pub fn store(&self) -> &StateStore {
        &self.mounted.store
    }

    pub fn history(&self) -> Vec<HistoryPoint> {
        self.sampler.history()
    }

    pub fn sampler(&self) -> &HistorySampler {
        &self.sampler
    }

    /// Rapport du cycle lancé au montage
    pub fn initial_report(&self) -> &RefreshReport {
        &self.initial
    }

    /// `false` une fois démonté, explicitement ou par fin de session
    pub fn is_mounted(&self) -> bool {
        self.mounted.is_active()
    }

    /// `true` seulement si le handler de cette vue est toujours celui enregistré
    pub fn has_push_handler(&self) -> bool {
        self.mounted
            .subscription
            .lock()
            .as_ref()
            .is_some_and(DeltaSubscription::is_registered)
    }

    /// Rafraîchissement manuel, hors timer
    pub async fn refresh(&self) -> RefreshReport {
        self.poller.refresh().await
    }

    pub fn unmount(self) {}
}

impl<A> Drop for MountedDashboard<A> {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        if self.mounted.teardown() {
            info!("dashboard unmounted");
        }
    }
}
