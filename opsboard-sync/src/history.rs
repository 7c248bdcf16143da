/**
 * HISTORY SAMPLER - Séries bornées pour les graphes de tendance
 *
 * RÔLE :
 * Sur son propre timer (10s par défaut), indépendant du poll, lit les compteurs
 * déjà commités dans le State Store et ajoute un point à un buffer circulaire.
 *
 * FONCTIONNEMENT :
 * - Ne déclenche jamais de fetch
 * - Capacité fixe (36 par défaut) ; au-delà, le plus ancien point sort (FIFO)
 * - La résolution des graphes ne dépend donc ni de la latence backend ni des échecs de poll
 */

use crate::models::HistoryPoint;
use crate::state::{new_state, Shared};
use crate::store::StateStore;
use crate::task::ScheduledTask;
use std::collections::VecDeque;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct HistoryBuffer {
    points: VecDeque<HistoryPoint>,
    capacity: usize,
}

impl HistoryBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            points: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, point: HistoryPoint) {
        self.points.push_back(point);
        while self.points.len() > self.capacity {
            self.points.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&HistoryPoint> {
        self.points.back()
    }

    /// Points du plus ancien au plus récent
    pub fn to_vec(&self) -> Vec<HistoryPoint> {
        self.points.iter().copied().collect()
    }
}

#[derive(Clone)]
pub struct HistorySampler {
    store: StateStore,
    buffer: Shared<HistoryBuffer>,
}

impl HistorySampler {
    pub fn new(store: StateStore, capacity: usize) -> Self {
        Self {
            store,
            buffer: new_state(HistoryBuffer::new(capacity)),
        }
    }

    pub fn sample(&self) -> HistoryPoint {
        self.sample_at(OffsetDateTime::now_utc())
    }

    pub fn sample_at(&self, timestamp: OffsetDateTime) -> HistoryPoint {
        let counters = self.store.counters();
        let point = HistoryPoint {
            timestamp,
            online_count: counters.online,
            down_monitor_count: counters.down_monitors,
            active_alert_count: counters.active_alerts,
            critical_license_count: counters.critical_licenses,
        };
        self.buffer.lock().push(point);
        debug!(
            online = point.online_count,
            down_monitors = point.down_monitor_count,
            alerts = point.active_alert_count,
            "history sample"
        );
        point
    }

    pub fn history(&self) -> Vec<HistoryPoint> {
        self.buffer.lock().to_vec()
    }

    pub fn latest(&self) -> Option<HistoryPoint> {
        self.buffer.lock().latest().copied()
    }

    /// Boucle d'échantillonnage ; le premier point est pris immédiatement
    pub fn spawn(&self, period: Duration) -> ScheduledTask {
        let sampler = self.clone();
        ScheduledTask::spawn("history-sampler", async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                sampler.sample();
            }
        })
    }
}
