//! Primitives d'état partagé : verrou court + compteur de révision observable

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

/// Aucun verrou ne doit être tenu à travers un `.await`
pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// Compteur monotone incrémenté à chaque commit ; les abonnés sont réveillés
#[derive(Clone)]
pub struct Revision {
    tx: Arc<watch::Sender<u64>>,
}

impl Revision {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn bump(&self) -> u64 {
        let mut next = 0;
        self.tx.send_modify(|rev| {
            *rev += 1;
            next = *rev;
        });
        next
    }

    pub fn current(&self) -> u64 {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

impl Default for Revision {
    fn default() -> Self {
        Self::new()
    }
}
