/**
 * PUSH CHANNEL CLIENT - Flux d'événements serveur → deltas typés
 *
 * RÔLE :
 * Maintient une seule connexion persistante au bus d'événements (MQTT) et
 * traduit les événements nommés (`device:update`) en `DeviceDelta`.
 *
 * FONCTIONNEMENT :
 * - `connect()` est idempotent : un appel alors qu'une connexion existe ne fait rien
 * - Un seul handler par nom d'événement : enregistrer un handler remplace le
 *   précédent ; la `DeltaSubscription` retournée le désenregistre à son drop
 * - Événement `<prefix>/<nom>` sur le bus ; réabonnement à chaque ConnAck
 *   (reconnexion gérée par l'event loop rumqttc, sans backoff maison)
 * - Les deltas sont délivrés dans l'ordre d'émission, sans réordonnancement
 * - Payload invalide → warning, ignoré
 */

use crate::config::PushConf;
use crate::models::{DeviceDelta, DeviceUpdateWire};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEVICE_UPDATE: &str = "device:update";

pub type DeltaHandler = Arc<dyn Fn(DeviceDelta) + Send + Sync>;

struct Registered {
    id: u64,
    handler: DeltaHandler,
}

struct PushInner {
    config: PushConf,
    handlers: Mutex<HashMap<String, Registered>>,
    next_id: AtomicU64,
    connection: Mutex<Option<JoinHandle<()>>>,
    client: Mutex<Option<AsyncClient>>,
    transport_up: AtomicBool,
}

impl Drop for PushInner {
    fn drop(&mut self) {
        if let Some(handle) = self.connection.get_mut().take() {
            handle.abort();
        }
    }
}

#[derive(Clone)]
pub struct PushClient {
    inner: Arc<PushInner>,
}

/// Jeton d'abonnement : le drop retire le handler s'il est toujours celui enregistré
pub struct DeltaSubscription {
    inner: Weak<PushInner>,
    event: String,
    id: u64,
}

impl DeltaSubscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    /// `false` une fois remplacé par un handler plus récent (ou client détruit)
    pub fn is_registered(&self) -> bool {
        self.inner.upgrade().is_some_and(|inner| {
            inner
                .handlers
                .lock()
                .get(&self.event)
                .is_some_and(|r| r.id == self.id)
        })
    }
}

impl Drop for DeltaSubscription {
    fn drop(&mut self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut handlers = inner.handlers.lock();
        if handlers.get(&self.event).is_some_and(|r| r.id == self.id) {
            handlers.remove(&self.event);
            debug!(event = %self.event, "delta handler deregistered");
        }
    }
}

impl PushClient {
    pub fn new(config: PushConf) -> Self {
        Self {
            inner: Arc::new(PushInner {
                config,
                handlers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                connection: Mutex::new(None),
                client: Mutex::new(None),
                transport_up: AtomicBool::new(false),
            }),
        }
    }

    pub fn topic_for(&self, event: &str) -> String {
        format!("{}/{}", self.inner.config.topic_prefix.trim_end_matches('/'), event)
    }

    fn event_for_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let prefix = self.inner.config.topic_prefix.trim_end_matches('/');
        topic.strip_prefix(prefix)?.strip_prefix('/')
    }

    /// Enregistre le handler `device:update`, en remplaçant le précédent
    pub fn on_delta<F>(&self, handler: F) -> DeltaSubscription
    where
        F: Fn(DeviceDelta) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let replaced = self
            .inner
            .handlers
            .lock()
            .insert(
                DEVICE_UPDATE.to_string(),
                Registered {
                    id,
                    handler: Arc::new(handler),
                },
            )
            .is_some();
        if replaced {
            debug!(event = DEVICE_UPDATE, "previous delta handler replaced");
        }
        if let Some(client) = self.inner.client.lock().as_ref() {
            if let Err(e) = client.try_subscribe(self.topic_for(DEVICE_UPDATE), QoS::AtLeastOnce) {
                warn!(error = %e, "subscribe request not queued, will retry on reconnect");
            }
        }
        DeltaSubscription {
            inner: Arc::downgrade(&self.inner),
            event: DEVICE_UPDATE.to_string(),
            id,
        }
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    /// Route un événement brut vers son handler. Retourne `true` si un delta a été délivré.
    pub fn dispatch(&self, event: &str, payload: &[u8]) -> bool {
        if event != DEVICE_UPDATE {
            debug!(event, "ignoring unhandled push event");
            return false;
        }
        let handler = match self.inner.handlers.lock().get(event) {
            Some(registered) => registered.handler.clone(),
            None => return false,
        };
        let delta = match serde_json::from_slice::<DeviceUpdateWire>(payload) {
            Ok(wire) => DeviceDelta::from_wire(wire),
            Err(e) => {
                warn!(event, error = %e, "malformed push payload");
                return false;
            }
        };
        match delta {
            Some(delta) => {
                handler(delta);
                true
            }
            None => {
                warn!(event, "push payload without device_id");
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner
            .connection
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn transport_up(&self) -> bool {
        self.inner.transport_up.load(Ordering::SeqCst)
    }

    /// Ouvre la connexion si elle n'existe pas. Retourne `false` si c'était un no-op.
    pub fn connect(&self) -> bool {
        let mut connection = self.inner.connection.lock();
        if connection.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        let config = &self.inner.config;
        let client_id = format!("opsboard-{}", Uuid::new_v4().simple());
        let mut opts = MqttOptions::new(client_id, &config.broker_host, config.broker_port);
        opts.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        opts.set_clean_session(true);
        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        *self.inner.client.lock() = Some(client.clone());

        // la boucle ne garde qu'une référence faible : détruire le client la termine
        let weak = Arc::downgrade(&self.inner);
        let reconnect_delay = Duration::from_secs(config.reconnect_delay_secs);
        info!(host = %config.broker_host, port = config.broker_port, "push channel connecting");

        *connection = Some(tokio::spawn(async move {
            loop {
                let polled = eventloop.poll().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("push client dropped, connection loop stops");
                    return;
                };
                let this = PushClient { inner };
                let failed = match polled {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        this.inner.transport_up.store(true, Ordering::SeqCst);
                        this.resubscribe(&client);
                        false
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        match this.event_for_topic(&p.topic) {
                            Some(event) => {
                                this.dispatch(event, &p.payload);
                            }
                            None => debug!(topic = %p.topic, "publish outside event prefix"),
                        }
                        false
                    }
                    Ok(_) => false,
                    Err(e) => {
                        if this.inner.transport_up.swap(false, Ordering::SeqCst) {
                            warn!(error = %e, "push channel lost, transport will reconnect");
                        } else {
                            debug!(error = %e, "push channel still unavailable");
                        }
                        true
                    }
                };
                drop(this);
                if failed {
                    tokio::time::sleep(reconnect_delay).await;
                }
            }
        }));
        true
    }

    /// Réabonne tous les événements ayant un handler (appelé à chaque ConnAck)
    fn resubscribe(&self, client: &AsyncClient) {
        let events: Vec<String> = self.inner.handlers.lock().keys().cloned().collect();
        for event in events {
            if let Err(e) = client.try_subscribe(self.topic_for(&event), QoS::AtLeastOnce) {
                warn!(event = %event, error = %e, "resubscribe failed");
            }
        }
    }

    pub fn disconnect(&self) {
        if let Some(client) = self.inner.client.lock().take() {
            let _ = client.try_disconnect();
        }
        if let Some(handle) = self.inner.connection.lock().take() {
            handle.abort();
            info!("push channel disconnected");
        }
        self.inner.transport_up.store(false, Ordering::SeqCst);
    }
}
