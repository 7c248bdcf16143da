/*!
Broker MQTT minimal pour tester le canal push sur un vrai transport

Écoute sur `127.0.0.1:<port éphémère>` et parle juste assez de MQTT 3.1.1 :
- CONNECT → CONNACK, SUBSCRIBE → SUBACK (QoS 0 accordé), PINGREQ → PINGRESP
- `publish()` envoie un PUBLISH QoS 0 à chaque connexion abonnée au topic exact
- `drop_connections()` coupe toutes les connexions pour simuler une perte du transport
- Compteurs de connexions et d'abonnements reçus, attente avec timeout
*/

use anyhow::{bail, Result};
use opsboard_sync::config::PushConf;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info};

const CONNECT: u8 = 1;
const SUBSCRIBE: u8 = 8;
const PINGREQ: u8 = 12;
const DISCONNECT: u8 = 14;

struct Connection {
    topics: Vec<String>,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    tasks: Vec<AbortHandle>,
}

#[derive(Default)]
struct BrokerState {
    connections: Mutex<HashMap<u64, Connection>>,
    next_id: AtomicU64,
    connects: AtomicUsize,
    subscribe_requests: Mutex<HashMap<String, usize>>,
}

pub struct TestBroker {
    state: Arc<BrokerState>,
    port: u16,
    acceptor: JoinHandle<()>,
}

impl TestBroker {
    pub async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let state = Arc::new(BrokerState::default());

        let acceptor = tokio::spawn({
            let state = state.clone();
            async move {
                while let Ok((stream, peer)) = listener.accept().await {
                    let id = state.next_id.fetch_add(1, Ordering::SeqCst);
                    debug!(id, %peer, "broker accepted connection");
                    let (read_half, write_half) = stream.into_split();
                    let (outbox, rx) = mpsc::unbounded_channel();
                    let writer = tokio::spawn(write_loop(write_half, rx));
                    state.connections.lock().insert(
                        id,
                        Connection {
                            topics: Vec::new(),
                            outbox,
                            tasks: vec![writer.abort_handle()],
                        },
                    );
                    let reader = tokio::spawn(read_loop(state.clone(), id, read_half));
                    if let Some(conn) = state.connections.lock().get_mut(&id) {
                        conn.tasks.push(reader.abort_handle());
                    }
                }
            }
        });

        info!(port, "test broker listening");
        Ok(Self {
            state,
            port,
            acceptor,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Config push pointant sur ce broker, reconnexion immédiate
    pub fn push_conf(&self) -> PushConf {
        PushConf {
            broker_host: "127.0.0.1".into(),
            broker_port: self.port,
            reconnect_delay_secs: 0,
            ..PushConf::default()
        }
    }

    /// Nombre de CONNECT reçus depuis le démarrage
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Nombre de SUBSCRIBE reçus pour `topic`, reconnexions comprises
    pub fn subscribe_count(&self, topic: &str) -> usize {
        self.state
            .subscribe_requests
            .lock()
            .get(topic)
            .copied()
            .unwrap_or(0)
    }

    /// Connexions actuellement abonnées à `topic`
    pub fn subscribers(&self, topic: &str) -> usize {
        self.state
            .connections
            .lock()
            .values()
            .filter(|c| c.topics.iter().any(|t| t == topic))
            .count()
    }

    /// Publie en QoS 0 ; retourne le nombre de connexions servies
    pub fn publish(&self, topic: &str, payload: &[u8]) -> usize {
        let packet = publish_packet(topic, payload);
        let connections = self.state.connections.lock();
        connections
            .values()
            .filter(|c| c.topics.iter().any(|t| t == topic))
            .filter(|c| c.outbox.send(packet.clone()).is_ok())
            .count()
    }

    /// Coupe brutalement toutes les connexions ouvertes
    pub fn drop_connections(&self) -> usize {
        let dropped: Vec<Connection> = self
            .state
            .connections
            .lock()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in &dropped {
            for task in &conn.tasks {
                task.abort();
            }
        }
        info!(count = dropped.len(), "test broker dropped connections");
        dropped.len()
    }

    /// Attend qu'au moins `count` connexions soient abonnées à `topic`
    pub async fn wait_for_subscribers(&self, topic: &str, count: usize, limit: Duration) -> Result<()> {
        let waited = tokio::time::timeout(limit, async {
            while self.subscribers(topic) < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if waited.is_err() {
            bail!("no {count} subscriber(s) on {topic} within {limit:?}");
        }
        Ok(())
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.acceptor.abort();
        self.drop_connections();
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(bytes) = rx.recv().await {
        if writer.write_all(&bytes).await.is_err() {
            break;
        }
    }
}

async fn read_loop(state: Arc<BrokerState>, id: u64, mut reader: OwnedReadHalf) {
    loop {
        let (header, body) = match read_packet(&mut reader).await {
            Ok(packet) => packet,
            Err(e) => {
                debug!(id, error = %e, "broker connection closed");
                break;
            }
        };
        let reply = match header >> 4 {
            CONNECT => {
                state.connects.fetch_add(1, Ordering::SeqCst);
                Some(vec![0x20, 0x02, 0x00, 0x00])
            }
            SUBSCRIBE => {
                let Some((pkid, topics)) = subscribe_request(&body) else {
                    debug!(id, "malformed SUBSCRIBE");
                    break;
                };
                {
                    let mut requests = state.subscribe_requests.lock();
                    for topic in &topics {
                        *requests.entry(topic.clone()).or_default() += 1;
                    }
                }
                let granted = topics.len();
                if let Some(conn) = state.connections.lock().get_mut(&id) {
                    conn.topics.extend(topics);
                }
                Some(suback_packet(pkid, granted))
            }
            PINGREQ => Some(vec![0xD0, 0x00]),
            DISCONNECT => break,
            _ => None,
        };
        if let Some(reply) = reply {
            let sent = state
                .connections
                .lock()
                .get(&id)
                .is_some_and(|c| c.outbox.send(reply).is_ok());
            if !sent {
                break;
            }
        }
    }
    if let Some(conn) = state.connections.lock().remove(&id) {
        for task in conn.tasks {
            task.abort();
        }
    }
}

async fn read_packet(reader: &mut OwnedReadHalf) -> io::Result<(u8, Vec<u8>)> {
    let header = reader.read_u8().await?;
    let mut length = 0usize;
    let mut shift = 0;
    loop {
        let byte = reader.read_u8().await?;
        length |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 21 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "remaining length overflow"));
        }
    }
    let mut body = vec![0; length];
    reader.read_exact(&mut body).await?;
    Ok((header, body))
}

fn subscribe_request(body: &[u8]) -> Option<(u16, Vec<String>)> {
    let pkid = u16::from_be_bytes([*body.first()?, *body.get(1)?]);
    let mut rest = body.get(2..)?;
    let mut topics = Vec::new();
    while !rest.is_empty() {
        let len = usize::from(u16::from_be_bytes([*rest.first()?, *rest.get(1)?]));
        let topic = rest.get(2..2 + len)?;
        topics.push(String::from_utf8_lossy(topic).into_owned());
        // octet de QoS demandé
        rest = rest.get(2 + len + 1..)?;
    }
    Some((pkid, topics))
}

fn remaining_length(mut len: usize, out: &mut Vec<u8>) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
}

fn suback_packet(pkid: u16, granted: usize) -> Vec<u8> {
    let mut packet = vec![0x90];
    remaining_length(2 + granted, &mut packet);
    packet.extend_from_slice(&pkid.to_be_bytes());
    packet.extend(std::iter::repeat(0x00).take(granted));
    packet
}

fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0x30];
    remaining_length(2 + topic.len() + payload.len(), &mut packet);
    packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    packet.extend_from_slice(topic.as_bytes());
    packet.extend_from_slice(payload);
    packet
}
