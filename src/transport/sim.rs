// In-process simulated broker used by the CLI simulate mode and the tests.
//
// It models only what the test types observe: topic routing, retained
// messages, persistent-session queues, will delivery and session takeover.
use parking_lot::{Mutex, RwLock};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{
    topic_matches, ConnectAck, ConnectOptions, DeviceTransport, InboundMessage, OutboundMessage,
    TransportConnector, TransportFuture, WillMessage,
};
use crate::error::EngineError;
use crate::spec::Protocol;

/// Failure injection knobs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SimFaults {
    pub connect_failure_rate: f64,
    pub publish_failure_rate: f64,
    /// Delay before a QoS 1/2 publish is acknowledged.
    pub latency: Duration,
    /// Graceful disconnects never complete.
    pub hang_on_disconnect: bool,
    /// The broker refuses every job up front.
    pub unavailable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SimBrokerStats {
    pub connects: u64,
    pub disconnects: u64,
    pub aborts: u64,
    pub publishes: u64,
    pub will_deliveries: u64,
    pub queued: u64,
    pub connected_clients: u64,
}

struct Connection {
    id: u64,
    inbox: mpsc::UnboundedSender<InboundMessage>,
    will: Option<WillMessage>,
}

struct QueuedMessage {
    message: InboundMessage,
    expires_at: Option<Instant>,
}

struct ClientSession {
    connection: Option<Connection>,
    clean: bool,
    subscriptions: HashMap<String, u8>,
    queue: VecDeque<QueuedMessage>,
}

struct BrokerState {
    sessions: HashMap<String, ClientSession>,
    /// filter -> subscribed client ids
    filters: HashMap<String, HashSet<String>>,
    retained: HashMap<String, InboundMessage>,
    will_deliveries: HashMap<String, u64>,
    rng: SmallRng,
    next_connection_id: u64,
}

pub struct SimBroker {
    state: Mutex<BrokerState>,
    faults: RwLock<SimFaults>,
    connects: AtomicU64,
    disconnects: AtomicU64,
    aborts: AtomicU64,
    publishes: AtomicU64,
    will_deliveries: AtomicU64,
    queued: AtomicU64,
}

impl SimBroker {
    pub fn new() -> Arc<Self> {
        Self::with_seed(0x5eed)
    }

    /// Seed for the failure-injection rolls.
    pub fn with_seed(seed: u64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BrokerState {
                sessions: HashMap::new(),
                filters: HashMap::new(),
                retained: HashMap::new(),
                will_deliveries: HashMap::new(),
                rng: SmallRng::seed_from_u64(seed),
                next_connection_id: 1,
            }),
            faults: RwLock::new(SimFaults::default()),
            connects: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
            publishes: AtomicU64::new(0),
            will_deliveries: AtomicU64::new(0),
            queued: AtomicU64::new(0),
        })
    }

    pub fn set_faults(&self, faults: SimFaults) {
        *self.faults.write() = faults;
    }

    pub fn faults(&self) -> SimFaults {
        self.faults.read().clone()
    }

    pub fn connector(self: &Arc<Self>) -> SimConnector {
        SimConnector {
            broker: Arc::clone(self),
        }
    }

    pub fn stats(&self) -> SimBrokerStats {
        SimBrokerStats {
            connects: self.connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            publishes: self.publishes.load(Ordering::Relaxed),
            will_deliveries: self.will_deliveries.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            connected_clients: self.connected_clients() as u64,
        }
    }

    pub fn connected_clients(&self) -> usize {
        self.state
            .lock()
            .sessions
            .values()
            .filter(|s| s.connection.is_some())
            .count()
    }

    pub fn will_deliveries_for(&self, client_id: &str) -> u64 {
        self.state
            .lock()
            .will_deliveries
            .get(client_id)
            .copied()
            .unwrap_or(0)
    }

    /// Clients whose will was published more than once.
    pub fn duplicate_wills(&self) -> usize {
        self.state
            .lock()
            .will_deliveries
            .values()
            .filter(|&&n| n > 1)
            .count()
    }

    pub fn retained(&self, topic: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .retained
            .get(topic)
            .map(|m| m.payload.clone())
    }

    pub fn retained_count(&self) -> usize {
        self.state.lock().retained.len()
    }

    fn connect(
        &self,
        options: &ConnectOptions,
        inbox: mpsc::UnboundedSender<InboundMessage>,
    ) -> Result<(u64, ConnectAck), EngineError> {
        let faults = self.faults();
        if faults.unavailable {
            return Err(EngineError::ConnectionFailure("broker unreachable".to_string()));
        }

        let mut state = self.state.lock();
        if faults.connect_failure_rate > 0.0
            && state.rng.gen_bool(faults.connect_failure_rate.clamp(0.0, 1.0))
        {
            return Err(EngineError::ConnectionFailure(format!(
                "connection refused for {}",
                options.client_id
            )));
        }

        let id = state.next_connection_id;
        state.next_connection_id += 1;

        let existing_clean = state
            .sessions
            .get(&options.client_id)
            .map(|s| s.clean);
        if options.clean_session || existing_clean == Some(true) {
            Self::remove_session(&mut state, &options.client_id);
        }
        let session_present = !options.clean_session && state.sessions.contains_key(&options.client_id);

        let session = state
            .sessions
            .entry(options.client_id.clone())
            .or_insert_with(|| ClientSession {
                connection: None,
                clean: options.clean_session,
                subscriptions: HashMap::new(),
                queue: VecDeque::new(),
            });
        // takeover: a previous connection of the same client is dropped silently
        session.clean = options.clean_session;
        session.connection = Some(Connection {
            id,
            inbox: inbox.clone(),
            will: options.will.clone(),
        });

        let now = Instant::now();
        while let Some(queued) = session.queue.pop_front() {
            if queued.expires_at.map_or(true, |at| at > now) {
                let _ = inbox.send(queued.message);
            }
        }

        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok((id, ConnectAck { session_present }))
    }

    fn remove_session(state: &mut BrokerState, client_id: &str) {
        if let Some(session) = state.sessions.remove(client_id) {
            for filter in session.subscriptions.keys() {
                if let Some(clients) = state.filters.get_mut(filter) {
                    clients.remove(client_id);
                    if clients.is_empty() {
                        state.filters.remove(filter);
                    }
                }
            }
        }
    }

    fn is_current(&self, client_id: &str, connection_id: u64) -> bool {
        self.state
            .lock()
            .sessions
            .get(client_id)
            .and_then(|s| s.connection.as_ref())
            .map_or(false, |c| c.id == connection_id)
    }

    /// Close a connection. Returns false if it was no longer current.
    fn close(&self, client_id: &str, connection_id: u64, graceful: bool) -> bool {
        let mut state = self.state.lock();
        let Some(session) = state.sessions.get_mut(client_id) else {
            return false;
        };
        if session.connection.as_ref().map(|c| c.id) != Some(connection_id) {
            return false;
        }
        let connection = session.connection.take();
        let clean = session.clean;
        if clean {
            Self::remove_session(&mut state, client_id);
        }

        if graceful {
            self.disconnects.fetch_add(1, Ordering::Relaxed);
        } else {
            self.aborts.fetch_add(1, Ordering::Relaxed);
            if let Some(will) = connection.and_then(|c| c.will) {
                *state
                    .will_deliveries
                    .entry(client_id.to_string())
                    .or_insert(0) += 1;
                self.will_deliveries.fetch_add(1, Ordering::Relaxed);
                let message = OutboundMessage {
                    topic: will.topic,
                    payload: will.payload,
                    qos: will.qos,
                    retain: will.retain,
                    expiry_seconds: None,
                };
                self.route(&mut state, &message);
            }
        }
        true
    }

    fn publish(
        &self,
        client_id: &str,
        connection_id: u64,
        message: &OutboundMessage,
    ) -> Result<(), EngineError> {
        let publish_failure_rate = self.faults.read().publish_failure_rate;
        let mut state = self.state.lock();
        let connected = state
            .sessions
            .get(client_id)
            .and_then(|s| s.connection.as_ref())
            .map_or(false, |c| c.id == connection_id);
        if !connected {
            return Err(EngineError::Protocol(format!(
                "{} publish on closed connection",
                client_id
            )));
        }
        if publish_failure_rate > 0.0 && state.rng.gen_bool(publish_failure_rate.clamp(0.0, 1.0)) {
            return Err(EngineError::Protocol(format!(
                "publish to {} not acknowledged",
                message.topic
            )));
        }
        self.publishes.fetch_add(1, Ordering::Relaxed);
        self.route(&mut state, message);
        Ok(())
    }

    fn route(&self, state: &mut BrokerState, message: &OutboundMessage) {
        if message.retain {
            if message.payload.is_empty() {
                state.retained.remove(&message.topic);
            } else {
                state.retained.insert(
                    message.topic.clone(),
                    InboundMessage {
                        topic: message.topic.clone(),
                        payload: message.payload.clone(),
                        qos: message.qos,
                        retained: true,
                    },
                );
            }
        }

        let targets: Vec<(String, String)> = state
            .filters
            .iter()
            .filter(|(filter, _)| topic_matches(filter, &message.topic))
            .flat_map(|(filter, clients)| {
                clients
                    .iter()
                    .map(move |client| (filter.clone(), client.clone()))
            })
            .collect();
        if targets.is_empty() {
            return;
        }

        let expires_at = message
            .expiry_seconds
            .map(|secs| Instant::now() + Duration::from_secs(secs as u64));
        for (filter, client) in targets {
            let Some(session) = state.sessions.get_mut(&client) else {
                continue;
            };
            let sub_qos = session.subscriptions.get(&filter).copied().unwrap_or(0);
            let inbound = InboundMessage {
                topic: message.topic.clone(),
                payload: message.payload.clone(),
                qos: message.qos.min(sub_qos),
                retained: false,
            };
            match &session.connection {
                Some(connection) => {
                    let _ = connection.inbox.send(inbound);
                }
                None if !session.clean && inbound.qos > 0 => {
                    session.queue.push_back(QueuedMessage {
                        message: inbound,
                        expires_at,
                    });
                    self.queued.fetch_add(1, Ordering::Relaxed);
                }
                None => {}
            }
        }
    }

    fn subscribe(
        &self,
        client_id: &str,
        connection_id: u64,
        filter: &str,
        qos: u8,
    ) -> Result<(), EngineError> {
        let mut state = self.state.lock();
        let state = &mut *state;
        let Some(session) = state.sessions.get_mut(client_id) else {
            return Err(EngineError::Protocol(format!("{} not connected", client_id)));
        };
        let Some(connection) = session.connection.as_ref().filter(|c| c.id == connection_id)
        else {
            return Err(EngineError::Protocol(format!("{} not connected", client_id)));
        };
        for retained in state.retained.values() {
            if topic_matches(filter, &retained.topic) {
                let _ = connection.inbox.send(InboundMessage {
                    qos: retained.qos.min(qos),
                    ..retained.clone()
                });
            }
        }
        session.subscriptions.insert(filter.to_string(), qos);
        state
            .filters
            .entry(filter.to_string())
            .or_default()
            .insert(client_id.to_string());
        Ok(())
    }
}

/// Hands out `SimTransport`s bound to one broker.
#[derive(Clone)]
pub struct SimConnector {
    broker: Arc<SimBroker>,
}

impl SimConnector {
    pub fn broker(&self) -> &Arc<SimBroker> {
        &self.broker
    }
}

impl TransportConnector for SimConnector {
    fn prepare(&self, _protocol: Protocol, broker_url: &str) -> Result<(), EngineError> {
        if self.broker.faults.read().unavailable {
            return Err(EngineError::ConnectionFailure(format!(
                "broker {} unreachable",
                broker_url
            )));
        }
        Ok(())
    }

    fn create(
        &self,
        _protocol: Protocol,
        _broker_url: &str,
    ) -> Result<Box<dyn DeviceTransport>, EngineError> {
        Ok(Box::new(SimTransport::new(Arc::clone(&self.broker))))
    }
}

struct ActiveConnection {
    client_id: String,
    id: u64,
    inbox: mpsc::UnboundedReceiver<InboundMessage>,
}

/// Client side of a simulated connection. Dropping it while connected is an
/// ungraceful disconnect, so the broker publishes the will.
pub struct SimTransport {
    broker: Arc<SimBroker>,
    active: Option<ActiveConnection>,
}

impl SimTransport {
    pub fn new(broker: Arc<SimBroker>) -> Self {
        Self {
            broker,
            active: None,
        }
    }

    fn active(&mut self) -> Result<&mut ActiveConnection, EngineError> {
        self.active
            .as_mut()
            .ok_or_else(|| EngineError::Protocol("not connected".to_string()))
    }
}

impl DeviceTransport for SimTransport {
    fn connect<'a>(&'a mut self, options: &'a ConnectOptions) -> TransportFuture<'a, ConnectAck> {
        Box::pin(async move {
            if let Some(previous) = self.active.take() {
                self.broker.close(&previous.client_id, previous.id, true);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let (id, ack) = self.broker.connect(options, tx)?;
            self.active = Some(ActiveConnection {
                client_id: options.client_id.clone(),
                id,
                inbox: rx,
            });
            Ok(ack)
        })
    }

    fn publish<'a>(&'a mut self, message: &'a OutboundMessage) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let latency = self.broker.faults.read().latency;
            let broker = Arc::clone(&self.broker);
            let active = self.active()?;
            broker.publish(&active.client_id, active.id, message)?;
            if message.qos > 0 && !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            Ok(())
        })
    }

    fn subscribe<'a>(&'a mut self, filter: &'a str, qos: u8) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let broker = Arc::clone(&self.broker);
            let active = self.active()?;
            broker.subscribe(&active.client_id, active.id, filter, qos)
        })
    }

    fn receive<'a>(&'a mut self, timeout: Duration) -> TransportFuture<'a, Option<InboundMessage>> {
        Box::pin(async move {
            let active = self.active()?;
            match tokio::time::timeout(timeout, active.inbox.recv()).await {
                Ok(Some(message)) => Ok(Some(message)),
                Ok(None) => Err(EngineError::Protocol("connection closed".to_string())),
                Err(_) => Ok(None),
            }
        })
    }

    fn disconnect<'a>(&'a mut self) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if self.broker.faults.read().hang_on_disconnect {
                std::future::pending::<()>().await;
            }
            if let Some(active) = self.active.take() {
                self.broker.close(&active.client_id, active.id, true);
            }
            Ok(())
        })
    }

    fn abort(&mut self) {
        if let Some(active) = self.active.take() {
            self.broker.close(&active.client_id, active.id, false);
        }
    }

    fn is_connected(&self) -> bool {
        self.active
            .as_ref()
            .map_or(false, |a| self.broker.is_current(&a.client_id, a.id))
    }
}

impl Drop for SimTransport {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(client_id: &str, clean: bool) -> ConnectOptions {
        ConnectOptions {
            client_id: client_id.to_string(),
            clean_session: clean,
            keep_alive: Duration::from_secs(60),
            will: None,
        }
    }

    fn message(topic: &str, payload: &[u8], qos: u8, retain: bool) -> OutboundMessage {
        OutboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
            retain,
            expiry_seconds: None,
        }
    }

    #[tokio::test]
    async fn test_publish_routes_to_subscriber() {
        let broker = SimBroker::new();
        let mut sub = SimTransport::new(broker.clone());
        let mut publisher = SimTransport::new(broker.clone());
        sub.connect(&options("sub", true)).await.unwrap();
        publisher.connect(&options("pub", true)).await.unwrap();
        sub.subscribe("devices/+/telemetry", 1).await.unwrap();

        publisher
            .publish(&message("devices/a/telemetry", b"hi", 1, false))
            .await
            .unwrap();
        let got = sub.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(got.payload, b"hi");
        assert_eq!(got.qos, 1);
        assert!(!got.retained);
        assert_eq!(broker.stats().publishes, 1);
    }

    #[tokio::test]
    async fn test_receive_times_out_with_none() {
        let broker = SimBroker::new();
        let mut client = SimTransport::new(broker);
        client.connect(&options("c", true)).await.unwrap();
        assert!(client.receive(Duration::from_millis(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retained_delivered_on_subscribe() {
        let broker = SimBroker::new();
        let mut publisher = SimTransport::new(broker.clone());
        publisher.connect(&options("pub", true)).await.unwrap();
        publisher
            .publish(&message("devices/a/status", b"{\"online\":true}", 1, true))
            .await
            .unwrap();
        assert_eq!(broker.retained_count(), 1);

        let mut late = SimTransport::new(broker.clone());
        late.connect(&options("late", true)).await.unwrap();
        late.subscribe("devices/a/status", 1).await.unwrap();
        let got = late.receive(Duration::from_millis(10)).await.unwrap().unwrap();
        assert!(got.retained);

        // empty retained payload clears the topic
        publisher
            .publish(&message("devices/a/status", b"", 1, true))
            .await
            .unwrap();
        assert_eq!(broker.retained("devices/a/status"), None);
    }

    #[tokio::test]
    async fn test_persistent_session_queues_while_offline() {
        let broker = SimBroker::new();
        let mut device = SimTransport::new(broker.clone());
        let ack = device.connect(&options("dev", false)).await.unwrap();
        assert!(!ack.session_present);
        device.subscribe("devices/dev/downlink", 1).await.unwrap();
        device.disconnect().await.unwrap();

        let mut backend = SimTransport::new(broker.clone());
        backend.connect(&options("backend", true)).await.unwrap();
        for i in 0..3u8 {
            backend
                .publish(&message("devices/dev/downlink", &[i], 1, false))
                .await
                .unwrap();
        }
        assert_eq!(broker.stats().queued, 3);

        let ack = device.connect(&options("dev", false)).await.unwrap();
        assert!(ack.session_present);
        for i in 0..3u8 {
            let got = device.receive(Duration::from_millis(10)).await.unwrap().unwrap();
            assert_eq!(got.payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn test_clean_session_discards_state() {
        let broker = SimBroker::new();
        let mut device = SimTransport::new(broker.clone());
        device.connect(&options("dev", false)).await.unwrap();
        device.subscribe("t", 1).await.unwrap();
        device.disconnect().await.unwrap();
        let ack = device.connect(&options("dev", true)).await.unwrap();
        assert!(!ack.session_present);
    }

    #[tokio::test]
    async fn test_qos0_not_queued() {
        let broker = SimBroker::new();
        let mut device = SimTransport::new(broker.clone());
        device.connect(&options("dev", false)).await.unwrap();
        device.subscribe("t", 0).await.unwrap();
        device.disconnect().await.unwrap();
        let mut backend = SimTransport::new(broker.clone());
        backend.connect(&options("b", true)).await.unwrap();
        backend.publish(&message("t", b"x", 1, false)).await.unwrap();
        assert_eq!(broker.stats().queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_messages_not_replayed() {
        let broker = SimBroker::new();
        let mut device = SimTransport::new(broker.clone());
        device.connect(&options("dev", false)).await.unwrap();
        device.subscribe("t", 1).await.unwrap();
        device.disconnect().await.unwrap();

        let mut backend = SimTransport::new(broker.clone());
        backend.connect(&options("b", true)).await.unwrap();
        let mut expiring = message("t", b"old", 1, false);
        expiring.expiry_seconds = Some(1);
        backend.publish(&expiring).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        device.connect(&options("dev", false)).await.unwrap();
        assert!(device.receive(Duration::from_millis(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_will_published_on_abort_not_on_disconnect() {
        let broker = SimBroker::new();
        let will = WillMessage {
            topic: "devices/dev/status".to_string(),
            payload: b"{\"online\":false}".to_vec(),
            qos: 1,
            retain: true,
        };
        let mut opts = options("dev", true);
        opts.will = Some(will);

        let mut clean = SimTransport::new(broker.clone());
        clean.connect(&opts).await.unwrap();
        clean.disconnect().await.unwrap();
        assert_eq!(broker.will_deliveries_for("dev"), 0);

        let mut dirty = SimTransport::new(broker.clone());
        dirty.connect(&opts).await.unwrap();
        dirty.abort();
        assert_eq!(broker.will_deliveries_for("dev"), 1);
        assert_eq!(
            broker.retained("devices/dev/status"),
            Some(b"{\"online\":false}".to_vec())
        );
        // a second abort on a closed transport is a no-op
        dirty.abort();
        assert_eq!(broker.will_deliveries_for("dev"), 1);
    }

    #[tokio::test]
    async fn test_drop_while_connected_is_an_abort() {
        let broker = SimBroker::new();
        {
            let mut client = SimTransport::new(broker.clone());
            client.connect(&options("c", true)).await.unwrap();
            assert_eq!(broker.connected_clients(), 1);
        }
        assert_eq!(broker.connected_clients(), 0);
        assert_eq!(broker.stats().aborts, 1);
    }

    #[tokio::test]
    async fn test_takeover_invalidates_old_connection() {
        let broker = SimBroker::new();
        let mut first = SimTransport::new(broker.clone());
        let mut second = SimTransport::new(broker.clone());
        first.connect(&options("same", true)).await.unwrap();
        second.connect(&options("same", true)).await.unwrap();
        assert!(!first.is_connected());
        assert!(second.is_connected());
        assert!(first.publish(&message("t", b"x", 0, false)).await.is_err());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let broker = SimBroker::new();
        broker.set_faults(SimFaults {
            connect_failure_rate: 1.0,
            ..SimFaults::default()
        });
        let mut client = SimTransport::new(broker.clone());
        let err = client.connect(&options("c", true)).await.unwrap_err();
        assert!(matches!(err, EngineError::ConnectionFailure(_)));

        broker.set_faults(SimFaults {
            publish_failure_rate: 1.0,
            ..SimFaults::default()
        });
        client.connect(&options("c", true)).await.unwrap();
        let err = client.publish(&message("t", b"x", 1, false)).await.unwrap_err();
        assert!(matches!(err, EngineError::Protocol(_)));

        broker.set_faults(SimFaults {
            unavailable: true,
            ..SimFaults::default()
        });
        assert!(broker
            .connector()
            .prepare(Protocol::Mqtt, "mqtt://sim")
            .is_err());
    }
}
