// Device session: one simulated device's connection, clock and sequence.
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::rate::SafetyController;
use crate::sensor::{self, SensorGenerator};
use crate::spec::TestSpec;
use crate::stats::JobMetrics;
use crate::transport::{
    ConnectAck, ConnectOptions, DeviceTransport, InboundMessage, OutboundMessage,
    TransportConnector, WillMessage,
};

pub const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Why a strategy stopped before finishing its schedule.
#[derive(Debug)]
pub enum Interrupt {
    /// The job's cancellation token fired.
    Cancelled,
    /// Unrecoverable for this device; the session is abandoned.
    Fatal(EngineError),
}

impl From<EngineError> for Interrupt {
    fn from(err: EngineError) -> Self {
        Interrupt::Fatal(err)
    }
}

pub type Step<T> = Result<T, Interrupt>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Stopped,
    Failed(String),
}

/// Connection parameters a strategy requires.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectProfile {
    pub clean_session: bool,
    pub will: Option<WillMessage>,
}

/// Everything the sessions of one job share.
pub struct SessionEnv {
    pub job_id: String,
    pub spec: Arc<TestSpec>,
    pub config: Arc<EngineConfig>,
    pub metrics: Arc<JobMetrics>,
    pub safety: Arc<SafetyController>,
    pub connector: Arc<dyn TransportConnector>,
    pub cancel: CancellationToken,
}

pub struct DeviceSession {
    index: u32,
    device_id: String,
    seed: u64,
    state: ConnectionState,
    sequence: u64,
    transport: Box<dyn DeviceTransport>,
    sensor: SensorGenerator,
    profile: ConnectProfile,
    env: Arc<SessionEnv>,
    clock: Option<Instant>,
    last_retained_flag: bool,
    last_will_registered: bool,
}

impl DeviceSession {
    pub fn new(
        index: u32,
        env: Arc<SessionEnv>,
        profile: impl FnOnce(&str) -> ConnectProfile,
    ) -> Result<Self, EngineError> {
        let seed = sensor::device_seed(&env.job_id, index);
        let device_id = sensor::device_id(index, seed);
        let transport = env
            .connector
            .create(env.spec.protocol, &env.spec.broker_url)?;
        let sensor = SensorGenerator::new(seed, env.spec.anomaly.clone());
        let profile = profile(&device_id);
        Ok(Self {
            index,
            device_id,
            seed,
            state: ConnectionState::Disconnected,
            sequence: 0,
            transport,
            sensor,
            profile,
            env,
            clock: None,
            last_retained_flag: false,
            last_will_registered: false,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn spec(&self) -> &TestSpec {
        &self.env.spec
    }

    pub fn env(&self) -> &Arc<SessionEnv> {
        &self.env
    }

    pub fn metrics(&self) -> &JobMetrics {
        &self.env.metrics
    }

    pub fn last_retained_flag(&self) -> bool {
        self.last_retained_flag
    }

    pub fn last_will_registered(&self) -> bool {
        self.last_will_registered
    }

    fn cancel(&self) -> CancellationToken {
        self.env.cancel.clone()
    }

    /// Time since the session's clock started (first successful connect).
    pub fn elapsed(&self) -> Duration {
        self.clock.map_or(Duration::ZERO, |start| start.elapsed())
    }

    fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            client_id: self.device_id.clone(),
            clean_session: self.profile.clean_session,
            keep_alive: KEEP_ALIVE,
            will: self.profile.will.clone(),
        }
    }

    /// A single connection attempt, throttled by the global connect limiter.
    async fn connect_once(&mut self) -> Step<ConnectAck> {
        let cancel = self.cancel();
        self.state = ConnectionState::Connecting;
        if !self.env.safety.connect_limiter().acquire(&cancel).await {
            self.state = ConnectionState::Disconnected;
            return Err(Interrupt::Cancelled);
        }

        self.env.metrics.record_connect_attempt();
        let options = self.connect_options();
        let timeout = self.env.config.connect_timeout();
        let result = tokio::select! {
            _ = cancel.cancelled() => {
                self.state = ConnectionState::Disconnected;
                return Err(Interrupt::Cancelled);
            }
            r = tokio::time::timeout(timeout, self.transport.connect(&options)) => r,
        };

        match result {
            Ok(Ok(ack)) => {
                self.state = ConnectionState::Connected;
                self.last_will_registered = options.will.is_some();
                self.env.metrics.record_connect_success();
                if self.clock.is_none() {
                    self.clock = Some(Instant::now());
                }
                Ok(ack)
            }
            Ok(Err(e)) => {
                self.state = ConnectionState::Disconnected;
                self.env.metrics.record_connect_failure(&e.to_string());
                Err(Interrupt::Fatal(e))
            }
            Err(_) => {
                self.state = ConnectionState::Disconnected;
                let err = EngineError::Timeout(format!(
                    "{} connect timed out after {:?}",
                    self.device_id, timeout
                ));
                self.env.metrics.record_connect_failure(&err.to_string());
                Err(Interrupt::Fatal(err))
            }
        }
    }

    /// Connect, retrying up to `retries` more times with the configured back-off.
    pub async fn connect_with_retry(&mut self, retries: u32) -> Step<ConnectAck> {
        let mut attempt = 0;
        loop {
            match self.connect_once().await {
                Ok(ack) => return Ok(ack),
                Err(Interrupt::Fatal(e)) if attempt < retries => {
                    attempt += 1;
                    debug!(device = %self.device_id, attempt, error = %e, "connect failed, retrying");
                    self.sleep(self.env.config.reconnect_backoff()).await?;
                }
                Err(Interrupt::Fatal(e)) => {
                    self.state = ConnectionState::Failed;
                    return Err(Interrupt::Fatal(EngineError::ConnectionFailure(format!(
                        "{}: {}",
                        self.device_id, e
                    ))));
                }
                Err(Interrupt::Cancelled) => return Err(Interrupt::Cancelled),
            }
        }
    }

    /// Drop the connection cleanly and establish it again.
    pub async fn reconnect(&mut self, retries: u32) -> Step<ConnectAck> {
        self.disconnect().await;
        let ack = self.connect_with_retry(retries).await?;
        self.env.metrics.record_reconnect();
        Ok(ack)
    }

    /// Graceful disconnect. Errors are counted, not propagated.
    pub async fn disconnect(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        if let Err(e) = self.transport.disconnect().await {
            self.env.metrics.record_error(&e.to_string());
            self.close_ungracefully();
            return;
        }
        self.state = ConnectionState::Disconnected;
        self.env.metrics.record_disconnect();
    }

    /// Drop the connection without a protocol goodbye. A registered will
    /// fires, so it is counted as triggered.
    pub fn abort(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        self.close_ungracefully();
    }

    fn close_ungracefully(&mut self) {
        self.transport.abort();
        self.state = ConnectionState::Disconnected;
        self.env.metrics.record_disconnect();
        if self.last_will_registered {
            self.env.metrics.record_lwt_triggered();
        }
    }

    /// Mark the session as abandoned after an unrecoverable error.
    pub fn fail(&mut self, error: &EngineError) {
        self.abort();
        self.state = ConnectionState::Failed;
        self.env.metrics.record_device_failed(&error.to_string());
    }

    /// Sleep until `offset` past the session start, or until cancelled.
    pub async fn wait_until(&self, offset: Duration) -> Step<()> {
        let start = self.clock.unwrap_or_else(Instant::now);
        let cancel = self.cancel();
        tokio::select! {
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep_until(start + offset) => Ok(()),
        }
    }

    pub async fn sleep(&self, duration: Duration) -> Step<()> {
        let cancel = self.cancel();
        tokio::select! {
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Next sequence number and the padded sensor payload scheduled at `offset`.
    pub fn next_payload(&mut self, offset: Duration) -> Step<(u64, Vec<u8>)> {
        self.next_sequence();
        let before = self.sensor.anomalies_injected();
        let reading = self.sensor.next_reading(offset);
        let injected = self.sensor.anomalies_injected() - before;
        if injected > 0 {
            self.env.metrics.record_anomalies(injected);
        }
        let payload = sensor::encode_payload(
            &self.device_id,
            self.sequence,
            chrono::Utc::now().timestamp_millis(),
            &reading,
            self.env.spec.message_size_bytes as usize,
        )
        .map_err(|e| EngineError::Protocol(format!("payload encoding failed: {}", e)))?;
        Ok((self.sequence, payload))
    }

    /// Publish under the global publish limiter and the configured retry policy.
    /// Returns whether the broker acknowledged it; failures are counted.
    pub async fn publish(&mut self, message: &OutboundMessage) -> Step<bool> {
        let delivered = deliver(&self.env, self.transport.as_mut(), message).await?;
        self.record_delivery(message, delivered)
    }

    /// Publish through a backend client, counted like a device publish.
    pub async fn publish_backend(
        &self,
        backend: &mut dyn DeviceTransport,
        message: &OutboundMessage,
    ) -> Step<bool> {
        let delivered = deliver(&self.env, backend, message).await?;
        match delivered {
            Ok(latency) => {
                self.env
                    .metrics
                    .record_publish(message.payload.len(), latency, self.index as usize);
                Ok(true)
            }
            Err(e) => {
                self.env.metrics.record_publish_failure(&e.to_string());
                Ok(false)
            }
        }
    }

    /// Publish through a backend client without touching the publish counters.
    /// Only a failure is recorded.
    pub async fn publish_unmetered(
        &self,
        backend: &mut dyn DeviceTransport,
        message: &OutboundMessage,
    ) -> Step<bool> {
        match deliver(&self.env, backend, message).await? {
            Ok(_) => Ok(true),
            Err(e) => {
                self.env.metrics.record_publish_failure(&e.to_string());
                Ok(false)
            }
        }
    }

    fn record_delivery(
        &mut self,
        message: &OutboundMessage,
        delivered: Result<Duration, EngineError>,
    ) -> Step<bool> {
        match delivered {
            Ok(latency) => {
                self.env
                    .metrics
                    .record_publish(message.payload.len(), latency, self.index as usize);
                if message.retain {
                    self.env.metrics.record_retained();
                }
                self.last_retained_flag = message.retain;
                Ok(true)
            }
            Err(e) => {
                self.env.metrics.record_publish_failure(&e.to_string());
                Ok(false)
            }
        }
    }

    /// Publish the next sensor reading on `topic` using the spec's QoS and flags.
    pub async fn publish_reading(&mut self, offset: Duration, topic: &str) -> Step<bool> {
        let (_, payload) = self.next_payload(offset)?;
        let message = self.outbound(topic, payload);
        self.publish(&message).await
    }

    pub fn outbound(&self, topic: &str, payload: Vec<u8>) -> OutboundMessage {
        let spec = &self.env.spec;
        OutboundMessage {
            topic: topic.to_string(),
            payload,
            qos: spec.qos,
            retain: spec.retain,
            expiry_seconds: spec.message_expiry_seconds,
        }
    }

    pub async fn subscribe(&mut self, filter: &str, qos: u8) -> Step<()> {
        let cancel = self.cancel();
        tokio::select! {
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            r = self.transport.subscribe(filter, qos) => r.map_err(Interrupt::Fatal),
        }
    }

    pub async fn receive(&mut self, timeout: Duration) -> Step<Option<InboundMessage>> {
        let cancel = self.cancel();
        tokio::select! {
            _ = cancel.cancelled() => Err(Interrupt::Cancelled),
            r = self.transport.receive(timeout) => r.map_err(Interrupt::Fatal),
        }
    }

    /// Open a separate client connection, used to play the backend side of a
    /// test. It is throttled like device connects but not counted in metrics.
    pub async fn open_backend_client(&self, suffix: &str) -> Step<Box<dyn DeviceTransport>> {
        let cancel = self.cancel();
        let env = &self.env;
        let mut transport = env.connector.create(env.spec.protocol, &env.spec.broker_url)?;
        if !env.safety.connect_limiter().acquire(&cancel).await {
            return Err(Interrupt::Cancelled);
        }
        let options = ConnectOptions {
            client_id: format!("{}-{}", self.device_id, suffix),
            clean_session: true,
            keep_alive: KEEP_ALIVE,
            will: None,
        };
        let timeout = env.config.connect_timeout();
        tokio::select! {
            _ = cancel.cancelled() => return Err(Interrupt::Cancelled),
            r = tokio::time::timeout(timeout, transport.connect(&options)) => match r {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(Interrupt::Fatal(e)),
                Err(_) => {
                    return Err(Interrupt::Fatal(EngineError::Timeout(format!(
                        "backend client for {} timed out",
                        self.device_id
                    ))))
                }
            },
        }
        Ok(transport)
    }
}

/// Throttled publish with retries. The outer error is cancellation; the inner
/// result is the acknowledgement latency or the last publish error.
async fn deliver(
    env: &SessionEnv,
    transport: &mut dyn DeviceTransport,
    message: &OutboundMessage,
) -> Step<Result<Duration, EngineError>> {
    let attempts = env.config.publish_retry.attempts().max(1);
    let mut last_error = EngineError::Protocol(format!("publish to {} not attempted", message.topic));
    for _ in 0..attempts {
        if !env.safety.publish_limiter().acquire(&env.cancel).await {
            return Err(Interrupt::Cancelled);
        }
        let started = Instant::now();
        let result = tokio::select! {
            _ = env.cancel.cancelled() => return Err(Interrupt::Cancelled),
            r = transport.publish(message) => r,
        };
        match result {
            Ok(()) => return Ok(Ok(started.elapsed())),
            Err(e) => last_error = e,
        }
    }
    Ok(Err(last_error))
}

/// A session dropped while connected (a forced termination) closes without a
/// goodbye, exactly like `abort`.
impl Drop for DeviceSession {
    fn drop(&mut self) {
        if self.state == ConnectionState::Connected {
            self.close_ungracefully();
        }
    }
}
