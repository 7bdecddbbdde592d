// Device transport abstraction
//
// The engine never speaks MQTT or AMQP itself. Wire clients implement
// `DeviceTransport` and are produced per session by a `TransportConnector`.
pub mod sim;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::error::EngineError;
use crate::spec::Protocol;

pub type TransportFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EngineError>> + Send + 'a>>;

/// Message the broker publishes on the client's behalf after an ungraceful disconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub client_id: String,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub will: Option<WillMessage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectAck {
    /// The broker resumed a stored session for this client.
    pub session_present: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub expiry_seconds: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retained: bool,
}

/// One client connection to a broker.
pub trait DeviceTransport: Send + Sync {
    fn connect<'a>(&'a mut self, options: &'a ConnectOptions) -> TransportFuture<'a, ConnectAck>;

    /// Resolves once the broker acknowledged the message (immediately for QoS 0).
    fn publish<'a>(&'a mut self, message: &'a OutboundMessage) -> TransportFuture<'a, ()>;

    fn subscribe<'a>(&'a mut self, filter: &'a str, qos: u8) -> TransportFuture<'a, ()>;

    /// Next delivered message, or `None` if nothing arrived within `timeout`.
    fn receive<'a>(&'a mut self, timeout: Duration) -> TransportFuture<'a, Option<InboundMessage>>;

    /// Graceful close (MQTT DISCONNECT, AMQP link/session close).
    fn disconnect<'a>(&'a mut self) -> TransportFuture<'a, ()>;

    /// Drop the connection without a protocol-level goodbye.
    fn abort(&mut self);

    fn is_connected(&self) -> bool;
}

/// Creates transports for the sessions of a job.
pub trait TransportConnector: Send + Sync {
    /// Checked once before a job ramps up; an error here fails the job.
    fn prepare(&self, protocol: Protocol, broker_url: &str) -> Result<(), EngineError> {
        let _ = (protocol, broker_url);
        Ok(())
    }

    fn create(
        &self,
        protocol: Protocol,
        broker_url: &str,
    ) -> Result<Box<dyn DeviceTransport>, EngineError>;
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
