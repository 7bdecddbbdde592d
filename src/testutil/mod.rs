use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineError;
use crate::spec::{Protocol, TestSpec, TestType};
use crate::transport::{
    ConnectAck, ConnectOptions, DeviceTransport, InboundMessage, OutboundMessage,
    TransportConnector, TransportFuture,
};

/// テスト用の共通モックトランスポートの共有状態
/// - 接続・送信メッセージの記録
/// - 送信カウント
/// - オプションの失敗注入
#[derive(Default)]
pub struct MockLog {
    pub connects: Mutex<Vec<ConnectOptions>>,
    pub protocols: Mutex<Vec<(Protocol, String)>>,
    pub published: Mutex<Vec<(String, OutboundMessage)>>,
    pub publish_count: AtomicUsize,
    pub should_fail: AtomicBool,
}

impl MockLog {
    /// should_fail フラグを設定する
    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::Relaxed);
    }

    /// 送信成功したメッセージ数を返す
    pub fn published_count(&self) -> usize {
        self.published.lock().len()
    }

    /// 指定クライアントが送信したペイロードをJSONとして返す
    pub fn payloads_of(&self, client_id: &str) -> Vec<serde_json::Value> {
        self.published
            .lock()
            .iter()
            .filter(|(id, _)| id == client_id)
            .filter_map(|(_, m)| serde_json::from_slice(&m.payload).ok())
            .collect()
    }

    pub fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .connects
            .lock()
            .iter()
            .map(|o| o.client_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Broker-less transport: acknowledges everything and never delivers.
pub struct MockTransport {
    log: Arc<MockLog>,
    client_id: Option<String>,
}

impl MockTransport {
    pub fn new(log: Arc<MockLog>) -> Self {
        Self {
            log,
            client_id: None,
        }
    }
}

impl DeviceTransport for MockTransport {
    fn connect<'a>(&'a mut self, options: &'a ConnectOptions) -> TransportFuture<'a, ConnectAck> {
        Box::pin(async move {
            self.log.connects.lock().push(options.clone());
            self.client_id = Some(options.client_id.clone());
            Ok(ConnectAck {
                session_present: false,
            })
        })
    }

    fn publish<'a>(&'a mut self, message: &'a OutboundMessage) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.log.publish_count.fetch_add(1, Ordering::Relaxed);
            if self.log.should_fail.load(Ordering::Relaxed) {
                return Err(EngineError::Protocol("mock failure".to_string()));
            }
            let client_id = self
                .client_id
                .clone()
                .ok_or_else(|| EngineError::Protocol("not connected".to_string()))?;
            self.log.published.lock().push((client_id, message.clone()));
            Ok(())
        })
    }

    fn subscribe<'a>(&'a mut self, _filter: &'a str, _qos: u8) -> TransportFuture<'a, ()> {
        Box::pin(async move { Ok(()) })
    }

    fn receive<'a>(&'a mut self, timeout: Duration) -> TransportFuture<'a, Option<InboundMessage>> {
        Box::pin(async move {
            tokio::time::sleep(timeout).await;
            Ok(None)
        })
    }

    fn disconnect<'a>(&'a mut self) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            self.client_id = None;
            Ok(())
        })
    }

    fn abort(&mut self) {
        self.client_id = None;
    }

    fn is_connected(&self) -> bool {
        self.client_id.is_some()
    }
}

/// Hands out `MockTransport`s that share one log.
#[derive(Clone, Default)]
pub struct MockConnector {
    pub log: Arc<MockLog>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransportConnector for MockConnector {
    fn create(
        &self,
        protocol: Protocol,
        broker_url: &str,
    ) -> Result<Box<dyn DeviceTransport>, EngineError> {
        self.log
            .protocols
            .lock()
            .push((protocol, broker_url.to_string()));
        Ok(Box::new(MockTransport::new(Arc::clone(&self.log))))
    }
}

/// A valid spec against the simulated broker.
pub fn sim_spec(test_type: TestType, devices: u32, runtime_seconds: u32) -> TestSpec {
    TestSpec {
        broker_url: "mqtt://sim".to_string(),
        devices,
        runtime_seconds,
        ..TestSpec::default()
    }
    .with_type_overrides(test_type)
}
