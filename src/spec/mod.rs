// Test specification: the validated, immutable description of one load-test job.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;

use crate::error::EngineError;

pub const DEVICES_RANGE: RangeInclusive<u32> = 1..=100_000;
pub const RUNTIME_RANGE: RangeInclusive<u32> = 10..=3_600;
pub const CONNECT_RATE_RANGE: RangeInclusive<u32> = 1..=2_000;
pub const QOS_RANGE: RangeInclusive<u8> = 0..=2;
pub const MESSAGE_SIZE_RANGE: RangeInclusive<u32> = 1..=1_048_576;
pub const PUBLISH_RATE_RANGE: RangeInclusive<f64> = 0.1..=100.0;
pub const EXPIRY_RANGE: RangeInclusive<u32> = 1..=86_400;
pub const MULTIPLIER_RANGE: RangeInclusive<u32> = 1..=100;
pub const BURST_DURATION_RANGE: RangeInclusive<u32> = 1..=300;
pub const CHURN_INTERVAL_RANGE: RangeInclusive<u32> = 1..=300;
pub const OFFLINE_RANGE: RangeInclusive<u32> = 1..=60;

pub const DEVICE_ID_PLACEHOLDER: &str = "{deviceId}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Mqtt,
    MqttWs,
    Amqp,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::Mqtt
    }
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Mqtt => "mqtt",
            Protocol::MqttWs => "mqtt-ws",
            Protocol::Amqp => "amqp",
        }
    }

    /// URL schemes a broker address may use with this protocol.
    pub fn schemes(&self) -> &'static [&'static str] {
        match self {
            Protocol::Mqtt => &["mqtt", "mqtts"],
            Protocol::MqttWs => &["ws", "wss"],
            Protocol::Amqp => &["amqp", "amqps"],
        }
    }

    /// Retained messages, wills and persistent sessions are MQTT features.
    pub fn supports(&self, test_type: TestType) -> bool {
        match self {
            Protocol::Mqtt | Protocol::MqttWs => true,
            Protocol::Amqp => matches!(
                test_type,
                TestType::Telemetry | TestType::Burst | TestType::Churn | TestType::Command
            ),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum TestType {
    Telemetry,
    Burst,
    Churn,
    Retained,
    Command,
    Offline,
    Lwt,
}

impl Default for TestType {
    fn default() -> Self {
        TestType::Telemetry
    }
}

impl TestType {
    pub const ALL: [TestType; 7] = [
        TestType::Telemetry,
        TestType::Burst,
        TestType::Churn,
        TestType::Retained,
        TestType::Command,
        TestType::Offline,
        TestType::Lwt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestType::Telemetry => "telemetry",
            TestType::Burst => "burst",
            TestType::Churn => "churn",
            TestType::Retained => "retained",
            TestType::Command => "command",
            TestType::Offline => "offline",
            TestType::Lwt => "lwt",
        }
    }

    /// Parse the `{testType}` path segment of `POST /tests/{testType}`.
    pub fn from_path(segment: &str) -> Option<TestType> {
        TestType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == segment)
    }
}

impl fmt::Display for TestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyKind {
    Spike,
    Dropout,
    Drift,
    Stuck,
}

/// Probabilistic payload anomalies. Never changes how many messages are sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnomalyConfig {
    pub probability: f64,
    pub kinds: Vec<AnomalyKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TestSpec {
    pub protocol: Protocol,
    pub broker_url: String,
    pub test_type: TestType,
    pub devices: u32,
    pub connect_rate: u32,
    pub runtime_seconds: u32,
    pub topic_pattern: String,
    pub qos: u8,
    pub retain: bool,
    pub clean_session: bool,
    pub message_size_bytes: u32,
    pub publish_rate_per_device: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_expiry_seconds: Option<u32>,
    pub multiplier: u32,
    pub burst_duration_seconds: u32,
    pub churn_interval_seconds: u32,
    pub offline_seconds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<AnomalyConfig>,
}

impl Default for TestSpec {
    fn default() -> Self {
        Self {
            protocol: Protocol::default(),
            broker_url: String::new(),
            test_type: TestType::default(),
            devices: 10,
            connect_rate: 100,
            runtime_seconds: 60,
            topic_pattern: "devices/{deviceId}/telemetry".to_string(),
            qos: 1,
            retain: false,
            clean_session: true,
            message_size_bytes: 256,
            publish_rate_per_device: 1.0,
            message_expiry_seconds: None,
            multiplier: 10,
            burst_duration_seconds: 30,
            churn_interval_seconds: 10,
            offline_seconds: 5,
            anomaly: None,
        }
    }
}

/// Per-device and whole-job message accounting a correct run must reproduce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedCounts {
    pub messages_per_device: u64,
    pub reconnects_per_device: u64,
    pub lwt_per_device: u64,
    pub total_messages: u64,
    pub total_reconnects: u64,
    pub total_lwt: u64,
}

fn check_range<T: PartialOrd + fmt::Display>(
    errors: &mut Vec<String>,
    name: &str,
    value: T,
    range: &RangeInclusive<T>,
) {
    if !range.contains(&value) {
        errors.push(format!(
            "{} must be between {} and {} (got {})",
            name,
            range.start(),
            range.end(),
            value
        ));
    }
}

impl TestSpec {
    /// Parse a spec from a JSON body.
    pub fn from_json(json: &str) -> Result<TestSpec, EngineError> {
        serde_json::from_str(json)
            .map_err(|e| EngineError::Validation(format!("invalid test spec JSON: {}", e)))
    }

    /// Force the fields a test type depends on. Applied when a spec is submitted
    /// through `POST /tests/{testType}`.
    pub fn with_type_overrides(mut self, test_type: TestType) -> TestSpec {
        self.test_type = test_type;
        match test_type {
            TestType::Churn | TestType::Offline => self.clean_session = false,
            TestType::Retained => self.retain = true,
            _ => {}
        }
        self
    }

    /// Check every field against its documented range. All violations are reported.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        self.validate_broker_url(&mut errors);

        if !self.protocol.supports(self.test_type) {
            errors.push(format!(
                "testType {} is not supported over {}",
                self.test_type, self.protocol
            ));
        }

        check_range(&mut errors, "devices", self.devices, &DEVICES_RANGE);
        check_range(&mut errors, "connectRate", self.connect_rate, &CONNECT_RATE_RANGE);
        check_range(
            &mut errors,
            "runtimeSeconds",
            self.runtime_seconds,
            &RUNTIME_RANGE,
        );
        check_range(&mut errors, "qos", self.qos, &QOS_RANGE);
        check_range(
            &mut errors,
            "messageSizeBytes",
            self.message_size_bytes,
            &MESSAGE_SIZE_RANGE,
        );
        if self.publish_rate_per_device.is_nan() {
            errors.push("publishRatePerDevice must be a number".to_string());
        } else {
            check_range(
                &mut errors,
                "publishRatePerDevice",
                self.publish_rate_per_device,
                &PUBLISH_RATE_RANGE,
            );
        }
        if let Some(expiry) = self.message_expiry_seconds {
            check_range(&mut errors, "messageExpirySeconds", expiry, &EXPIRY_RANGE);
        }
        check_range(&mut errors, "multiplier", self.multiplier, &MULTIPLIER_RANGE);
        check_range(
            &mut errors,
            "burstDurationSeconds",
            self.burst_duration_seconds,
            &BURST_DURATION_RANGE,
        );
        check_range(
            &mut errors,
            "churnIntervalSeconds",
            self.churn_interval_seconds,
            &CHURN_INTERVAL_RANGE,
        );
        check_range(
            &mut errors,
            "offlineSeconds",
            self.offline_seconds,
            &OFFLINE_RANGE,
        );

        if self.topic_pattern.trim().is_empty() {
            errors.push("topicPattern must not be empty".to_string());
        }

        match self.test_type {
            TestType::Burst if self.burst_duration_seconds > self.runtime_seconds => {
                errors.push("burstDurationSeconds must not exceed runtimeSeconds".to_string());
            }
            TestType::Churn if self.churn_interval_seconds > self.runtime_seconds => {
                errors.push("churnIntervalSeconds must not exceed runtimeSeconds".to_string());
            }
            TestType::Offline => {
                if self.offline_seconds > self.runtime_seconds / 2 {
                    errors.push("offlineSeconds must not exceed runtimeSeconds / 2".to_string());
                }
                if self.qos == 0 {
                    errors.push("offline tests require qos 1 or 2".to_string());
                }
            }
            _ => {}
        }

        if let Some(anomaly) = &self.anomaly {
            if !(0.0..=1.0).contains(&anomaly.probability) {
                errors.push("anomaly.probability must be between 0 and 1".to_string());
            }
            if anomaly.kinds.is_empty() {
                errors.push("anomaly.kinds must not be empty".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    fn validate_broker_url(&self, errors: &mut Vec<String>) {
        if self.broker_url.is_empty() {
            errors.push("brokerUrl is required".to_string());
            return;
        }
        let Some((scheme, rest)) = self.broker_url.split_once("://") else {
            errors.push(format!("brokerUrl '{}' has no scheme", self.broker_url));
            return;
        };
        if !self.protocol.schemes().contains(&scheme) {
            errors.push(format!(
                "brokerUrl scheme '{}' does not match protocol {} (expected one of {})",
                scheme,
                self.protocol,
                self.protocol.schemes().join(", ")
            ));
        }
        let host = rest.split(['/', ':']).next().unwrap_or("");
        if host.is_empty() {
            errors.push("brokerUrl must include a host".to_string());
        }
    }

    /// Validate and convert the collected messages into a single error.
    pub fn ensure_valid(&self) -> Result<(), EngineError> {
        self.validate()
            .map_err(|errors| EngineError::Validation(errors.join("; ")))
    }

    pub fn render_topic(&self, device_id: &str) -> String {
        self.topic_pattern.replace(DEVICE_ID_PLACEHOLDER, device_id)
    }

    /// Number of telemetry messages at `publishRatePerDevice` over the whole runtime.
    pub fn telemetry_messages(&self) -> u64 {
        (self.runtime_seconds as f64 * self.publish_rate_per_device).round() as u64
    }

    pub fn expected_counts(&self) -> ExpectedCounts {
        let runtime = self.runtime_seconds as u64;
        let (messages, reconnects, lwt) = match self.test_type {
            TestType::Telemetry => (self.telemetry_messages(), 0, 0),
            TestType::Burst => {
                let burst = (self.burst_duration_seconds as u64).min(runtime);
                ((runtime - burst) + burst * self.multiplier as u64, 0, 0)
            }
            TestType::Churn => (0, runtime / self.churn_interval_seconds.max(1) as u64, 0),
            TestType::Retained => (runtime, 0, 0),
            TestType::Command => (runtime * 2, 0, 0),
            TestType::Offline => (runtime, 1, 0),
            TestType::Lwt => (runtime / 2, 0, 1),
        };
        let devices = self.devices as u64;
        ExpectedCounts {
            messages_per_device: messages,
            reconnects_per_device: reconnects,
            lwt_per_device: lwt,
            total_messages: messages * devices,
            total_reconnects: reconnects * devices,
            total_lwt: lwt * devices,
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn mqtt_spec() -> TestSpec {
        TestSpec {
            broker_url: "mqtt://localhost:1883".to_string(),
            ..TestSpec::default()
        }
    }

    // ===== Parsing and defaults =====

    #[test]
    fn test_minimal_json_uses_defaults() {
        let spec = TestSpec::from_json(r#"{"brokerUrl": "mqtt://localhost"}"#).unwrap();
        assert_eq!(spec.devices, 10);
        assert_eq!(spec.runtime_seconds, 60);
        assert_eq!(spec.qos, 1);
        assert_eq!(spec.topic_pattern, "devices/{deviceId}/telemetry");
        assert_eq!(spec.protocol, Protocol::Mqtt);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_camel_case_fields() {
        let json = r#"{"protocol": "mqtt-ws", "brokerUrl": "wss://b.example/mqtt",
            "testType": "burst", "publishRatePerDevice": 2.5, "burstDurationSeconds": 20}"#;
        let spec = TestSpec::from_json(json).unwrap();
        assert_eq!(spec.protocol, Protocol::MqttWs);
        assert_eq!(spec.test_type, TestType::Burst);
        assert_eq!(spec.publish_rate_per_device, 2.5);
        assert_eq!(spec.burst_duration_seconds, 20);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_malformed_json_is_validation_error() {
        let err = TestSpec::from_json("{devices: 3").unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn test_type_from_path() {
        assert_eq!(TestType::from_path("lwt"), Some(TestType::Lwt));
        assert_eq!(TestType::from_path("telemetry"), Some(TestType::Telemetry));
        assert_eq!(TestType::from_path("nope"), None);
    }

    #[test]
    fn test_type_overrides() {
        let churn = mqtt_spec().with_type_overrides(TestType::Churn);
        assert!(!churn.clean_session);
        let offline = mqtt_spec().with_type_overrides(TestType::Offline);
        assert!(!offline.clean_session);
        let retained = mqtt_spec().with_type_overrides(TestType::Retained);
        assert!(retained.retain);
        let telemetry = mqtt_spec().with_type_overrides(TestType::Telemetry);
        assert!(telemetry.clean_session);
        assert!(!telemetry.retain);
    }

    // ===== Validation =====

    #[test]
    fn test_devices_upper_bound() {
        let mut spec = mqtt_spec();
        spec.devices = 100_000;
        assert!(spec.validate().is_ok());
        spec.devices = 100_001;
        let errors = spec.validate().unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("devices must be between 1 and 100000"));
    }

    #[test]
    fn test_runtime_bounds() {
        let mut spec = mqtt_spec();
        spec.runtime_seconds = 9;
        assert!(spec.validate().is_err());
        spec.runtime_seconds = 3_601;
        assert!(spec.validate().is_err());
        spec.runtime_seconds = 10;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_collects_all_errors() {
        let mut spec = mqtt_spec();
        spec.devices = 0;
        spec.qos = 3;
        spec.message_size_bytes = 2_000_000;
        spec.publish_rate_per_device = 0.01;
        let errors = spec.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_missing_broker_url() {
        let spec = TestSpec::default();
        let errors = spec.validate().unwrap_err();
        assert!(errors.iter().any(|e| e == "brokerUrl is required"));
    }

    #[test]
    fn test_broker_scheme_must_match_protocol() {
        let mut spec = mqtt_spec();
        spec.broker_url = "amqp://localhost:5672".to_string();
        assert!(spec.validate().is_err());
        spec.protocol = Protocol::Amqp;
        assert!(spec.validate().is_ok());
        spec.broker_url = "amqp://".to_string();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_amqp_rejects_mqtt_only_types() {
        for test_type in [TestType::Retained, TestType::Offline, TestType::Lwt] {
            let spec = TestSpec {
                protocol: Protocol::Amqp,
                broker_url: "amqps://mq.local".to_string(),
                ..TestSpec::default()
            }
            .with_type_overrides(test_type);
            assert!(spec.validate().is_err(), "{} over amqp", test_type);
        }
    }

    #[test]
    fn test_burst_window_longer_than_runtime() {
        let mut spec = mqtt_spec().with_type_overrides(TestType::Burst);
        spec.runtime_seconds = 20;
        spec.burst_duration_seconds = 30;
        let errors = spec.validate().unwrap_err();
        assert!(errors[0].contains("burstDurationSeconds"));
    }

    #[test]
    fn test_offline_needs_qos_and_room() {
        let mut spec = mqtt_spec().with_type_overrides(TestType::Offline);
        spec.runtime_seconds = 10;
        spec.offline_seconds = 5;
        assert!(spec.validate().is_ok());
        spec.offline_seconds = 6;
        assert!(spec.validate().is_err());
        spec.offline_seconds = 5;
        spec.qos = 0;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_anomaly_validation() {
        let mut spec = mqtt_spec();
        spec.anomaly = Some(AnomalyConfig {
            probability: 1.5,
            kinds: vec![],
        });
        assert_eq!(spec.validate().unwrap_err().len(), 2);
    }

    #[test]
    fn test_nan_rate_rejected() {
        let mut spec = mqtt_spec();
        spec.publish_rate_per_device = f64::NAN;
        assert!(spec.validate().is_err());
    }

    // ===== Expected accounting =====

    #[test]
    fn test_expected_telemetry() {
        let spec = TestSpec {
            devices: 100,
            runtime_seconds: 60,
            ..mqtt_spec()
        };
        assert_eq!(spec.expected_counts().total_messages, 6_000);
    }

    #[test]
    fn test_expected_burst() {
        let spec = TestSpec {
            devices: 1_000,
            runtime_seconds: 120,
            multiplier: 10,
            burst_duration_seconds: 30,
            ..mqtt_spec()
        }
        .with_type_overrides(TestType::Burst);
        let counts = spec.expected_counts();
        assert_eq!(counts.messages_per_device, 390);
        assert_eq!(counts.total_messages, 390_000);
    }

    #[test]
    fn test_expected_churn_command_lwt() {
        let churn = TestSpec {
            devices: 500,
            runtime_seconds: 120,
            ..mqtt_spec()
        }
        .with_type_overrides(TestType::Churn);
        assert_eq!(churn.expected_counts().reconnects_per_device, 12);

        let command = TestSpec {
            devices: 50,
            runtime_seconds: 60,
            ..mqtt_spec()
        }
        .with_type_overrides(TestType::Command);
        assert_eq!(command.expected_counts().messages_per_device, 120);

        let lwt = TestSpec {
            devices: 100,
            runtime_seconds: 300,
            ..mqtt_spec()
        }
        .with_type_overrides(TestType::Lwt);
        assert_eq!(lwt.expected_counts().total_lwt, 100);
    }

    #[test]
    fn test_render_topic() {
        let spec = mqtt_spec();
        assert_eq!(
            spec.render_topic("device-00001-abcd"),
            "devices/device-00001-abcd/telemetry"
        );
    }

    // ===== Property-Based Tests =====

    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_generated_specs_validate(spec in generators::arb_valid_spec()) {
            prop_assert!(spec.validate().is_ok(), "{:?}", spec.validate());
        }

        #[test]
        fn prop_devices_above_cap_always_rejected(extra in 1u32..1_000_000) {
            let spec = TestSpec { devices: 100_000 + extra, ..mqtt_spec() };
            prop_assert!(spec.validate().is_err());
        }

        #[test]
        fn prop_json_roundtrip_preserves_spec(spec in generators::arb_valid_spec()) {
            let json = serde_json::to_string(&spec).unwrap();
            let parsed = TestSpec::from_json(&json).unwrap();
            prop_assert_eq!(parsed.devices, spec.devices);
            prop_assert_eq!(parsed.test_type, spec.test_type);
            prop_assert_eq!(parsed.clean_session, spec.clean_session);
        }
    }
}
