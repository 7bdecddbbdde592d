// Seeded sensor readings and JSON payload encoding for simulated devices.
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::f64::consts::TAU;
use std::time::Duration;

use crate::spec::{AnomalyConfig, AnomalyKind};

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

const WARMING_PER_HOUR: f64 = 5.0;
const HUMIDITY_CYCLE_SECS: f64 = 300.0;
const HUMIDITY_AMPLITUDE: f64 = 10.0;

/// `,"padding":""` added around the filler string.
const PADDING_OVERHEAD: usize = 13;

/// Deterministic 64-bit seed for one device of one job (FNV-1a).
pub fn device_seed(job_id: &str, device_index: u32) -> u64 {
    let mut hash = FNV_OFFSET;
    for byte in job_id
        .as_bytes()
        .iter()
        .chain(device_index.to_le_bytes().iter())
    {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// `device-{index:05}-{suffix}` with a four-letter suffix taken from the seed.
pub fn device_id(device_index: u32, seed: u64) -> String {
    let suffix: String = (0..4)
        .map(|i| (b'a' + ((seed >> (i * 8)) % 26) as u8) as char)
        .collect();
    format!("device-{:05}-{}", device_index, suffix)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anomaly: Option<AnomalyKind>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryPayload<'a> {
    device_id: &'a str,
    sequence: u64,
    timestamp: i64,
    #[serde(flatten)]
    reading: &'a SensorReading,
    #[serde(skip_serializing_if = "Option::is_none")]
    padding: Option<String>,
}

/// Per-device reading source. Same seed and same call sequence produce the
/// same readings.
pub struct SensorGenerator {
    rng: SmallRng,
    temperature_base: f64,
    humidity_base: f64,
    pressure_base: f64,
    drift_offset: f64,
    last: Option<SensorReading>,
    anomaly: Option<AnomalyConfig>,
    anomalies_injected: u64,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl SensorGenerator {
    pub fn new(seed: u64, anomaly: Option<AnomalyConfig>) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            temperature_base: 10.0 + (seed % 20) as f64,
            humidity_base: 35.0 + (seed % 30) as f64,
            pressure_base: 1003.0 + (seed % 20) as f64,
            drift_offset: 0.0,
            last: None,
            anomaly: anomaly.filter(|a| a.probability > 0.0 && !a.kinds.is_empty()),
            anomalies_injected: 0,
        }
    }

    pub fn baseline(&self) -> (f64, f64, f64) {
        (self.temperature_base, self.humidity_base, self.pressure_base)
    }

    pub fn anomalies_injected(&self) -> u64 {
        self.anomalies_injected
    }

    /// Reading for a message scheduled `elapsed` into the session.
    pub fn next_reading(&mut self, elapsed: Duration) -> SensorReading {
        let secs = elapsed.as_secs_f64();
        let temperature = self.temperature_base
            + WARMING_PER_HOUR * secs / 3600.0
            + self.drift_offset
            + self.rng.gen_range(-0.5..=0.5);
        let humidity = (self.humidity_base
            + HUMIDITY_AMPLITUDE * (TAU * secs / HUMIDITY_CYCLE_SECS).sin()
            + self.rng.gen_range(-2.0..=2.0))
        .clamp(0.0, 100.0);
        let pressure = self.pressure_base + self.rng.gen_range(-0.5..=0.5);

        let mut reading = SensorReading {
            temperature: Some(round2(temperature)),
            humidity: Some(round2(humidity)),
            pressure: Some(round2(pressure)),
            anomaly: None,
        };

        if let Some(kind) = self.roll_anomaly() {
            self.anomalies_injected += 1;
            reading = self.apply_anomaly(kind, reading);
        }

        self.last = Some(reading);
        reading
    }

    fn roll_anomaly(&mut self) -> Option<AnomalyKind> {
        let config = self.anomaly.as_ref()?;
        if !self.rng.gen_bool(config.probability.clamp(0.0, 1.0)) {
            return None;
        }
        config.kinds.choose(&mut self.rng).copied()
    }

    fn apply_anomaly(&mut self, kind: AnomalyKind, normal: SensorReading) -> SensorReading {
        match kind {
            AnomalyKind::Spike => {
                let jump = self.rng.gen_range(20.0..=40.0);
                SensorReading {
                    temperature: normal.temperature.map(|t| round2(t + jump)),
                    anomaly: Some(kind),
                    ..normal
                }
            }
            AnomalyKind::Dropout => SensorReading {
                temperature: None,
                humidity: None,
                pressure: None,
                anomaly: Some(kind),
            },
            AnomalyKind::Drift => {
                let step = self.rng.gen_range(0.5..=2.0);
                self.drift_offset += step;
                SensorReading {
                    temperature: normal.temperature.map(|t| round2(t + step)),
                    anomaly: Some(kind),
                    ..normal
                }
            }
            AnomalyKind::Stuck => match self.last {
                Some(previous) => SensorReading {
                    anomaly: Some(kind),
                    ..previous
                },
                None => SensorReading {
                    anomaly: Some(kind),
                    ..normal
                },
            },
        }
    }
}

/// Encode a telemetry payload, padded with filler up to `target_size` bytes
/// when the body is smaller.
pub fn encode_payload(
    device_id: &str,
    sequence: u64,
    timestamp_ms: i64,
    reading: &SensorReading,
    target_size: usize,
) -> serde_json::Result<Vec<u8>> {
    let mut payload = TelemetryPayload {
        device_id,
        sequence,
        timestamp: timestamp_ms,
        reading,
        padding: None,
    };
    let mut body = serde_json::to_vec(&payload)?;
    if body.len() >= target_size {
        return Ok(body);
    }
    if body.len() + PADDING_OVERHEAD > target_size {
        // too close for a padding field; trailing whitespace keeps the JSON valid
        body.resize(target_size, b' ');
        return Ok(body);
    }
    payload.padding = Some("x".repeat(target_size - body.len() - PADDING_OVERHEAD));
    serde_json::to_vec(&payload)
}
