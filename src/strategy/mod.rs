// Test-type strategies
//
// A closed set of behaviours, one per test type, selected once when a job
// starts. Each one drives a single device session through a schedule of
// actions measured from the session's own clock.
pub mod schedule;

mod churn;
mod command;
mod lwt;
mod offline;
mod publishing;

use std::time::Duration;

pub use schedule::MessageSchedule;

use crate::pool::session::{ConnectProfile, DeviceSession, Step};
use crate::spec::{TestSpec, TestType};
use crate::transport::WillMessage;

pub const WILL_PAYLOAD: &[u8] = br#"{"online":false}"#;

pub fn status_topic(device_id: &str) -> String {
    format!("devices/{}/status", device_id)
}

pub fn commands_topic(device_id: &str) -> String {
    format!("devices/{}/commands", device_id)
}

pub fn responses_topic(device_id: &str) -> String {
    format!("devices/{}/responses", device_id)
}

pub fn downlink_topic(device_id: &str) -> String {
    format!("devices/{}/downlink", device_id)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Strategy {
    Telemetry(MessageSchedule),
    Burst(MessageSchedule),
    Churn { interval_secs: u32 },
    Retained,
    Command,
    Offline { offline_secs: u32 },
    Lwt,
}

impl Strategy {
    pub fn for_spec(spec: &TestSpec) -> Strategy {
        let runtime = spec.runtime_seconds;
        match spec.test_type {
            TestType::Telemetry => {
                Strategy::Telemetry(MessageSchedule::uniform(runtime, spec.publish_rate_per_device))
            }
            TestType::Burst => Strategy::Burst(MessageSchedule::burst(
                runtime,
                spec.burst_duration_seconds,
                spec.multiplier,
            )),
            TestType::Churn => Strategy::Churn {
                interval_secs: spec.churn_interval_seconds,
            },
            TestType::Retained => Strategy::Retained,
            TestType::Command => Strategy::Command,
            TestType::Offline => Strategy::Offline {
                offline_secs: spec.offline_seconds,
            },
            TestType::Lwt => Strategy::Lwt,
        }
    }

    pub fn test_type(&self) -> TestType {
        match self {
            Strategy::Telemetry(_) => TestType::Telemetry,
            Strategy::Burst(_) => TestType::Burst,
            Strategy::Churn { .. } => TestType::Churn,
            Strategy::Retained => TestType::Retained,
            Strategy::Command => TestType::Command,
            Strategy::Offline { .. } => TestType::Offline,
            Strategy::Lwt => TestType::Lwt,
        }
    }

    /// Session flags and will message the device must connect with.
    pub fn connect_profile(&self, spec: &TestSpec, device_id: &str) -> ConnectProfile {
        match self {
            Strategy::Churn { .. } | Strategy::Offline { .. } => ConnectProfile {
                clean_session: false,
                will: None,
            },
            Strategy::Lwt => ConnectProfile {
                clean_session: spec.clean_session,
                will: Some(WillMessage {
                    topic: status_topic(device_id),
                    payload: WILL_PAYLOAD.to_vec(),
                    qos: 1,
                    retain: true,
                }),
            },
            _ => ConnectProfile {
                clean_session: spec.clean_session,
                will: None,
            },
        }
    }

    /// Whether failed connects of this type are retried before giving up.
    pub fn retries_connects(&self) -> bool {
        matches!(self, Strategy::Churn { .. } | Strategy::Offline { .. })
    }

    /// Drive a connected session through the test type's schedule. Returns
    /// once the runtime has elapsed; the caller closes the connection.
    pub async fn run(&self, session: &mut DeviceSession) -> Step<()> {
        let runtime_secs = session.spec().runtime_seconds;
        match self {
            Strategy::Telemetry(schedule) | Strategy::Burst(schedule) => {
                publishing::run_schedule(session, schedule).await?
            }
            Strategy::Retained => publishing::run_retained(session, runtime_secs).await?,
            Strategy::Churn { interval_secs } => {
                churn::run(session, runtime_secs, *interval_secs).await?
            }
            Strategy::Command => command::run(session, runtime_secs).await?,
            Strategy::Offline { offline_secs } => {
                offline::run(session, runtime_secs, *offline_secs).await?
            }
            // the session ends at the abort
            Strategy::Lwt => return lwt::run(session, runtime_secs).await,
        }
        session
            .wait_until(Duration::from_secs(runtime_secs as u64))
            .await
    }
}
