// Offline backlog: a persistent-session device drops off mid-run, buffers its
// readings locally and on return expects the broker to replay what was sent
// to it while away.
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::pool::session::{DeviceSession, Step};
use crate::transport::OutboundMessage;

use super::downlink_topic;
use super::schedule::{offline_window, MessageSchedule};

/// How long to wait for each further replayed message after reconnecting.
const REPLAY_QUIET: Duration = Duration::from_millis(200);

pub(super) async fn run(session: &mut DeviceSession, runtime_secs: u32, offline_secs: u32) -> Step<()> {
    let device_id = session.device_id().to_string();
    let topic = session.spec().render_topic(&device_id);
    let downlink = downlink_topic(&device_id);
    let qos = session.spec().qos;
    let retries = session.env().config.connect_retries;

    session.subscribe(&downlink, qos).await?;

    let (start, end) = offline_window(runtime_secs, offline_secs);
    let (offline_from, offline_until) = (Duration::from_secs(start), Duration::from_secs(end));
    let schedule = MessageSchedule::per_second(runtime_secs as u64);

    for offset in schedule.iter().take_while(|o| *o < offline_from) {
        session.wait_until(offset).await?;
        session.publish_reading(offset, &topic).await?;
    }

    session.wait_until(offline_from).await?;
    session.disconnect().await;
    debug!(device = %device_id, offline_secs, "device offline");

    let mut backend = session.open_backend_client("downlink").await?;
    let mut backlog = Vec::new();
    let mut queued_sent = 0u64;
    for offset in schedule
        .iter()
        .skip_while(|o| *o < offline_from)
        .take_while(|o| *o < offline_until)
    {
        session.wait_until(offset).await?;
        let (_, payload) = session.next_payload(offset)?;
        backlog.push(payload);

        let queued = OutboundMessage {
            topic: downlink.clone(),
            payload: json!({ "queued": queued_sent, "deviceId": device_id })
                .to_string()
                .into_bytes(),
            qos,
            retain: false,
            expiry_seconds: session.spec().message_expiry_seconds,
        };
        if session.publish_unmetered(backend.as_mut(), &queued).await? {
            queued_sent += 1;
        }
    }
    backend.abort();

    session.wait_until(offline_until).await?;
    let ack = session.reconnect(retries).await?;
    if !ack.session_present {
        session
            .metrics()
            .record_publish_failure(&format!("{}: broker did not resume the session", device_id));
    }

    let mut replayed = 0u64;
    while let Some(message) = session.receive(REPLAY_QUIET).await? {
        if message.topic == downlink {
            replayed += 1;
        } else {
            session.metrics().record_received();
        }
    }
    session.metrics().record_replayed(replayed);
    if replayed < queued_sent {
        session.metrics().record_publish_failure(&format!(
            "{}: {} of {} queued messages replayed",
            device_id, replayed, queued_sent
        ));
    }

    for payload in backlog {
        let message = session.outbound(&topic, payload);
        session.publish(&message).await?;
    }

    for offset in schedule.iter().skip_while(|o| *o < offline_until) {
        session.wait_until(offset).await?;
        session.publish_reading(offset, &topic).await?;
    }
    Ok(())
}
