// Command/response: the backend issues one command per second on the device's
// command topic and the device answers on its response topic.
use serde_json::json;
use std::time::Duration;

use crate::pool::session::{DeviceSession, Step};
use crate::transport::OutboundMessage;

use super::schedule::MessageSchedule;
use super::{commands_topic, responses_topic};

const TICK: Duration = Duration::from_secs(1);

pub(super) async fn run(session: &mut DeviceSession, runtime_secs: u32) -> Step<()> {
    let device_id = session.device_id().to_string();
    let commands = commands_topic(&device_id);
    let responses = responses_topic(&device_id);
    let qos = session.spec().qos;

    session.subscribe(&commands, qos).await?;
    let mut backend = session.open_backend_client("backend").await?;

    for (command_id, offset) in MessageSchedule::per_second(runtime_secs as u64)
        .iter()
        .enumerate()
    {
        session.wait_until(offset).await?;
        let command = OutboundMessage {
            retain: false,
            ..session.outbound(
                &commands,
                json!({ "commandId": command_id, "action": "read_sensors" })
                    .to_string()
                    .into_bytes(),
            )
        };
        if !session.publish_backend(backend.as_mut(), &command).await? {
            continue;
        }

        if !await_command(session, &commands, offset + TICK).await? {
            session
                .metrics()
                .record_publish_failure(&format!("{}: command {} not received", device_id, command_id));
            continue;
        }

        let sequence = session.next_sequence();
        let response = OutboundMessage {
            retain: false,
            ..session.outbound(
                &responses,
                json!({
                    "commandId": command_id,
                    "deviceId": device_id,
                    "sequence": sequence,
                    "status": "ok",
                })
                .to_string()
                .into_bytes(),
            )
        };
        session.publish(&response).await?;
    }

    backend.abort();
    Ok(())
}

/// Wait for the next message on `topic`, no later than `deadline` past the
/// session start. Returns whether it arrived.
async fn await_command(session: &mut DeviceSession, topic: &str, deadline: Duration) -> Step<bool> {
    loop {
        let remaining = deadline.saturating_sub(session.elapsed());
        if remaining.is_zero() {
            return Ok(false);
        }
        match session.receive(remaining).await? {
            Some(message) if message.topic == topic => {
                session.metrics().record_command_received();
                return Ok(true);
            }
            Some(_) => session.metrics().record_received(),
            None => return Ok(false),
        }
    }
}
