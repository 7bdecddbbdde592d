// Telemetry, burst and retained: plain publishing on a fixed schedule.
use crate::pool::session::{DeviceSession, Step};
use crate::transport::OutboundMessage;

use super::schedule::MessageSchedule;
use super::status_topic;

/// Publish one sensor reading on the spec topic at every scheduled offset.
pub(super) async fn run_schedule(session: &mut DeviceSession, schedule: &MessageSchedule) -> Step<()> {
    let topic = session.spec().render_topic(session.device_id());
    for offset in schedule.iter() {
        session.wait_until(offset).await?;
        session.publish_reading(offset, &topic).await?;
    }
    Ok(())
}

/// One retained status message per second.
pub(super) async fn run_retained(session: &mut DeviceSession, runtime_secs: u32) -> Step<()> {
    let topic = status_topic(session.device_id());
    for offset in MessageSchedule::per_second(runtime_secs as u64).iter() {
        session.wait_until(offset).await?;
        let (_, payload) = session.next_payload(offset)?;
        let message = OutboundMessage {
            qos: 1,
            retain: true,
            ..session.outbound(&topic, payload)
        };
        session.publish(&message).await?;
    }
    Ok(())
}
