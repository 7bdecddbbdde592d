// Last will: publish telemetry, then vanish without a DISCONNECT once.
use crate::pool::session::{DeviceSession, Step};

use super::schedule::{lwt_abort_offset, MessageSchedule};

pub(super) async fn run(session: &mut DeviceSession, runtime_secs: u32) -> Step<()> {
    let topic = session.spec().render_topic(session.device_id());
    let abort_at = lwt_abort_offset(runtime_secs);
    for offset in MessageSchedule::per_second(runtime_secs as u64)
        .iter()
        .take_while(|o| *o < abort_at)
    {
        session.wait_until(offset).await?;
        session.publish_reading(offset, &topic).await?;
    }

    session.wait_until(abort_at).await?;
    // counts the will as triggered
    session.abort();
    Ok(())
}
