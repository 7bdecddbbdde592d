// Churn: cycle the connection at a fixed interval.
use crate::pool::session::{DeviceSession, Step};

use super::schedule::churn_offsets;

pub(super) async fn run(session: &mut DeviceSession, runtime_secs: u32, interval_secs: u32) -> Step<()> {
    let retries = session.env().config.connect_retries;
    for offset in churn_offsets(runtime_secs, interval_secs) {
        session.wait_until(offset).await?;
        session.reconnect(retries).await?;
    }
    Ok(())
}
