//! In-process test harness: impaired links and a loopback session

pub mod link;
pub mod session;

use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::info;

pub use link::{lossy_link, LinkConditions, LinkError, LinkReceiver, LinkSender};
pub use session::{LoopbackSession, SessionConfig, SessionError, SessionReport};

/// Step `session` at its tick rate in real time for `ticks` ticks
pub async fn run_realtime(
    session: &mut LoopbackSession,
    ticks: u64,
) -> Result<SessionReport, SessionError> {
    let tick_duration = Duration::from_secs_f64(session.config().tick_interval());
    let mut ticker = interval(tick_duration);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        "Loopback session started at {} Hz for {} ticks",
        session.config().tick_rate,
        ticks
    );

    for _ in 0..ticks {
        ticker.tick().await;
        session.step()?;
    }

    let report = session.report();
    info!(
        "Loopback session finished after {} ticks ({:.2}s simulated)",
        report.ticks, report.elapsed
    );
    Ok(report)
}
