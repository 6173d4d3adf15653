//! Host loop: drives orchestrator ticks at a fixed interval.
//!
//! Ticks run on the loop's task, one at a time. When a tick overruns its
//! period the missed ticks are skipped, never queued, so a slow device read
//! can delay the loop but never makes it re-enter.
//!
//! Device reads and the sensor settling delay block the calling thread. On a
//! multi-threaded runtime each tick therefore runs under
//! [`tokio::task::block_in_place`] so the worker's other tasks (the shutdown
//! signal among them) move to another thread while the read waits.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

use crate::calibration::CalibrationManager;
use crate::error::Result;
use crate::orchestrator::{Monitor, RecordingRun, TickOutcome};
use crate::pipeline::ProcessedReading;
use crate::session::ChannelSession;

/// Why a loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The requested number of ticks completed
    Completed,
    /// The shutdown future resolved
    Shutdown,
}

/// Run a blocking device call from async code.
///
/// Uses `block_in_place` on a multi-threaded runtime; on a current-thread
/// runtime (or outside any runtime) the call runs inline, as there is no
/// other worker to hand tasks to.
pub fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Tick `run` once per sampling period until `max_rows` rows are logged or
/// `shutdown` resolves.
///
/// The run is not stopped here; the caller decides when to call
/// [`RecordingRun::stop`]. A fatal tick error has already aborted the run
/// when it is returned.
pub async fn run_recording<S, F>(
    run: &mut RecordingRun<'_>,
    max_rows: Option<u64>,
    shutdown: S,
    mut on_tick: F,
) -> Result<StopReason>
where
    S: Future<Output = ()>,
    F: FnMut(&TickOutcome),
{
    let mut ticker = ticker(Duration::from_secs_f64(run.period_s()));
    tokio::pin!(shutdown);

    loop {
        if max_rows.is_some_and(|max| run.rows() >= max) {
            info!(rows = run.rows(), "Row limit reached");
            return Ok(StopReason::Completed);
        }
        tokio::select! {
            biased;
            () = &mut shutdown => {
                info!(rows = run.rows(), "Shutdown requested");
                return Ok(StopReason::Shutdown);
            }
            _ = ticker.tick() => {
                match blocking(|| run.tick()) {
                    Ok(outcome) => on_tick(&outcome),
                    Err(e) if run.is_finished() => return Err(e),
                    Err(e) => warn!(error = %e, "Tick failed"),
                }
            }
        }
    }
}

/// Poll `monitor` every interval until `count` readings are taken or
/// `shutdown` resolves.
pub async fn run_monitor<S, F>(
    monitor: &mut Monitor,
    session: &mut ChannelSession,
    calibration: &CalibrationManager,
    count: Option<u64>,
    shutdown: S,
    mut on_reading: F,
) -> Result<StopReason>
where
    S: Future<Output = ()>,
    F: FnMut(&ProcessedReading),
{
    let mut ticker = ticker(monitor.interval());
    let mut taken = 0u64;
    tokio::pin!(shutdown);

    loop {
        if count.is_some_and(|n| taken >= n) {
            return Ok(StopReason::Completed);
        }
        tokio::select! {
            biased;
            () = &mut shutdown => return Ok(StopReason::Shutdown),
            _ = ticker.tick() => {
                let reading = blocking(|| monitor.tick(session, calibration))?;
                taken += 1;
                on_reading(&reading);
            }
        }
    }
}
