// Wait command: poll a check command until it succeeds or times out

use std::time::Duration;

use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::executor::Executor;
use crate::output::errors::SpotError;
use crate::parser::ast::WaitSpec;

/// Check interval used when the command does not set one
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(5);

/// Interval between checks, `DEFAULT_WAIT_INTERVAL` when unset
pub fn poll_interval(spec: &WaitSpec) -> Duration {
    if spec.interval.is_zero() {
        DEFAULT_WAIT_INTERVAL
    } else {
        spec.interval
    }
}

/// Run `spec.command` every interval until it succeeds.
///
/// A zero timeout disables waiting. Failed checks are not reported; only the
/// timeout (`WaitTimeout`) or cancellation (`Cancelled`) ends the wait with an
/// error. Polling is strictly periodic, the first check fires one interval in.
pub async fn wait_for(
    exec: &dyn Executor,
    cancel: &CancellationToken,
    spec: &WaitSpec,
) -> Result<(), SpotError> {
    if spec.timeout.is_zero() {
        return Ok(());
    }
    let interval = poll_interval(spec);

    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = sleep(spec.timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SpotError::Cancelled),
            _ = &mut deadline => return Err(SpotError::WaitTimeout),
            _ = ticker.tick() => {
                tokio::select! {
                    biased;
                    _ = &mut deadline => return Err(SpotError::WaitTimeout),
                    res = exec.run(cancel, &spec.command) => match res {
                        Ok(_) => return Ok(()),
                        Err(e) => debug!("wait check {:?} failed: {}", spec.command, e),
                    },
                }
            }
        }
    }
}
