/*
[INPUT]:  Bootstrapped grid engine, shutdown token
[OUTPUT]: Periodic Recon cycles and fill polling until shutdown or ALARM
[POS]:    Runtime layer - single-symbol run loop
[UPDATE]: When scheduling, shutdown or escalation behaviour changes
*/

use std::sync::Arc;

use keygrid_exchange::Executor;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::GridEngine;
use crate::error::{GridError, Result};

/// Drive the engine until `shutdown` fires.
///
/// An operation already running when shutdown is requested finishes first.
/// ALARM ends the loop with `GridError::Alarm`; other failures are logged and
/// retried on the next tick.
pub async fn run_grid<E: Executor>(engine: Arc<GridEngine<E>>, shutdown: CancellationToken) -> Result<()> {
    let config = engine.config();
    let symbol = config.symbol.clone();
    let mut recon = interval(config.recon_interval());
    recon.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut poll = interval(config.event_poll_interval());
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        symbol = %symbol,
        recon_interval_sec = config.recon_interval_sec,
        event_poll_interval_sec = config.event_poll_interval_sec,
        "grid run loop starting"
    );

    let outcome = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(symbol = %symbol, "grid shutdown requested");
                break Ok(());
            }
            _ = recon.tick() => {
                match engine.run_recon_cycle().await {
                    Ok(report) => debug!(
                        symbol = %symbol,
                        placed = report.execution.placed,
                        cancelled = report.execution.cancelled,
                        "recon tick"
                    ),
                    Err(err) if err.is_alarm() => break Err(err),
                    Err(err) => warn!(symbol = %symbol, error = %err, "recon cycle failed"),
                }
            }
            _ = poll.tick() => {
                match engine.poll_fills().await {
                    Ok(0) => {}
                    Ok(count) => debug!(symbol = %symbol, fills = count, "fills handled"),
                    Err(err) if err.is_alarm() => break Err(err),
                    Err(err) => warn!(symbol = %symbol, error = %err, "fill poll failed"),
                }
            }
        }
    };

    if let Err(GridError::Alarm(message)) = &outcome {
        error!(symbol = %symbol, message = %message, "automation halted by ALARM");
    }
    if let Err(err) = engine.flush().await {
        warn!(symbol = %symbol, error = %err, "final state flush failed");
    }
    info!(symbol = %symbol, "grid run loop stopped");
    outcome
}
