/*
[INPUT]:  Transaction log (fresh or read back at startup), exchange executor
[OUTPUT]: Log driven to COMPLETED with adopted order ids, or ALARM
[POS]:    Rebuild layer - crash-safe cancel-all / place-all / sync transaction
[UPDATE]: When phase handling, retry policy or resume rules change
*/

use std::collections::HashSet;
use std::time::Duration;

use keygrid_exchange::{ExchangeError, Executor, OpenOrder, Side};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::error::{GridError, Result};
use crate::notifier::Notifier;
use crate::precision::price_matches;
use crate::rebuild::txlog::{FailedOrder, PlacedOrder, RebuildPhase, TransactionLog, TxLogStore};
use crate::retry::{rate_limit_hint, timed, RetryPolicy};

/// Runs a migration plan as PENDING -> CANCELLING -> PLACING -> SYNCING -> COMPLETED.
///
/// The log is written before every side effect. A cancel that cannot be confirmed
/// parks the log in ALARM and no further call is made.
pub struct AtomicRebuildExecutor<'a, E: Executor + ?Sized> {
    exchange: &'a E,
    notifier: &'a dyn Notifier,
    logs: &'a TxLogStore,
    retry: RetryPolicy,
    call_timeout: Duration,
    tolerance: Decimal,
}

impl<'a, E: Executor + ?Sized> AtomicRebuildExecutor<'a, E> {
    pub fn new(
        exchange: &'a E,
        notifier: &'a dyn Notifier,
        logs: &'a TxLogStore,
        retry: RetryPolicy,
        call_timeout: Duration,
        tolerance: Decimal,
    ) -> Self {
        Self {
            exchange,
            notifier,
            logs,
            retry,
            call_timeout,
            tolerance,
        }
    }

    /// Drive the log from its current phase to COMPLETED.
    ///
    /// Returns the open orders read during SYNCING. The COMPLETED phase is not
    /// written; the caller commits the plan and then clears the log.
    pub async fn execute(&self, log: &mut TransactionLog) -> Result<Vec<OpenOrder>> {
        if log.needs_intervention() {
            return Err(GridError::Alarm(alarm_message(log)));
        }
        if log.phase == RebuildPhase::Pending {
            self.logs.save(log).await?;
            log.advance(RebuildPhase::Cancelling)?;
            self.logs.save(log).await?;
        }
        if log.phase == RebuildPhase::Cancelling {
            self.run_cancels(log).await?;
            log.advance(RebuildPhase::Placing)?;
            self.logs.save(log).await?;
        }
        if log.phase == RebuildPhase::Retry {
            log.advance(RebuildPhase::Placing)?;
            self.logs.save(log).await?;
        }
        if log.phase == RebuildPhase::Placing {
            self.run_places(log).await?;
        }
        let open_orders = self.sync(log).await?;
        log.advance(RebuildPhase::Completed)?;
        info!(
            rebuild_id = %log.id,
            cancelled = log.cancelled.len(),
            placed = log.placed.len(),
            failed = log.failed.len(),
            "rebuild completed"
        );
        Ok(open_orders)
    }

    /// Continue a log found at startup.
    ///
    /// Before continuing, exchange ground truth decides which cancels already took
    /// effect and which planned places are already resting.
    pub async fn resume(&self, log: &mut TransactionLog) -> Result<Vec<OpenOrder>> {
        if log.needs_intervention() {
            error!(rebuild_id = %log.id, "transaction log in ALARM, resume blocked");
            return Err(GridError::Alarm(alarm_message(log)));
        }
        info!(rebuild_id = %log.id, phase = %log.phase, "resuming rebuild");
        if matches!(
            log.phase,
            RebuildPhase::Pending | RebuildPhase::Cancelling | RebuildPhase::Placing | RebuildPhase::Retry
        ) {
            let open_orders = self.read_open_orders().await?;
            let resting: HashSet<&str> = open_orders.iter().map(|o| o.id.as_str()).collect();
            for cancel in log.pending_cancels() {
                if !resting.contains(cancel.order_id.as_str()) {
                    info!(order_id = %cancel.order_id, "cancel already effective");
                    log.cancelled.push(cancel.order_id);
                }
            }
            self.adopt_resting(log, &open_orders);
            self.logs.save(log).await?;
        }
        self.execute(log).await
    }

    async fn run_cancels(&self, log: &mut TransactionLog) -> Result<()> {
        let exchange = self.exchange;
        let call_timeout = self.call_timeout;
        for cancel in log.pending_cancels() {
            let order_id = cancel.order_id.as_str();
            let attempted = self
                .retry
                .retry_when(
                    |_| timed(call_timeout, exchange.cancel_order(order_id)),
                    ExchangeError::is_retryable,
                    rate_limit_hint,
                )
                .await;
            match attempted.result {
                Ok(()) => {
                    info!(order_id = %order_id, price = %cancel.price, "rebuild cancel confirmed");
                }
                Err(ExchangeError::UnknownOrder { .. }) => {
                    warn!(order_id = %order_id, "order already gone, counted as cancelled");
                }
                Err(err) => {
                    let message = format!(
                        "cancel of {order_id} failed after {} attempt(s): {err}",
                        attempted.attempts
                    );
                    log.error_message = Some(message.clone());
                    log.advance(RebuildPhase::Alarm)?;
                    self.logs.save(log).await?;
                    error!(rebuild_id = %log.id, order_id = %order_id, error = %err, "rebuild cancel failed, ALARM");
                    self.notifier.alarm(&log.symbol, &message).await;
                    return Err(GridError::Alarm(message));
                }
            }
            log.cancelled.push(cancel.order_id.clone());
            self.logs.save(log).await?;
        }
        Ok(())
    }

    async fn run_places(&self, log: &mut TransactionLog) -> Result<()> {
        let exchange = self.exchange;
        let call_timeout = self.call_timeout;
        for place in log.pending_places() {
            let attempted = self
                .retry
                .retry_when(
                    |_| timed(call_timeout, exchange.place_order(place.side, place.price, place.qty)),
                    |err: &ExchangeError| err.is_retryable() && !err.is_unknown_outcome(),
                    rate_limit_hint,
                )
                .await;
            match attempted.result {
                Ok(order_id) => {
                    info!(
                        order_id = %order_id,
                        side = %place.side,
                        price = %place.price,
                        qty = %place.qty,
                        "rebuild place confirmed"
                    );
                    log.placed.push(PlacedOrder {
                        place,
                        order_id: Some(order_id),
                    });
                }
                Err(err) if err.is_unknown_outcome() => {
                    warn!(side = %place.side, price = %place.price, "rebuild place timed out, resolved at sync");
                    log.placed.push(PlacedOrder { place, order_id: None });
                }
                Err(err) => {
                    warn!(
                        side = %place.side,
                        price = %place.price,
                        attempts = attempted.attempts,
                        error = %err,
                        "rebuild place failed"
                    );
                    log.failed.push(FailedOrder {
                        place,
                        error: err.to_string(),
                        attempts: attempted.attempts,
                    });
                }
            }
            self.logs.save(log).await?;
        }

        if !log.failed.is_empty() {
            log.retry_count += 1;
            log.error_message = Some(format!("{} place(s) failed", log.failed.len()));
            log.advance(RebuildPhase::Retry)?;
            self.logs.save(log).await?;
        }
        log.advance(RebuildPhase::Syncing)?;
        self.logs.save(log).await?;
        Ok(())
    }

    /// Re-read the book, resolve unknown outcomes and attach order ids to the planned slots.
    async fn sync(&self, log: &mut TransactionLog) -> Result<Vec<OpenOrder>> {
        let open_orders = self.read_open_orders().await?;
        self.adopt_resting(log, &open_orders);

        let tolerance = self.tolerance;
        for slot in &mut log.target_active {
            let candidates: Vec<&PlacedOrder> = log
                .placed
                .iter()
                .filter(|p| p.place.slot_id == slot.id())
                .filter(|p| {
                    p.order_id
                        .as_deref()
                        .is_some_and(|id| open_orders.iter().any(|o| o.id == id))
                })
                .collect();
            let chosen = candidates
                .iter()
                .find(|p| p.place.side == slot.direction())
                .or(candidates.first());
            let adopted = chosen.and_then(|p| p.order_id.clone().map(|id| (id, p.place.qty)));
            if let Some((order_id, qty)) = adopted {
                slot.attach_order(order_id, qty);
            } else if let Some(order) = open_orders
                .iter()
                .find(|o| o.side == slot.direction() && price_matches(o.price, slot.price(), tolerance))
            {
                slot.attach_order(order.id.clone(), order.remaining_qty());
            }
        }
        self.logs.save(log).await?;
        Ok(open_orders)
    }

    /// Give ids to timed-out places and to remaining planned places already on the book.
    fn adopt_resting(&self, log: &mut TransactionLog, open_orders: &[OpenOrder]) {
        let mut claimed: HashSet<String> = log
            .placed
            .iter()
            .filter_map(|p| p.order_id.clone())
            .chain(log.orders_to_cancel.iter().map(|c| c.order_id.clone()))
            .collect();
        let tolerance = self.tolerance;
        let find = |side: Side, price: Decimal, qty: Decimal, claimed: &mut HashSet<String>| {
            let order = open_orders.iter().find(|o| {
                o.side == side
                    && price_matches(o.price, price, tolerance)
                    && o.qty == qty
                    && !claimed.contains(&o.id)
            })?;
            claimed.insert(order.id.clone());
            Some(order.id.clone())
        };

        for placed in log.placed.iter_mut().filter(|p| p.order_id.is_none()) {
            if let Some(id) = find(placed.place.side, placed.place.price, placed.place.qty, &mut claimed) {
                info!(order_id = %id, price = %placed.place.price, "timed-out place found on book");
                placed.order_id = Some(id);
            }
        }
        for place in log.pending_places() {
            if let Some(id) = find(place.side, place.price, place.qty, &mut claimed) {
                info!(order_id = %id, price = %place.price, "planned place already resting");
                log.placed.push(PlacedOrder {
                    place,
                    order_id: Some(id),
                });
            }
        }
    }

    async fn read_open_orders(&self) -> Result<Vec<OpenOrder>> {
        let exchange = self.exchange;
        let call_timeout = self.call_timeout;
        let attempted = self
            .retry
            .retry_when(
                |_| timed(call_timeout, exchange.get_open_orders()),
                ExchangeError::is_retryable,
                rate_limit_hint,
            )
            .await;
        Ok(attempted.result?)
    }
}

fn alarm_message(log: &TransactionLog) -> String {
    log.error_message
        .clone()
        .unwrap_or_else(|| format!("rebuild {} is in ALARM", log.id))
}
