/*
[INPUT]:  Grid configuration, executor, notifier, on-disk state
[OUTPUT]: Bootstrap, migration, recon cycles and fill handling under one grid lock
[POS]:    Orchestration layer - owns the slot store and every exchange side effect
[UPDATE]: When engine operations, persistence points or pathway ordering change
*/

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use keygrid_exchange::{ExchangeError, Executor, OpenOrder, Position, Side, Trade};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::action::{ExecutionReport, OrderAction};
use crate::config::GridConfig;
use crate::error::{GridError, Result};
use crate::event::EventIncrementer;
use crate::feed::TargetPrices;
use crate::inflight::InFlightBook;
use crate::inherit::inherit_by_index;
use crate::mapping::MappingBuilder;
use crate::metrics::{GridMetrics, GridMetricsSnapshot};
use crate::notifier::Notifier;
use crate::persistence::{GridSnapshot, StateStore, HISTORY_LIMIT};
use crate::quota::QuotaReconciler;
use crate::rebuild::{
    AtomicRebuildExecutor, RebuildPhase, RebuildRecord, RebuildTrigger, TransactionLog, TxLogStore,
};
use crate::retry::timed;
use crate::slot::{Slot, SlotId};
use crate::store::{InventoryAdjustment, InventoryRecord, SlotStore};
use crate::trade_store::{TradeRecord, TradeStore};

/// Ledger rows consulted when padding inventory.
const LEDGER_LOOKBACK: usize = 200;

/// Mutable grid state. Only reachable through the engine lock.
#[derive(Debug)]
struct GridCore {
    store: SlotStore,
    inflight: InFlightBook,
    seen_trades: HashSet<String>,
    seeded: bool,
    pending: Option<TransactionLog>,
    history: Vec<RebuildRecord>,
    metrics: GridMetrics,
    last_unmapped: Vec<SlotId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapReport {
    pub active: usize,
    pub retired: usize,
    pub inventory: usize,
    /// Set when an interrupted migration was finished during startup.
    pub resumed: Option<RebuildRecord>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconReport {
    pub current_price: Decimal,
    pub fills: usize,
    pub adjustment: Option<InventoryAdjustment>,
    pub destroyed: Vec<SlotId>,
    pub unmapped: Vec<SlotId>,
    pub actions: Vec<OrderAction>,
    pub execution: ExecutionReport,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FillReport {
    /// False when the trade id was already handled.
    pub handled: bool,
    pub owner: Option<SlotId>,
    pub released: Vec<InventoryRecord>,
    pub actions: Vec<OrderAction>,
    pub execution: ExecutionReport,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingMigration {
    pub id: String,
    pub phase: RebuildPhase,
    pub trigger: RebuildTrigger,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GridStatus {
    pub symbol: String,
    pub active: Vec<Slot>,
    pub retired: Vec<Slot>,
    pub inventory: Vec<InventoryRecord>,
    pub total_fill_count: u32,
    pub inflight_places: usize,
    pub pending: Option<PendingMigration>,
    pub history: Vec<RebuildRecord>,
    pub metrics: GridMetricsSnapshot,
}

impl From<&TransactionLog> for PendingMigration {
    fn from(log: &TransactionLog) -> Self {
        Self {
            id: log.id.clone(),
            phase: log.phase,
            trigger: log.trigger,
            error: log.error_message.clone(),
        }
    }
}

/// Slot grid engine for one symbol.
///
/// Every operation takes the grid lock for its whole duration, exchange calls
/// included, so Recon, fill handling and migrations never interleave.
pub struct GridEngine<E: Executor> {
    config: GridConfig,
    exchange: Arc<E>,
    notifier: Arc<dyn Notifier>,
    state: StateStore,
    logs: TxLogStore,
    trades: TradeStore,
    mapping: MappingBuilder,
    reconciler: QuotaReconciler,
    events: EventIncrementer,
    core: Mutex<GridCore>,
}

impl<E: Executor> GridEngine<E> {
    pub fn new(config: GridConfig, exchange: Arc<E>, notifier: Arc<dyn Notifier>) -> Self {
        let mapping = MappingBuilder::new(config.min_profit_pct);
        let reconciler = QuotaReconciler::new(config.quota_params(), config.precision());
        let events = EventIncrementer::new(reconciler.clone(), mapping.clone());
        let state = StateStore::new(&config.state_dir, &config.symbol);
        let logs = TxLogStore::new(&config.state_dir, &config.symbol);
        let trades = TradeStore::new(&config.state_dir, &config.symbol);
        let inflight_ttl = config.order_timeout() * 2;
        let mut store = SlotStore::new(config.price_tolerance);
        store.set_unit(config.base_amount_per_grid);
        let core = GridCore {
            store,
            inflight: InFlightBook::new(inflight_ttl, config.price_tolerance),
            seen_trades: HashSet::new(),
            seeded: false,
            pending: None,
            history: Vec::new(),
            metrics: GridMetrics::default(),
            last_unmapped: Vec::new(),
        };
        Self {
            config,
            exchange,
            notifier,
            state,
            logs,
            trades,
            mapping,
            reconciler,
            events,
            core: Mutex::new(core),
        }
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn exchange(&self) -> &Arc<E> {
        &self.exchange
    }

    /// Load persisted state and finish any interrupted migration.
    pub async fn bootstrap(&self) -> Result<BootstrapReport> {
        let mut core = self.core.lock().await;

        if let Some(snapshot) = self.state.load().await? {
            core.store = SlotStore::from_parts(snapshot.store, self.config.price_tolerance)?;
            core.store.set_unit(self.config.base_amount_per_grid);
            core.history = snapshot.history;
            info!(
                symbol = %self.config.symbol,
                active = core.store.slots().len(),
                retired = core.store.retired().len(),
                inventory = core.store.inventory().len(),
                "snapshot loaded"
            );
        } else {
            info!(symbol = %self.config.symbol, "no snapshot, starting empty");
        }

        for record in self.trades.load_all().await? {
            core.seen_trades.insert(record.trade_id);
        }

        let mut resumed = None;
        if let Some(log) = self.logs.load().await? {
            if log.needs_intervention() {
                error!(rebuild_id = %log.id, "transaction log in ALARM, automation blocked");
                let message = log
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("rebuild {} is in ALARM", log.id));
                core.pending = Some(log);
                return Err(GridError::Alarm(message));
            }
            warn!(rebuild_id = %log.id, phase = %log.phase, "interrupted migration found");
            resumed = Some(self.complete_rebuild(&mut core, log, true).await?);
        }

        let unmapped = self.rebuild_mapping(&mut core);
        self.alert_boundary(&mut core, unmapped).await;
        Ok(BootstrapReport {
            active: core.store.slots().len(),
            retired: core.store.retired().len(),
            inventory: core.store.inventory().len(),
            resumed,
        })
    }

    /// Move the grid onto a new price list through the atomic rebuild transaction.
    pub async fn migrate(
        &self,
        prices: TargetPrices,
        current_price: Decimal,
        trigger: RebuildTrigger,
    ) -> Result<RebuildRecord> {
        let mut core = self.core.lock().await;
        self.settle_pending(&mut core).await?;

        let prices = match &self.config.boundary {
            Some(boundary) => boundary.apply(prices)?,
            None => prices,
        };
        let open_orders = self.read(self.exchange.get_open_orders()).await?;
        let plan = inherit_by_index(&prices, &core.store, &open_orders, current_price)?;
        info!(
            symbol = %self.config.symbol,
            trigger = %trigger,
            slots = plan.target_active.len(),
            retiring = plan.newly_retired.len(),
            cancels = plan.cancels.len(),
            places = plan.places.len(),
            "migration planned"
        );

        let log = TransactionLog::new(&self.config.symbol, plan, trigger, current_price);
        self.logs.save(&log).await?;
        self.complete_rebuild(&mut core, log, false).await
    }

    /// One full reconciliation pass.
    pub async fn run_recon_cycle(&self) -> Result<ReconReport> {
        let mut core = self.core.lock().await;
        self.settle_pending(&mut core).await?;

        let position: Position = self.read(self.exchange.get_position()).await?;
        let open_orders = self.read(self.exchange.get_open_orders()).await?;
        let exchange_trades = self.read(self.exchange.get_trade_history()).await?;
        let current_price = position.mark_price;
        let mut report = ReconReport {
            current_price,
            ..ReconReport::default()
        };

        // Fills missed by the event pathway update inventory only; the plan below
        // already covers whatever they would have placed.
        if core.seeded {
            let unseen: Vec<Trade> = exchange_trades
                .iter()
                .filter(|t| !core.seen_trades.contains(&t.id))
                .cloned()
                .collect();
            for trade in unseen {
                self.apply_fill(&mut core, &trade, &open_orders, current_price)
                    .await?;
                report.fills += 1;
            }
        } else {
            self.seed_trades(&mut core, &exchange_trades);
        }
        core.store.prune_sell_fills(&open_orders);

        let now = Utc::now();
        let swept = core.inflight.sweep(&open_orders, now);
        if swept.expired > 0 {
            warn!(expired = swept.expired, "in-flight places expired unseen");
        }

        let ledger = self.trades.load_recent(LEDGER_LOOKBACK).await?;
        report.adjustment = core.store.reconcile_holdings(
            position.qty,
            self.config.base_amount_per_grid,
            self.config.max_fill_per_level,
            &exchange_trades,
            &ledger,
        );
        if let Some(adjustment) = &report.adjustment {
            self.notifier
                .quota_event(&self.config.symbol, "inventory_reconcile", &adjustment.to_string())
                .await;
        }

        report.unmapped = self.rebuild_mapping(&mut core);
        let destroyed = core.store.sweep_retired(&open_orders);
        if !destroyed.is_empty() {
            report.destroyed = destroyed.iter().map(|s| s.id()).collect();
            report.unmapped = self.rebuild_mapping(&mut core);
        }
        self.alert_boundary(&mut core, report.unmapped.clone()).await;

        let plan = self
            .reconciler
            .reconcile(&core.store, &open_orders, &core.inflight, current_price);
        report.execution = self.execute_actions(&mut core, &plan.actions).await;
        report.actions = plan.actions;

        core.metrics
            .record_recon(open_orders.len(), position.qty, current_price);
        core.metrics.record_execution(&report.execution);
        self.persist(&core).await?;
        self.notifier
            .recon_summary(&self.config.symbol, &report.execution)
            .await;
        debug!(
            price = %current_price,
            fills = report.fills,
            placed = report.execution.placed,
            cancelled = report.execution.cancelled,
            "recon cycle done"
        );
        Ok(report)
    }

    /// Handle one fill through the event pathway.
    pub async fn on_fill(&self, trade: Trade) -> Result<FillReport> {
        let mut core = self.core.lock().await;
        self.settle_pending(&mut core).await?;
        if core.seen_trades.contains(&trade.id) {
            debug!(trade_id = %trade.id, "duplicate fill ignored");
            return Ok(FillReport::default());
        }

        let position = self.read(self.exchange.get_position()).await?;
        let open_orders = self.read(self.exchange.get_open_orders()).await?;
        core.inflight.sweep(&open_orders, Utc::now());
        let report = self
            .handle_fill(&mut core, &trade, &open_orders, position.mark_price)
            .await?;
        self.persist(&core).await?;
        Ok(report)
    }

    /// Read trade history and run the event pathway for fills not seen before.
    ///
    /// The first poll after startup only seeds the dedupe set.
    pub async fn poll_fills(&self) -> Result<usize> {
        let mut core = self.core.lock().await;
        self.settle_pending(&mut core).await?;

        let trades = self.read(self.exchange.get_trade_history()).await?;
        if !core.seeded {
            self.seed_trades(&mut core, &trades);
            return Ok(0);
        }
        let fresh: Vec<Trade> = trades
            .into_iter()
            .filter(|t| !core.seen_trades.contains(&t.id))
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        let position = self.read(self.exchange.get_position()).await?;
        let open_orders = self.read(self.exchange.get_open_orders()).await?;
        core.inflight.sweep(&open_orders, Utc::now());
        let count = fresh.len();
        for trade in fresh {
            self.handle_fill(&mut core, &trade, &open_orders, position.mark_price)
                .await?;
        }
        self.persist(&core).await?;
        Ok(count)
    }

    /// Operator action: drop an ALARM log and resync slot order ids from the venue.
    ///
    /// Returns false when no alarm was pending.
    pub async fn clear_alarm(&self) -> Result<bool> {
        let mut core = self.core.lock().await;
        let log = match core.pending.take() {
            Some(log) => Some(log),
            None => self.logs.load().await?,
        };
        let Some(log) = log else {
            return Ok(false);
        };
        if !log.needs_intervention() {
            core.pending = Some(log);
            return Ok(false);
        }

        self.logs.clear().await?;
        let open_orders = self.read(self.exchange.get_open_orders()).await?;
        core.store.sync_active_orders(&open_orders);
        core.inflight.clear();
        let unmapped = self.rebuild_mapping(&mut core);
        self.alert_boundary(&mut core, unmapped).await;
        self.persist(&core).await?;
        warn!(rebuild_id = %log.id, "ALARM cleared by operator, slots resynced");
        self.notifier
            .quota_event(&self.config.symbol, "alarm_cleared", &log.id)
            .await;
        Ok(true)
    }

    pub async fn reset_fill_counters(&self, reason: &str) -> Result<()> {
        let mut core = self.core.lock().await;
        core.store.clear_inventory(reason);
        self.persist(&core).await?;
        self.notifier
            .quota_event(&self.config.symbol, "reset_fill_counters", reason)
            .await;
        Ok(())
    }

    /// Persist the current state. Called once more on shutdown.
    pub async fn flush(&self) -> Result<()> {
        let core = self.core.lock().await;
        self.persist(&core).await
    }

    pub async fn status(&self) -> GridStatus {
        let core = self.core.lock().await;
        GridStatus {
            symbol: self.config.symbol.clone(),
            active: core.store.slots().to_vec(),
            retired: core.store.retired().to_vec(),
            inventory: core.store.inventory().to_vec(),
            total_fill_count: core.store.total_fill_count(),
            inflight_places: core.inflight.places().len(),
            pending: core.pending.as_ref().map(PendingMigration::from),
            history: core.history.clone(),
            metrics: core.metrics.snapshot(),
        }
    }

    /// Refuse under ALARM; otherwise finish a migration left behind by a failed call.
    async fn settle_pending(&self, core: &mut GridCore) -> Result<()> {
        let Some(log) = core.pending.take() else {
            return Ok(());
        };
        if log.needs_intervention() {
            let message = log
                .error_message
                .clone()
                .unwrap_or_else(|| format!("rebuild {} is in ALARM", log.id));
            core.pending = Some(log);
            return Err(GridError::Alarm(message));
        }
        self.complete_rebuild(core, log, true).await.map(|_| ())
    }

    async fn complete_rebuild(
        &self,
        core: &mut GridCore,
        mut log: TransactionLog,
        resume: bool,
    ) -> Result<RebuildRecord> {
        let executor = AtomicRebuildExecutor::new(
            self.exchange.as_ref(),
            self.notifier.as_ref(),
            &self.logs,
            self.config.retry_policy(),
            self.config.order_timeout(),
            self.config.price_tolerance,
        );
        let outcome = if resume {
            executor.resume(&mut log).await
        } else {
            executor.execute(&mut log).await
        };

        if let Err(err) = outcome {
            if err.is_alarm() {
                push_history(&mut core.history, log.record());
                core.pending = Some(log);
                self.persist(core).await?;
            } else {
                warn!(rebuild_id = %log.id, phase = %log.phase, error = %err, "migration interrupted, will resume");
                core.pending = Some(log);
            }
            return Err(err);
        }

        core.store
            .commit_migration(log.target_active.clone(), log.newly_retired.clone())?;
        core.inflight.clear();
        let unmapped = self.rebuild_mapping(core);
        self.alert_boundary(core, unmapped).await;
        let record = log.record();
        push_history(&mut core.history, record.clone());
        self.persist(core).await?;
        self.logs.clear().await?;
        info!(
            rebuild_id = %record.id,
            trigger = %record.trigger,
            placed = record.placed,
            failed = record.failed,
            "migration committed"
        );
        self.notifier
            .migration_completed(&self.config.symbol, &record)
            .await;
        Ok(record)
    }

    /// Inventory, ledger and follow-up orders for one new fill.
    async fn handle_fill(
        &self,
        core: &mut GridCore,
        trade: &Trade,
        open_orders: &[OpenOrder],
        current_price: Decimal,
    ) -> Result<FillReport> {
        let outcome = self
            .apply_fill(core, trade, open_orders, current_price)
            .await?;
        let execution = self.execute_actions(core, &outcome.actions).await;
        core.metrics.record_execution(&execution);
        for action in &outcome.actions {
            self.notifier
                .quota_event(&self.config.symbol, &action.reason().to_string(), &describe(action))
                .await;
        }
        Ok(FillReport {
            handled: true,
            owner: outcome.owner,
            released: outcome.released,
            actions: outcome.actions,
            execution,
        })
    }

    /// Apply a fill to inventory and the ledger without touching the exchange.
    async fn apply_fill(
        &self,
        core: &mut GridCore,
        trade: &Trade,
        open_orders: &[OpenOrder],
        current_price: Decimal,
    ) -> Result<crate::event::FillOutcome> {
        core.seen_trades.insert(trade.id.clone());
        core.inflight.resolve_filled(&trade.order_id);
        let outcome = self.events.on_fill(
            &mut core.store,
            trade,
            open_orders,
            &core.inflight,
            current_price,
        )?;
        info!(
            trade_id = %trade.id,
            order_id = %trade.order_id,
            side = %trade.side,
            price = %trade.price,
            qty = %trade.qty,
            owner = ?outcome.owner.map(|id| id.0),
            "fill handled"
        );
        self.trades
            .append(&TradeRecord::from_trade(trade, outcome.owner))
            .await?;
        core.metrics.record_fill();
        if let Some(slot_id) = outcome.unmapped {
            warn!(slot_id = %slot_id, price = %trade.price, "filled slot has no sell target");
            self.notifier
                .boundary_alert(&self.config.symbol, &[trade.price])
                .await;
        }
        Ok(outcome)
    }

    /// Execute actions one by one. Failures are logged and counted; the next
    /// Recon cycle repairs whatever is left.
    async fn execute_actions(&self, core: &mut GridCore, actions: &[OrderAction]) -> ExecutionReport {
        let mut report = ExecutionReport::default();
        let timeout = self.config.order_timeout();
        for action in actions {
            match action {
                OrderAction::Place {
                    side,
                    price,
                    qty,
                    slot_id,
                    reason,
                } => {
                    // Dispatch time: a timed-out place must still match its resting order.
                    let now = Utc::now();
                    let result = timed(timeout, self.exchange.place_order(*side, *price, *qty)).await;
                    match result {
                        Ok(order_id) => {
                            info!(order_id = %order_id, side = %side, price = %price, qty = %qty, reason = %reason, "order placed");
                            core.inflight
                                .record_place(Some(order_id.clone()), *side, *price, *qty, *slot_id, now);
                            match side {
                                Side::Buy => {
                                    if let Err(err) = core.store.attach_order(*slot_id, order_id, *qty) {
                                        warn!(slot_id = %slot_id, error = %err, "placed buy has no slot");
                                    }
                                }
                                Side::Sell => {
                                    core.store.link_sell(*slot_id, &order_id, *qty);
                                    core.store.set_target_qty(*slot_id, *qty);
                                }
                            }
                            report.placed += 1;
                        }
                        Err(err) if err.is_unknown_outcome() => {
                            warn!(side = %side, price = %price, qty = %qty, error = %err, "place outcome unknown, tracked in flight");
                            core.inflight
                                .record_place(None, *side, *price, *qty, *slot_id, now);
                            report.unknown += 1;
                        }
                        Err(err) => {
                            warn!(side = %side, price = %price, qty = %qty, reason = %reason, error = %err, "place failed");
                            report.failed += 1;
                        }
                    }
                }
                OrderAction::Cancel {
                    order_id,
                    price,
                    reason,
                    ..
                } => {
                    let result = timed(timeout, self.exchange.cancel_order(order_id)).await;
                    match result {
                        Ok(()) => {
                            info!(order_id = %order_id, price = %price, reason = %reason, "order cancelled");
                            core.inflight.record_cancel(order_id, Utc::now());
                            core.store.clear_order(order_id);
                            report.cancelled += 1;
                        }
                        Err(ExchangeError::UnknownOrder { .. }) => {
                            debug!(order_id = %order_id, "cancel target already gone");
                            core.store.clear_order(order_id);
                        }
                        Err(err) if err.is_unknown_outcome() => {
                            warn!(order_id = %order_id, error = %err, "cancel outcome unknown, tracked in flight");
                            core.inflight.record_cancel(order_id, Utc::now());
                            core.store.clear_order(order_id);
                            report.unknown += 1;
                        }
                        Err(err) => {
                            warn!(order_id = %order_id, reason = %reason, error = %err, "cancel failed");
                            report.failed += 1;
                        }
                    }
                }
            }
        }
        report
    }

    fn seed_trades(&self, core: &mut GridCore, trades: &[Trade]) {
        core.seen_trades.extend(trades.iter().map(|t| t.id.clone()));
        core.seeded = true;
        debug!(seeded = trades.len(), "fill dedupe set seeded");
    }

    /// Rebuild adjacency from the store; returns the slots left without a target.
    fn rebuild_mapping(&self, core: &mut GridCore) -> Vec<SlotId> {
        let report = self.mapping.build(&core.store);
        core.store.set_adjacency(report.adjacency);
        report.unmapped.iter().map(|u| u.slot_id).collect()
    }

    /// Alert once per change in the set of unmapped slots.
    async fn alert_boundary(&self, core: &mut GridCore, unmapped: Vec<SlotId>) {
        if unmapped == core.last_unmapped {
            return;
        }
        if !unmapped.is_empty() {
            let prices: Vec<Decimal> = unmapped
                .iter()
                .filter_map(|id| core.store.slot(*id).map(|s| s.price()))
                .collect();
            self.notifier
                .boundary_alert(&self.config.symbol, &prices)
                .await;
        }
        core.last_unmapped = unmapped;
    }

    async fn persist(&self, core: &GridCore) -> Result<()> {
        let snapshot = GridSnapshot::new(
            self.config.symbol.clone(),
            core.store.to_parts(),
            core.history.clone(),
        );
        self.state.save(&snapshot).await?;
        Ok(())
    }

    async fn read<T, F>(&self, call: F) -> Result<T>
    where
        F: std::future::Future<Output = keygrid_exchange::Result<T>>,
    {
        Ok(timed(self.config.order_timeout(), call).await?)
    }
}

fn push_history(history: &mut Vec<RebuildRecord>, record: RebuildRecord) {
    history.push(record);
    if history.len() > HISTORY_LIMIT {
        let excess = history.len() - HISTORY_LIMIT;
        history.drain(..excess);
    }
}

fn describe(action: &OrderAction) -> String {
    match action {
        OrderAction::Place {
            side,
            price,
            qty,
            slot_id,
            ..
        } => format!("place {side} {qty} @ {price} for slot {slot_id}"),
        OrderAction::Cancel {
            order_id, price, ..
        } => format!("cancel {order_id} @ {price}"),
    }
}
