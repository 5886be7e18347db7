/*
[INPUT]:  Migration plans and per-order execution results
[OUTPUT]: Persisted transaction log with validated phase transitions, rebuild history records
[POS]:    Rebuild layer - write-ahead intent log for migrations
[UPDATE]: When phases, triggers or log fields change
*/

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info};

use crate::error::GridError;
use crate::inherit::{MigrationPlan, PlannedCancel, PlannedPlace};
use crate::persistence::write_atomic;
use crate::slot::Slot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RebuildPhase {
    Pending,
    Cancelling,
    Placing,
    Syncing,
    Completed,
    Alarm,
    Retry,
}

impl RebuildPhase {
    /// Check if moving to `next` is a valid step
    pub fn can_advance(self, next: RebuildPhase) -> bool {
        use RebuildPhase::*;
        matches!(
            (self, next),
            (Pending, Cancelling)
                | (Cancelling, Placing)
                | (Cancelling, Alarm)
                | (Placing, Syncing)
                | (Placing, Retry)
                | (Retry, Placing)
                | (Retry, Syncing)
                | (Syncing, Completed)
        )
    }
}

impl fmt::Display for RebuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RebuildPhase::Pending => "PENDING",
            RebuildPhase::Cancelling => "CANCELLING",
            RebuildPhase::Placing => "PLACING",
            RebuildPhase::Syncing => "SYNCING",
            RebuildPhase::Completed => "COMPLETED",
            RebuildPhase::Alarm => "ALARM",
            RebuildPhase::Retry => "RETRY",
        };
        f.write_str(label)
    }
}

/// Why a migration was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildTrigger {
    AnchorDrift,
    BoundaryAlert,
    DailyRefresh,
    ManualRebuild,
    ColdStart,
    ConfigChange,
}

impl fmt::Display for RebuildTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RebuildTrigger::AnchorDrift => "anchor_drift",
            RebuildTrigger::BoundaryAlert => "boundary_alert",
            RebuildTrigger::DailyRefresh => "daily_refresh",
            RebuildTrigger::ManualRebuild => "manual_rebuild",
            RebuildTrigger::ColdStart => "cold_start",
            RebuildTrigger::ConfigChange => "config_change",
        };
        f.write_str(label)
    }
}

impl FromStr for RebuildTrigger {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "anchor_drift" => Ok(RebuildTrigger::AnchorDrift),
            "boundary_alert" => Ok(RebuildTrigger::BoundaryAlert),
            "daily_refresh" => Ok(RebuildTrigger::DailyRefresh),
            "manual" | "manual_rebuild" => Ok(RebuildTrigger::ManualRebuild),
            "cold_start" => Ok(RebuildTrigger::ColdStart),
            "config_change" => Ok(RebuildTrigger::ConfigChange),
            other => Err(format!("unknown rebuild trigger: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub place: PlannedPlace,
    /// `None` while a timed-out place has not been found on the book.
    pub order_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedOrder {
    pub place: PlannedPlace,
    pub error: String,
    pub attempts: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionLog {
    pub id: String,
    pub symbol: String,
    pub phase: RebuildPhase,
    pub trigger: RebuildTrigger,
    #[serde(with = "rust_decimal::serde::str")]
    pub current_price: Decimal,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub target_active: Vec<Slot>,
    pub newly_retired: Vec<Slot>,
    pub orders_to_cancel: Vec<PlannedCancel>,
    #[serde(default)]
    pub cancelled: Vec<String>,
    pub orders_to_place: Vec<PlannedPlace>,
    #[serde(default)]
    pub placed: Vec<PlacedOrder>,
    #[serde(default)]
    pub failed: Vec<FailedOrder>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
}

impl TransactionLog {
    pub fn new(symbol: &str, plan: MigrationPlan, trigger: RebuildTrigger, current_price: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.to_string(),
            phase: RebuildPhase::Pending,
            trigger,
            current_price,
            started_at: now,
            updated_at: now,
            target_active: plan.target_active,
            newly_retired: plan.newly_retired,
            orders_to_cancel: plan.cancels,
            cancelled: Vec::new(),
            orders_to_place: plan.places,
            placed: Vec::new(),
            failed: Vec::new(),
            error_message: None,
            retry_count: 0,
        }
    }

    pub fn advance(&mut self, next: RebuildPhase) -> crate::error::Result<()> {
        if !self.phase.can_advance(next) {
            return Err(GridError::InvariantViolation(format!(
                "rebuild {} cannot move {} -> {}",
                self.id, self.phase, next
            )));
        }
        info!(rebuild_id = %self.id, from = %self.phase, to = %next, "rebuild phase");
        self.phase = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_incomplete(&self) -> bool {
        self.phase != RebuildPhase::Completed
    }

    pub fn needs_intervention(&self) -> bool {
        self.phase == RebuildPhase::Alarm
    }

    pub fn pending_cancels(&self) -> Vec<PlannedCancel> {
        self.orders_to_cancel
            .iter()
            .filter(|c| !self.cancelled.contains(&c.order_id))
            .cloned()
            .collect()
    }

    /// Places not yet attempted to completion.
    pub fn pending_places(&self) -> Vec<PlannedPlace> {
        self.orders_to_place
            .iter()
            .filter(|p| {
                !self.placed.iter().any(|done| &done.place == *p)
                    && !self.failed.iter().any(|f| &f.place == *p)
            })
            .cloned()
            .collect()
    }

    pub fn record(&self) -> RebuildRecord {
        RebuildRecord {
            id: self.id.clone(),
            trigger: self.trigger,
            started_at: self.started_at,
            finished_at: Utc::now(),
            phase: self.phase,
            cancelled: self.cancelled.len(),
            placed: self.placed.len(),
            failed: self.failed.len(),
            error: self.error_message.clone(),
        }
    }
}

/// Summary kept in the snapshot history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuildRecord {
    pub id: String,
    pub trigger: RebuildTrigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phase: RebuildPhase,
    pub cancelled: usize,
    pub placed: usize,
    pub failed: usize,
    #[serde(default)]
    pub error: Option<String>,
}

/// Log file `<state_dir>/<symbol>_pending_migration.json`.
#[derive(Debug, Clone)]
pub struct TxLogStore {
    path: PathBuf,
}

impl TxLogStore {
    pub fn new(state_dir: &Path, symbol: &str) -> Self {
        Self {
            path: state_dir.join(format!("{symbol}_pending_migration.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Option<TransactionLog>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read transaction log {}", self.path.display()))?;
        let log = serde_json::from_str(&content)
            .with_context(|| format!("parse transaction log {}", self.path.display()))?;
        Ok(Some(log))
    }

    pub async fn save(&self, log: &TransactionLog) -> Result<()> {
        let json = serde_json::to_vec_pretty(log).context("serialize transaction log")?;
        write_atomic(&self.path, &json).await?;
        debug!(rebuild_id = %log.id, phase = %log.phase, "transaction log saved");
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("remove {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::SlotId;
    use keygrid_exchange::Side;
    use tempfile::TempDir;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn plan() -> MigrationPlan {
        MigrationPlan {
            target_active: vec![Slot::new(SlotId(1), dec("96500"), Side::Sell)],
            newly_retired: Vec::new(),
            cancels: vec![PlannedCancel {
                order_id: "o1".into(),
                side: Side::Sell,
                price: dec("96000"),
                slot_id: SlotId(1),
            }],
            places: vec![PlannedPlace {
                side: Side::Sell,
                price: dec("96500"),
                qty: dec("0.0007"),
                slot_id: SlotId(1),
            }],
        }
    }

    #[test]
    fn phases_follow_the_happy_path() {
        let mut log = TransactionLog::new("BTC-USD", plan(), RebuildTrigger::ManualRebuild, dec("95000"));
        for next in [
            RebuildPhase::Cancelling,
            RebuildPhase::Placing,
            RebuildPhase::Syncing,
            RebuildPhase::Completed,
        ] {
            log.advance(next).expect("advance");
        }
        assert!(!log.is_incomplete());
    }

    #[test]
    fn alarm_is_terminal() {
        let mut log = TransactionLog::new("BTC-USD", plan(), RebuildTrigger::ManualRebuild, dec("95000"));
        log.advance(RebuildPhase::Cancelling).expect("cancelling");
        log.advance(RebuildPhase::Alarm).expect("alarm");
        assert!(log.needs_intervention());
        assert!(log.advance(RebuildPhase::Placing).is_err());
        assert!(log.advance(RebuildPhase::Syncing).is_err());
    }

    #[test]
    fn pending_work_shrinks_as_results_arrive() {
        let mut log = TransactionLog::new("BTC-USD", plan(), RebuildTrigger::ColdStart, dec("95000"));
        assert_eq!(log.pending_cancels().len(), 1);
        log.cancelled.push("o1".into());
        assert!(log.pending_cancels().is_empty());

        let place = log.orders_to_place[0].clone();
        log.placed.push(PlacedOrder { place, order_id: None });
        assert!(log.pending_places().is_empty());
    }

    #[test]
    fn trigger_parses_cli_aliases() {
        assert_eq!("manual".parse::<RebuildTrigger>(), Ok(RebuildTrigger::ManualRebuild));
        assert_eq!("anchor-drift".parse::<RebuildTrigger>(), Ok(RebuildTrigger::AnchorDrift));
        assert!("sideways".parse::<RebuildTrigger>().is_err());
    }

    #[tokio::test]
    async fn log_round_trips_through_disk() {
        let dir = TempDir::new().expect("tempdir");
        let store = TxLogStore::new(dir.path(), "BTC-USD");
        assert!(store.load().await.expect("load").is_none());

        let mut log = TransactionLog::new("BTC-USD", plan(), RebuildTrigger::DailyRefresh, dec("95000"));
        log.advance(RebuildPhase::Cancelling).expect("advance");
        store.save(&log).await.expect("save");

        let raw = fs::read_to_string(store.path()).await.expect("raw");
        assert!(raw.contains("\"CANCELLING\""));
        assert_eq!(store.load().await.expect("load"), Some(log));

        store.clear().await.expect("clear");
        store.clear().await.expect("clear twice");
        assert!(store.load().await.expect("load").is_none());
    }
}
