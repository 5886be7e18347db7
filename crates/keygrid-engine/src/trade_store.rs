/*
[INPUT]:  Handled fills from the event pathway
[OUTPUT]: Append-only JSONL trade ledger per symbol
[POS]:    Persistence layer - fill history used for inventory attribution
[UPDATE]: When the ledger record shape or file layout changes
*/

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use keygrid_exchange::{Side, Trade};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::slot::SlotId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub order_id: String,
    pub trade_id: String,
    pub side: Side,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    #[serde(default)]
    pub slot_id: Option<SlotId>,
}

impl TradeRecord {
    pub fn from_trade(trade: &Trade, slot_id: Option<SlotId>) -> Self {
        Self {
            timestamp: trade.timestamp,
            order_id: trade.order_id.clone(),
            trade_id: trade.id.clone(),
            side: trade.side,
            price: trade.price,
            qty: trade.qty,
            slot_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TradeStore {
    path: PathBuf,
}

impl TradeStore {
    pub fn new(state_dir: &Path, symbol: &str) -> Self {
        Self {
            path: state_dir.join(format!("{symbol}_trades.jsonl")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, record: &TradeRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create ledger dir {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(record).context("serialize trade record")?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open ledger {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Every readable record in file order. Malformed lines are skipped.
    pub async fn load_all(&self) -> Result<Vec<TradeRecord>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read ledger {}", self.path.display()))?;

        let mut records = Vec::new();
        for (index, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TradeRecord>(line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(line = index + 1, error = %err, "skipping malformed ledger line"),
            }
        }
        Ok(records)
    }

    pub async fn load_recent(&self, limit: usize) -> Result<Vec<TradeRecord>> {
        let mut records = self.load_all().await?;
        let skip = records.len().saturating_sub(limit);
        Ok(records.split_off(skip))
    }
}
