/*
[INPUT]:  Slot store contents and rebuild history
[OUTPUT]: Atomically written JSON snapshot per symbol
[POS]:    Persistence layer - durable grid state
[UPDATE]: When snapshot fields or file layout change
*/

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::debug;

use crate::rebuild::RebuildRecord;
use crate::store::StoreParts;

pub const HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSnapshot {
    pub symbol: String,
    pub store: StoreParts,
    #[serde(default)]
    pub history: Vec<RebuildRecord>,
    pub updated_at: DateTime<Utc>,
}

impl GridSnapshot {
    pub fn new(symbol: impl Into<String>, store: StoreParts, mut history: Vec<RebuildRecord>) -> Self {
        let excess = history.len().saturating_sub(HISTORY_LIMIT);
        history.drain(..excess);
        Self {
            symbol: symbol.into(),
            store,
            history,
            updated_at: Utc::now(),
        }
    }
}

/// Snapshot file `<state_dir>/<symbol>_state.json`.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: &Path, symbol: &str) -> Self {
        Self {
            path: state_dir.join(format!("{symbol}_state.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `None` when no snapshot has been written yet.
    pub async fn load(&self) -> Result<Option<GridSnapshot>> {
        if !fs::try_exists(&self.path).await.unwrap_or(false) {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read snapshot {}", self.path.display()))?;
        let snapshot = serde_json::from_str(&content)
            .with_context(|| format!("parse snapshot {}", self.path.display()))?;
        Ok(Some(snapshot))
    }

    pub async fn save(&self, snapshot: &GridSnapshot) -> Result<()> {
        let json = serde_json::to_vec_pretty(snapshot).context("serialize snapshot")?;
        write_atomic(&self.path, &json).await?;
        debug!(path = %self.path.display(), "snapshot saved");
        Ok(())
    }
}

/// Write to `<path>.tmp` and rename over `path`.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create state dir {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::{Slot, SlotId};
    use keygrid_exchange::Side;
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use tempfile::TempDir;

    fn parts() -> StoreParts {
        StoreParts {
            slots: vec![
                Slot::new(SlotId(1), Decimal::from_str("95000").expect("price"), Side::Sell),
                Slot::new(SlotId(2), Decimal::from_str("94000").expect("price"), Side::Buy),
            ],
            next_slot_id: 3,
            ..StoreParts::default()
        }
    }

    #[tokio::test]
    async fn missing_snapshot_loads_as_none() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::new(dir.path(), "BTC-USD");
        assert!(store.load().await.expect("load").is_none());
    }

    #[tokio::test]
    async fn save_then_load_keeps_slots() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::new(dir.path(), "BTC-USD");
        let snapshot = GridSnapshot::new("BTC-USD", parts(), Vec::new());
        store.save(&snapshot).await.expect("save");

        let loaded = store.load().await.expect("load").expect("present");
        assert_eq!(loaded.store.slots, snapshot.store.slots);
        assert_eq!(loaded.store.next_slot_id, 3);
        assert!(!dir.path().join("BTC-USD_state.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupted_snapshot_is_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let store = StateStore::new(dir.path(), "BTC-USD");
        fs::write(store.path(), "{ not json").await.expect("write");
        assert!(store.load().await.is_err());
    }
}
