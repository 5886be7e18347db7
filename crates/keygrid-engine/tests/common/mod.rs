/*
[INPUT]:  Temp state directories, paper venue and grid configuration
[OUTPUT]: Shared fixtures for engine integration tests
[POS]:    Test infrastructure - shared across engine test modules
[UPDATE]: When adding new test patterns or fixtures
*/

#![allow(dead_code)]

use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use keygrid_engine::{ExecutionReport, GridConfig, GridEngine, Notifier, RebuildRecord, TargetPrices};
use keygrid_exchange::{ContractSpec, Executor, OpenOrder, PaperExchange, Side};
use rust_decimal::Decimal;

pub fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).expect("valid decimal")
}

pub fn prices(list: &str) -> TargetPrices {
    TargetPrices::parse(list).expect("valid prices")
}

pub fn config(state_dir: &Path) -> GridConfig {
    let mut config = GridConfig::new("BTC-USD", dec("0.001"));
    config.state_dir = state_dir.to_path_buf();
    config.retry_base_delay_ms = 1;
    config.place_max_attempts = 2;
    config.recon_interval_sec = 1;
    config.event_poll_interval_sec = 1;
    config
}

pub fn paper(mark: &str, holdings: &str) -> Arc<PaperExchange> {
    Arc::new(PaperExchange::new(ContractSpec::default(), dec(mark), dec(holdings)))
}

pub struct Harness {
    pub engine: GridEngine<PaperExchange>,
    pub paper: Arc<PaperExchange>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn harness(state_dir: &Path, paper: Arc<PaperExchange>) -> Harness {
    harness_with(config(state_dir), paper)
}

pub fn harness_with(config: GridConfig, paper: Arc<PaperExchange>) -> Harness {
    let notifier = Arc::new(RecordingNotifier::default());
    let engine = GridEngine::new(config, paper.clone(), notifier.clone());
    Harness {
        engine,
        paper,
        notifier,
    }
}

pub async fn open_orders(paper: &PaperExchange) -> Vec<OpenOrder> {
    paper.get_open_orders().await.expect("open orders")
}

pub async fn resting(paper: &PaperExchange, side: Side) -> Vec<(Decimal, Decimal)> {
    let mut orders: Vec<(Decimal, Decimal)> = open_orders(paper)
        .await
        .into_iter()
        .filter(|o| o.side == side)
        .map(|o| (o.price, o.remaining_qty()))
        .collect();
    orders.sort_by(|a, b| b.0.cmp(&a.0));
    orders
}

/// Notifier that keeps every event for assertions.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<String>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().expect("notifier lock").clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn push(&self, event: String) {
        self.events.lock().expect("notifier lock").push(event);
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn alarm(&self, _symbol: &str, message: &str) {
        self.push(format!("alarm:{message}"));
    }

    async fn boundary_alert(&self, _symbol: &str, missing: &[Decimal]) {
        let prices: Vec<String> = missing.iter().map(|p| p.to_string()).collect();
        self.push(format!("boundary:{}", prices.join(",")));
    }

    async fn recon_summary(&self, _symbol: &str, report: &ExecutionReport) {
        self.push(format!("recon:placed={},cancelled={}", report.placed, report.cancelled));
    }

    async fn quota_event(&self, _symbol: &str, action: &str, detail: &str) {
        self.push(format!("quota:{action}:{detail}"));
    }

    async fn migration_completed(&self, _symbol: &str, record: &RebuildRecord) {
        self.push(format!("migration:{}", record.trigger));
    }
}
