/*
[INPUT]:  Alarms, boundary gaps, recon summaries and migration results from the engine
[OUTPUT]: Operator-facing notifications (tracing records by default)
[POS]:    Notification layer - narrow alert sink interface
[UPDATE]: When adding notification kinds or delivery backends
*/

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::action::ExecutionReport;
use crate::rebuild::RebuildRecord;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// Automation halted; operator action required.
    async fn alarm(&self, symbol: &str, message: &str);

    /// Filled or buy-side slots that have no slot above them to sell into.
    async fn boundary_alert(&self, symbol: &str, missing: &[Decimal]);

    async fn recon_summary(&self, symbol: &str, report: &ExecutionReport);

    async fn quota_event(&self, symbol: &str, action: &str, detail: &str);

    async fn migration_completed(&self, symbol: &str, record: &RebuildRecord);
}

/// Default sink: structured log records only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn alarm(&self, symbol: &str, message: &str) {
        error!(symbol = %symbol, message = %message, "ALARM: automation halted");
    }

    async fn boundary_alert(&self, symbol: &str, missing: &[Decimal]) {
        let prices: Vec<String> = missing.iter().map(|p| p.to_string()).collect();
        warn!(symbol = %symbol, prices = ?prices, "boundary alert: no upward sell target");
    }

    async fn recon_summary(&self, symbol: &str, report: &ExecutionReport) {
        if report.is_empty() {
            return;
        }
        info!(
            symbol = %symbol,
            placed = report.placed,
            cancelled = report.cancelled,
            failed = report.failed,
            unknown = report.unknown,
            "recon cycle executed"
        );
    }

    async fn quota_event(&self, symbol: &str, action: &str, detail: &str) {
        info!(symbol = %symbol, action = %action, detail = %detail, "quota event");
    }

    async fn migration_completed(&self, symbol: &str, record: &RebuildRecord) {
        info!(
            symbol = %symbol,
            rebuild_id = %record.id,
            trigger = %record.trigger,
            phase = %record.phase,
            cancelled = record.cancelled,
            placed = record.placed,
            failed = record.failed,
            "migration finished"
        );
    }
}
