/*
[INPUT]:  Public API exports for the keygrid engine crate
[OUTPUT]: Module declarations and public re-exports
[POS]:    Crate root - library entry point
[UPDATE]: When adding new modules or public exports
*/

pub mod action;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod feed;
pub mod inflight;
pub mod inherit;
pub mod mapping;
pub mod metrics;
pub mod notifier;
pub mod persistence;
pub mod precision;
pub mod quota;
pub mod rebuild;
pub mod retry;
pub mod runtime;
pub mod slot;
pub mod store;
pub mod trade_store;

// Re-export main types for convenience
pub use action::{ActionReason, ExecutionReport, OrderAction};
pub use config::GridConfig;
pub use engine::{BootstrapReport, FillReport, GridEngine, GridStatus, PendingMigration, ReconReport};
pub use error::{GridError, Result};
pub use feed::{BoundaryMode, ManualBoundary, TargetPrices};
pub use notifier::{LogNotifier, Notifier};
pub use rebuild::{RebuildPhase, RebuildRecord, RebuildTrigger, TransactionLog};
pub use runtime::run_grid;
pub use slot::{LifecycleState, Slot, SlotId};
pub use store::{InventoryRecord, SlotStore};
