/*
[INPUT]:  Migration plans from the index inheritor
[OUTPUT]: Transaction log types and the atomic rebuild executor
[POS]:    Rebuild layer - module root
[UPDATE]: When adding rebuild submodules
*/

pub mod executor;
pub mod txlog;

pub use executor::AtomicRebuildExecutor;
pub use txlog::{
    FailedOrder, PlacedOrder, RebuildPhase, RebuildRecord, RebuildTrigger, TransactionLog, TxLogStore,
};
