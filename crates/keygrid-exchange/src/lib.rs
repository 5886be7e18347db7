/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public keygrid exchange crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod error;
pub mod executor;
pub mod paper;
pub mod types;

pub use error::{ExchangeError, Result};
pub use executor::Executor;
pub use paper::{PaperExchange, PaperFault};

// Re-export all types
pub use types::*;
