/*
[INPUT]:  Executor contract schema and serde requirements
[OUTPUT]: Typed Rust structs/enums with serialization support
[POS]:    Data layer - type definitions for the executor contract
[UPDATE]: When the executor contract changes or new types added
*/

pub mod enums;
pub mod models;

pub use enums::*;
pub use models::*;
