// Application layer - the ledger's public operations.
// Parsing, deadlines and error tagging live here; all balance
// state stays in the store behind `Repository`.

pub mod error;
pub mod service;

pub use error::*;
pub use service::*;
