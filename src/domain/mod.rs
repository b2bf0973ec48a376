mod amount;
mod ledger;
mod transfer;
mod wallet;

pub use amount::*;
pub use ledger::*;
pub use transfer::*;
pub use wallet::*;
