pub mod ledger;
pub mod loan;
pub mod transaction;

pub use ledger::*;
pub use loan::*;
pub use transaction::*;
