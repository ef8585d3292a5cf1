pub mod kiva_graphql;
pub mod ledger_ws;
pub mod memory_ledger;
pub mod static_catalog;
pub mod traits;

pub use kiva_graphql::KivaGraphqlClient;
pub use ledger_ws::LedgerWsSource;
pub use memory_ledger::{InMemoryLedger, LedgerLoan};
pub use static_catalog::StaticCatalog;
pub use traits::{LedgerSource, LedgerSubmitter, MetadataService, RawLedgerStream, RawLoanMetadata};
