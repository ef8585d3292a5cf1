pub mod adapters;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod services;

pub use adapters::{InMemoryLedger, KivaGraphqlClient, LedgerWsSource, StaticCatalog};
pub use config::AppConfig;
pub use engine::{EngineHandle, EngineNotification, ReconciliationEngine, Snapshot};
pub use error::{MetadataFetchError, Result, SyncError};
pub use services::{
    LedgerSubscriptionHub, MetadataFetcher, PriceConverter, SubscriptionHandle, TransactionGateway,
};
