pub mod metadata_fetcher;
pub mod price_converter;
pub mod subscription_hub;
pub mod transaction_gateway;

pub use metadata_fetcher::{validate_record, MetadataFetcher};
pub use price_converter::{DisplayValue, PriceConverter};
pub use subscription_hub::{LedgerSubscriptionHub, SubscriptionHandle};
pub use transaction_gateway::{StatusSequencer, SubmissionUpdate, TransactionGateway};
