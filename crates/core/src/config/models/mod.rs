pub mod app_config;
pub mod broker;
pub mod dispatcher;
pub mod executor;
pub mod observability;
pub mod paths;
pub mod record_store;

pub use app_config::AppConfig;
pub use broker::BrokerConfig;
pub use dispatcher::{DispatcherConfig, RetryConfig};
pub use executor::ExecutorConfig;
pub use observability::ObservabilityConfig;
pub use paths::PathsConfig;
pub use record_store::{RecordStoreConfig, RecordStoreType};
