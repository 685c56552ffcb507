pub mod broker;
pub mod executor;
pub mod run_state_store;

pub use broker::{AckMode, BrokerClient, Delivery, DeliveryReceiver};
pub use executor::ReductionExecutor;
pub use run_state_store::RunStateStore;
