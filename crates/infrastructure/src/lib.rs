pub mod in_memory_broker;
pub mod rabbitmq_broker;
pub mod run_store;

pub use in_memory_broker::InMemoryBroker;
pub use rabbitmq_broker::RabbitMqBroker;
pub use run_store::{InMemoryRunStore, PostgresRunStore};
