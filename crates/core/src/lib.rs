pub mod config;
pub mod errors;
pub mod models;
pub mod path_translation;
pub mod traits;

pub use config::AppConfig;
pub use errors::*;
pub use models::{
    ExperimentId, FailureKind, JobMessage, LogLocations, Outcome, RunIdentity, RunRecord,
    RunStatus, StatusMessage,
};
pub use path_translation::PathTranslator;
pub use traits::{
    AckMode, BrokerClient, Delivery, DeliveryReceiver, ReductionExecutor, RunStateStore,
};
