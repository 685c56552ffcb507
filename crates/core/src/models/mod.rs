pub mod job_message;
pub mod outcome;
pub mod run;
pub mod status_message;

pub use job_message::{ExperimentId, JobMessage, VariableMap};
pub use outcome::{FailureKind, Outcome};
pub use run::{LogLocations, RunIdentity, RunRecord, RunStatus};
pub use status_message::StatusMessage;
