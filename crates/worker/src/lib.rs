pub mod executor;
pub mod output_capture;
pub mod workspace;

pub use executor::{validate_paths, ScriptExecutor, SKIPPED_MESSAGE};
pub use output_capture::{StreamKind, TailBuffer, TeeWriter};
pub use workspace::{OutputLayout, RunPaths, RunWorkspace};
