pub mod artifact;
pub mod config;
pub mod error;
pub mod image;
pub mod lifecycle;
pub mod observability;
pub mod pipeline;
pub mod plan;
pub mod probe;
pub mod process;
pub mod provision;
pub mod quality;
pub mod security;
pub mod stages;
pub mod toolchain;
pub mod validation;

pub use config::PipelineConfig;
pub use error::{GateError, StageError};
pub use pipeline::{PipelineExecutor, PipelineRun, RunContext, RunStatus, StageKind, StageRegistry};
