// src/lib.rs - Stack injection and comparison for CWS slice archives
pub mod archive;
pub mod checks;
pub mod compare;
pub mod config;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod request;
pub mod sequence;
pub mod suite;
pub mod tool;

pub use compare::{compare, CompareOptions, ComparisonResult};
pub use config::{load_config, Config};
pub use error::{ErrorKind, JobError};
pub use job::{JobController, JobStatus};
pub use request::{ProcessingOptions, StackRequest};
pub use tool::{MagickTool, TransformTool};
