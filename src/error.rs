// src/error.rs - Job error taxonomy shared by the pipeline, checks and controller
use std::path::PathBuf;
use serde::Serialize;
use thiserror::Error;

use crate::archive::ArchiveError;
use crate::sequence::SequenceError;
use crate::tool::ToolError;

/// Coarse classification of a failed job, published through `JobStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    InvalidInput,
    NoNumberFound,
    ArchiveRead,
    ArchiveWrite,
    NoSlicesFound,
    TransformTool,
    Unknown,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Couldn't find a number in the slice filename: {}", .0.display())]
    NoNumberFound(PathBuf),
    #[error("Error reading template archive {}: {source}", path.display())]
    ArchiveRead {
        path: PathBuf,
        #[source]
        source: ArchiveError,
    },
    #[error("Error writing output archive {}: {source}", path.display())]
    ArchiveWrite {
        path: PathBuf,
        #[source]
        source: ArchiveError,
    },
    #[error("No embedded slice images found in {}", .0.display())]
    NoSlicesFound(PathBuf),
    #[error("Transform tool error: {0}")]
    TransformTool(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("An unknown error occurred: {0}")]
    Unknown(String),
}

impl JobError {
    /// `None` for cancellation, which is a terminal state rather than a failure kind.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            JobError::InvalidInput(_) => Some(ErrorKind::InvalidInput),
            JobError::NoNumberFound(_) => Some(ErrorKind::NoNumberFound),
            JobError::ArchiveRead { .. } => Some(ErrorKind::ArchiveRead),
            JobError::ArchiveWrite { .. } => Some(ErrorKind::ArchiveWrite),
            JobError::NoSlicesFound(_) => Some(ErrorKind::NoSlicesFound),
            JobError::TransformTool(_) => Some(ErrorKind::TransformTool),
            JobError::Cancelled => None,
            JobError::Unknown(_) => Some(ErrorKind::Unknown),
        }
    }
}

impl From<SequenceError> for JobError {
    fn from(e: SequenceError) -> Self {
        match e {
            SequenceError::NoNumberFound(path) => JobError::NoNumberFound(path),
        }
    }
}

impl From<ToolError> for JobError {
    fn from(e: ToolError) -> Self {
        JobError::TransformTool(e.to_string())
    }
}
