// src/tool/mod.rs - External raster tool invocation and result classification
pub mod command;

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;

use crate::config::ToolConfig;
pub use command::{CanvasSize, CommandKind, FilterChain, ToolCommand};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{kind:?} command exited with status {code:?}: {stderr}")]
    Exit {
        kind: CommandKind,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Unparsable {kind:?} output '{output}': {reason}")]
    Unparsable {
        kind: CommandKind,
        output: String,
        reason: String,
    },
}

/// Raw result of one tool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr; the compare mode reports on either.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }

    /// Turn a non-zero exit into an error.
    pub fn check(self, kind: CommandKind) -> Result<Self, ToolError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ToolError::Exit { kind, code: self.exit_code, stderr: self.stderr.trim().to_string() })
        }
    }

    /// Interpret a size-probe response.
    pub fn canvas_size(self) -> Result<CanvasSize, ToolError> {
        let output = self.check(CommandKind::ProbeSize)?;
        output.stdout.parse().map_err(|reason| ToolError::Unparsable {
            kind: CommandKind::ProbeSize,
            output: output.stdout.trim().to_string(),
            reason,
        })
    }

    /// First number found in the combined output, whatever the exit status.
    /// The compare mode exits non-zero when images differ but still prints the metric.
    pub fn distortion(&self) -> Option<f64> {
        parse_distortion(&self.combined())
    }
}

/// Find the first token that reads as a number, skipping quotes and parentheses
/// (e.g. `"0"` or `1234 (0.0188)`).
pub fn parse_distortion(text: &str) -> Option<f64> {
    text.split(|c: char| c.is_whitespace() || matches!(c, '"' | '(' | ')' | ','))
        .filter(|t| !t.is_empty())
        .find_map(|t| t.parse::<f64>().ok().filter(|v| v.is_finite()))
}

/// Seam between the pipeline and the process that does the pixel work.
#[async_trait]
pub trait TransformTool: Send + Sync {
    async fn execute(&self, command: &ToolCommand) -> Result<ToolOutput, ToolError>;
}

/// ImageMagick 7 `magick`, run as a child process.
#[derive(Debug, Clone)]
pub struct MagickTool {
    program: PathBuf,
}

impl MagickTool {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    pub fn from_config(config: &ToolConfig) -> Self {
        Self::new(config.executable())
    }

    pub fn program(&self) -> &std::path::Path {
        &self.program
    }
}

#[async_trait]
impl TransformTool for MagickTool {
    async fn execute(&self, command: &ToolCommand) -> Result<ToolOutput, ToolError> {
        tracing::debug!("{} {}", self.program.display(), command);
        let mut cmd = Command::new(&self.program);
        cmd.args(command.args())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        #[cfg(windows)]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let output = cmd.output().await.map_err(|source| ToolError::Launch {
            program: self.program.display().to_string(),
            source,
        })?;
        Ok(ToolOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
