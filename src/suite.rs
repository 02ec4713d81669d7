// src/suite.rs - Regression suite: build each case and compare it to a reference archive
//!
//! ```toml
//! [[case]]
//! name = "negated"
//! template = "templates/cube.cws"
//! input = "stacks/negated/slice_0000.png"
//! reference = "reference/negated.cws"
//! negate = true
//! ```
//!
//! Relative paths are resolved against the suite file's folder.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::compare::{self, CompareOptions, ComparisonResult};
use crate::config::{self, Config};
use crate::job::JobController;
use crate::request::{ProcessingOptions, StackRequest};
use crate::tool::TransformTool;

#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Suite has no cases")]
    Empty,
    #[error("Case '{name}' could not start")]
    NotStarted { name: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuiteFile {
    #[serde(default, rename = "case")]
    pub cases: Vec<SuiteCase>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuiteCase {
    pub name: String,
    pub template: PathBuf,
    /// First image of the stack.
    pub input: PathBuf,
    pub reference: PathBuf,
    #[serde(flatten)]
    pub options: ProcessingOptions,
}

impl SuiteCase {
    fn resolved(mut self, base: &Path) -> Self {
        for path in [&mut self.template, &mut self.input, &mut self.reference] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
        if let Some(mask) = self.options.mask_image.as_mut().filter(|m| m.is_relative()) {
            *mask = base.join(&*mask);
        }
        self
    }
}

#[derive(Debug)]
pub struct CaseOutcome {
    pub name: String,
    /// Final message of the build job.
    pub build_message: String,
    pub built: bool,
    pub comparison: Option<ComparisonResult>,
    pub compare_error: Option<String>,
}

impl CaseOutcome {
    pub fn passed(&self) -> bool {
        self.built && self.comparison.as_ref().is_some_and(|c| c.equal)
    }
}

#[derive(Debug, Default)]
pub struct SuiteReport {
    pub cases: Vec<CaseOutcome>,
}

impl SuiteReport {
    pub fn passed(&self) -> bool {
        self.cases.iter().all(CaseOutcome::passed)
    }

    pub fn failed_names(&self) -> impl Iterator<Item = &str> {
        self.cases.iter().filter(|c| !c.passed()).map(|c| c.name.as_str())
    }
}

pub fn load_suite(path: &Path) -> Result<Vec<SuiteCase>, SuiteError> {
    let content = std::fs::read_to_string(path)?;
    let file: SuiteFile = toml::from_str(&content)?;
    if file.cases.is_empty() {
        return Err(SuiteError::Empty);
    }
    let base = path.parent().unwrap_or(Path::new(""));
    Ok(file.cases.into_iter().map(|c| c.resolved(base)).collect())
}

/// Build every case into a temporary folder and compare it to its reference.
/// A failing case does not stop the suite.
pub async fn run_suite(
    path: &Path,
    config: &Config,
    tool: Arc<dyn TransformTool>,
) -> Result<SuiteReport, SuiteError> {
    let cases = load_suite(path)?;
    let work = config::scratch_in(config.job.scratch_dir.as_deref(), "cws-suite-")?;
    let mut report = SuiteReport::default();

    for case in cases {
        tracing::info!("Building {}", case.name);
        let output = work.path().join(format!("{}.cws", case.name));
        let request = StackRequest::new(&case.template, &case.input, &output).with_options(case.options.clone());

        let mut controller = JobController::new(config.job.clone(), tool.clone());
        if !controller.start(request) {
            return Err(SuiteError::NotStarted { name: case.name });
        }
        let status = controller.wait().await;
        while controller.poll_message().is_some() {}

        let mut outcome = CaseOutcome {
            name: case.name.clone(),
            build_message: status.final_message.clone(),
            built: status.success,
            comparison: None,
            compare_error: None,
        };

        if status.success {
            tracing::info!("Checking {}", case.name);
            let options = CompareOptions { diff_dir: None, scratch_dir: config.job.scratch_dir.clone() };
            match compare::compare(&case.reference, &output, &options, tool.as_ref()).await {
                Ok(result) => outcome.comparison = Some(result),
                Err(e) => outcome.compare_error = Some(e.to_string()),
            }
        }

        if outcome.passed() {
            tracing::info!("{} Passed", case.name);
        } else {
            tracing::warn!("{} Failed!", case.name);
        }
        report.cases.push(outcome);
    }

    if report.passed() {
        tracing::info!("All tests passed!");
    } else {
        tracing::warn!("Some tests failed!");
    }
    Ok(report)
}
