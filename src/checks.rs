// src/checks.rs - Cheap up-front validation of a request's inputs
use serde::Serialize;
use std::path::Path;

use crate::archive;
use crate::error::{ErrorKind, JobError};
use crate::request::StackRequest;
use crate::sequence;

/// Number of slice images in a template archive, read from its member list only.
pub fn check_template(path: &Path) -> Result<usize, JobError> {
    if !path.is_file() {
        return Err(JobError::InvalidInput(format!("template archive {} not found", path.display())));
    }
    let names = archive::member_names(path).map_err(|source| JobError::ArchiveRead {
        path: path.to_path_buf(),
        source,
    })?;
    let slices = names
        .iter()
        .filter(|n| n.to_ascii_lowercase().ends_with(archive::SLICE_EXTENSION))
        .count();
    if slices == 0 {
        return Err(JobError::NoSlicesFound(path.to_path_buf()));
    }
    Ok(slices)
}

/// Length of the image stack starting at `seed`.
pub fn check_stack(seed: &Path) -> Result<usize, JobError> {
    if !seed.is_file() {
        return Err(JobError::InvalidInput(format!("first slice {} not found", seed.display())));
    }
    let (_, count) = sequence::resolve(seed)?;
    Ok(count)
}

/// The output archive can be created: its folder exists. A bare file name is
/// relative to the working directory and always accepted.
pub fn check_output(path: &Path) -> Result<(), JobError> {
    if path.as_os_str().is_empty() {
        return Err(JobError::InvalidInput("no output archive given".to_string()));
    }
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() && !parent.is_dir() => Err(JobError::InvalidInput(
            format!("output folder {} does not exist", parent.display()),
        )),
        _ => Ok(()),
    }
}

pub fn check_mask(path: &Path) -> Result<(), JobError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(JobError::InvalidInput(format!("mask image {} not found", path.display())))
    }
}

/// Outcome of one check, for display.
#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub name: &'static str,
    pub ok: bool,
    pub message: String,
    pub error: Option<ErrorKind>,
}

impl CheckOutcome {
    fn from_result<T>(name: &'static str, result: Result<T, JobError>, describe: impl FnOnce(T) -> String) -> Self {
        match result {
            Ok(value) => Self { name, ok: true, message: describe(value), error: None },
            Err(e) => Self { name, ok: false, message: e.to_string(), error: e.kind() },
        }
    }
}

/// All checks that apply to a request, run independently of each other.
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub template_slices: Option<usize>,
    pub stack_slices: Option<usize>,
    pub outcomes: Vec<CheckOutcome>,
}

impl CheckReport {
    pub fn ok(&self) -> bool {
        self.outcomes.iter().all(|o| o.ok)
    }

    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.outcomes.iter().map(|o| o.message.as_str())
    }
}

pub fn check_request(request: &StackRequest) -> CheckReport {
    let template = check_template(&request.template);
    let template_slices = template.as_ref().ok().copied();
    let mut outcomes = vec![CheckOutcome::from_result("template", template, |n| {
        format!("CWS file has {} slices", n)
    })];

    let mut stack_slices = None;
    if request.options.repeat_first {
        let exists = if request.first_slice.is_file() {
            Ok(())
        } else {
            Err(JobError::InvalidInput(format!("first slice {} not found", request.first_slice.display())))
        };
        outcomes.push(CheckOutcome::from_result("stack", exists, |_| "Repeating the first slice".to_string()));
    } else {
        let stack = check_stack(&request.first_slice);
        stack_slices = stack.as_ref().ok().copied();
        outcomes.push(CheckOutcome::from_result("stack", stack, |n| format!("Found {} slice images.", n)));
    }

    outcomes.push(CheckOutcome::from_result("output", check_output(&request.output), |_| {
        format!("Output {} can be written", request.output.display())
    }));

    if request.options.use_mask {
        let mask = match request.options.mask_image.as_deref() {
            Some(path) => check_mask(path),
            None => Err(JobError::InvalidInput("mask enabled but no mask image given".to_string())),
        };
        outcomes.push(CheckOutcome::from_result("mask", mask, |_| "OK".to_string()));
    }

    for outcome in outcomes.iter().filter(|o| !o.ok) {
        tracing::warn!("Check {} failed: {}", outcome.name, outcome.message);
    }
    CheckReport { template_slices, stack_slices, outcomes }
}
