// src/pipeline.rs - Template archive + image stack -> output archive
//!
//! Stages run in order: validate, unpack the template into a scratch directory,
//! probe the canvas size, convert the stack into the slice slots, blank any
//! slots the stack does not reach, and repack. Slice images inside a CWS must
//! be named after the *output* archive, so every slot is rewritten under the
//! output base name and the template-named file is removed.

use std::fs;
use std::path::{Path, PathBuf};

use crate::archive::{self, ArchiveError, SliceSet};
use crate::config::JobConfig;
use crate::error::JobError;
use crate::job::{JobReporter, JobStage};
use crate::request::StackRequest;
use crate::sequence::{self, SequenceKey};
use crate::tool::{CanvasSize, CommandKind, FilterChain, ToolCommand, TransformTool};

const CONTENT_DIR: &str = "cws";
const BLANK_IMAGE: &str = "blank.png";

/// Counts of what a finished run did, plus recoverable failures.
#[derive(Debug, Default)]
pub struct PipelineReport {
    pub template_slices: usize,
    pub input_slices: usize,
    pub converted: usize,
    pub blanked: usize,
    /// Stack images that did not fit into the template.
    pub dropped: usize,
    pub canvas: Option<CanvasSize>,
    /// Per-slice failures that did not stop the run; any entry fails the job.
    pub failures: Vec<JobError>,
}

#[derive(Debug)]
enum StackSource {
    Repeat(PathBuf),
    Sequence(SequenceKey),
}

/// How stack images map onto template slots.
#[derive(Debug)]
struct StackPlan {
    source: StackSource,
    convert_count: usize,
    /// Denominator for conversion progress; the stack size, at least 1.
    progress_count: usize,
    blank_count: usize,
    dropped: usize,
}

impl StackPlan {
    fn source_for(&self, slot: usize) -> PathBuf {
        match &self.source {
            StackSource::Repeat(path) => path.clone(),
            StackSource::Sequence(key) => key.path_for(key.start() + slot as u64),
        }
    }
}

/// Run a whole injection. The scratch directory is gone by the time this returns,
/// whatever the outcome.
pub async fn run(
    request: &StackRequest,
    config: &JobConfig,
    tool: &dyn TransformTool,
    reporter: &JobReporter,
) -> Result<PipelineReport, JobError> {
    reporter.stage(JobStage::Validating);
    validate(request)?;

    reporter.stage(JobStage::Unpacking);
    let scratch = config
        .scratch("cws-stack-")
        .map_err(|e| archive_read(request, e.into()))?;
    let content = scratch.path().join(CONTENT_DIR);
    fs::create_dir(&content).map_err(|e| archive_read(request, e.into()))?;
    unpack(request, &content).await?;

    reporter.stage(JobStage::Probing);
    let slots = SliceSet::discover(&content, None)
        .map_err(|e| archive_read(request, e.into()))?
        .filter(|set| set.count() > 0)
        .ok_or_else(|| {
            reporter.warn("Couldn't find any png images in the template! Make sure you slice before you save!");
            JobError::NoSlicesFound(request.template.clone())
        })?;
    let canvas = tool
        .execute(&ToolCommand::probe_size(&slots.path_for(0)))
        .await
        .and_then(|out| out.canvas_size())
        .inspect_err(|_| reporter.warn("Error getting the size of the template image! Is the tool path correct?"))?;
    reporter.message(format!("Template has {} slices of {}", slots.count(), canvas));

    let plan = plan_stack(request, slots.count(), reporter)?;
    let mut report = PipelineReport {
        template_slices: slots.count(),
        input_slices: plan.progress_count,
        dropped: plan.dropped,
        canvas: Some(canvas),
        ..Default::default()
    };

    reporter.percent(converting_percent(0, plan.progress_count));
    checkpoint(reporter)?;

    let output_base = request.output_base();
    let layout = SlotLayout { template: &slots, content: &content, output_base: &output_base };
    let filters = request.options.filter_chain();
    convert_slices(tool, reporter, &layout, &plan, &filters, canvas, &mut report).await?;

    if plan.blank_count > 0 {
        let blank = scratch.path().join(BLANK_IMAGE);
        blank_slices(tool, reporter, &layout, &plan, canvas, &blank, &mut report).await?;
    }

    reporter.stage(JobStage::Repacking);
    let packed = pack(request, &content).await;
    reporter.percent(99.0);
    if let Err(e) = scratch.close() {
        tracing::warn!("Failed to remove scratch directory: {}", e);
    }
    let members = packed?;
    reporter.message(format!("Wrote {} members to {}", members, request.output.display()));
    Ok(report)
}

fn validate(request: &StackRequest) -> Result<(), JobError> {
    let invalid = |msg: String| Err(JobError::InvalidInput(msg));
    if !request.template.is_file() {
        return invalid(format!("template archive {} not found", request.template.display()));
    }
    if !request.first_slice.is_file() {
        return invalid(format!("first slice {} not found", request.first_slice.display()));
    }
    if request.output.as_os_str().is_empty() || request.output.file_stem().is_none() {
        return invalid("no output archive given".to_string());
    }
    if let Some(parent) = request.output.parent() {
        if !parent.as_os_str().is_empty() && !parent.is_dir() {
            return invalid(format!("output folder {} does not exist", parent.display()));
        }
    }
    request.options.validate().or_else(invalid)?;
    if request.options.use_mask {
        if let Some(mask) = request.options.mask_image.as_deref().filter(|m| !m.is_file()) {
            return invalid(format!("mask image {} not found", mask.display()));
        }
    }
    Ok(())
}

fn plan_stack(request: &StackRequest, template_count: usize, reporter: &JobReporter) -> Result<StackPlan, JobError> {
    if request.options.repeat_first {
        return Ok(StackPlan {
            source: StackSource::Repeat(request.first_slice.clone()),
            convert_count: template_count,
            progress_count: template_count,
            blank_count: 0,
            dropped: 0,
        });
    }

    let (key, mut count) = sequence::resolve(&request.first_slice).inspect_err(|_| {
        reporter.warn("Couldn't find a number in the filename of your slice input.");
    })?;
    if count == 0 {
        reporter.warn("Slice count for the incoming image stack is 0. This should not be!");
        count = 1;
    }
    reporter.message(format!("Found {} slice images", count));

    let convert_count = count.min(template_count);
    let dropped = count.saturating_sub(template_count);
    let blank_count = template_count - convert_count;
    if dropped > 0 {
        reporter.warn(format!(
            "There are not enough slices in the template to fill all the slices in your dataset! {} slices will be lost",
            dropped
        ));
    } else if blank_count > 0 {
        reporter.warn(format!(
            "The stack has {} slices but the template has {}; {} slices will be blank",
            count, template_count, blank_count
        ));
    }

    Ok(StackPlan {
        source: StackSource::Sequence(key),
        convert_count,
        progress_count: count,
        blank_count,
        dropped,
    })
}

/// Template slots in the content directory and the names they are rewritten to.
struct SlotLayout<'a> {
    template: &'a SliceSet,
    content: &'a Path,
    output_base: &'a str,
}

impl SlotLayout<'_> {
    fn count(&self) -> usize {
        self.template.count()
    }

    /// Output-named path for a slot.
    fn target(&self, slot: usize) -> PathBuf {
        self.content.join(archive::slice_name(self.output_base, slot))
    }

    /// Drop the template-named copy of a slot once the output-named one is written.
    /// A slot with nothing written keeps its template image.
    fn retire(&self, slot: usize) {
        let target = self.target(slot);
        if !target.is_file() {
            tracing::debug!("Slot {} was not written, keeping the template image", slot);
            return;
        }
        let stale = self.template.path_for(slot);
        if stale == target || same_file(&stale, &target) {
            return;
        }
        if let Err(e) = fs::remove_file(&stale) {
            tracing::debug!("Could not remove {}: {}", stale.display(), e);
        }
    }
}

/// Whether two existing paths name one file. Names differing only in case do so
/// on case-insensitive filesystems, so the filesystem decides.
#[cfg(unix)]
fn same_file(a: &Path, b: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    match (fs::metadata(a), fs::metadata(b)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Progress after `done` of `count` stack images are converted.
pub fn converting_percent(done: usize, count: usize) -> f64 {
    5.0 + 80.0 * done as f64 / count.max(1) as f64
}

/// Progress after `done` of `remaining` slots are blanked. The denominator is
/// one larger than the slot count so blanking never reaches 95.
pub fn blanking_percent(done: usize, remaining: usize) -> f64 {
    85.0 + 10.0 * done as f64 / (remaining + 1) as f64
}

async fn convert_slices(
    tool: &dyn TransformTool,
    reporter: &JobReporter,
    layout: &SlotLayout<'_>,
    plan: &StackPlan,
    filters: &FilterChain,
    canvas: CanvasSize,
    report: &mut PipelineReport,
) -> Result<(), JobError> {
    reporter.stage(JobStage::Converting);
    for slot in 0..plan.convert_count {
        reporter.message(format!("Converting slice {}/{}", slot + 1, plan.convert_count));
        let command = ToolCommand::convert(&plan.source_for(slot), filters, canvas, &layout.target(slot));
        match tool.execute(&command).await.and_then(|out| out.check(CommandKind::Convert)) {
            Ok(_) => report.converted += 1,
            Err(e) => {
                reporter.warn(format!(
                    "Slice {}: {}. Output archive may be corrupt, or the tool location may need to be set.",
                    slot, e
                ));
                report.failures.push(e.into());
            }
        }
        layout.retire(slot);

        reporter.percent(converting_percent(slot + 1, plan.progress_count));
        checkpoint(reporter)?;
    }
    Ok(())
}

async fn blank_slices(
    tool: &dyn TransformTool,
    reporter: &JobReporter,
    layout: &SlotLayout<'_>,
    plan: &StackPlan,
    canvas: CanvasSize,
    blank: &Path,
    report: &mut PipelineReport,
) -> Result<(), JobError> {
    reporter.stage(JobStage::Blanking);
    let generated = tool
        .execute(&ToolCommand::blank(canvas, blank))
        .await
        .and_then(|out| out.check(CommandKind::Blank));
    if let Err(e) = generated {
        reporter.warn(format!("Error creating the blank slice image: {}", e));
        report.failures.push(e.into());
    }

    let total = layout.count();
    let first = plan.convert_count;
    for slot in first..total {
        reporter.message(format!("Blanking slice {}/{}", slot + 1, total));
        if blank.is_file() {
            match fs::copy(blank, layout.target(slot)) {
                Ok(_) => report.blanked += 1,
                Err(e) => {
                    reporter.warn(format!("Error creating blanked slice {}: {}. Resulting archive may be corrupt.", slot, e));
                    report.failures.push(JobError::Unknown(format!("blank slice {}: {}", slot, e)));
                }
            }
        }
        layout.retire(slot);

        reporter.percent(blanking_percent(slot + 1 - first, total - first));
        checkpoint(reporter)?;
    }
    Ok(())
}

fn checkpoint(reporter: &JobReporter) -> Result<(), JobError> {
    if reporter.is_cancelled() {
        Err(JobError::Cancelled)
    } else {
        Ok(())
    }
}

fn archive_read(request: &StackRequest, source: ArchiveError) -> JobError {
    JobError::ArchiveRead { path: request.template.clone(), source }
}

async fn unpack(request: &StackRequest, content: &Path) -> Result<(), JobError> {
    let names = archive::unpack_blocking(request.template.clone(), content.to_path_buf())
        .await
        .map_err(|e| archive_read(request, e))?;
    tracing::info!("Unpacked {} members from {}", names.len(), request.template.display());
    Ok(())
}

async fn pack(request: &StackRequest, content: &Path) -> Result<usize, JobError> {
    archive::pack_blocking(content.to_path_buf(), request.output.clone())
        .await
        .map(|names| names.len())
        .map_err(|source| JobError::ArchiveWrite { path: request.output.clone(), source })
}
