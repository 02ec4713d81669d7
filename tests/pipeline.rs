// Stack injection pipeline against the fake raster tool
mod common;

use common::*;
use cws_stack::config::JobConfig;
use cws_stack::error::{ErrorKind, JobError};
use cws_stack::job::{CancelFlag, JobController, JobReporter, JobStage, JobStatus};
use cws_stack::pipeline::{self, PipelineReport};
use cws_stack::request::{ProcessingOptions, StackRequest};
use cws_stack::tool::CommandKind;
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};

struct Fixture {
    dir: TempDir,
    scratch: TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self { dir: tempfile::tempdir().unwrap(), scratch: tempfile::tempdir().unwrap() }
    }

    fn path(&self, name: &str) -> std::path::PathBuf {
        self.dir.path().join(name)
    }

    fn config(&self) -> JobConfig {
        JobConfig { scratch_dir: Some(self.scratch.path().to_path_buf()), ..Default::default() }
    }
}

struct Run {
    result: Result<PipelineReport, JobError>,
    messages: Vec<String>,
    status: watch::Receiver<JobStatus>,
    reporter: JobReporter,
}

async fn run(fixture: &Fixture, request: &StackRequest, tool: &FakeTool) -> Run {
    let (reporter, status, mut messages) = JobReporter::channel(CancelFlag::default());
    let result = pipeline::run(request, &fixture.config(), tool, &reporter).await;
    Run { result, messages: drain(&mut messages), status, reporter }
}

fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(m) = rx.try_recv() {
        out.push(m);
    }
    out
}

fn slice_members(members: &std::collections::BTreeMap<String, Vec<u8>>) -> Vec<String> {
    members.keys().filter(|k| k.ends_with(".png")).cloned().collect()
}

fn count_containing(messages: &[String], needle: &str) -> usize {
    messages.iter().filter(|m| m.contains(needle)).count()
}

#[tokio::test]
async fn test_short_stack_is_padded_with_blank_slices() {
    let fx = Fixture::new();
    write_template(&fx.path("template.cws"), "template", 5);
    let seed = write_stack(fx.dir.path(), "layer_", 3);
    let request = StackRequest::new(fx.path("template.cws"), seed, fx.path("result.cws"));
    let tool = FakeTool::new();

    let run = run(&fx, &request, &tool).await;
    let report = run.result.unwrap();
    assert_eq!(report.converted, 3);
    assert_eq!(report.blanked, 2);
    assert!(report.failures.is_empty());
    assert_eq!(count_containing(&run.messages, "will be blank"), 1);
    assert_eq!(count_containing(&run.messages, "lost"), 0);

    let members = read_archive(&fx.path("result.cws"));
    assert_eq!(
        slice_members(&members),
        vec!["result0000.png", "result0001.png", "result0002.png", "result0003.png", "result0004.png"]
    );
    for i in 0..3 {
        let content = text(&members[&format!("result{:04}.png", i)]);
        assert!(content.starts_with("CONVERTED"), "slot {}: {}", i, content);
        assert!(content.ends_with(&format!("SLICE {}", i)));
    }
    for i in 3..5 {
        assert_eq!(text(&members[&format!("result{:04}.png", i)]), "BLANK 64x48");
    }
    assert!(members.contains_key("template.gcode"));
    assert!(members.contains_key("template.slicing"));
    assert!(members.contains_key("manifest.xml"));
    assert_eq!(tool.commands(CommandKind::Blank).len(), 1);
    assert!(is_empty_dir(fx.scratch.path()));
}

#[tokio::test]
async fn test_long_stack_drops_surplus() {
    let fx = Fixture::new();
    write_template(&fx.path("template.cws"), "template", 2);
    let seed = write_stack(fx.dir.path(), "layer_", 4);
    let request = StackRequest::new(fx.path("template.cws"), seed, fx.path("result.cws"));
    let tool = FakeTool::new();

    let run = run(&fx, &request, &tool).await;
    let report = run.result.unwrap();
    assert_eq!(report.converted, 2);
    assert_eq!(report.dropped, 2);
    assert_eq!(report.blanked, 0);
    assert_eq!(count_containing(&run.messages, "2 slices will be lost"), 1);

    let members = read_archive(&fx.path("result.cws"));
    assert_eq!(slice_members(&members), vec!["result0000.png", "result0001.png"]);
    assert!(text(&members["result0001.png"]).ends_with("SLICE 1"));
    assert!(tool.commands(CommandKind::Blank).is_empty());
}

#[tokio::test]
async fn test_repeat_first_fills_every_slot() {
    let fx = Fixture::new();
    write_template(&fx.path("template.cws"), "template", 4);
    // No digits needed when the first slice is repeated.
    fs::write(fx.path("cover.png"), "SLICE cover").unwrap();
    let options = ProcessingOptions { repeat_first: true, negate: true, ..Default::default() };
    let request = StackRequest::new(fx.path("template.cws"), fx.path("cover.png"), fx.path("out.cws"))
        .with_options(options);
    let tool = FakeTool::new();

    let report = run(&fx, &request, &tool).await.result.unwrap();
    assert_eq!(report.converted, 4);

    let members = read_archive(&fx.path("out.cws"));
    assert_eq!(slice_members(&members).len(), 4);
    for (_, bytes) in members.iter().filter(|(k, _)| k.ends_with(".png")) {
        assert_eq!(text(bytes), "CONVERTED negate=true threshold=none mask=false\nSLICE cover");
    }
}

#[tokio::test]
async fn test_filters_reach_the_tool() {
    let fx = Fixture::new();
    write_template(&fx.path("template.cws"), "template", 1);
    let seed = write_stack(fx.dir.path(), "s", 1);
    fs::write(fx.path("mask.png"), "MASK").unwrap();
    let options = ProcessingOptions {
        threshold: true,
        threshold_percent: 40.0,
        use_mask: true,
        mask_image: Some(fx.path("mask.png")),
        ..Default::default()
    };
    let request = StackRequest::new(fx.path("template.cws"), seed, fx.path("masked.cws")).with_options(options);
    let tool = FakeTool::new();

    run(&fx, &request, &tool).await.result.unwrap();
    let converts = tool.commands(CommandKind::Convert);
    assert_eq!(converts.len(), 1);
    assert_eq!(converts[0].inputs()[1], fx.path("mask.png"));
    let members = read_archive(&fx.path("masked.cws"));
    assert!(text(&members["masked0000.png"]).starts_with("CONVERTED negate=false threshold=40% mask=true"));
}

#[tokio::test]
async fn test_tool_failure_is_recorded_and_loop_continues() {
    let fx = Fixture::new();
    write_template(&fx.path("template.cws"), "template", 3);
    let seed = write_stack(fx.dir.path(), "layer_", 3);
    fs::write(fx.path("layer_0001.png"), "BAD DATA").unwrap();
    let request = StackRequest::new(fx.path("template.cws"), seed, fx.path("result.cws"));
    let tool = FakeTool::new();

    let run = run(&fx, &request, &tool).await;
    let report = run.result.unwrap();
    assert_eq!(tool.commands(CommandKind::Convert).len(), 3);
    assert_eq!(report.converted, 2);
    assert_eq!(report.failures.len(), 1);
    assert!(fx.path("result.cws").exists());

    run.reporter.finish(Ok(report));
    let status = run.status.borrow().clone();
    assert!(status.done);
    assert!(!status.success);
    assert_eq!(status.stage, JobStage::Failed);
    assert_eq!(status.error, Some(ErrorKind::TransformTool));
    assert_eq!(status.percent, 100.0);
}

#[tokio::test]
async fn test_missing_template_is_invalid_input() {
    let fx = Fixture::new();
    let seed = write_stack(fx.dir.path(), "layer_", 1);
    let request = StackRequest::new(fx.path("nope.cws"), seed, fx.path("result.cws"));

    let run = run(&fx, &request, &FakeTool::new()).await;
    assert!(matches!(run.result, Err(JobError::InvalidInput(_))));
    assert!(!fx.path("result.cws").exists());
}

#[tokio::test]
async fn test_missing_output_folder_is_invalid_input() {
    let fx = Fixture::new();
    write_template(&fx.path("template.cws"), "template", 1);
    let seed = write_stack(fx.dir.path(), "layer_", 1);
    let request = StackRequest::new(fx.path("template.cws"), seed, fx.path("missing/result.cws"));

    let run = run(&fx, &request, &FakeTool::new()).await;
    assert!(matches!(run.result, Err(JobError::InvalidInput(_))));
}

#[tokio::test]
async fn test_seed_without_number() {
    let fx = Fixture::new();
    write_template(&fx.path("template.cws"), "template", 2);
    fs::write(fx.path("cover.png"), "SLICE").unwrap();
    let request = StackRequest::new(fx.path("template.cws"), fx.path("cover.png"), fx.path("result.cws"));

    let run = run(&fx, &request, &FakeTool::new()).await;
    assert!(matches!(run.result, Err(JobError::NoNumberFound(_))));
    assert!(is_empty_dir(fx.scratch.path()));
}

#[tokio::test]
async fn test_template_without_slices() {
    let fx = Fixture::new();
    let mut members = std::collections::BTreeMap::new();
    members.insert("manifest.xml".to_string(), b"<manifest/>".to_vec());
    write_archive(&fx.path("empty.cws"), &members);
    let seed = write_stack(fx.dir.path(), "layer_", 1);
    let request = StackRequest::new(fx.path("empty.cws"), seed, fx.path("result.cws"));

    let run = run(&fx, &request, &FakeTool::new()).await;
    assert!(matches!(run.result, Err(JobError::NoSlicesFound(_))));
    assert!(is_empty_dir(fx.scratch.path()));
}

#[tokio::test]
async fn test_unreadable_template_is_archive_read_error() {
    let fx = Fixture::new();
    fs::write(fx.path("broken.cws"), "not a zip").unwrap();
    let seed = write_stack(fx.dir.path(), "layer_", 1);
    let request = StackRequest::new(fx.path("broken.cws"), seed, fx.path("result.cws"));

    let run = run(&fx, &request, &FakeTool::new()).await;
    let err = run.result.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::ArchiveRead));
    assert!(is_empty_dir(fx.scratch.path()));
}

#[tokio::test]
async fn test_bad_probe_output_is_tool_error() {
    let fx = Fixture::new();
    write_template(&fx.path("template.cws"), "template", 1);
    let seed = write_stack(fx.dir.path(), "layer_", 1);
    let request = StackRequest::new(fx.path("template.cws"), seed, fx.path("result.cws"));
    let tool = FakeTool::new().with_canvas("unable to open image");

    let run = run(&fx, &request, &tool).await;
    assert!(matches!(run.result, Err(JobError::TransformTool(_))));
}

#[tokio::test]
async fn test_slices_follow_output_name_when_template_name_matches() {
    let fx = Fixture::new();
    write_template(&fx.path("part.cws"), "part", 2);
    let seed = write_stack(fx.dir.path(), "layer_", 2);
    fs::create_dir(fx.path("out")).unwrap();
    let output = fx.path("out").join("part.cws");
    let request = StackRequest::new(fx.path("part.cws"), seed, &output);

    run(&fx, &request, &FakeTool::new()).await.result.unwrap();
    let members = read_archive(&output);
    assert_eq!(slice_members(&members), vec!["part0000.png", "part0001.png"]);
    assert!(text(&members["part0000.png"]).starts_with("CONVERTED"));
}

#[tokio::test]
async fn test_output_name_differing_only_in_case_replaces_template_slices() {
    let fx = Fixture::new();
    write_template(&fx.path("Part.cws"), "Part", 3);
    let seed = write_stack(fx.dir.path(), "layer_", 3);
    fs::create_dir(fx.path("out")).unwrap();
    let output = fx.path("out").join("part.cws");
    let request = StackRequest::new(fx.path("Part.cws"), seed, &output);

    run(&fx, &request, &FakeTool::new()).await.result.unwrap();
    let members = read_archive(&output);
    let slices = slice_members(&members);
    assert_eq!(slices.len(), 3, "{:?}", slices);
    for name in &slices {
        assert!(text(&members[name]).starts_with("CONVERTED"), "{}", name);
    }
}

#[tokio::test]
async fn test_failed_blank_keeps_template_slots() {
    let fx = Fixture::new();
    write_template(&fx.path("template.cws"), "template", 4);
    let seed = write_stack(fx.dir.path(), "layer_", 2);
    let request = StackRequest::new(fx.path("template.cws"), seed, fx.path("result.cws"));
    let tool = FakeTool::new().failing_blank();

    let report = run(&fx, &request, &tool).await.result.unwrap();
    assert_eq!(report.converted, 2);
    assert_eq!(report.blanked, 0);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].kind(), Some(ErrorKind::TransformTool));

    let members = read_archive(&fx.path("result.cws"));
    assert_eq!(
        slice_members(&members),
        vec!["result0000.png", "result0001.png", "template0002.png", "template0003.png"]
    );
    assert_eq!(text(&members["template0003.png"]), "TEMPLATE 3");
}

#[tokio::test]
async fn test_unwritable_output_is_archive_write_error() {
    let fx = Fixture::new();
    write_template(&fx.path("template.cws"), "template", 2);
    let seed = write_stack(fx.dir.path(), "layer_", 2);
    // A directory where the output file should go.
    fs::create_dir(fx.path("result.cws")).unwrap();
    let request = StackRequest::new(fx.path("template.cws"), seed, fx.path("result.cws"));

    let run = run(&fx, &request, &FakeTool::new()).await;
    let err = run.result.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::ArchiveWrite));
    assert!(is_empty_dir(fx.scratch.path()));
    assert!(fx.path("result.cws").is_dir());
}

#[tokio::test]
async fn test_unwritable_output_fails_the_job() {
    let fx = Fixture::new();
    write_template(&fx.path("template.cws"), "template", 2);
    let seed = write_stack(fx.dir.path(), "layer_", 2);
    fs::create_dir(fx.path("result.cws")).unwrap();
    let request = StackRequest::new(fx.path("template.cws"), seed, fx.path("result.cws"));

    let config = JobConfig { poll_interval_ms: 5, ..fx.config() };
    let mut controller = JobController::new(config, Arc::new(FakeTool::new()));
    assert!(controller.start(request));
    let status = tokio::time::timeout(std::time::Duration::from_secs(10), controller.wait())
        .await
        .unwrap();
    assert!(status.done);
    assert!(!status.success);
    assert_eq!(status.stage, JobStage::Failed);
    assert_eq!(status.error, Some(ErrorKind::ArchiveWrite));
    assert_eq!(status.percent, 100.0);
    assert!(is_empty_dir(fx.scratch.path()));
}

fn assert_percent(status: &watch::Receiver<JobStatus>, expected: f64) {
    let percent = status.borrow().percent;
    assert!((percent - expected).abs() < 1e-9, "percent {} != {}", percent, expected);
}

#[tokio::test]
async fn test_progress_while_converting() {
    let fx = Fixture::new();
    write_template(&fx.path("template.cws"), "template", 5);
    let seed = write_stack(fx.dir.path(), "layer_", 3);
    let request = StackRequest::new(fx.path("template.cws"), seed, fx.path("result.cws"));
    let gate = Arc::new(Semaphore::new(0));
    let (tool, mut started) = FakeTool::gated(gate.clone());
    let (reporter, status, _messages) = JobReporter::channel(CancelFlag::default());
    let config = fx.config();
    let worker = tokio::spawn(async move { pipeline::run(&request, &config, &tool, &reporter).await });

    // Each convert starts only after the previous slot's progress is published.
    for done in 0..3 {
        started.recv().await.unwrap();
        assert_eq!(status.borrow().stage, JobStage::Converting);
        assert_percent(&status, 5.0 + 80.0 * done as f64 / 3.0);
        gate.add_permits(1);
    }

    let report = worker.await.unwrap().unwrap();
    assert_eq!(report.blanked, 2);
    assert_eq!(status.borrow().stage, JobStage::Repacking);
    assert_percent(&status, 99.0);
}

#[test]
fn test_progress_formulas() {
    // Three of five slots converted, then the remaining two blanked.
    let converting: Vec<f64> = (1..=3).map(|i| pipeline::converting_percent(i, 3)).collect();
    assert_eq!(converting[2], 85.0);
    assert!(converting.windows(2).all(|w| w[0] < w[1]));
    let blanking: Vec<f64> = (1..=2).map(|i| pipeline::blanking_percent(i, 2)).collect();
    assert!((blanking[0] - (85.0 + 10.0 / 3.0)).abs() < 1e-9);
    assert!((blanking[1] - (85.0 + 20.0 / 3.0)).abs() < 1e-9);
}

#[test]
fn test_request_paths_are_kept() {
    let request = StackRequest::new("a.cws", "s_0000.png", Path::new("dir").join("b.cws"));
    assert_eq!(request.output_base(), "b");
}
