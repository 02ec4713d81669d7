// src/job.rs - Background stack-injection job: status, message feed, cancellation
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::config::JobConfig;
use crate::error::{ErrorKind, JobError};
use crate::pipeline::{self, PipelineReport};
use crate::request::StackRequest;
use crate::tool::TransformTool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Idle,
    Validating,
    Unpacking,
    Probing,
    Converting,
    Blanking,
    Repacking,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStage::Succeeded | JobStage::Failed | JobStage::Cancelled)
    }
}

/// Snapshot of a job, as seen by the polling side.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStatus {
    pub job_id: Option<String>,
    pub done: bool,
    /// Meaningful only once `done` is set.
    pub success: bool,
    pub final_message: String,
    /// 0–100, never decreasing while the job runs.
    pub percent: f64,
    pub stage: JobStage,
    pub error: Option<ErrorKind>,
}

impl JobStatus {
    fn idle() -> Self {
        Self {
            job_id: None,
            done: false,
            success: false,
            final_message: String::new(),
            percent: 0.0,
            stage: JobStage::Idle,
            error: None,
        }
    }

    fn started(job_id: &str) -> Self {
        Self {
            job_id: Some(job_id.to_string()),
            stage: JobStage::Validating,
            ..Self::idle()
        }
    }
}

/// Cooperative cancellation request, checked by the worker between slices.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Worker-side handle: the only writer of a job's status and message feed.
/// Every message is mirrored to the tracing log.
#[derive(Debug, Clone)]
pub struct JobReporter {
    status: Arc<watch::Sender<JobStatus>>,
    messages: mpsc::UnboundedSender<String>,
    cancel: CancelFlag,
}

impl JobReporter {
    /// A reporter with fresh channels, returning the reading ends.
    pub fn channel(cancel: CancelFlag) -> (Self, watch::Receiver<JobStatus>, mpsc::UnboundedReceiver<String>) {
        Self::with_status(JobStatus::started(&uuid::Uuid::new_v4().to_string()), cancel)
    }

    fn with_status(
        initial: JobStatus,
        cancel: CancelFlag,
    ) -> (Self, watch::Receiver<JobStatus>, mpsc::UnboundedReceiver<String>) {
        let (status_tx, status_rx) = watch::channel(initial);
        let (message_tx, message_rx) = mpsc::unbounded_channel();
        let reporter = Self {
            status: Arc::new(status_tx),
            messages: message_tx,
            cancel,
        };
        (reporter, status_rx, message_rx)
    }

    pub fn message(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        let _ = self.messages.send(message);
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        let _ = self.messages.send(message);
    }

    pub fn stage(&self, stage: JobStage) {
        tracing::debug!("Stage: {:?}", stage);
        self.status.send_modify(|s| s.stage = stage);
    }

    /// Raise the progress figure; lower values are ignored.
    pub fn percent(&self, percent: f64) {
        self.status.send_modify(|s| {
            if percent > s.percent {
                s.percent = percent.min(100.0);
            }
        });
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Publish the terminal state. Only the first call has any effect.
    pub fn finish(&self, result: Result<PipelineReport, JobError>) {
        if self.status.borrow().done {
            return;
        }
        let (stage, success, message, error) = match result {
            Ok(report) => match report.failures.first() {
                None => {
                    self.message("Done!");
                    (JobStage::Succeeded, true, "Success".to_string(), None)
                }
                Some(first) => {
                    tracing::error!("Job finished with {} failures", report.failures.len());
                    (JobStage::Failed, false, first.to_string(), first.kind())
                }
            },
            Err(JobError::Cancelled) => {
                self.message("Cancelled!");
                (JobStage::Cancelled, false, "Cancelled!".to_string(), None)
            }
            Err(e) => {
                tracing::error!("Job failed: {}", e);
                let _ = self.messages.send(e.to_string());
                (JobStage::Failed, false, e.to_string(), e.kind())
            }
        };
        self.status.send_modify(|s| {
            s.stage = stage;
            s.success = success;
            s.final_message = message;
            s.error = error;
            s.percent = 100.0;
            s.done = true;
        });
    }
}

/// Runs one stack-injection job at a time on a background tokio task.
///
/// The caller polls [`JobController::poll_status`] and drains
/// [`JobController::poll_message`] at its own pace; the worker never blocks on it.
pub struct JobController {
    config: JobConfig,
    tool: Arc<dyn TransformTool>,
    status: watch::Receiver<JobStatus>,
    messages: Option<mpsc::UnboundedReceiver<String>>,
    cancel: CancelFlag,
    supervisor: Option<JoinHandle<()>>,
}

impl JobController {
    pub fn new(config: JobConfig, tool: Arc<dyn TransformTool>) -> Self {
        let (_, status) = watch::channel(JobStatus::idle());
        Self {
            config,
            tool,
            status,
            messages: None,
            cancel: CancelFlag::default(),
            supervisor: None,
        }
    }

    /// Launch `request` in the background. Returns `false` if there is no
    /// runtime to spawn on, or the previous job has not finished.
    pub fn start(&mut self, request: StackRequest) -> bool {
        if self.is_active() {
            tracing::warn!("A job is already running; not starting another");
            return false;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!("No async runtime available to run the job");
            return false;
        };

        let job_id = uuid::Uuid::new_v4().to_string();
        self.cancel.reset();
        let (reporter, status, messages) = JobReporter::with_status(JobStatus::started(&job_id), self.cancel.clone());
        self.status = status;
        self.messages = Some(messages);

        let tool = self.tool.clone();
        let config = self.config.clone();
        let span = tracing::info_span!("job", id = %job_id);
        tracing::info!("Starting job {}: {} -> {}", job_id, request.template.display(), request.output.display());

        self.supervisor = Some(runtime.spawn(async move {
            let worker_reporter = reporter.clone();
            let worker = tokio::spawn(
                async move { pipeline::run(&request, &config, tool.as_ref(), &worker_reporter).await }
                    .instrument(span),
            );
            let result = match worker.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(JobError::Unknown("the worker panicked".to_string())),
                Err(e) => Err(JobError::Unknown(e.to_string())),
            };
            reporter.finish(result);
        }));
        true
    }

    /// Current status; cheap and non-blocking.
    pub fn poll_status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    /// Next queued progress message, if any.
    pub fn poll_message(&mut self) -> Option<String> {
        self.messages.as_mut()?.try_recv().ok()
    }

    /// Ask the running job to stop at its next checkpoint. Idempotent.
    pub fn request_cancel(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!("Cancellation requested");
        }
        self.cancel.cancel();
    }

    /// Shared cancellation flag, e.g. for a signal handler.
    pub fn cancel_handle(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn is_active(&self) -> bool {
        let status = self.status.borrow();
        status.stage != JobStage::Idle && !status.done
    }

    /// Poll at the configured interval until the job is done.
    pub async fn wait(&self) -> JobStatus {
        loop {
            let status = self.poll_status();
            if status.done || status.stage == JobStage::Idle {
                return status;
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }
}

impl Drop for JobController {
    fn drop(&mut self) {
        // The worker owns its scratch directory; stop it at the next checkpoint.
        if self.supervisor.is_some() && self.is_active() {
            self.cancel.cancel();
        }
    }
}
