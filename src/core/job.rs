//! Purpose: Background copy of every partition of a source level into a target writer.
//! Exports: `CopyJob`, `JobId`, `JobInfo`, `JobStatus`, `JobSnapshot`.
//! Role: Long-running unit of work tracked by `LevelManager`; awaitable, pollable, cancellable.
//! Invariants: States only move created -> running -> completed | failed | cancelled.
//! Invariants: The source use-token is handed back exactly once, before the terminal state is published.
//! Invariants: Cancellation is observed between partitions, never inside one.
//! Invariants: A failed or cancelled job closes its writer and removes the partial output.

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::core::error::{Error, ErrorKind};
use crate::core::format::TargetWriter;
use crate::core::handle::{LevelHandle, UseToken};
use crate::core::store::{LevelWriter, Platform, Selection};

const INDETERMINATE: u64 = u64::MAX;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct JobId(u64);

impl JobId {
    pub fn get(self) -> u64 {
        self.0
    }

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Created,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Clone, Debug)]
enum JobState {
    Created,
    Running,
    Completed,
    Failed(Error),
    Cancelled,
}

impl JobState {
    fn status(&self) -> JobStatus {
        match self {
            JobState::Created => JobStatus::Created,
            JobState::Running => JobStatus::Running,
            JobState::Completed => JobStatus::Completed,
            JobState::Failed(_) => JobStatus::Failed,
            JobState::Cancelled => JobStatus::Cancelled,
        }
    }

    fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }
}

/// Fixed description of a job, fit for observability endpoints.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: JobId,
    pub path: PathBuf,
    pub source_class: String,
    pub source_dimension: String,
    pub source_selection_min: [i32; 3],
    pub source_selection_max: [i32; 3],
    pub target_class: String,
    pub target_dimension: String,
    pub target_path: PathBuf,
    pub target_format: String,
    pub target_platform: Platform,
    /// RFC 3339 time the copy was started; unset for a job cancelled before it ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
}

impl JobInfo {
    pub fn source_selection(&self) -> Selection {
        Selection::new(self.source_selection_min, self.source_selection_max)
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub processor: &'static str,
    pub id: JobId,
    #[serde(rename = "state")]
    pub status: JobStatus,
    pub progress: Option<f64>,
    pub info: JobInfo,
}

pub struct CopyJob {
    info: JobInfo,
    source: Arc<LevelHandle>,
    token: UseToken,
    target: Mutex<Option<Box<dyn LevelWriter>>>,
    progress: AtomicU64,
    cancel_requested: AtomicBool,
    started: AtomicBool,
    started_at: OnceLock<String>,
    state: watch::Sender<JobState>,
}

impl CopyJob {
    pub const PROCESSOR: &'static str = "ChunkCopyProcess";

    pub(crate) fn new(
        id: JobId,
        source: Arc<LevelHandle>,
        token: UseToken,
        target: TargetWriter,
    ) -> Result<Self, Error> {
        let level = source.level();
        let source_dimension = level.dimensions().into_iter().next().ok_or_else(|| {
            Error::new(ErrorKind::Usage)
                .with_message("source level has no dimensions")
                .with_path(source.path())
        })?;
        let selection = level.bounds(&source_dimension)?;
        let (target_path, target_format, platform, writer) = target.into_parts();
        let target_dimension = writer
            .dimensions()
            .into_iter()
            .next()
            .unwrap_or_else(|| source_dimension.clone());

        let info = JobInfo {
            id,
            path: source.path().to_path_buf(),
            source_class: level.class_name().to_string(),
            source_dimension,
            source_selection_min: selection.min,
            source_selection_max: selection.max,
            target_class: writer.class_name().to_string(),
            target_dimension,
            target_path,
            target_format,
            target_platform: platform.unwrap_or_else(|| level.platform()),
            started_at: None,
        };
        let (state, _) = watch::channel(JobState::Created);

        Ok(Self {
            info,
            source,
            token,
            target: Mutex::new(Some(writer)),
            progress: AtomicU64::new(INDETERMINATE),
            cancel_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
            started_at: OnceLock::new(),
            state,
        })
    }

    pub fn id(&self) -> JobId {
        self.info.id
    }

    pub fn info(&self) -> JobInfo {
        JobInfo {
            started_at: self.started_at.get().cloned(),
            ..self.info.clone()
        }
    }

    pub fn source(&self) -> &Arc<LevelHandle> {
        &self.source
    }

    pub fn status(&self) -> JobStatus {
        self.state.borrow().status()
    }

    /// Fraction of partitions copied, or `None` until the first one lands.
    ///
    /// Only a completed job reports `1.0`.
    pub fn progress(&self) -> Option<f64> {
        if matches!(*self.state.borrow(), JobState::Completed) {
            return Some(1.0);
        }
        let bits = self.progress.load(Ordering::Acquire);
        (bits != INDETERMINATE).then(|| f64::from_bits(bits))
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            processor: Self::PROCESSOR,
            id: self.info.id,
            status: self.status(),
            progress: self.progress(),
            info: self.info(),
        }
    }

    /// Spawns the copy. Later calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let now = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
        let _ = self.started_at.set(now);
        self.state.send_replace(JobState::Running);
        let job = Arc::clone(self);
        tokio::spawn(async move {
            info!(job = %job.id(), path = %job.info.path.display(), "starting chunk copy");
            let worker = Arc::clone(&job);
            let outcome = match tokio::task::spawn_blocking(move || worker.run()).await {
                Ok(outcome) => outcome,
                Err(err) => Err(Error::new(ErrorKind::Internal)
                    .with_message("chunk copy worker panicked")
                    .with_source(err)),
            };
            job.finish(outcome).await;
        });
    }

    /// Resolves once the job is terminal; a failed job yields its error.
    pub async fn wait(&self) -> Result<(), Error> {
        let mut rx = self.state.subscribe();
        let state = rx
            .wait_for(JobState::is_terminal)
            .await
            .map_err(|_| Error::new(ErrorKind::Internal).with_message("job state channel closed"))?
            .clone();
        match state {
            JobState::Completed => Ok(()),
            JobState::Failed(err) => Err(err),
            JobState::Cancelled => Err(Error::cancelled().with_path(&self.info.path)),
            JobState::Created | JobState::Running => {
                Err(Error::new(ErrorKind::Internal).with_message("job is not finished"))
            }
        }
    }

    /// Requests cancellation and waits for the copy to stop.
    ///
    /// The cancellation itself is not reported as an error; a failure that
    /// happened before the request was observed still is.
    pub async fn cancel(&self) -> Result<(), Error> {
        self.cancel_requested.store(true, Ordering::SeqCst);
        if !self.started.swap(true, Ordering::SeqCst) {
            let writer = self.lock_target().take();
            if let Some(mut writer) = writer {
                if let Err(err) = writer.close() {
                    warn!(job = %self.id(), error = %err, "failed to close unused target");
                }
            }
            self.finish(Err(Error::cancelled())).await;
            return Ok(());
        }
        info!(job = %self.id(), "cancelling chunk copy");
        match self.wait().await {
            Ok(()) => Ok(()),
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    async fn finish(&self, outcome: Result<(), Error>) {
        self.source.remove_use(self.token).await;
        let state = match outcome {
            Ok(()) => {
                info!(job = %self.id(), path = %self.info.path.display(), "completed chunk copy");
                JobState::Completed
            }
            Err(err) if err.is_cancelled() => {
                warn!(job = %self.id(), path = %self.info.path.display(), "interrupted chunk copy");
                JobState::Cancelled
            }
            Err(err) => {
                error!(
                    job = %self.id(),
                    path = %self.info.path.display(),
                    target = %self.info.target_path.display(),
                    source_class = %self.info.source_class,
                    target_class = %self.info.target_class,
                    error = %err,
                    "exception in chunk copy"
                );
                JobState::Failed(err)
            }
        };
        self.state.send_replace(state);
    }

    fn lock_target(&self) -> MutexGuard<'_, Option<Box<dyn LevelWriter>>> {
        self.target.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    // Runs on the blocking pool.
    fn run(&self) -> Result<(), Error> {
        let mut writer = self.lock_target().take().ok_or_else(|| {
            Error::new(ErrorKind::Internal).with_message("copy target was already consumed")
        })?;
        if self.is_cancel_requested() {
            self.close_quietly(writer.as_mut());
            return Err(Error::cancelled().with_path(&self.info.path));
        }

        match panic::catch_unwind(AssertUnwindSafe(|| self.copy_into(writer.as_mut()))) {
            Ok(result) => result,
            Err(payload) => {
                // The writer may hold partial output; it is still ours to clean up.
                self.discard(writer.as_mut());
                Err(Error::new(ErrorKind::Job)
                    .with_message(format!("chunk copy panicked: {}", panic_message(&*payload)))
                    .with_path(&self.info.path))
            }
        }
    }

    fn copy_into(&self, writer: &mut dyn LevelWriter) -> Result<(), Error> {
        let selection = self.info.source_selection();
        if let Err(err) = writer.create_and_open(&self.info.target_platform, &selection, false) {
            // Nothing of ours exists at the target yet; leave whatever is there alone.
            self.close_quietly(writer);
            return Err(self.job_error(err, "failed to create target"));
        }

        let result = self.copy_partitions(writer, &selection).and_then(|()| {
            writer
                .close()
                .map_err(|err| self.job_error(err, "failed to close target"))
        });
        if result.is_err() {
            self.discard(writer);
        }
        result
    }

    fn copy_partitions(
        &self,
        writer: &mut dyn LevelWriter,
        selection: &Selection,
    ) -> Result<(), Error> {
        let level = self.source.level();
        let dimension = &self.info.source_dimension;
        let chunks = level
            .partitions(dimension, selection)
            .map_err(|err| self.job_error(err, "failed to enumerate source partitions"))?;
        let total = chunks.len();

        for (index, pos) in chunks.into_iter().enumerate() {
            if self.is_cancel_requested() {
                return Err(Error::cancelled().with_path(&self.info.path));
            }
            let partition = level.read_partition(dimension, pos).map_err(|err| {
                self.job_error(err, format!("failed to read chunk {},{}", pos.cx, pos.cz))
            })?;
            writer
                .commit_partition(&partition, &self.info.target_dimension)
                .map_err(|err| {
                    self.job_error(err, format!("failed to commit chunk {},{}", pos.cx, pos.cz))
                })?;
            let done = index + 1;
            if done < total {
                self.record_progress(done as f64 / total as f64);
            }
        }

        writer
            .save()
            .map_err(|err| self.job_error(err, "failed to save target"))
    }

    fn record_progress(&self, value: f64) {
        self.progress.store(value.to_bits(), Ordering::Release);
    }

    fn job_error(&self, err: Error, message: impl Into<String>) -> Error {
        match err.kind() {
            ErrorKind::Cancelled | ErrorKind::AlreadyExists => err,
            _ => err.wrap(ErrorKind::Job, message),
        }
    }

    fn close_quietly(&self, writer: &mut dyn LevelWriter) {
        if let Err(err) = writer.close() {
            warn!(job = %self.id(), error = %err, "failed to close target");
        }
    }

    fn discard(&self, writer: &mut dyn LevelWriter) {
        self.close_quietly(writer);
        match writer.remove_output() {
            Ok(()) => info!(
                job = %self.id(),
                target = %self.info.target_path.display(),
                "removed partial target"
            ),
            Err(err) => warn!(
                job = %self.id(),
                target = %self.info.target_path.display(),
                error = %err,
                "failed to remove partial target"
            ),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text
    } else {
        "unknown panic"
    }
}

impl fmt::Debug for CopyJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CopyJob")
            .field("id", &self.info.id)
            .field("path", &self.info.path)
            .field("target", &self.info.target_path)
            .field("status", &self.status())
            .finish()
    }
}
