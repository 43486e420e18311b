//! Task controllers: the durable side of the job lifecycle
//!
//! A controller manages one task type. It owns three durable stores keyed by
//! the job params - *pending* (known but not finished), *done*, and
//! *erroneous* - and the artifact directory where uploaded result payloads
//! land. The scheduler's queues are volatile; on startup every controller
//! replays its pending store into the scheduler, which is how in-flight work
//! survives a restart.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::scheduler::Scheduler;
use crate::store::{JobStore, StoreBackend};
use shared::utils::params_to_filename;

/// A controller was asked about a job it does not know.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job {params:?} for task {action}")]
pub struct UnknownJob {
    pub action: String,
    pub params: String,
}

/// Per-task durable state and artifact storage.
pub struct TaskController {
    /// The uppercase action token this controller owns, e.g. `ARTICLE`.
    action: String,
    pending: Box<dyn JobStore>,
    done: Box<dyn JobStore>,
    erroneous: Box<dyn JobStore>,
    artifact_dir: PathBuf,
    artifact_suffix: String,
}

impl TaskController {
    /// Open (creating if absent) the three stores under
    /// `<state_dir>/<prefix>/{queue,done,error}` and the artifact directory.
    pub fn open(
        backend: StoreBackend,
        state_dir: &Path,
        prefix: &str,
        action: &str,
        artifact_dir: &Path,
        artifact_suffix: &str,
    ) -> Result<Self> {
        let base = state_dir.join(prefix);
        let pending = backend.open(&base.join("queue"))?;
        let done = backend.open(&base.join("done"))?;
        let erroneous = backend.open(&base.join("error"))?;

        std::fs::create_dir_all(artifact_dir).with_context(|| {
            format!(
                "Failed to create artifact directory {}",
                artifact_dir.display()
            )
        })?;

        Ok(Self {
            action: action.to_string(),
            pending,
            done,
            erroneous,
            artifact_dir: artifact_dir.to_path_buf(),
            artifact_suffix: artifact_suffix.to_string(),
        })
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    /// Re-register every pending job with the scheduler. Called once at
    /// startup; whatever was in flight when the previous process stopped is
    /// treated as not yet done and replayed.
    pub fn register_pending(&self, scheduler: &mut Scheduler) -> Result<usize> {
        let keys = self.pending.keys()?;
        for params in &keys {
            scheduler.append_work(&self.action, params);
        }
        info!(
            action = %self.action,
            count = keys.len(),
            "Re-registered pending jobs with the scheduler"
        );
        Ok(keys.len())
    }

    /// Register a new job unless it is already pending or already done.
    /// Returns whether the job was actually added.
    pub fn add_job(&mut self, scheduler: &mut Scheduler, params: &str) -> Result<bool> {
        if self.done.contains(params)? || self.pending.contains(params)? {
            return Ok(false);
        }
        self.pending.put(params, "1")?;
        scheduler.append_work(&self.action, params);
        debug!(action = %self.action, params = %params, "Job added");
        Ok(true)
    }

    pub fn is_done(&self, params: &str) -> Result<bool> {
        self.done.contains(params)
    }

    /// Mark a job finished. Idempotent: a repeated upload overwrites the done
    /// flag, and the scheduler's complaint about already-removed work is
    /// swallowed because the job has already been finalized.
    ///
    /// The done flag is durable before the scheduler forgets the job, so a
    /// crash in between can only lead to a replayed job, never a lost one.
    pub fn mark_job_done(&mut self, scheduler: &mut Scheduler, params: &str) -> Result<()> {
        self.done.put(params, "1")?;
        if self.pending.contains(params)? {
            self.pending.delete(params)?;
        }
        if let Err(e) = scheduler.mark_work_done(&self.action, params) {
            debug!(action = %self.action, params = %params, error = %e,
                "Scheduler had no record of completed job (duplicate upload?)");
        }
        Ok(())
    }

    /// Move a pending job to the erroneous store after a worker reported a
    /// permanent failure for it.
    pub fn mark_job_erroneous(
        &mut self,
        scheduler: &mut Scheduler,
        params: &str,
    ) -> Result<(), ControllerError> {
        if !self.pending.contains(params).map_err(ControllerError::Store)? {
            return Err(ControllerError::UnknownJob(UnknownJob {
                action: self.action.clone(),
                params: params.to_string(),
            }));
        }
        self.erroneous
            .put(params, "1")
            .map_err(ControllerError::Store)?;
        self.pending
            .delete(params)
            .map_err(ControllerError::Store)?;
        if let Err(e) = scheduler.mark_work_done(&self.action, params) {
            warn!(action = %self.action, params = %params, error = %e,
                "Scheduler had no record of erroneous job");
        }
        Ok(())
    }

    /// Write an uploaded result payload into the artifact directory, whole
    /// file, under a filename derived from the params. A retry overwrites.
    pub fn store_artifact(&self, params: &str, data: &[u8]) -> Result<PathBuf> {
        let filename = format!("{}{}", params_to_filename(params), self.artifact_suffix);
        let path = self.artifact_dir.join(filename);
        std::fs::write(&path, data)
            .with_context(|| format!("Failed to write artifact {}", path.display()))?;
        Ok(path)
    }

    pub fn counts(&self) -> Result<(usize, usize, usize)> {
        Ok((
            self.pending.len()?,
            self.done.len()?,
            self.erroneous.len()?,
        ))
    }

    /// HTML fragment for the management page.
    pub fn status_fragment(&self) -> Result<String> {
        let (queued, done, erroneous) = self.counts()?;
        let total = queued + done + erroneous;
        let percent = |n: usize| {
            if total == 0 {
                0.0
            } else {
                (n as f64) * 100.0 / (total as f64)
            }
        };
        Ok(format!(
            "<dl>\n\
             <dt>Queued jobs</dt><dd>{queued} ({:02.2}%)</dd>\n\
             <dt>Done jobs</dt><dd>{done} ({:02.2}%)</dd>\n\
             <dt>Erroneous jobs</dt><dd>{erroneous} ({:02.2}%)</dd>\n\
             <dt>Total</dt><dd>{total}</dd>\n\
             </dl>",
            percent(queued),
            percent(done),
            percent(erroneous),
        ))
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, params: &str) -> Result<bool> {
        self.pending.contains(params)
    }

    #[cfg(test)]
    pub(crate) fn is_erroneous(&self, params: &str) -> Result<bool> {
        self.erroneous.contains(params)
    }
}

/// Errors surfaced by controller operations.
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error(transparent)]
    UnknownJob(#[from] UnknownJob),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
