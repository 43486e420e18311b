//! The task handler contract
//!
//! Handlers do the site-specific work: given the params of an assigned job
//! they fetch whatever they need, build a result payload (conventionally a
//! gzip blob), upload it through the context, and hand the coordinator's
//! response back to the agent for re-dispatch. What a handler actually
//! crawls is none of the agent's business; the agent only routes commands to
//! handlers and enforces pacing.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::upload::CoordinatorClient;
use shared::utils::params_to_filename;

/// How a handler failed.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The params are permanently unfetchable (a "nothing for you to see"
    /// page, a deleted article). The agent reports this to the coordinator
    /// and the job will not be retried.
    #[error("nothing here for {0:?}")]
    Permanent(String),
    /// Anything else: network trouble, parse failures. Propagates into the
    /// agent's retry/backoff loop.
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

/// What the agent hands a handler: the upload client, the handler's task
/// path, and the local store for cached artifacts.
pub struct HandlerContext<'a> {
    pub client: &'a CoordinatorClient,
    pub task_path: &'a str,
    pub store_dir: &'a Path,
}

impl<'a> HandlerContext<'a> {
    /// Upload a result payload for the current task. Returns the response
    /// body, the next command, which the handler gives back to the agent.
    pub async fn upload_result(
        &self,
        params: &str,
        filename: &str,
        payload: &[u8],
        extra_fields: &[(&str, &str)],
    ) -> Result<String, HandlerError> {
        self.client
            .upload_result(self.task_path, params, filename, payload, extra_fields)
            .await
            .map_err(HandlerError::Transient)
    }

    /// Keep a local copy of retrieved data for recovery. Params are turned
    /// into something filesystem safe here.
    pub fn write_to_store(
        &self,
        params: &str,
        extension: &str,
        data: &[u8],
    ) -> Result<PathBuf, HandlerError> {
        let filename = format!("{}{}", params_to_filename(params), extension);
        let path = self.store_dir.join(filename);
        std::fs::write(&path, data)
            .map_err(|e| HandlerError::Transient(anyhow::anyhow!(
                "Failed to write local artifact {}: {}", path.display(), e
            )))?;
        info!(path = %path.display(), "Wrote retrieved data to the local store");
        Ok(path)
    }
}

/// A registered command handler.
///
/// `Ok(Some(body))` is a coordinator response the agent must re-dispatch as
/// a forced sleep - the normal outcome after an upload. `Ok(None)` means the
/// handler did not contact the coordinator and there is nothing further to
/// do.
///
/// Handlers fetch external resources with their own retry policy; a few
/// attempts with a linearly growing pause (60s per attempt) has served well
/// against flaky sites. Whatever is retrieved should be cached through
/// [`HandlerContext::write_to_store`] before uploading, so a crashed worker
/// can recover its work.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(
        &self,
        params: &str,
        ctx: &HandlerContext<'_>,
    ) -> Result<Option<String>, HandlerError>;
}

/// Dummy handler that just logs. The embedding point for real article
/// retrievers; also handy as a liveness check.
pub struct PongHandler;

#[async_trait]
impl TaskHandler for PongHandler {
    async fn run(
        &self,
        _params: &str,
        _ctx: &HandlerContext<'_>,
    ) -> Result<Option<String>, HandlerError> {
        info!("PONG!");
        // No upload happened, so there is no follow-up command to obey
        Ok(None)
    }
}
