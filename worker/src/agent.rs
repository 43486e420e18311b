//! The worker's main loop
//!
//! The agent endlessly pings the coordinator, parses the returned command,
//! and dispatches it to a registered handler. Two rules keep a worker from
//! hammering the target site even when the coordinator misbehaves: after a
//! handler uploads its result, the upload response is re-entered as a
//! forced sleep clamped to at least [`MIN_SLEEP`] seconds; and transport
//! failures back off by a growing delay before giving up for good.

use anyhow::{Context, Result};
use chrono::{Local, TimeDelta};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::handler::{HandlerContext, HandlerError, TaskHandler};
use crate::upload::CoordinatorClient;
use shared::protocol::{Command, WrongCommandFormat};

/// Minimum number of seconds between two consecutive non-sleep commands.
/// Enforced client-side no matter what the coordinator says.
pub const MIN_SLEEP: u64 = 240;

/// The run loop terminates on this many consecutive failed ping cycles.
const MAX_CONSECUTIVE_FAILURES: u32 = 6;

/// Each consecutive failure adds this many minutes to the retry sleep.
const RETRY_STEP_MINUTES: u64 = 15;

struct RegisteredHandler {
    task_path: String,
    handler: Box<dyn TaskHandler>,
}

pub struct WorkerAgent {
    client_id: String,
    client: CoordinatorClient,
    store_dir: PathBuf,
    handlers: HashMap<String, RegisteredHandler>,
}

impl WorkerAgent {
    pub fn new(
        base_url: String,
        store_dir: PathBuf,
        client_id: String,
        client_hostname: &str,
        handler_version: &str,
    ) -> Result<Self> {
        std::fs::create_dir_all(&store_dir)
            .with_context(|| format!("Failed to create store directory {}", store_dir.display()))?;
        let client =
            CoordinatorClient::new(base_url, &client_id, client_hostname, handler_version)?;
        Ok(Self {
            client_id,
            client,
            store_dir,
            handlers: HashMap::new(),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Register a handler for an action. `task_path` is the URL segment its
    /// results are uploaded under. SLEEP needs no registration; it is
    /// built in.
    pub fn register_handler(
        &mut self,
        action: &str,
        task_path: &str,
        handler: Box<dyn TaskHandler>,
    ) {
        self.handlers.insert(
            action.to_string(),
            RegisteredHandler {
                task_path: task_path.to_string(),
                handler,
            },
        );
    }

    /// The endless ping-and-dispatch loop.
    ///
    /// On any error the cycle is logged and retried with a cumulative
    /// backoff of +15 minutes per consecutive failure; the sixth
    /// consecutive failure terminates the agent.
    pub async fn run(&self) -> Result<()> {
        let mut n_attempts: u32 = 0;
        let mut sleep_delay_mins: u64 = 0;
        loop {
            match self.ping_and_dispatch().await {
                Ok(()) => {
                    // Success! Reset retry counters
                    n_attempts = 0;
                    sleep_delay_mins = 0;
                }
                Err(e) => {
                    n_attempts += 1;
                    if n_attempts >= MAX_CONSECUTIVE_FAILURES {
                        error!(attempts = n_attempts, error = %format!("{:#}", e),
                            "Giving up after too many consecutive failures");
                        return Err(e.context("too many consecutive failed ping cycles"));
                    }
                    sleep_delay_mins += RETRY_STEP_MINUTES;
                    warn!(attempts = n_attempts, retry_in_mins = sleep_delay_mins,
                        error = %format!("{:#}", e), "Ignoring error, will retry");
                    tokio::time::sleep(Duration::from_secs(sleep_delay_mins * 60)).await;
                }
            }
        }
    }

    async fn ping_and_dispatch(&self) -> Result<()> {
        let body = self.client.ping().await?;
        self.dispatch(&body).await
    }

    /// Parse and execute one command from the coordinator.
    pub(crate) async fn dispatch(&self, body: &str) -> Result<()> {
        let command = Command::parse(body)?;
        if command.is_sleep() {
            let seconds: u64 = command
                .params
                .parse()
                .map_err(|_| WrongCommandFormat(body.to_string()))?;
            self.sleep_for(seconds).await;
            return Ok(());
        }

        let registered = self.handlers.get(&command.action).ok_or_else(|| {
            anyhow::anyhow!("No handler registered for action {}", command.action)
        })?;
        info!(action = %command.action, params = %command.params, "Handling command");

        let ctx = HandlerContext {
            client: &self.client,
            task_path: &registered.task_path,
            store_dir: &self.store_dir,
        };
        let follow_up = match registered.handler.run(&command.params, &ctx).await {
            Ok(follow_up) => follow_up,
            Err(HandlerError::Permanent(params)) => {
                // Known-permanent failure: tell the coordinator and move on
                warn!(action = %command.action, params = %params,
                    "Handler reported a permanently failed job");
                Some(
                    self.client
                        .report_nothing(&registered.task_path, &params)
                        .await?,
                )
            }
            Err(HandlerError::Transient(e)) => return Err(e),
        };

        // After a job the coordinator's answer ought to be a SLEEP; whatever
        // it is, we sleep at least MIN_SLEEP before touching the site again.
        if let Some(body) = follow_up {
            let seconds = forced_sleep_seconds(&body)?;
            self.sleep_for(seconds).await;
        }
        Ok(())
    }

    async fn sleep_for(&self, seconds: u64) {
        let now = Local::now();
        let wake = now + TimeDelta::seconds(seconds as i64);
        info!(
            "PING, sleeping for {} (now: {} wake: {})",
            seconds,
            now.format("%Y%m%dT%H%M%S"),
            wake.format("%Y%m%dT%H%M%S")
        );
        tokio::time::sleep(Duration::from_secs(seconds)).await;
    }
}

/// How long to sleep when a response is re-dispatched after a job.
///
/// The clamp is applied to the parsed action, not the raw body: a SLEEP with
/// a short duration is raised to [`MIN_SLEEP`], and any non-SLEEP command is
/// ignored and replaced by a [`MIN_SLEEP`] sleep. A malformed body is still
/// an error.
pub(crate) fn forced_sleep_seconds(body: &str) -> Result<u64, WrongCommandFormat> {
    let command = Command::parse(body)?;
    if command.is_sleep() {
        Ok(command.params.parse::<u64>().map_or(MIN_SLEEP, |n| n.max(MIN_SLEEP)))
    } else {
        Ok(MIN_SLEEP)
    }
}
