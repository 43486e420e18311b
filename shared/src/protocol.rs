//! Wire protocol between the coordinator and its workers
//!
//! This module defines the single-line command format the coordinator returns
//! to workers, plus the header and endpoint names both sides must agree on.
//! A command has the form `"<ACTION> <PARAMS> #"` - exactly three
//! whitespace-separated tokens, the trailing token being the single character
//! `#` used as an end-of-command sentinel. Neither the action nor the params
//! may contain whitespace.

use std::fmt;

/// The action token of the built-in sleep command. Workers always have a
/// handler registered for it.
pub const SLEEP_ACTION: &str = "SLEEP";

/// The end-of-command sentinel token.
const TRAILER: &str = "#";

/// HTTP headers a worker sends on every request
pub mod headers {
    pub const CLIENT_ID: &str = "client-id";
    pub const CLIENT_HOSTNAME: &str = "client-hostname";
    pub const CLIENT_VERSION: &str = "client-version";
    pub const CLIENT_ARVER: &str = "client-arver";
}

/// Coordinator endpoint paths
pub mod endpoints {
    pub const PING: &str = "/ping";
    pub const MANAGE: &str = "/manage";
    pub const CLIENTS: &str = "/clients";
    pub const QUITQUITQUIT: &str = "/quitquitquit";
    /// Path segment between the task name and the params on the endpoint a
    /// worker uses to report a permanent, non-retryable failure.
    pub const NOTHING_ERROR: &str = "nothing-error";
}

/// A malformed command body was received from the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("wrong command format: {0:?}")]
pub struct WrongCommandFormat(pub String);

/// A parsed coordinator directive.
///
/// The pair `(action, params)` is also the identity of a job; the scheduler
/// treats `params` as opaque and only the owning task controller interprets
/// it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Command {
    pub action: String,
    pub params: String,
}

impl Command {
    pub fn new(action: impl Into<String>, params: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: params.into(),
        }
    }

    /// Build a SLEEP command asking the worker to come back in `seconds`.
    pub fn sleep(seconds: u64) -> Self {
        Self::new(SLEEP_ACTION, seconds.to_string())
    }

    pub fn is_sleep(&self) -> bool {
        self.action == SLEEP_ACTION
    }

    /// Render the command into its wire form, `"<ACTION> <PARAMS> #"`.
    pub fn render(&self) -> String {
        format!("{} {} {}", self.action, self.params, TRAILER)
    }

    /// Parse a response body into a command.
    ///
    /// The body must contain exactly three whitespace-separated tokens and
    /// the third must be the `#` sentinel; anything else is rejected with
    /// [`WrongCommandFormat`].
    pub fn parse(body: &str) -> Result<Self, WrongCommandFormat> {
        let mut tokens = body.split_whitespace();
        let action = tokens.next();
        let params = tokens.next();
        let trailer = tokens.next();
        match (action, params, trailer, tokens.next()) {
            (Some(action), Some(params), Some(TRAILER), None) => {
                Ok(Self::new(action, params))
            }
            _ => Err(WrongCommandFormat(body.to_string())),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
