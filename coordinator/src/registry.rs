//! Durable registry of every worker that ever contacted the coordinator
//!
//! For each client id we store the headers the worker sent plus its lifetime
//! job count, serialized as a single `#`-delimited string so the record fits
//! a plain key/value store: `id#hostname#worker_version#handler_version#jobs`.
//! The job counters are recovered from the store on startup.

use anyhow::Result;
use axum::http::HeaderMap;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use crate::scheduler::Scheduler;
use crate::store::{JobStore, StoreBackend};
use shared::protocol::headers;
use shared::utils::current_timestamp;

/// A request that requires identification arrived without a usable
/// `client-id` header.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("missing or empty client-id header")]
pub struct InvalidClientId;

/// Errors surfaced by registry updates.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    InvalidClientId(#[from] InvalidClientId),
    #[error(transparent)]
    Store(anyhow::Error),
}

/// Placeholder recorded for metadata headers the worker did not send.
const UNKNOWN: &str = "UNKNOWN";

const RECORD_HEADERS: [&str; 4] = [
    headers::CLIENT_ID,
    headers::CLIENT_HOSTNAME,
    headers::CLIENT_VERSION,
    headers::CLIENT_ARVER,
];

pub struct ClientRegistry {
    known_clients: Box<dyn JobStore>,
    jobs_done: HashMap<String, u64>,
}

impl ClientRegistry {
    /// Open the registry store under `<state_dir>/clients` and recover the
    /// per-client job counters from the persisted records.
    pub fn open(backend: StoreBackend, state_dir: &Path) -> Result<Self> {
        let known_clients = backend.open(&state_dir.join("clients"))?;
        let mut jobs_done = HashMap::new();
        for client_id in known_clients.keys()? {
            if let Some(record) = known_clients.get(&client_id)? {
                let jobs = record
                    .split('#')
                    .nth(4)
                    .and_then(|f| f.parse::<u64>().ok())
                    .unwrap_or_else(|| {
                        warn!(client_id = %client_id, record = %record,
                            "Malformed client record, resetting job counter");
                        0
                    });
                jobs_done.insert(client_id, jobs);
            }
        }
        info!(clients = jobs_done.len(), "Client registry loaded");
        Ok(Self {
            known_clients,
            jobs_done,
        })
    }

    /// Extract and validate the client id from request headers without
    /// touching any state. Used by handlers that must reject unidentified
    /// requests before doing anything else.
    pub fn client_id(headers: &HeaderMap) -> Result<String, InvalidClientId> {
        let id = headers
            .get(headers::CLIENT_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if id.is_empty() {
            return Err(InvalidClientId);
        }
        Ok(id.to_string())
    }

    /// Update the durable record for the client identified in `headers`,
    /// bumping its lifetime job counter when `job_done` is set. Returns the
    /// client id.
    pub fn update_client_stats(
        &mut self,
        headers: &HeaderMap,
        job_done: bool,
    ) -> Result<String, RegistryError> {
        let client_id = Self::client_id(headers)?;
        if job_done {
            *self.jobs_done.entry(client_id.clone()).or_insert(0) += 1;
        }
        let mut fields: Vec<String> = RECORD_HEADERS
            .iter()
            .map(|name| {
                headers
                    .get(*name)
                    .and_then(|v| v.to_str().ok())
                    .filter(|s| !s.is_empty())
                    .unwrap_or(UNKNOWN)
                    .to_string()
            })
            .collect();
        fields.push(self.jobs_done.get(&client_id).copied().unwrap_or(0).to_string());
        self.known_clients
            .put(&client_id, &fields.join("#"))
            .map_err(RegistryError::Store)?;
        Ok(client_id)
    }

    #[cfg(test)]
    pub(crate) fn jobs_done(&self, client_id: &str) -> u64 {
        self.jobs_done.get(client_id).copied().unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn client_count(&self) -> Result<usize> {
        self.known_clients.len()
    }

    /// Render the client status page: one row per known client with its
    /// recorded metadata, ALIVE/DEAD classification against the scheduler's
    /// liveness map, and the time since it was last seen.
    pub fn render(&self, scheduler: &Scheduler) -> Result<String> {
        let now = current_timestamp();
        let mut page = String::from(
            "<html>\n<head><title>Client Status</title></head>\n<body>\n\
             <h1>Clients</h1>\n\
             <table class=\"clientState\">\n<thead>\n<tr>\n\
             <th>client-hostname</th><th>client-version</th>\
             <th>client-arver</th><th># jobs</th><th>state</th><th>Last seen</th>\n\
             </tr>\n</thead>\n<tbody>\n",
        );
        let mut client_ids = self.known_clients.keys()?;
        client_ids.sort();
        for client_id in client_ids {
            let record = match self.known_clients.get(&client_id)? {
                Some(record) => record,
                None => continue,
            };
            let (state, last_seen) = match scheduler.peer_last_seen(&client_id) {
                Some(ts) => ("ALIVE", format!("{}s ago", now.saturating_sub(ts))),
                None => ("DEAD", "-".to_string()),
            };
            page.push_str(&format!("<tr class=\"{}\" id=\"{}\">", state, client_id));
            // Skip field 0, the id: it doubles as the lookup key
            for value in record.split('#').skip(1) {
                page.push_str(&format!("<td>{}</td>", value));
            }
            page.push_str(&format!("<td>{}</td><td>{}</td></tr>\n", state, last_seen));
        }
        page.push_str("</tbody></table>\n</body>\n</html>\n");
        Ok(page)
    }
}
