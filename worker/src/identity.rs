//! Stable worker identity
//!
//! A worker generates a UUID on first run and persists it under a
//! hostname-derived filename in its store directory. The same id is reused
//! across invocations on the same box, which is how the coordinator tells
//! workers apart and keeps their lifetime job counters.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Canonical textual UUID length. Anything shorter on disk is not a valid
/// identity and gets replaced.
const UUID_LEN: usize = 36;

/// This machine's hostname, used for the identity and log filenames and for
/// the `client-hostname` header.
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string())
}

pub fn id_file_path(store_dir: &Path, host: &str) -> PathBuf {
    store_dir.join(format!("{}.id", host))
}

pub fn log_file_name(host: &str) -> String {
    format!("{}.log", host)
}

/// Load the persisted worker id, or create and persist a fresh one when the
/// file is missing or does not hold a plausible UUID.
pub fn get_or_create_peer_id(path: &Path) -> Result<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let id = contents.trim().to_string();
            if id.len() < UUID_LEN {
                // not a valid ID
                create_and_write_id(path)
            } else {
                Ok(id)
            }
        }
        Err(_) => create_and_write_id(path),
    }
}

fn create_and_write_id(path: &Path) -> Result<String> {
    let id = Uuid::new_v4().to_string();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    std::fs::write(path, &id)
        .with_context(|| format!("Failed to persist worker id to {}", path.display()))?;
    info!(path = %path.display(), "Generated a fresh worker id");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_fresh_id_is_created_and_persisted() {
        let tmp = TempDir::new().unwrap();
        let path = id_file_path(tmp.path(), "crawler-01");
        let id = get_or_create_peer_id(&path).unwrap();
        assert_eq!(id.len(), UUID_LEN);
        assert_eq!(std::fs::read_to_string(&path).unwrap().trim(), id);
    }

    #[test]
    fn test_existing_id_is_reused() {
        let tmp = TempDir::new().unwrap();
        let path = id_file_path(tmp.path(), "crawler-01");
        let first = get_or_create_peer_id(&path).unwrap();
        let second = get_or_create_peer_id(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_truncated_id_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let path = id_file_path(tmp.path(), "crawler-01");
        std::fs::write(&path, "too-short").unwrap();
        let id = get_or_create_peer_id(&path).unwrap();
        assert_ne!(id, "too-short");
        assert_eq!(id.len(), UUID_LEN);
    }

    #[test]
    fn test_surrounding_whitespace_is_stripped() {
        let tmp = TempDir::new().unwrap();
        let path = id_file_path(tmp.path(), "crawler-01");
        let id = Uuid::new_v4().to_string();
        std::fs::write(&path, format!("{}\n", id)).unwrap();
        assert_eq!(get_or_create_peer_id(&path).unwrap(), id);
    }
}
