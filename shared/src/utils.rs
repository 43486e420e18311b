//! Utility functions shared by the coordinator and worker components

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp in seconds
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Turn a job's params into a filesystem-safe filename.
///
/// Params may contain `/` (article identifiers often do); path separators are
/// replaced so the result is a single path component. Both the coordinator's
/// artifact store and the worker's local cache derive filenames this way, so
/// a retry of the same job overwrites its previous artifact.
pub fn params_to_filename(params: &str) -> String {
    params.replace(['/', '\\'], "_")
}

/// Compress a payload with gzip.
///
/// Result payloads travel and rest compressed; handlers are expected to
/// gzip whatever they crawled before uploading it.
pub fn gzip_bytes(data: &[u8]) -> crate::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// Decompress a gzip payload.
pub fn gunzip_bytes(data: &[u8]) -> crate::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Validate a coordinator base URL.
///
/// Ensures the URL parses, uses an http(s) scheme, has a host, and carries no
/// embedded credentials.
pub fn validate_base_url(url_str: &str) -> crate::Result<()> {
    use url::Url;

    let parsed = Url::parse(url_str)
        .map_err(|e| anyhow::anyhow!("Invalid URL '{}': {}", url_str, e))?;

    let scheme = parsed.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(anyhow::anyhow!(
            "URL '{}' must use http:// or https:// scheme",
            url_str
        ));
    }

    if parsed.host().is_none() {
        return Err(anyhow::anyhow!("URL '{}' must have a valid host", url_str));
    }

    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(anyhow::anyhow!(
            "URL '{}' must not contain embedded credentials",
            url_str
        ));
    }

    Ok(())
}
