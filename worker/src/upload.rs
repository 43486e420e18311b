//! HTTP client for talking to the coordinator
//!
//! Every request carries the worker's identity headers. Result uploads are
//! encoded as `multipart/form-data` with the fixed legacy boundary; the
//! response body of a ping or an upload is always a single-line command.

use anyhow::{Context, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use shared::multipart::{self, FilePart};
use shared::protocol::{endpoints, headers};
use std::time::Duration;
use tracing::{debug, info};

const HTTP_TIMEOUT_SECONDS: u64 = 120;

/// The standard identity headers that accompany every request: `client-id`,
/// `client-hostname`, `client-version`, and `client-arver` (the handler
/// version).
pub(crate) fn identity_headers(
    client_id: &str,
    client_hostname: &str,
    handler_version: &str,
) -> Result<HeaderMap> {
    let mut default_headers = HeaderMap::new();
    for (name, value) in [
        (headers::CLIENT_ID, client_id),
        (headers::CLIENT_HOSTNAME, client_hostname),
        (headers::CLIENT_VERSION, env!("CARGO_PKG_VERSION")),
        (headers::CLIENT_ARVER, handler_version),
    ] {
        default_headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_str(value)
                .with_context(|| format!("Invalid value for header {}", name))?,
        );
    }
    Ok(default_headers)
}

pub struct CoordinatorClient {
    client: reqwest::Client,
    base_url: String,
}

impl CoordinatorClient {
    pub fn new(
        base_url: String,
        client_id: &str,
        client_hostname: &str,
        handler_version: &str,
    ) -> Result<Self> {
        let default_headers = identity_headers(client_id, client_hostname, handler_version)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECONDS))
            .default_headers(default_headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, base_url })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET `/ping` and return the raw command body.
    pub async fn ping(&self) -> Result<String> {
        let url = format!("{}{}", self.base_url, endpoints::PING);
        debug!(url = %url, "Pinging the coordinator");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!("Ping to {} answered {}", url, status));
        }
        Ok(response.text().await.context("Failed to read ping body")?)
    }

    /// Upload a result payload to `<base_url>/<task>/<params>` as a
    /// multipart form with an `article-sid` echo field, the payload under
    /// `article-data`, and any extra fields the task's controller expects.
    /// Returns the response body: the next command.
    pub async fn upload_result(
        &self,
        task_path: &str,
        params: &str,
        filename: &str,
        payload: &[u8],
        extra_fields: &[(&str, &str)],
    ) -> Result<String> {
        let mut fields = vec![("article-sid", params)];
        fields.extend_from_slice(extra_fields);
        let body = multipart::encode_form(
            &fields,
            &[FilePart {
                name: "article-data",
                filename,
                data: payload,
            }],
        );

        let url = format!("{}/{}/{}", self.base_url, task_path, params);
        info!(url = %url, bytes = body.len(), "Uploading result");
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, multipart::content_type())
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload result to {}", url))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!("Upload to {} answered {}", url, status));
        }
        Ok(response.text().await.context("Failed to read upload response")?)
    }

    /// Report a permanently failed job on the task's nothing-here endpoint.
    /// Returns the response body: the next command.
    pub async fn report_nothing(&self, task_path: &str, params: &str) -> Result<String> {
        let url = format!(
            "{}/{}/{}/{}",
            self.base_url,
            task_path,
            endpoints::NOTHING_ERROR,
            params
        );
        info!(url = %url, "Reporting permanently failed job");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to report to {}", url))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow::anyhow!("Report to {} answered {}", url, status));
        }
        Ok(response.text().await.context("Failed to read report response")?)
    }
}
