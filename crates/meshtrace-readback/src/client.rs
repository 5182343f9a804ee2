use crate::model::{convert_document, TraceDocument};
use meshtrace_types::CompletedTrace;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the backend query API. Not-found is not an error: a missing
/// trace comes back as `Ok(None)`.
#[derive(Debug, Error)]
pub enum ReadbackError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Backend { status: u16, body: String },
}

/// HTTP client for the OTLP backend's trace query API.
pub struct ReadbackClient {
    base_url: String,
    client: reqwest::Client,
}

impl ReadbackClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET {base}/api/traces/{id-no-dashes}`; 404 means the trace does not
    /// exist (yet), any other non-2xx carries the status and body.
    pub async fn get_trace(
        &self,
        trace_id: &str,
    ) -> Result<Option<CompletedTrace>, ReadbackError> {
        let normalized: String = trace_id.chars().filter(|c| *c != '-').collect();
        let url = format!("{}/api/traces/{}", self.base_url, normalized);
        debug!(url = %url, "querying trace backend");

        let response = self.client.get(&url).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ReadbackError::Backend {
                status: status.as_u16(),
                body,
            });
        }

        let document: TraceDocument = response.json().await?;
        Ok(convert_document(&normalized, &document))
    }
}
