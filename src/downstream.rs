use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::instrument;

use crate::{JobProcessor, ProcessError, RelayError, RelayResult, TaskEnvelope};

/// Path of the processing endpoint on the downstream service
const PROCESS_PATH: &str = "/api/v1/jobs/process-ai-job";

/// Thin client for the downstream processing service.
///
/// One authenticated POST per envelope, bounded by the configured request
/// timeout. A 2xx response yields the body as an opaque JSON value; any
/// other response, and any network-level failure, is a [`ProcessError`].
/// No retries here - the queue owns the retry schedule.
pub struct DownstreamClient {
    client: Client,
    endpoint: String,
    shared_secret: String,
}

impl DownstreamClient {
    /// Build a client for `base_url`, authenticating with `shared_secret`.
    ///
    /// `timeout` bounds every request; a downstream hang costs at most one
    /// concurrency slot for this long.
    pub fn new(
        base_url: &str,
        shared_secret: impl Into<String>,
        timeout: Duration,
    ) -> RelayResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RelayError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), PROCESS_PATH),
            shared_secret: shared_secret.into(),
        })
    }

    /// Endpoint URL requests are sent to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

// The bearer credential must never leak through logs
impl fmt::Debug for DownstreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownstreamClient")
            .field("endpoint", &self.endpoint)
            .field("shared_secret", &"<redacted>")
            .finish()
    }
}

#[async_trait]
impl JobProcessor for DownstreamClient {
    #[instrument(skip(self, envelope), fields(message_id = %envelope.message_id))]
    async fn process(&self, envelope: &TaskEnvelope) -> Result<Value, ProcessError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.shared_secret)
            .json(envelope)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProcessError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}
