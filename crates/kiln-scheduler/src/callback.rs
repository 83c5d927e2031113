//! Build result webhooks.

use kiln_core::{BuildResult, Error, Result};
use std::time::Duration;
use tracing::debug;

/// Posts a finished build's result to the URL the job was submitted with.
///
/// Failures are returned to the caller, which logs them; callbacks are never
/// retried.
#[derive(Clone)]
pub struct CallbackNotifier {
    http: reqwest::Client,
    token: Option<String>,
}

impl CallbackNotifier {
    pub fn new(timeout: Duration, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Internal(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, token })
    }

    pub async fn notify(&self, url: &str, result: &BuildResult) -> Result<()> {
        let mut request = self.http.post(url).json(result);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Callback(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Callback(format!("{} returned {}", url, status)));
        }

        debug!(job_id = %result.job_id, url = %url, status = %status, "Delivered callback");
        Ok(())
    }
}
