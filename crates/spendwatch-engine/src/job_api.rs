//! HTTP client for the external compute provider.
//!
//! Implements [`JobApi`] against a conventional REST surface:
//! `POST /jobs` submits, `GET /jobs/{ref}` reports status, and
//! `DELETE /jobs/{ref}` requests cancellation. All calls are time-bounded;
//! a timeout surfaces as [`SpendWatchError::ExternalService`] and is handled
//! at tick level by the tracker.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use spendwatch_core::{JobApi, JobPoll, JobRequest, Result, SpendWatchError};
use tracing::debug;

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    /// Provider status: `queued`, `running`, `completed`, or `failed`.
    status: String,
    #[serde(default)]
    progress: u8,
    #[serde(default)]
    cost_usd: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

/// REST-backed [`JobApi`] implementation.
pub struct HttpJobApi {
    base_url: String,
    client: reqwest::Client,
}

impl HttpJobApi {
    pub fn new(base_url: &str, timeout_ms: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| {
                SpendWatchError::Config(format!("failed to build job API client: {e}"))
            })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[async_trait]
impl JobApi for HttpJobApi {
    async fn submit(&self, request: &JobRequest) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/jobs", self.base_url))
            .json(request)
            .send()
            .await
            .map_err(|e| SpendWatchError::ExternalService(format!("job submit failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SpendWatchError::ExternalService(format!(
                "job submit returned status {}",
                response.status()
            )));
        }

        let body: SubmitResponse = response.json().await.map_err(|e| {
            SpendWatchError::ExternalService(format!("malformed submit response: {e}"))
        })?;
        debug!(external_ref = %body.id, "Job submitted upstream");
        Ok(body.id)
    }

    async fn poll_status(&self, external_ref: &str) -> Result<JobPoll> {
        let response = self
            .client
            .get(format!("{}/jobs/{external_ref}", self.base_url))
            .send()
            .await
            .map_err(|e| SpendWatchError::ExternalService(format!("status poll failed: {e}")))?;

        if !response.status().is_success() {
            return Err(SpendWatchError::ExternalService(format!(
                "status poll returned status {}",
                response.status()
            )));
        }

        let body: StatusResponse = response.json().await.map_err(|e| {
            SpendWatchError::ExternalService(format!("malformed status response: {e}"))
        })?;

        let poll = match body.status.as_str() {
            "queued" | "running" => JobPoll {
                done: false,
                progress: body.progress.min(100),
                failed: false,
                actual_cost_usd: None,
                error: None,
            },
            "completed" => JobPoll {
                done: true,
                progress: 100,
                failed: false,
                actual_cost_usd: body.cost_usd,
                error: None,
            },
            "failed" => JobPoll {
                done: true,
                progress: body.progress.min(100),
                failed: true,
                actual_cost_usd: None,
                error: body.error,
            },
            other => {
                return Err(SpendWatchError::ExternalService(format!(
                    "unknown provider status '{other}'"
                )))
            }
        };
        Ok(poll)
    }

    async fn cancel(&self, external_ref: &str) -> Result<bool> {
        let response = self
            .client
            .delete(format!("{}/jobs/{external_ref}", self.base_url))
            .send()
            .await
            .map_err(|e| {
                SpendWatchError::ExternalService(format!("cancel request failed: {e}"))
            })?;
        Ok(response.status().is_success())
    }
}
