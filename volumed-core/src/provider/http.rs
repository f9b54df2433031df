use super::{JobState, JobToken, ProviderClient, ProviderRequest};
use crate::error::{Result, VolumeError};
use async_trait::async_trait;
use serde::Deserialize;

/// Provider control plane over HTTP. Mutating endpoints return a job id
/// immediately; `/jobs/{id}` reports the job's progress.
pub struct HttpProviderClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: String,
}

#[derive(Deserialize)]
struct JobResponse {
    status: String,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

impl HttpProviderClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            client: reqwest::Client::new(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            builder = builder.header("X-Api-Key", key);
        }
        builder
    }

    async fn submit_inner(&self, request: &ProviderRequest) -> Result<JobToken> {
        let builder = match request {
            ProviderRequest::CreateVolume {
                name,
                size_bytes,
                disk_offering_id,
                zone_id,
            } => self
                .request(reqwest::Method::POST, "/volumes")
                .json(&serde_json::json!({
                    "name": name,
                    "size_bytes": size_bytes,
                    "disk_offering_id": disk_offering_id,
                    "zone_id": zone_id,
                })),
            ProviderRequest::AttachVolume { volume_id, vm_id } => self
                .request(
                    reqwest::Method::POST,
                    &format!("/volumes/{}/attach", volume_id),
                )
                .json(&serde_json::json!({ "vm_id": vm_id })),
            ProviderRequest::DetachVolume { volume_id } => self.request(
                reqwest::Method::POST,
                &format!("/volumes/{}/detach", volume_id),
            ),
            ProviderRequest::DeleteVolume { volume_id } => {
                self.request(reqwest::Method::DELETE, &format!("/volumes/{}", volume_id))
            }
        };

        let response = builder
            .send()
            .await
            .map_err(|e| VolumeError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VolumeError::ProviderSubmitFailure(format!(
                "{} {}: {}",
                request.describe(),
                status,
                body
            )));
        }

        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|e| VolumeError::Http(e.to_string()))?;
        Ok(JobToken {
            job_id: parsed.job_id,
        })
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn submit(&self, request: &ProviderRequest) -> Result<JobToken> {
        self.submit_inner(request).await
    }

    async fn query_job(&self, token: &JobToken) -> Result<JobState> {
        let response = self
            .request(reqwest::Method::GET, &format!("/jobs/{}", token.job_id))
            .send()
            .await
            .map_err(|e| VolumeError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VolumeError::Http(format!(
                "job query {}: {} {}",
                token.job_id, status, body
            )));
        }

        let parsed: JobResponse = response
            .json()
            .await
            .map_err(|e| VolumeError::Http(e.to_string()))?;

        match parsed.status.as_str() {
            "pending" | "running" => Ok(JobState::Pending),
            "success" => Ok(JobState::Success(
                parsed.result.unwrap_or(serde_json::Value::Null),
            )),
            "failure" => Ok(JobState::Failure(
                parsed.error.unwrap_or_else(|| "unspecified".to_string()),
            )),
            other => Err(VolumeError::Http(format!(
                "job {} reported unknown status {:?}",
                token.job_id, other
            ))),
        }
    }
}
