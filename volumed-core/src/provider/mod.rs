mod gateway;
mod http;

pub use gateway::{GatewayTimeouts, ProviderGateway};
pub use http::HttpProviderClient;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Control-plane request against the storage provider. All mutating calls
/// are asynchronous on the provider side; submission only yields a job
/// token to poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderRequest {
    CreateVolume {
        name: String,
        size_bytes: u64,
        disk_offering_id: Option<String>,
        zone_id: Option<String>,
    },
    AttachVolume {
        volume_id: String,
        vm_id: String,
    },
    DetachVolume {
        volume_id: String,
    },
    DeleteVolume {
        volume_id: String,
    },
}

impl ProviderRequest {
    pub fn describe(&self) -> &'static str {
        match self {
            ProviderRequest::CreateVolume { .. } => "create_volume",
            ProviderRequest::AttachVolume { .. } => "attach_volume",
            ProviderRequest::DetachVolume { .. } => "detach_volume",
            ProviderRequest::DeleteVolume { .. } => "delete_volume",
        }
    }
}

/// Handle to an accepted asynchronous provider job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobToken {
    pub job_id: String,
}

/// Terminal-or-not state of a provider job as reported by its job API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Pending,
    /// Completed successfully; the payload is the provider's result record
    /// (volume id for creates, attach details for attaches).
    Success(serde_json::Value),
    /// Ran to a failed conclusion; the detail string is the provider's own.
    Failure(String),
}

/// Seam to the provider control plane. Implemented over HTTP in
/// production and by mocks in tests.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Submit a mutating request. An error here means the provider
    /// rejected it outright and no job exists.
    async fn submit(&self, request: &ProviderRequest) -> Result<JobToken>;

    /// Poll the state of a previously accepted job.
    async fn query_job(&self, token: &JobToken) -> Result<JobState>;
}
