use crate::error::{Result, VolumeError};
use crate::models::{CreateVolumeRequest, OperationType};
use crate::provider::{ProviderGateway, ProviderRequest};
use std::sync::Arc;
use tracing::info;

/// Provision a new volume at the provider. Nothing appears on this host;
/// attach is a separate operation.
#[derive(Clone)]
pub struct CreateVolumeOperation {
    gateway: Arc<ProviderGateway>,
}

#[derive(Debug, Clone)]
pub struct CreateVolumeOperationResult {
    pub volume_id: String,
    pub provider_response: serde_json::Value,
}

impl CreateVolumeOperation {
    pub fn new(gateway: Arc<ProviderGateway>) -> Self {
        Self { gateway }
    }

    pub async fn run(&self, request: CreateVolumeRequest) -> Result<CreateVolumeOperationResult> {
        let provider_response = self
            .gateway
            .execute(
                OperationType::Create,
                &ProviderRequest::CreateVolume {
                    name: request.name.clone(),
                    size_bytes: request.size_bytes,
                    disk_offering_id: request.disk_offering_id.clone(),
                    zone_id: request.zone_id.clone(),
                },
            )
            .await?;

        let volume_id = provider_response
            .get("volume_id")
            .or_else(|| provider_response.get("id"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                VolumeError::Internal(format!(
                    "create job result carries no volume id: {}",
                    provider_response
                ))
            })?
            .to_string();

        info!(volume_id = %volume_id, name = %request.name, "volume created");
        Ok(CreateVolumeOperationResult {
            volume_id,
            provider_response,
        })
    }
}
