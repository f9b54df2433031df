use crate::error::{FailureStage, Result};
use crate::models::{DeviceMapping, OperationType};
use crate::provider::{ProviderGateway, ProviderRequest};
use crate::store::VolumeStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

/// Detach a volume from the appliance VM. The persistent identity and the
/// NBD export stay: detach happens mid-migration (test failovers,
/// failback) and the volume's replacement will reclaim both.
#[derive(Clone)]
pub struct DetachVolumeOperation {
    store: Arc<VolumeStore>,
    gateway: Arc<ProviderGateway>,
}

#[derive(Debug, Clone)]
pub struct DetachVolumeOperationResult {
    pub mapping: Option<DeviceMapping>,
}

impl DetachVolumeOperation {
    pub fn new(store: Arc<VolumeStore>, gateway: Arc<ProviderGateway>) -> Self {
        Self { store, gateway }
    }

    pub async fn run(&self, volume_id: &str) -> Result<DetachVolumeOperationResult> {
        self.gateway
            .execute(
                OperationType::Detach,
                &ProviderRequest::DetachVolume {
                    volume_id: volume_id.to_string(),
                },
            )
            .await?;

        let mapping = match self
            .store
            .get_mapping(volume_id)
            .map_err(|e| e.at_stage(FailureStage::Correlation))?
        {
            Some(mut mapping) => {
                let now = Utc::now();
                mapping.provider_state = "detached".to_string();
                mapping.os_state = "detached".to_string();
                mapping.last_synced_at = now;
                mapping.updated_at = now;
                self.store
                    .update_mapping(&mapping)
                    .map_err(|e| e.at_stage(FailureStage::Correlation))?;
                Some(mapping)
            }
            None => None,
        };

        info!(volume_id = %volume_id, "volume detached");
        Ok(DetachVolumeOperationResult { mapping })
    }
}
