use crate::error::{FailureStage, Result};
use crate::identity::IdentityManager;
use crate::models::OperationType;
use crate::nbd::ExportManager;
use crate::provider::{ProviderGateway, ProviderRequest};
use crate::store::VolumeStore;
use std::sync::Arc;
use tracing::info;

/// Permanently destroy a volume. This is the one path that tears the
/// local chain down: export marked inactive, persistent identity removed,
/// mapping rows deleted.
#[derive(Clone)]
pub struct DeleteVolumeOperation {
    store: Arc<VolumeStore>,
    gateway: Arc<ProviderGateway>,
    identity: Arc<IdentityManager>,
    exports: Arc<ExportManager>,
}

#[derive(Debug, Clone)]
pub struct DeleteVolumeOperationResult {
    pub removed_mapping: bool,
}

impl DeleteVolumeOperation {
    pub fn new(
        store: Arc<VolumeStore>,
        gateway: Arc<ProviderGateway>,
        identity: Arc<IdentityManager>,
        exports: Arc<ExportManager>,
    ) -> Self {
        Self {
            store,
            gateway,
            identity,
            exports,
        }
    }

    pub async fn run(&self, volume_id: &str) -> Result<DeleteVolumeOperationResult> {
        self.gateway
            .execute(
                OperationType::Delete,
                &ProviderRequest::DeleteVolume {
                    volume_id: volume_id.to_string(),
                },
            )
            .await?;

        self.exports
            .remove_export(volume_id)
            .await
            .map_err(|e| e.at_stage(FailureStage::Export))?;

        if let Some(mapping) = self
            .store
            .get_mapping(volume_id)
            .map_err(|e| e.at_stage(FailureStage::Identity))?
        {
            if let Some(name) = &mapping.persistent_device_name {
                self.identity
                    .remove(name)
                    .await
                    .map_err(|e| e.at_stage(FailureStage::Identity))?;
            }
        }

        let removed_mapping = self
            .store
            .delete_mapping(volume_id)
            .map_err(|e| e.at_stage(FailureStage::Correlation))?;
        info!(volume_id = %volume_id, "volume deleted");
        Ok(DeleteVolumeOperationResult { removed_mapping })
    }
}
