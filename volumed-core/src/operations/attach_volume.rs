use crate::device::DeviceCorrelator;
use crate::error::{FailureStage, Result};
use crate::identity::{persistent_name, IdentityManager};
use crate::models::{AttachVolumeRequest, DeviceMapping, NbdExport, OperationMode, OperationType};
use crate::nbd::ExportManager;
use crate::provider::{ProviderGateway, ProviderRequest};
use crate::store::VolumeStore;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use ulid::Ulid;

/// Attach a volume to the migration appliance VM and plumb the full local
/// chain behind it: correlate the device that appears, give it a
/// persistent mapper identity, and export it over NBD.
///
/// Stage failures leave earlier stages' state in place. A half-attached
/// volume is diagnosable from the mapping row and failure stage; rolling
/// back automatically would destroy the evidence and can detach a device
/// an operator is already looking at.
#[derive(Clone)]
pub struct AttachVolumeOperation {
    store: Arc<VolumeStore>,
    gateway: Arc<ProviderGateway>,
    correlator: Arc<DeviceCorrelator>,
    identity: Arc<IdentityManager>,
    exports: Arc<ExportManager>,
    correlation_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AttachVolumeOperationResult {
    pub mapping: DeviceMapping,
    pub export: NbdExport,
}

impl AttachVolumeOperation {
    pub fn new(
        store: Arc<VolumeStore>,
        gateway: Arc<ProviderGateway>,
        correlator: Arc<DeviceCorrelator>,
        identity: Arc<IdentityManager>,
        exports: Arc<ExportManager>,
        correlation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            correlator,
            identity,
            exports,
            correlation_timeout,
        }
    }

    pub async fn run(
        &self,
        volume_id: &str,
        request: AttachVolumeRequest,
    ) -> Result<AttachVolumeOperationResult> {
        // Register before submitting so the expectation order mirrors
        // provider submission order for equal-size tie-breaks.
        let expectation = self
            .correlator
            .register(volume_id, &request.vm_id, request.size_bytes);

        let provider_response = match self
            .gateway
            .execute(
                OperationType::Attach,
                &ProviderRequest::AttachVolume {
                    volume_id: volume_id.to_string(),
                    vm_id: request.vm_id.clone(),
                },
            )
            .await
        {
            Ok(response) => response,
            Err(e) => {
                expectation.cancel();
                return Err(e);
            }
        };
        let device_slot = provider_response
            .get("device_slot")
            .and_then(|v| v.as_i64());

        let device = expectation.await_device(self.correlation_timeout).await?;
        info!(
            volume_id = %volume_id,
            device = %device.path,
            "attach correlated to local device"
        );

        let mode = request.operation_mode.unwrap_or(OperationMode::Primary);
        let mut mapping = self
            .upsert_mapping(volume_id, &request, mode, &device.path, device_slot)
            .await
            .map_err(|e| e.at_stage(FailureStage::Correlation))?;

        let name = persistent_name(&request.vm_name, request.disk_slot);
        let mapper_path = self
            .identity
            .ensure(&name, &device.path)
            .await
            .map_err(|e| e.at_stage(FailureStage::Identity))?;

        mapping.persistent_device_name = Some(name.clone());
        mapping.mapper_path = Some(mapper_path);
        mapping.updated_at = Utc::now();
        self.store
            .update_mapping(&mapping)
            .map_err(|e| e.at_stage(FailureStage::Identity))?;

        let export = self
            .exports
            .create_export(volume_id, &name)
            .await
            .map_err(|e| e.at_stage(FailureStage::Export))?;

        Ok(AttachVolumeOperationResult { mapping, export })
    }

    /// Reuse the volume's existing mapping row when there is one; the row
    /// identity is stable across failover/failback reattaches.
    async fn upsert_mapping(
        &self,
        volume_id: &str,
        request: &AttachVolumeRequest,
        mode: OperationMode,
        device_path: &str,
        device_slot: Option<i64>,
    ) -> Result<DeviceMapping> {
        let now = Utc::now();
        if let Some(mut existing) = self.store.get_mapping(volume_id)? {
            existing.vm_id = request.vm_id.clone();
            existing.operation_mode = mode;
            existing.device_path = device_path.to_string();
            existing.provider_device_slot = device_slot;
            existing.provider_state = "attached".to_string();
            existing.os_state = "attached".to_string();
            existing.size_bytes = request.size_bytes;
            existing.last_synced_at = now;
            existing.updated_at = now;
            self.store.update_mapping(&existing)?;
            return Ok(existing);
        }

        let mapping = DeviceMapping {
            id: Ulid::new().to_string(),
            volume_id: volume_id.to_string(),
            volume_id_numeric: None,
            vm_id: request.vm_id.clone(),
            operation_mode: mode,
            device_path: device_path.to_string(),
            provider_device_slot: device_slot,
            provider_state: "attached".to_string(),
            os_state: "attached".to_string(),
            size_bytes: request.size_bytes,
            persistent_device_name: None,
            mapper_path: None,
            last_synced_at: now,
            created_at: now,
            updated_at: now,
        };
        self.store.create_mapping(&mapping)?;
        Ok(mapping)
    }
}
