use crate::error::FailureStage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A tracked volume operation. Created by the orchestrator, mutated only by
/// it, terminal once completed/failed, retained for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeOperation {
    pub id: String,
    pub op_type: OperationType,
    pub status: OperationStatus,
    pub volume_id: String,
    pub vm_id: Option<String>,
    pub request: serde_json::Value,
    pub response: Option<serde_json::Value>,
    pub error: Option<String>,
    pub failure_stage: Option<FailureStage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl VolumeOperation {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Completed | OperationStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Attach,
    Detach,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Create => "create",
            OperationType::Attach => "attach",
            OperationType::Detach => "detach",
            OperationType::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Executing => "executing",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationMode {
    Primary,
    Failover,
}

impl OperationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationMode::Primary => "primary",
            OperationMode::Failover => "failover",
        }
    }
}

/// One row per live attachment, correlating a provider volume with the
/// local block device it surfaced as. Updated in place when the real path
/// changes across failover/failback; deleted on permanent detach/destroy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMapping {
    pub id: String,
    pub volume_id: String,
    pub volume_id_numeric: Option<i64>,
    pub vm_id: String,
    pub operation_mode: OperationMode,
    pub device_path: String,
    pub provider_device_slot: Option<i64>,
    pub provider_state: String,
    pub os_state: String,
    pub size_bytes: u64,
    pub persistent_device_name: Option<String>,
    pub mapper_path: Option<String>,
    pub last_synced_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An NBD export definition. The export name derives from the persistent
/// device name, never from the volume id or real device path, so the
/// export survives volume replacement during failover/failback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NbdExport {
    pub id: String,
    pub volume_id: String,
    pub export_name: String,
    pub mapper_path: String,
    pub port: u16,
    pub status: ExportStatus,
    pub config_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportStatus {
    Pending,
    Active,
    Inactive,
    Failed,
}

impl ExportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportStatus::Pending => "pending",
            ExportStatus::Active => "active",
            ExportStatus::Inactive => "inactive",
            ExportStatus::Failed => "failed",
        }
    }
}

/// Stable indirection from a fixed per-disk name to the current mapper
/// device path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentDeviceName {
    pub name: String,
    pub mapper_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    pub name: String,
    pub size_bytes: u64,
    pub disk_offering_id: Option<String>,
    pub zone_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachVolumeRequest {
    pub vm_id: String,
    pub vm_name: String,
    pub disk_slot: u32,
    /// Size of the volume being attached. Device correlation matches on
    /// it, so it must be the provider's exact figure.
    pub size_bytes: u64,
    #[serde(default)]
    pub operation_mode: Option<OperationMode>,
}

/// Filter criteria for listing operations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationFilter {
    pub op_type: Option<OperationType>,
    pub status: Option<OperationStatus>,
    pub volume_id: Option<String>,
    pub vm_id: Option<String>,
    pub limit: Option<usize>,
}
