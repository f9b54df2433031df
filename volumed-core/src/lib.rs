//! Volumed Core - Volume lifecycle engine for VM migration hosts
//!
//! Drives asynchronous storage-provider operations and the local plumbing
//! behind them:
//! - fire-and-forget provider jobs with polled completion
//! - correlation of provider volumes to the block devices they surface as
//! - persistent device-mapper identities per VM disk
//! - NBD export configuration for migration data movers
//! - SQLite as the single source of truth for all of the above

pub mod device;
pub mod error;
pub mod identity;
pub mod models;
pub mod nbd;
pub mod operations;
pub mod provider;
pub mod store;

pub use device::{DeviceCorrelator, DeviceEvent, DeviceInfo, DeviceMonitor, MonitorConfig};
pub use error::{FailureStage, Result, VolumeError};
pub use identity::{mapper_path, persistent_name, DmsetupBackend, IdentityManager, MapperBackend};
pub use models::{
    AttachVolumeRequest, CreateVolumeRequest, DeviceMapping, ExportStatus, NbdExport,
    OperationFilter, OperationMode, OperationStatus, OperationType, PersistentDeviceName,
    VolumeOperation,
};
pub use nbd::{export_name, ExportManager, NbdConfigWriter, NBD_PORT};
pub use operations::VolumeManager;
pub use provider::{
    GatewayTimeouts, HttpProviderClient, JobState, JobToken, ProviderClient, ProviderGateway,
    ProviderRequest,
};
pub use store::VolumeStore;
