pub mod attach_volume;
pub mod create_volume;
pub mod delete_volume;
pub mod detach_volume;
pub mod manager;

pub use attach_volume::{AttachVolumeOperation, AttachVolumeOperationResult};
pub use create_volume::{CreateVolumeOperation, CreateVolumeOperationResult};
pub use delete_volume::{DeleteVolumeOperation, DeleteVolumeOperationResult};
pub use detach_volume::{DetachVolumeOperation, DetachVolumeOperationResult};
pub use manager::VolumeManager;
