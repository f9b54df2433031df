use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, VolumeError>;

/// Stage of the orchestrated volume flow a failure originated from.
///
/// Upstream callers use the tag to decide retry vs. escalate: provider
/// failures on idempotent operations are retryable, correlation failures
/// point at the host's device bus, identity/export failures at local state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureStage {
    Provider,
    Correlation,
    Identity,
    Export,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::Provider => "provider",
            FailureStage::Correlation => "correlation",
            FailureStage::Identity => "identity",
            FailureStage::Export => "export",
        }
    }
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug)]
pub enum VolumeError {
    /// The provider rejected the request outright; no job was started.
    #[error("provider rejected request: {0}")]
    ProviderSubmitFailure(String),

    /// The provider accepted the job and it ran to a failed conclusion.
    /// The detail string is the provider's own, passed through verbatim.
    #[error("provider job failed: {0}")]
    ProviderJobFailure(String),

    /// The job was neither confirmed nor denied within budget. Unknown
    /// state: requires reconciliation before any retry.
    #[error("provider job {job_id} not resolved within {timeout_secs}s")]
    ProviderTimeout { job_id: String, timeout_secs: u64 },

    /// The provider reported attach success but no matching block device
    /// appeared locally. Signals an OS/bus visibility problem, not a
    /// provider failure.
    #[error("no device appeared for volume {volume_id} within {timeout_secs}s")]
    CorrelationTimeout { volume_id: String, timeout_secs: u64 },

    /// Another operation already holds the per-volume lock. The caller
    /// backs off; requests are rejected, never queued.
    #[error("operation already in flight for volume {0}")]
    OperationConflict(String),

    /// Two persistent names would alias the same real device and the
    /// conflict could not be auto-resolved from recorded mapping state.
    #[error("persistent name conflict on {real_path}: held by {existing_name}")]
    IdentityConflict {
        real_path: String,
        existing_name: String,
    },

    #[error("device mapper operation failed: {0}")]
    Mapper(String),

    /// Infrastructure failure (store write, filesystem, process spawn)
    /// attributed to the orchestration stage it interrupted.
    #[error("{stage} stage failed: {detail}")]
    StageFailure {
        stage: FailureStage,
        detail: String,
    },

    /// The caller gave up on the local wait. The provider job runs to
    /// its own conclusion; the outcome is unknown here.
    #[error("client cancelled, provider outcome unknown")]
    ClientCancelled,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VolumeError {
    /// Stage tag this error is attributed to when it fails an operation.
    pub fn stage(&self) -> Option<FailureStage> {
        match self {
            VolumeError::ProviderSubmitFailure(_)
            | VolumeError::ProviderJobFailure(_)
            | VolumeError::ProviderTimeout { .. } => Some(FailureStage::Provider),
            VolumeError::CorrelationTimeout { .. } => Some(FailureStage::Correlation),
            VolumeError::IdentityConflict { .. } | VolumeError::Mapper(_) => {
                Some(FailureStage::Identity)
            }
            VolumeError::StageFailure { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Attribute an untagged error to the stage it interrupted. Errors
    /// that already carry a stage pass through unchanged, so provider
    /// and mapper failures keep their own attribution.
    pub fn at_stage(self, stage: FailureStage) -> VolumeError {
        match self.stage() {
            Some(_) => self,
            None => VolumeError::StageFailure {
                stage,
                detail: self.to_string(),
            },
        }
    }
}
