use super::{
    AttachVolumeOperation, CreateVolumeOperation, DeleteVolumeOperation, DetachVolumeOperation,
};
use crate::device::DeviceCorrelator;
use crate::error::{Result, VolumeError};
use crate::identity::IdentityManager;
use crate::models::{
    AttachVolumeRequest, CreateVolumeRequest, OperationFilter, OperationStatus, OperationType,
    VolumeOperation,
};
use crate::nbd::ExportManager;
use crate::provider::ProviderGateway;
use crate::store::VolumeStore;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{error, info, warn};
use ulid::Ulid;

/// Orchestrates the volume lifecycle. Every public mutation records a
/// pending operation, spawns its stage sequence, and returns immediately;
/// callers poll the operation record for the outcome.
#[derive(Clone)]
pub struct VolumeManager {
    store: Arc<VolumeStore>,
    gateway: Arc<ProviderGateway>,
    correlator: Arc<DeviceCorrelator>,
    identity: Arc<IdentityManager>,
    exports: Arc<ExportManager>,
    correlation_timeout: Duration,
    // Volume ids with an operation in flight. Contention is rejected,
    // never queued: a queued mutation would run against state the caller
    // never saw.
    in_flight: Arc<Mutex<HashSet<String>>>,
    // Cancel signal per in-flight operation id.
    cancels: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

struct FlightGuard {
    key: String,
    set: Arc<Mutex<HashSet<String>>>,
    operation_id: String,
    cancels: Arc<Mutex<HashMap<String, Arc<Notify>>>>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut set = self.set.lock().unwrap_or_else(|e| e.into_inner());
        set.remove(&self.key);
        let mut cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
        cancels.remove(&self.operation_id);
    }
}

impl VolumeManager {
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
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            cancels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &Arc<VolumeStore> {
        &self.store
    }

    pub fn exports(&self) -> &Arc<ExportManager> {
        &self.exports
    }

    pub fn pending_correlations(&self) -> Vec<(String, u64)> {
        self.correlator.pending()
    }

    pub async fn create_volume(&self, request: CreateVolumeRequest) -> Result<VolumeOperation> {
        if request.name.is_empty() {
            return Err(VolumeError::InvalidRequest("volume name is empty".into()));
        }
        if request.size_bytes == 0 {
            return Err(VolumeError::InvalidRequest("volume size is zero".into()));
        }

        // No provider id exists yet; the operation is keyed by the
        // requested name until the create job reports the assigned id.
        let (op, guard, cancel) = self.begin(
            OperationType::Create,
            &request.name,
            None,
            serde_json::to_value(&request)?,
        )?;

        let manager = self.clone();
        let mut record = op.clone();
        tokio::spawn(async move {
            let _guard = guard;
            manager.mark_executing(&mut record);
            let operation = CreateVolumeOperation::new(Arc::clone(&manager.gateway));
            let outcome = tokio::select! {
                outcome = operation.run(request) => outcome,
                _ = cancel.notified() => Err(VolumeError::ClientCancelled),
            };
            match outcome {
                Ok(result) => {
                    record.volume_id = result.volume_id;
                    manager.finish(record, Ok(result.provider_response));
                }
                Err(e) => manager.finish(record, Err(e)),
            }
        });

        Ok(op)
    }

    pub async fn attach_volume(
        &self,
        volume_id: &str,
        request: AttachVolumeRequest,
    ) -> Result<VolumeOperation> {
        if request.vm_id.is_empty() || request.vm_name.is_empty() {
            return Err(VolumeError::InvalidRequest("vm_id and vm_name required".into()));
        }
        if request.size_bytes == 0 {
            return Err(VolumeError::InvalidRequest("size_bytes required".into()));
        }

        let (op, guard, cancel) = self.begin(
            OperationType::Attach,
            volume_id,
            Some(request.vm_id.clone()),
            serde_json::to_value(&request)?,
        )?;

        let manager = self.clone();
        let mut record = op.clone();
        let volume_id = volume_id.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            manager.mark_executing(&mut record);
            let operation = AttachVolumeOperation::new(
                Arc::clone(&manager.store),
                Arc::clone(&manager.gateway),
                Arc::clone(&manager.correlator),
                Arc::clone(&manager.identity),
                Arc::clone(&manager.exports),
                manager.correlation_timeout,
            );
            // Cancellation drops the stage future; its expectation handle
            // withdraws itself and the provider job runs on unobserved.
            let outcome = tokio::select! {
                outcome = operation.run(&volume_id, request) => outcome,
                _ = cancel.notified() => Err(VolumeError::ClientCancelled),
            };
            let outcome = outcome.map(|result| {
                serde_json::json!({
                    "device_path": result.mapping.device_path,
                    "mapper_path": result.mapping.mapper_path,
                    "persistent_device_name": result.mapping.persistent_device_name,
                    "export_name": result.export.export_name,
                    "port": result.export.port,
                })
            });
            manager.finish(record, outcome);
        });

        Ok(op)
    }

    pub async fn detach_volume(&self, volume_id: &str) -> Result<VolumeOperation> {
        let (op, guard, cancel) = self.begin(
            OperationType::Detach,
            volume_id,
            None,
            serde_json::json!({ "volume_id": volume_id }),
        )?;

        let manager = self.clone();
        let mut record = op.clone();
        let volume_id = volume_id.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            manager.mark_executing(&mut record);
            let operation =
                DetachVolumeOperation::new(Arc::clone(&manager.store), Arc::clone(&manager.gateway));
            let outcome = tokio::select! {
                outcome = operation.run(&volume_id) => outcome,
                _ = cancel.notified() => Err(VolumeError::ClientCancelled),
            };
            let outcome = outcome.map(|result| {
                serde_json::json!({
                    "detached": true,
                    "device_path": result.mapping.map(|m| m.device_path),
                })
            });
            manager.finish(record, outcome);
        });

        Ok(op)
    }

    pub async fn delete_volume(&self, volume_id: &str) -> Result<VolumeOperation> {
        let (op, guard, cancel) = self.begin(
            OperationType::Delete,
            volume_id,
            None,
            serde_json::json!({ "volume_id": volume_id }),
        )?;

        let manager = self.clone();
        let mut record = op.clone();
        let volume_id = volume_id.to_string();
        tokio::spawn(async move {
            let _guard = guard;
            manager.mark_executing(&mut record);
            let operation = DeleteVolumeOperation::new(
                Arc::clone(&manager.store),
                Arc::clone(&manager.gateway),
                Arc::clone(&manager.identity),
                Arc::clone(&manager.exports),
            );
            let outcome = tokio::select! {
                outcome = operation.run(&volume_id) => outcome,
                _ = cancel.notified() => Err(VolumeError::ClientCancelled),
            };
            let outcome =
                outcome.map(|result| serde_json::json!({ "removed_mapping": result.removed_mapping }));
            manager.finish(record, outcome);
        });

        Ok(op)
    }

    pub fn get_operation(&self, operation_id: &str) -> Result<Option<VolumeOperation>> {
        self.store.get_operation(operation_id)
    }

    pub fn list_operations(&self, filter: &OperationFilter) -> Result<Vec<VolumeOperation>> {
        self.store.list_operations(filter)
    }

    /// Poll the operation until it is terminal or the deadline passes.
    /// On deadline the still-running record is returned as-is; the stage
    /// sequence itself keeps going.
    pub async fn wait_for_completion(
        &self,
        operation_id: &str,
        timeout: Duration,
    ) -> Result<VolumeOperation> {
        let deadline = Instant::now() + timeout;
        loop {
            let op = self
                .store
                .get_operation(operation_id)?
                .ok_or_else(|| VolumeError::NotFound(format!("operation {}", operation_id)))?;
            if op.is_terminal() || Instant::now() >= deadline {
                return Ok(op);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Abandon the local wait for an in-flight operation. The provider
    /// job runs to its own conclusion; the record is failed with an
    /// unknown provider outcome and the caller reconciles through the
    /// mapping/status queries. Returns false when no operation with this
    /// id is in flight (already terminal, or never existed).
    pub fn cancel_operation(&self, operation_id: &str) -> bool {
        let cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
        match cancels.get(operation_id) {
            Some(cancel) => {
                info!(operation_id = %operation_id, "client cancelled operation");
                cancel.notify_one();
                true
            }
            None => false,
        }
    }

    /// Called once at startup. Operations left executing by a previous
    /// process have an unknown provider outcome; they are failed, never
    /// resumed, and callers reconcile through the status queries.
    pub fn reconcile_startup(&self) -> Result<usize> {
        let stale = self.store.list_executing_operations()?;
        let count = stale.len();
        for mut op in stale {
            warn!(
                operation_id = %op.id,
                op_type = op.op_type.as_str(),
                volume_id = %op.volume_id,
                "failing operation interrupted by restart"
            );
            op.status = OperationStatus::Failed;
            op.error = Some("daemon restarted mid-operation, provider outcome unknown".into());
            op.completed_at = Some(Utc::now());
            op.updated_at = Utc::now();
            self.store.update_operation(&op)?;
        }
        if count > 0 {
            info!(count, "startup reconciliation failed interrupted operations");
        }
        Ok(count)
    }

    fn begin(
        &self,
        op_type: OperationType,
        volume_id: &str,
        vm_id: Option<String>,
        request: serde_json::Value,
    ) -> Result<(VolumeOperation, FlightGuard, Arc<Notify>)> {
        {
            let mut set = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if !set.insert(volume_id.to_string()) {
                return Err(VolumeError::OperationConflict(volume_id.to_string()));
            }
        }

        let now = Utc::now();
        let op = VolumeOperation {
            id: Ulid::new().to_string(),
            op_type,
            status: OperationStatus::Pending,
            volume_id: volume_id.to_string(),
            vm_id,
            request,
            response: None,
            error: None,
            failure_stage: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let cancel = Arc::new(Notify::new());
        {
            let mut cancels = self.cancels.lock().unwrap_or_else(|e| e.into_inner());
            cancels.insert(op.id.clone(), Arc::clone(&cancel));
        }
        let guard = FlightGuard {
            key: volume_id.to_string(),
            set: Arc::clone(&self.in_flight),
            operation_id: op.id.clone(),
            cancels: Arc::clone(&self.cancels),
        };

        if let Err(e) = self.store.create_operation(&op) {
            drop(guard);
            return Err(e);
        }
        info!(
            operation_id = %op.id,
            op_type = op_type.as_str(),
            volume_id = %volume_id,
            "operation accepted"
        );
        Ok((op, guard, cancel))
    }

    fn mark_executing(&self, op: &mut VolumeOperation) {
        op.status = OperationStatus::Executing;
        op.updated_at = Utc::now();
        if let Err(e) = self.store.update_operation(op) {
            error!(operation_id = %op.id, error = %e, "failed to mark operation executing");
        }
    }

    /// Terminal transition for a spawned stage sequence. Status moves are
    /// monotonic; nothing resets a terminal record.
    fn finish(&self, mut op: VolumeOperation, outcome: Result<serde_json::Value>) {
        let now = Utc::now();
        match outcome {
            Ok(response) => {
                op.status = OperationStatus::Completed;
                op.response = Some(response);
            }
            Err(e) => {
                op.status = OperationStatus::Failed;
                op.failure_stage = e.stage();
                op.error = Some(e.to_string());
                warn!(
                    operation_id = %op.id,
                    volume_id = %op.volume_id,
                    stage = ?op.failure_stage,
                    error = %e,
                    "operation failed"
                );
            }
        }
        op.updated_at = now;
        op.completed_at = Some(now);
        if let Err(e) = self.store.update_operation(&op) {
            error!(operation_id = %op.id, error = %e, "failed to persist operation outcome");
        }
    }
}
