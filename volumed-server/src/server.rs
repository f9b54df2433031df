use crate::config::Config;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use volumed_core::{
    AttachVolumeRequest, CreateVolumeRequest, DeviceCorrelator, DeviceMonitor, DmsetupBackend,
    ExportManager, ExportStatus, HttpProviderClient, IdentityManager, NbdConfigWriter,
    OperationFilter, OperationStatus, OperationType, ProviderGateway, Result, VolumeError,
    VolumeManager, VolumeStore,
};

pub struct ServerState {
    pub manager: VolumeManager,
    pub provider_url: String,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Response {
    (
        StatusCode::OK,
        Json(ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        }),
    )
        .into_response()
}

fn accepted<T: Serialize>(data: T) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(ApiResponse {
            success: true,
            data: Some(data),
            error: None,
        }),
    )
        .into_response()
}

fn fail(error: &VolumeError) -> Response {
    let status = match error {
        VolumeError::NotFound(_) => StatusCode::NOT_FOUND,
        VolumeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        VolumeError::OperationConflict(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(error.to_string()),
        }),
    )
        .into_response()
}

pub async fn run_server(config: Config) -> Result<()> {
    let store = Arc::new(VolumeStore::new(config.database.path.clone())?);

    let client = Arc::new(HttpProviderClient::new(
        config.provider.base_url.clone(),
        config.provider.api_key.clone(),
    ));
    let gateway = Arc::new(ProviderGateway::new(client, config.gateway_timeouts()));

    let monitor = DeviceMonitor::new(config.monitor_config());
    let correlator = Arc::new(DeviceCorrelator::new());
    let _dispatcher = correlator.spawn_dispatcher(monitor.subscribe());
    let _monitor = monitor.spawn();

    let identity = Arc::new(IdentityManager::new(
        Arc::clone(&store),
        Arc::new(DmsetupBackend),
    ));
    let exports = Arc::new(ExportManager::new(
        Arc::clone(&store),
        NbdConfigWriter::new(config.nbd.conf_dir.clone(), config.nbd.pidfile.clone()),
        config.nbd.port,
    ));

    let manager = VolumeManager::new(
        store,
        gateway,
        correlator,
        identity,
        exports,
        config.correlation_timeout(),
    );

    let reconciled = manager.reconcile_startup()?;
    if reconciled > 0 {
        tracing::warn!(count = reconciled, "failed operations interrupted by restart");
    }

    let state = Arc::new(ServerState {
        manager,
        provider_url: config.provider.base_url.clone(),
    });

    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&config.api.bind_addr).await?;
    tracing::info!("Server listening on {}", config.api.bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/api/v1/volumes", post(create_volume))
        .route("/api/v1/volumes/:volume_id", delete(delete_volume))
        .route("/api/v1/volumes/:volume_id/attach", post(attach_volume))
        .route("/api/v1/volumes/:volume_id/detach", post(detach_volume))
        .route("/api/v1/volumes/:volume_id/device", get(get_volume_device))
        .route("/api/v1/operations", get(list_operations))
        .route("/api/v1/operations/:operation_id", get(get_operation))
        .route(
            "/api/v1/operations/:operation_id/cancel",
            post(cancel_operation),
        )
        .route("/api/v1/devices/:device/volume", get(get_device_volume))
        .route("/api/v1/vms/:vm_id/volumes", get(list_vm_volumes))
        .route("/api/v1/exports", get(list_exports))
        .route("/api/v1/exports/:volume_id", get(get_export))
        .route("/api/v1/health", get(health))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    /// Block up to this long for the operation to settle before
    /// responding; the operation keeps running either way.
    #[serde(default)]
    wait_secs: Option<u64>,
}

async fn respond_with_operation(
    state: &ServerState,
    op: volumed_core::VolumeOperation,
    wait: &WaitQuery,
) -> Response {
    match wait.wait_secs {
        Some(secs) => match state
            .manager
            .wait_for_completion(&op.id, Duration::from_secs(secs))
            .await
        {
            Ok(op) if op.is_terminal() => ok(op),
            Ok(op) => accepted(op),
            Err(e) => fail(&e),
        },
        None => accepted(op),
    }
}

async fn create_volume(
    State(state): State<Arc<ServerState>>,
    Query(wait): Query<WaitQuery>,
    Json(request): Json<CreateVolumeRequest>,
) -> Response {
    match state.manager.create_volume(request).await {
        Ok(op) => respond_with_operation(&state, op, &wait).await,
        Err(e) => fail(&e),
    }
}

async fn attach_volume(
    State(state): State<Arc<ServerState>>,
    Path(volume_id): Path<String>,
    Query(wait): Query<WaitQuery>,
    Json(request): Json<AttachVolumeRequest>,
) -> Response {
    match state.manager.attach_volume(&volume_id, request).await {
        Ok(op) => respond_with_operation(&state, op, &wait).await,
        Err(e) => fail(&e),
    }
}

async fn detach_volume(
    State(state): State<Arc<ServerState>>,
    Path(volume_id): Path<String>,
    Query(wait): Query<WaitQuery>,
) -> Response {
    match state.manager.detach_volume(&volume_id).await {
        Ok(op) => respond_with_operation(&state, op, &wait).await,
        Err(e) => fail(&e),
    }
}

async fn delete_volume(
    State(state): State<Arc<ServerState>>,
    Path(volume_id): Path<String>,
    Query(wait): Query<WaitQuery>,
) -> Response {
    match state.manager.delete_volume(&volume_id).await {
        Ok(op) => respond_with_operation(&state, op, &wait).await,
        Err(e) => fail(&e),
    }
}

async fn get_operation(
    State(state): State<Arc<ServerState>>,
    Path(operation_id): Path<String>,
) -> Response {
    match state.manager.get_operation(&operation_id) {
        Ok(Some(op)) => ok(op),
        Ok(None) => fail(&VolumeError::NotFound(format!(
            "operation {}",
            operation_id
        ))),
        Err(e) => fail(&e),
    }
}

/// Abandon the wait on an in-flight operation. The provider job is not
/// aborted; the record is failed with an unknown provider outcome.
async fn cancel_operation(
    State(state): State<Arc<ServerState>>,
    Path(operation_id): Path<String>,
) -> Response {
    if !state.manager.cancel_operation(&operation_id) {
        return fail(&VolumeError::NotFound(format!(
            "no in-flight operation {}",
            operation_id
        )));
    }
    match state.manager.get_operation(&operation_id) {
        Ok(Some(op)) => accepted(op),
        Ok(None) => fail(&VolumeError::NotFound(format!(
            "operation {}",
            operation_id
        ))),
        Err(e) => fail(&e),
    }
}

#[derive(Debug, Deserialize)]
struct OperationsQuery {
    #[serde(default, rename = "type")]
    op_type: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    volume_id: Option<String>,
    #[serde(default)]
    vm_id: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

impl OperationsQuery {
    fn to_filter(&self) -> Result<OperationFilter> {
        let op_type = match self.op_type.as_deref() {
            None => None,
            Some("create") => Some(OperationType::Create),
            Some("attach") => Some(OperationType::Attach),
            Some("detach") => Some(OperationType::Detach),
            Some("delete") => Some(OperationType::Delete),
            Some(other) => {
                return Err(VolumeError::InvalidRequest(format!(
                    "unknown operation type: {}",
                    other
                )))
            }
        };
        let status = match self.status.as_deref() {
            None => None,
            Some("pending") => Some(OperationStatus::Pending),
            Some("executing") => Some(OperationStatus::Executing),
            Some("completed") => Some(OperationStatus::Completed),
            Some("failed") => Some(OperationStatus::Failed),
            Some(other) => {
                return Err(VolumeError::InvalidRequest(format!(
                    "unknown operation status: {}",
                    other
                )))
            }
        };
        Ok(OperationFilter {
            op_type,
            status,
            volume_id: self.volume_id.clone(),
            vm_id: self.vm_id.clone(),
            limit: self.limit,
        })
    }
}

async fn list_operations(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<OperationsQuery>,
) -> Response {
    let filter = match query.to_filter() {
        Ok(filter) => filter,
        Err(e) => return fail(&e),
    };
    match state.manager.list_operations(&filter) {
        Ok(operations) => ok(operations),
        Err(e) => fail(&e),
    }
}

async fn get_volume_device(
    State(state): State<Arc<ServerState>>,
    Path(volume_id): Path<String>,
) -> Response {
    match state.manager.store().get_mapping(&volume_id) {
        Ok(Some(mapping)) => ok(mapping),
        Ok(None) => fail(&VolumeError::NotFound(format!(
            "no device mapping for volume {}",
            volume_id
        ))),
        Err(e) => fail(&e),
    }
}

/// Reverse lookup by device basename, `vdb` for `/dev/vdb`.
async fn get_device_volume(
    State(state): State<Arc<ServerState>>,
    Path(device): Path<String>,
) -> Response {
    let device_path = format!("/dev/{}", device);
    match state.manager.store().get_mapping_by_device(&device_path) {
        Ok(Some(mapping)) => ok(mapping),
        Ok(None) => fail(&VolumeError::NotFound(format!(
            "no attached volume on {}",
            device_path
        ))),
        Err(e) => fail(&e),
    }
}

async fn list_vm_volumes(
    State(state): State<Arc<ServerState>>,
    Path(vm_id): Path<String>,
) -> Response {
    match state.manager.store().list_mappings_for_vm(&vm_id) {
        Ok(mappings) => ok(mappings),
        Err(e) => fail(&e),
    }
}

#[derive(Debug, Deserialize)]
struct ExportsQuery {
    #[serde(default)]
    status: Option<String>,
}

async fn list_exports(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ExportsQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        None => None,
        Some("pending") => Some(ExportStatus::Pending),
        Some("active") => Some(ExportStatus::Active),
        Some("inactive") => Some(ExportStatus::Inactive),
        Some("failed") => Some(ExportStatus::Failed),
        Some(other) => {
            return fail(&VolumeError::InvalidRequest(format!(
                "unknown export status: {}",
                other
            )))
        }
    };
    match state.manager.exports().list_exports(status) {
        Ok(exports) => ok(exports),
        Err(e) => fail(&e),
    }
}

async fn get_export(
    State(state): State<Arc<ServerState>>,
    Path(volume_id): Path<String>,
) -> Response {
    match state.manager.exports().get_export(&volume_id) {
        Ok(Some(export)) => ok(export),
        Ok(None) => fail(&VolumeError::NotFound(format!(
            "no export for volume {}",
            volume_id
        ))),
        Err(e) => fail(&e),
    }
}

async fn health(State(state): State<Arc<ServerState>>) -> Response {
    let store_ok = state.manager.store().ping().is_ok();
    let pending = state.manager.pending_correlations();

    let body = serde_json::json!({
        "status": if store_ok { "ok" } else { "degraded" },
        "database": store_ok,
        "provider_url": state.provider_url,
        "pending_correlations": pending.len(),
    });
    if store_ok {
        ok(body)
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
    }
}
