use crate::error::{FailureStage, Result, VolumeError};
use crate::models::{
    DeviceMapping, ExportStatus, NbdExport, OperationFilter, OperationMode, OperationStatus,
    OperationType, PersistentDeviceName, VolumeOperation,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;

/// Relational source of truth for operation, mapping, export, and identity
/// state. Every component consults the store; none re-queries the provider
/// when a fresh local record exists.
pub struct VolumeStore {
    db_path: PathBuf,
}

impl VolumeStore {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        let store = Self { db_path };
        store.init_schema()?;
        Ok(store)
    }

    fn get_conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.pragma_update(None, "busy_timeout", 5000)?;
        Ok(conn)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.get_conn()?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS volume_operations (
                id TEXT PRIMARY KEY,
                op_type TEXT NOT NULL,
                status TEXT NOT NULL,
                volume_id TEXT NOT NULL,
                vm_id TEXT,
                request TEXT NOT NULL,
                response TEXT,
                error TEXT,
                failure_stage TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_operations_volume
             ON volume_operations(volume_id, status)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS device_mappings (
                id TEXT PRIMARY KEY,
                volume_id TEXT NOT NULL,
                volume_id_numeric INTEGER,
                vm_id TEXT NOT NULL,
                operation_mode TEXT NOT NULL,
                device_path TEXT NOT NULL,
                provider_device_slot INTEGER,
                provider_state TEXT NOT NULL,
                os_state TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                persistent_device_name TEXT,
                mapper_path TEXT,
                last_synced_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        // At most one attached row per volume.
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_mappings_attached
             ON device_mappings(volume_id) WHERE os_state = 'attached'",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_mappings_vm ON device_mappings(vm_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS nbd_exports (
                id TEXT PRIMARY KEY,
                volume_id TEXT NOT NULL,
                export_name TEXT NOT NULL UNIQUE,
                mapper_path TEXT NOT NULL,
                port INTEGER NOT NULL,
                status TEXT NOT NULL,
                config_path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_exports_volume ON nbd_exports(volume_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS persistent_device_names (
                name TEXT PRIMARY KEY,
                mapper_path TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
            [],
        )?;

        Ok(())
    }

    // === Operations ===

    pub fn create_operation(&self, op: &VolumeOperation) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO volume_operations (
                id, op_type, status, volume_id, vm_id, request, response,
                error, failure_stage, created_at, updated_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                op.id,
                op.op_type.as_str(),
                op.status.as_str(),
                op.volume_id,
                op.vm_id,
                op.request.to_string(),
                op.response.as_ref().map(|r| r.to_string()),
                op.error,
                op.failure_stage.map(|s| s.as_str()),
                op.created_at.to_rfc3339(),
                op.updated_at.to_rfc3339(),
                op.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn update_operation(&self, op: &VolumeOperation) -> Result<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE volume_operations SET
                status = ?2, volume_id = ?3, response = ?4, error = ?5,
                failure_stage = ?6, updated_at = ?7, completed_at = ?8
             WHERE id = ?1",
            params![
                op.id,
                op.status.as_str(),
                op.volume_id,
                op.response.as_ref().map(|r| r.to_string()),
                op.error,
                op.failure_stage.map(|s| s.as_str()),
                op.updated_at.to_rfc3339(),
                op.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        if affected == 0 {
            return Err(VolumeError::NotFound(format!("operation {}", op.id)));
        }
        Ok(())
    }

    pub fn get_operation(&self, operation_id: &str) -> Result<Option<VolumeOperation>> {
        let conn = self.get_conn()?;
        let op = conn
            .query_row(
                "SELECT id, op_type, status, volume_id, vm_id, request, response,
                        error, failure_stage, created_at, updated_at, completed_at
                 FROM volume_operations WHERE id = ?1",
                [operation_id],
                row_to_operation,
            )
            .optional()?;
        Ok(op)
    }

    pub fn list_operations(&self, filter: &OperationFilter) -> Result<Vec<VolumeOperation>> {
        let conn = self.get_conn()?;

        let mut sql = String::from(
            "SELECT id, op_type, status, volume_id, vm_id, request, response,
                    error, failure_stage, created_at, updated_at, completed_at
             FROM volume_operations WHERE 1=1",
        );
        let mut args: Vec<String> = Vec::new();

        if let Some(op_type) = filter.op_type {
            args.push(op_type.as_str().to_string());
            sql.push_str(&format!(" AND op_type = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(status.as_str().to_string());
            sql.push_str(&format!(" AND status = ?{}", args.len()));
        }
        if let Some(volume_id) = &filter.volume_id {
            args.push(volume_id.clone());
            sql.push_str(&format!(" AND volume_id = ?{}", args.len()));
        }
        if let Some(vm_id) = &filter.vm_id {
            args.push(vm_id.clone());
            sql.push_str(&format!(" AND vm_id = ?{}", args.len()));
        }
        sql.push_str(" ORDER BY created_at DESC");
        sql.push_str(&format!(" LIMIT {}", filter.limit.unwrap_or(100)));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_operation)?;

        let mut operations = Vec::new();
        for row in rows {
            operations.push(row?);
        }
        Ok(operations)
    }

    /// Operations left in `executing` by a previous process. Restart must
    /// surface these as unknown state, never resume them.
    pub fn list_executing_operations(&self) -> Result<Vec<VolumeOperation>> {
        self.list_operations(&OperationFilter {
            status: Some(OperationStatus::Executing),
            limit: Some(1000),
            ..Default::default()
        })
    }

    // === Device mappings ===

    pub fn create_mapping(&self, mapping: &DeviceMapping) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO device_mappings (
                id, volume_id, volume_id_numeric, vm_id, operation_mode,
                device_path, provider_device_slot, provider_state, os_state,
                size_bytes, persistent_device_name, mapper_path,
                last_synced_at, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                mapping.id,
                mapping.volume_id,
                mapping.volume_id_numeric,
                mapping.vm_id,
                mapping.operation_mode.as_str(),
                mapping.device_path,
                mapping.provider_device_slot,
                mapping.provider_state,
                mapping.os_state,
                mapping.size_bytes as i64,
                mapping.persistent_device_name,
                mapping.mapper_path,
                mapping.last_synced_at.to_rfc3339(),
                mapping.created_at.to_rfc3339(),
                mapping.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Update a mapping in place. Used when the real path changes across
    /// failover/failback; the row identity is stable.
    pub fn update_mapping(&self, mapping: &DeviceMapping) -> Result<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE device_mappings SET
                vm_id = ?2, operation_mode = ?3, device_path = ?4,
                provider_device_slot = ?5, provider_state = ?6, os_state = ?7,
                size_bytes = ?8, persistent_device_name = ?9, mapper_path = ?10,
                last_synced_at = ?11, updated_at = ?12
             WHERE id = ?1",
            params![
                mapping.id,
                mapping.vm_id,
                mapping.operation_mode.as_str(),
                mapping.device_path,
                mapping.provider_device_slot,
                mapping.provider_state,
                mapping.os_state,
                mapping.size_bytes as i64,
                mapping.persistent_device_name,
                mapping.mapper_path,
                mapping.last_synced_at.to_rfc3339(),
                mapping.updated_at.to_rfc3339(),
            ],
        )?;
        if affected == 0 {
            return Err(VolumeError::NotFound(format!("mapping {}", mapping.id)));
        }
        Ok(())
    }

    pub fn get_mapping(&self, volume_id: &str) -> Result<Option<DeviceMapping>> {
        let conn = self.get_conn()?;
        let mapping = conn
            .query_row(
                &format!(
                    "{MAPPING_SELECT} WHERE volume_id = ?1
                     ORDER BY updated_at DESC LIMIT 1"
                ),
                [volume_id],
                row_to_mapping,
            )
            .optional()?;
        Ok(mapping)
    }

    pub fn get_mapping_by_device(&self, device_path: &str) -> Result<Option<DeviceMapping>> {
        let conn = self.get_conn()?;
        let mapping = conn
            .query_row(
                &format!("{MAPPING_SELECT} WHERE device_path = ?1 AND os_state = 'attached'"),
                [device_path],
                row_to_mapping,
            )
            .optional()?;
        Ok(mapping)
    }

    pub fn get_mapping_by_persistent_name(&self, name: &str) -> Result<Option<DeviceMapping>> {
        let conn = self.get_conn()?;
        let mapping = conn
            .query_row(
                &format!(
                    "{MAPPING_SELECT} WHERE persistent_device_name = ?1
                     ORDER BY updated_at DESC LIMIT 1"
                ),
                [name],
                row_to_mapping,
            )
            .optional()?;
        Ok(mapping)
    }

    pub fn list_mappings_for_vm(&self, vm_id: &str) -> Result<Vec<DeviceMapping>> {
        let conn = self.get_conn()?;
        let mut stmt =
            conn.prepare(&format!("{MAPPING_SELECT} WHERE vm_id = ?1 ORDER BY created_at"))?;
        let rows = stmt.query_map([vm_id], row_to_mapping)?;

        let mut mappings = Vec::new();
        for row in rows {
            mappings.push(row?);
        }
        Ok(mappings)
    }

    pub fn delete_mapping(&self, volume_id: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "DELETE FROM device_mappings WHERE volume_id = ?1",
            [volume_id],
        )?;
        Ok(affected > 0)
    }

    // === NBD exports ===

    pub fn create_export(&self, export: &NbdExport) -> Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO nbd_exports (
                id, volume_id, export_name, mapper_path, port, status,
                config_path, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                export.id,
                export.volume_id,
                export.export_name,
                export.mapper_path,
                export.port,
                export.status.as_str(),
                export.config_path,
                export.created_at.to_rfc3339(),
                export.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_export(&self, export: &NbdExport) -> Result<()> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "UPDATE nbd_exports SET
                volume_id = ?2, mapper_path = ?3, port = ?4, status = ?5,
                config_path = ?6, updated_at = ?7
             WHERE id = ?1",
            params![
                export.id,
                export.volume_id,
                export.mapper_path,
                export.port,
                export.status.as_str(),
                export.config_path,
                export.updated_at.to_rfc3339(),
            ],
        )?;
        if affected == 0 {
            return Err(VolumeError::NotFound(format!("export {}", export.id)));
        }
        Ok(())
    }

    pub fn get_export_by_name(&self, export_name: &str) -> Result<Option<NbdExport>> {
        let conn = self.get_conn()?;
        let export = conn
            .query_row(
                &format!("{EXPORT_SELECT} WHERE export_name = ?1"),
                [export_name],
                row_to_export,
            )
            .optional()?;
        Ok(export)
    }

    pub fn get_export_by_volume(&self, volume_id: &str) -> Result<Option<NbdExport>> {
        let conn = self.get_conn()?;
        let export = conn
            .query_row(
                &format!(
                    "{EXPORT_SELECT} WHERE volume_id = ?1
                     ORDER BY updated_at DESC LIMIT 1"
                ),
                [volume_id],
                row_to_export,
            )
            .optional()?;
        Ok(export)
    }

    pub fn list_exports(&self, status: Option<ExportStatus>) -> Result<Vec<NbdExport>> {
        let conn = self.get_conn()?;
        let mut exports = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "{EXPORT_SELECT} WHERE status = ?1 ORDER BY created_at"
                ))?;
                let rows = stmt.query_map([status.as_str()], row_to_export)?;
                for row in rows {
                    exports.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!("{EXPORT_SELECT} ORDER BY created_at"))?;
                let rows = stmt.query_map([], row_to_export)?;
                for row in rows {
                    exports.push(row?);
                }
            }
        }
        Ok(exports)
    }

    // === Persistent device names ===

    pub fn upsert_persistent_name(&self, name: &str, mapper_path: &str) -> Result<()> {
        let conn = self.get_conn()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "INSERT INTO persistent_device_names (name, mapper_path, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?3)
             ON CONFLICT(name) DO UPDATE SET mapper_path = ?2, updated_at = ?3",
            params![name, mapper_path, now],
        )?;
        Ok(())
    }

    pub fn get_persistent_name(&self, name: &str) -> Result<Option<PersistentDeviceName>> {
        let conn = self.get_conn()?;
        let record = conn
            .query_row(
                "SELECT name, mapper_path, created_at, updated_at
                 FROM persistent_device_names WHERE name = ?1",
                [name],
                row_to_persistent_name,
            )
            .optional()?;
        Ok(record)
    }

    pub fn list_persistent_names(&self) -> Result<Vec<PersistentDeviceName>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT name, mapper_path, created_at, updated_at
             FROM persistent_device_names ORDER BY name",
        )?;
        let rows = stmt.query_map([], row_to_persistent_name)?;

        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }

    pub fn remove_persistent_name(&self, name: &str) -> Result<bool> {
        let conn = self.get_conn()?;
        let affected = conn.execute(
            "DELETE FROM persistent_device_names WHERE name = ?1",
            [name],
        )?;
        Ok(affected > 0)
    }

    pub fn ping(&self) -> Result<()> {
        let conn = self.get_conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }
}

const MAPPING_SELECT: &str = "SELECT id, volume_id, volume_id_numeric, vm_id, operation_mode,
        device_path, provider_device_slot, provider_state, os_state, size_bytes,
        persistent_device_name, mapper_path, last_synced_at, created_at, updated_at
 FROM device_mappings";

const EXPORT_SELECT: &str = "SELECT id, volume_id, export_name, mapper_path, port, status,
        config_path, created_at, updated_at
 FROM nbd_exports";

fn parse_ts(value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn parse_json(value: &str) -> rusqlite::Result<serde_json::Value> {
    serde_json::from_str(value).map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
}

fn row_to_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<VolumeOperation> {
    let op_type: String = row.get(1)?;
    let status: String = row.get(2)?;
    let request: String = row.get(5)?;
    let response: Option<String> = row.get(6)?;
    let failure_stage: Option<String> = row.get(8)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    let completed_at: Option<String> = row.get(11)?;

    Ok(VolumeOperation {
        id: row.get(0)?,
        op_type: parse_op_type(&op_type)?,
        status: parse_status(&status)?,
        volume_id: row.get(3)?,
        vm_id: row.get(4)?,
        request: parse_json(&request)?,
        response: response.as_deref().map(parse_json).transpose()?,
        error: row.get(7)?,
        failure_stage: failure_stage.as_deref().map(parse_stage).transpose()?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
    })
}

fn row_to_mapping(row: &rusqlite::Row<'_>) -> rusqlite::Result<DeviceMapping> {
    let operation_mode: String = row.get(4)?;
    let size_bytes: i64 = row.get(9)?;
    let last_synced_at: String = row.get(12)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;

    Ok(DeviceMapping {
        id: row.get(0)?,
        volume_id: row.get(1)?,
        volume_id_numeric: row.get(2)?,
        vm_id: row.get(3)?,
        operation_mode: match operation_mode.as_str() {
            "failover" => OperationMode::Failover,
            _ => OperationMode::Primary,
        },
        device_path: row.get(5)?,
        provider_device_slot: row.get(6)?,
        provider_state: row.get(7)?,
        os_state: row.get(8)?,
        size_bytes: size_bytes as u64,
        persistent_device_name: row.get(10)?,
        mapper_path: row.get(11)?,
        last_synced_at: parse_ts(&last_synced_at)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn row_to_export(row: &rusqlite::Row<'_>) -> rusqlite::Result<NbdExport> {
    let port: i64 = row.get(4)?;
    let status: String = row.get(5)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(NbdExport {
        id: row.get(0)?,
        volume_id: row.get(1)?,
        export_name: row.get(2)?,
        mapper_path: row.get(3)?,
        port: port as u16,
        status: match status.as_str() {
            "active" => ExportStatus::Active,
            "inactive" => ExportStatus::Inactive,
            "failed" => ExportStatus::Failed,
            _ => ExportStatus::Pending,
        },
        config_path: row.get(6)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn row_to_persistent_name(row: &rusqlite::Row<'_>) -> rusqlite::Result<PersistentDeviceName> {
    let created_at: String = row.get(2)?;
    let updated_at: String = row.get(3)?;
    Ok(PersistentDeviceName {
        name: row.get(0)?,
        mapper_path: row.get(1)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn parse_op_type(value: &str) -> rusqlite::Result<OperationType> {
    match value {
        "create" => Ok(OperationType::Create),
        "attach" => Ok(OperationType::Attach),
        "detach" => Ok(OperationType::Detach),
        "delete" => Ok(OperationType::Delete),
        other => Err(rusqlite::Error::ToSqlConversionFailure(
            format!("unknown operation type: {}", other).into(),
        )),
    }
}

fn parse_status(value: &str) -> rusqlite::Result<OperationStatus> {
    match value {
        "pending" => Ok(OperationStatus::Pending),
        "executing" => Ok(OperationStatus::Executing),
        "completed" => Ok(OperationStatus::Completed),
        "failed" => Ok(OperationStatus::Failed),
        other => Err(rusqlite::Error::ToSqlConversionFailure(
            format!("unknown operation status: {}", other).into(),
        )),
    }
}

fn parse_stage(value: &str) -> rusqlite::Result<FailureStage> {
    match value {
        "provider" => Ok(FailureStage::Provider),
        "correlation" => Ok(FailureStage::Correlation),
        "identity" => Ok(FailureStage::Identity),
        "export" => Ok(FailureStage::Export),
        other => Err(rusqlite::Error::ToSqlConversionFailure(
            format!("unknown failure stage: {}", other).into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, VolumeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = VolumeStore::new(dir.path().join("volumed.db")).unwrap();
        (dir, store)
    }

    fn sample_operation(id: &str, volume_id: &str, status: OperationStatus) -> VolumeOperation {
        let now = Utc::now();
        VolumeOperation {
            id: id.to_string(),
            op_type: OperationType::Attach,
            status,
            volume_id: volume_id.to_string(),
            vm_id: Some("vm-1".to_string()),
            request: serde_json::json!({"volume_id": volume_id, "vm_id": "vm-1"}),
            response: None,
            error: None,
            failure_stage: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn sample_mapping(id: &str, volume_id: &str, os_state: &str) -> DeviceMapping {
        let now = Utc::now();
        DeviceMapping {
            id: id.to_string(),
            volume_id: volume_id.to_string(),
            volume_id_numeric: Some(42),
            vm_id: "vm-1".to_string(),
            operation_mode: OperationMode::Primary,
            device_path: "/dev/vdb".to_string(),
            provider_device_slot: Some(1),
            provider_state: "attached".to_string(),
            os_state: os_state.to_string(),
            size_bytes: 50 * 1024 * 1024 * 1024,
            persistent_device_name: Some("webserver01-disk0".to_string()),
            mapper_path: Some("/dev/mapper/webserver01-disk0".to_string()),
            last_synced_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_operation_lifecycle() {
        let (_dir, store) = test_store();

        let mut op = sample_operation("op-1", "vol-1", OperationStatus::Pending);
        store.create_operation(&op).unwrap();

        op.status = OperationStatus::Executing;
        op.updated_at = Utc::now();
        store.update_operation(&op).unwrap();

        op.status = OperationStatus::Failed;
        op.error = Some("provider job failed: no capacity".to_string());
        op.failure_stage = Some(FailureStage::Provider);
        op.completed_at = Some(Utc::now());
        store.update_operation(&op).unwrap();

        let loaded = store.get_operation("op-1").unwrap().unwrap();
        assert_eq!(loaded.status, OperationStatus::Failed);
        assert_eq!(loaded.failure_stage, Some(FailureStage::Provider));
        assert!(loaded.completed_at.is_some());
        assert_eq!(loaded.request["vm_id"], "vm-1");
    }

    #[test]
    fn test_list_operations_filtered() {
        let (_dir, store) = test_store();
        store
            .create_operation(&sample_operation("op-1", "vol-1", OperationStatus::Pending))
            .unwrap();
        store
            .create_operation(&sample_operation(
                "op-2",
                "vol-2",
                OperationStatus::Executing,
            ))
            .unwrap();

        let executing = store.list_executing_operations().unwrap();
        assert_eq!(executing.len(), 1);
        assert_eq!(executing[0].id, "op-2");

        let for_volume = store
            .list_operations(&OperationFilter {
                volume_id: Some("vol-1".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(for_volume.len(), 1);
        assert_eq!(for_volume[0].id, "op-1");
    }

    #[test]
    fn test_single_attached_mapping_per_volume() {
        let (_dir, store) = test_store();
        store
            .create_mapping(&sample_mapping("map-1", "vol-1", "attached"))
            .unwrap();

        // Second attached row for the same volume violates the invariant.
        let err = store.create_mapping(&sample_mapping("map-2", "vol-1", "attached"));
        assert!(err.is_err());

        // A detached row for the same volume is fine.
        store
            .create_mapping(&sample_mapping("map-3", "vol-1", "detached"))
            .unwrap();
    }

    #[test]
    fn test_mapping_lookups() {
        let (_dir, store) = test_store();
        store
            .create_mapping(&sample_mapping("map-1", "vol-1", "attached"))
            .unwrap();

        let by_volume = store.get_mapping("vol-1").unwrap().unwrap();
        assert_eq!(by_volume.device_path, "/dev/vdb");

        let by_device = store.get_mapping_by_device("/dev/vdb").unwrap().unwrap();
        assert_eq!(by_device.volume_id, "vol-1");

        let by_name = store
            .get_mapping_by_persistent_name("webserver01-disk0")
            .unwrap()
            .unwrap();
        assert_eq!(by_name.id, "map-1");

        let for_vm = store.list_mappings_for_vm("vm-1").unwrap();
        assert_eq!(for_vm.len(), 1);

        assert!(store.delete_mapping("vol-1").unwrap());
        assert!(store.get_mapping("vol-1").unwrap().is_none());
    }

    #[test]
    fn test_persistent_name_upsert_is_stable() {
        let (_dir, store) = test_store();
        store
            .upsert_persistent_name("webserver01-disk0", "/dev/mapper/webserver01-disk0")
            .unwrap();
        let first = store
            .get_persistent_name("webserver01-disk0")
            .unwrap()
            .unwrap();

        // Repoint: the name and mapper path stay; only updated_at moves.
        store
            .upsert_persistent_name("webserver01-disk0", "/dev/mapper/webserver01-disk0")
            .unwrap();
        let second = store
            .get_persistent_name("webserver01-disk0")
            .unwrap()
            .unwrap();
        assert_eq!(first.mapper_path, second.mapper_path);
        assert_eq!(first.created_at, second.created_at);

        assert!(store.remove_persistent_name("webserver01-disk0").unwrap());
        assert!(store
            .get_persistent_name("webserver01-disk0")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_export_rows() {
        let (_dir, store) = test_store();
        let now = Utc::now();
        let mut export = NbdExport {
            id: "exp-1".to_string(),
            volume_id: "vol-1".to_string(),
            export_name: "migration-webserver01-disk0".to_string(),
            mapper_path: "/dev/mapper/webserver01-disk0".to_string(),
            port: 10809,
            status: ExportStatus::Pending,
            config_path: "/etc/nbd/conf.d/migration-webserver01-disk0.conf".to_string(),
            created_at: now,
            updated_at: now,
        };
        store.create_export(&export).unwrap();

        // Export names are unique; a duplicate insert is rejected.
        assert!(store.create_export(&export).is_err());

        export.status = ExportStatus::Active;
        store.update_export(&export).unwrap();

        let loaded = store
            .get_export_by_name("migration-webserver01-disk0")
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, ExportStatus::Active);

        let by_volume = store.get_export_by_volume("vol-1").unwrap().unwrap();
        assert_eq!(by_volume.id, "exp-1");

        let active = store.list_exports(Some(ExportStatus::Active)).unwrap();
        assert_eq!(active.len(), 1);
    }
}
