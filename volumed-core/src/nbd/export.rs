use super::config::NbdConfigWriter;
use crate::error::Result;
use crate::identity::mapper_path;
use crate::models::{ExportStatus, NbdExport};
use crate::store::VolumeStore;
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use ulid::Ulid;

pub const NBD_PORT: u16 = 10809;

/// Manages NBD exports for migration data movers. Export names derive
/// from the persistent device name so a mover's connection string stays
/// valid across volume replacement; the store row is the authority on
/// whether an export is live.
pub struct ExportManager {
    store: Arc<VolumeStore>,
    writer: NbdConfigWriter,
    port: u16,
}

pub fn export_name(persistent_name: &str) -> String {
    format!("migration-{}", persistent_name)
}

impl ExportManager {
    pub fn new(store: Arc<VolumeStore>, writer: NbdConfigWriter, port: u16) -> Self {
        Self {
            store,
            writer,
            port,
        }
    }

    /// Create (or re-assert) the export for a volume's persistent name.
    /// Idempotent: an existing active export with the same mapper path is
    /// returned as-is after re-asserting its stanza on disk.
    pub async fn create_export(
        &self,
        volume_id: &str,
        persistent_name: &str,
    ) -> Result<NbdExport> {
        let name = export_name(persistent_name);
        let target = mapper_path(persistent_name);

        if let Some(mut existing) = self.store.get_export_by_name(&name)? {
            if !self.writer.stanza_exists(&name).await {
                self.writer.write_stanza(&name, &target).await?;
                self.reload_best_effort().await;
            }
            if existing.status != ExportStatus::Active
                || existing.volume_id != volume_id
                || existing.mapper_path != target
            {
                existing.volume_id = volume_id.to_string();
                existing.mapper_path = target;
                existing.status = ExportStatus::Active;
                existing.updated_at = Utc::now();
                self.store.update_export(&existing)?;
            }
            return Ok(existing);
        }

        let now = Utc::now();
        let mut export = NbdExport {
            id: Ulid::new().to_string(),
            volume_id: volume_id.to_string(),
            export_name: name.clone(),
            mapper_path: target.clone(),
            port: self.port,
            status: ExportStatus::Pending,
            config_path: self.writer.stanza_path(&name).display().to_string(),
            created_at: now,
            updated_at: now,
        };
        self.store.create_export(&export)?;

        self.writer.write_stanza(&name, &target).await?;
        self.reload_best_effort().await;

        export.status = ExportStatus::Active;
        export.updated_at = Utc::now();
        self.store.update_export(&export)?;
        info!(export = %name, volume_id = %volume_id, "export active");
        Ok(export)
    }

    /// Drop the stanza and mark the row inactive. nbd-server applies
    /// SIGHUP additively, so the running process may keep serving the
    /// export until it restarts; the store still says inactive and that
    /// is what counts.
    pub async fn remove_export(&self, volume_id: &str) -> Result<Option<NbdExport>> {
        let Some(mut export) = self.store.get_export_by_volume(volume_id)? else {
            return Ok(None);
        };

        self.writer.remove_stanza(&export.export_name).await?;
        self.reload_best_effort().await;

        export.status = ExportStatus::Inactive;
        export.updated_at = Utc::now();
        self.store.update_export(&export)?;
        info!(export = %export.export_name, volume_id = %volume_id, "export inactive");
        Ok(Some(export))
    }

    pub fn get_export(&self, volume_id: &str) -> Result<Option<NbdExport>> {
        self.store.get_export_by_volume(volume_id)
    }

    pub fn list_exports(&self, status: Option<ExportStatus>) -> Result<Vec<NbdExport>> {
        self.store.list_exports(status)
    }

    async fn reload_best_effort(&self) {
        if let Err(e) = self.writer.reload().await {
            warn!(error = %e, "nbd config reload failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn manager(dir: &Path) -> (Arc<VolumeStore>, ExportManager) {
        let store = Arc::new(VolumeStore::new(dir.join("volumed.db")).unwrap());
        let writer = NbdConfigWriter::new(dir.join("conf.d"), dir.join("nbd-server.pid"));
        let manager = ExportManager::new(Arc::clone(&store), writer, NBD_PORT);
        (store, manager)
    }

    #[tokio::test]
    async fn test_export_name_tracks_identity_not_volume() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, manager) = manager(dir.path());

        let export = manager
            .create_export("vol-1", "web-disk0")
            .await
            .unwrap();
        assert_eq!(export.export_name, "migration-web-disk0");
        assert_eq!(export.mapper_path, "/dev/mapper/web-disk0");
        assert_eq!(export.port, NBD_PORT);
        assert_eq!(export.status, ExportStatus::Active);
    }

    #[tokio::test]
    async fn test_create_export_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, manager) = manager(dir.path());

        let first = manager.create_export("vol-1", "web-disk0").await.unwrap();
        let second = manager.create_export("vol-1", "web-disk0").await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.status, ExportStatus::Active);
    }

    #[tokio::test]
    async fn test_failover_reuses_export_for_new_volume() {
        let dir = tempfile::tempdir().unwrap();
        let (_store, manager) = manager(dir.path());

        let original = manager.create_export("vol-1", "web-disk0").await.unwrap();
        manager.remove_export("vol-1").await.unwrap();

        // Failover: a replacement volume behind the same identity picks
        // the export row back up under the same name.
        let replacement = manager
            .create_export("vol-2", "web-disk0")
            .await
            .unwrap();
        assert_eq!(replacement.id, original.id);
        assert_eq!(replacement.volume_id, "vol-2");
        assert_eq!(replacement.status, ExportStatus::Active);
    }

    #[tokio::test]
    async fn test_remove_marks_inactive_and_drops_stanza() {
        let dir = tempfile::tempdir().unwrap();
        let (store, manager) = manager(dir.path());

        manager.create_export("vol-1", "web-disk0").await.unwrap();
        let removed = manager.remove_export("vol-1").await.unwrap().unwrap();
        assert_eq!(removed.status, ExportStatus::Inactive);
        assert!(!dir.path().join("conf.d/migration-web-disk0.conf").exists());

        let row = store
            .get_export_by_name("migration-web-disk0")
            .unwrap()
            .unwrap();
        assert_eq!(row.status, ExportStatus::Inactive);

        // Removing a volume with no export is a no-op, not an error.
        assert!(manager.remove_export("vol-9").await.unwrap().is_none());
    }
}
