use crate::error::{Result, VolumeError};
use crate::store::VolumeStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Seam to the device-mapper layer. Production goes through dmsetup;
/// tests record calls against an in-memory table.
#[async_trait]
pub trait MapperBackend: Send + Sync {
    /// Create a linear mapping `name` covering all of `device_path`.
    async fn create(&self, name: &str, device_path: &str) -> Result<()>;

    /// Swap the backing device of an existing mapping without changing
    /// its mapper path. Open handles on /dev/mapper/{name} survive.
    async fn repoint(&self, name: &str, device_path: &str) -> Result<()>;

    async fn remove(&self, name: &str) -> Result<()>;

    /// The real device a mapping currently targets, if the mapping exists.
    async fn target_of(&self, name: &str) -> Result<Option<String>>;
}

/// Owns the `/dev/mapper/{vm}-disk{N}` identity layer. Every consumer of a
/// migrated disk opens the mapper path; when the underlying volume is
/// replaced the mapping is repointed and nothing upstream notices.
pub struct IdentityManager {
    store: Arc<VolumeStore>,
    backend: Arc<dyn MapperBackend>,
    // Per-name guards: concurrent ensure calls for the same name serialize,
    // different names proceed in parallel.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// `{sanitized_vm_name}-disk{slot}`. The name is a function of VM identity
/// and disk slot only, never of the volume or device currently behind it.
pub fn persistent_name(vm_name: &str, disk_slot: u32) -> String {
    let sanitized: String = vm_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    format!("{}-disk{}", sanitized.trim_matches('-'), disk_slot)
}

pub fn mapper_path(name: &str) -> String {
    format!("/dev/mapper/{}", name)
}

impl IdentityManager {
    pub fn new(store: Arc<VolumeStore>, backend: Arc<dyn MapperBackend>) -> Self {
        Self {
            store,
            backend,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Create or repoint the mapping for `name` so it targets `real_path`.
    /// Returns the stable mapper path. Idempotent: re-ensuring an
    /// up-to-date mapping is a no-op.
    pub async fn ensure(&self, name: &str, real_path: &str) -> Result<String> {
        let lock = self.name_lock(name).await;
        let _guard = lock.lock().await;

        self.resolve_conflicts(name, real_path).await?;

        match self.backend.target_of(name).await? {
            Some(current) if current == real_path => {
                debug!(name = %name, device = %real_path, "mapping already current");
            }
            Some(current) => {
                info!(
                    name = %name,
                    from = %current,
                    to = %real_path,
                    "repointing persistent mapping"
                );
                self.backend.repoint(name, real_path).await?;
            }
            None => {
                info!(name = %name, device = %real_path, "creating persistent mapping");
                self.backend.create(name, real_path).await?;
            }
        }

        let path = mapper_path(name);
        self.store.upsert_persistent_name(name, &path)?;
        Ok(path)
    }

    /// Tear the mapping down. Only called on permanent volume deletion;
    /// detach leaves identities in place for the volume's return.
    pub async fn remove(&self, name: &str) -> Result<()> {
        let lock = self.name_lock(name).await;
        let _guard = lock.lock().await;

        if self.backend.target_of(name).await?.is_some() {
            self.backend.remove(name).await?;
        }
        self.store.remove_persistent_name(name)?;
        info!(name = %name, "removed persistent mapping");
        Ok(())
    }

    /// A different name holding `real_path` means a stale mapping from a
    /// replaced volume. Repoint it to the device its own mapping row
    /// records; with no row to fall back on, refuse rather than guess.
    async fn resolve_conflicts(&self, name: &str, real_path: &str) -> Result<()> {
        for record in self.store.list_persistent_names()? {
            if record.name == name {
                continue;
            }
            let holds = self
                .backend
                .target_of(&record.name)
                .await?
                .is_some_and(|target| target == real_path);
            if !holds {
                continue;
            }

            let recorded = self
                .store
                .get_mapping_by_persistent_name(&record.name)?
                .map(|m| m.device_path);
            match recorded {
                Some(device) if device != real_path => {
                    warn!(
                        conflicting = %record.name,
                        device = %real_path,
                        repointed_to = %device,
                        "auto-resolving persistent name conflict"
                    );
                    self.backend.repoint(&record.name, &device).await?;
                }
                _ => {
                    return Err(VolumeError::IdentityConflict {
                        real_path: real_path.to_string(),
                        existing_name: record.name,
                    });
                }
            }
        }
        Ok(())
    }
}

/// dmsetup-backed linear mappings. Repoint is reload + resume so the
/// mapper node never disappears.
pub struct DmsetupBackend;

impl DmsetupBackend {
    async fn run(program: &str, args: &[&str]) -> Result<String> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| VolumeError::Mapper(format!("{} failed to run: {}", program, e)))?;
        if !output.status.success() {
            return Err(VolumeError::Mapper(format!(
                "{} {} failed: {}",
                program,
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    async fn linear_table(device_path: &str) -> Result<String> {
        let out = Self::run("blockdev", &["--getsz", device_path]).await?;
        let sectors: u64 = out
            .trim()
            .parse()
            .map_err(|_| VolumeError::Mapper(format!("bad blockdev output: {:?}", out.trim())))?;
        Ok(format!("0 {} linear {} 0", sectors, device_path))
    }

    /// dmsetup reports the target as major:minor; resolve it back to a
    /// /dev node through sysfs.
    async fn resolve_devno(devno: &str) -> Result<String> {
        let uevent = tokio::fs::read_to_string(format!("/sys/dev/block/{}/uevent", devno))
            .await
            .map_err(|e| VolumeError::Mapper(format!("no uevent for device {}: {}", devno, e)))?;
        for line in uevent.lines() {
            if let Some(devname) = line.strip_prefix("DEVNAME=") {
                return Ok(format!("/dev/{}", devname));
            }
        }
        Err(VolumeError::Mapper(format!(
            "no DEVNAME for device {}",
            devno
        )))
    }
}

#[async_trait]
impl MapperBackend for DmsetupBackend {
    async fn create(&self, name: &str, device_path: &str) -> Result<()> {
        let table = Self::linear_table(device_path).await?;
        Self::run("dmsetup", &["create", name, "--table", &table]).await?;
        Ok(())
    }

    async fn repoint(&self, name: &str, device_path: &str) -> Result<()> {
        let table = Self::linear_table(device_path).await?;
        Self::run("dmsetup", &["reload", name, "--table", &table]).await?;
        Self::run("dmsetup", &["resume", name]).await?;
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        Self::run("dmsetup", &["remove", name]).await?;
        Ok(())
    }

    async fn target_of(&self, name: &str) -> Result<Option<String>> {
        let output = tokio::process::Command::new("dmsetup")
            .args(["table", name])
            .output()
            .await
            .map_err(|e| VolumeError::Mapper(format!("dmsetup failed to run: {}", e)))?;
        if !output.status.success() {
            // dmsetup table on a missing device is the normal probe miss.
            return Ok(None);
        }
        let table = String::from_utf8_lossy(&output.stdout);
        let device = match table.split_whitespace().nth(3) {
            Some(device) => device,
            None => return Ok(None),
        };
        if device.contains(':') {
            Ok(Some(Self::resolve_devno(device).await?))
        } else {
            Ok(Some(device.to_string()))
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::models::{DeviceMapping, OperationMode};
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    /// In-memory mapper recording every call.
    pub struct MockMapper {
        pub targets: StdMutex<HashMap<String, String>>,
        pub calls: StdMutex<Vec<String>>,
    }

    impl MockMapper {
        pub fn new() -> Self {
            Self {
                targets: StdMutex::new(HashMap::new()),
                calls: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl MapperBackend for MockMapper {
        async fn create(&self, name: &str, device_path: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("create {} {}", name, device_path));
            self.targets
                .lock()
                .unwrap()
                .insert(name.to_string(), device_path.to_string());
            Ok(())
        }

        async fn repoint(&self, name: &str, device_path: &str) -> Result<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("repoint {} {}", name, device_path));
            self.targets
                .lock()
                .unwrap()
                .insert(name.to_string(), device_path.to_string());
            Ok(())
        }

        async fn remove(&self, name: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("remove {}", name));
            self.targets.lock().unwrap().remove(name);
            Ok(())
        }

        async fn target_of(&self, name: &str) -> Result<Option<String>> {
            Ok(self.targets.lock().unwrap().get(name).cloned())
        }
    }

    fn test_setup() -> (tempfile::TempDir, Arc<VolumeStore>, Arc<MockMapper>, IdentityManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VolumeStore::new(dir.path().join("volumed.db")).unwrap());
        let mapper = Arc::new(MockMapper::new());
        let manager = IdentityManager::new(Arc::clone(&store), mapper.clone() as Arc<dyn MapperBackend>);
        (dir, store, mapper, manager)
    }

    fn mapping_row(volume_id: &str, name: &str, device_path: &str) -> DeviceMapping {
        let now = Utc::now();
        DeviceMapping {
            id: format!("map-{}", volume_id),
            volume_id: volume_id.to_string(),
            volume_id_numeric: None,
            vm_id: "vm-1".to_string(),
            operation_mode: OperationMode::Primary,
            device_path: device_path.to_string(),
            provider_device_slot: None,
            provider_state: "attached".to_string(),
            os_state: "attached".to_string(),
            size_bytes: 1024,
            persistent_device_name: Some(name.to_string()),
            mapper_path: Some(mapper_path(name)),
            last_synced_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_persistent_name_derivation() {
        assert_eq!(persistent_name("WebServer01", 0), "webserver01-disk0");
        assert_eq!(persistent_name("db_prod.local", 2), "db-prod-local-disk2");
        assert_eq!(persistent_name("--edge--", 1), "edge-disk1");
    }

    #[tokio::test]
    async fn test_ensure_creates_then_repoints_same_path() {
        let (_dir, store, mapper, manager) = test_setup();

        let path = manager.ensure("web-disk0", "/dev/vdb").await.unwrap();
        assert_eq!(path, "/dev/mapper/web-disk0");

        // Failback: same name, new real device, same mapper path.
        let path = manager.ensure("web-disk0", "/dev/vdc").await.unwrap();
        assert_eq!(path, "/dev/mapper/web-disk0");

        let calls = mapper.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec!["create web-disk0 /dev/vdb", "repoint web-disk0 /dev/vdc"]
        );
        assert!(store.get_persistent_name("web-disk0").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent_when_current() {
        let (_dir, _store, mapper, manager) = test_setup();

        manager.ensure("web-disk0", "/dev/vdb").await.unwrap();
        manager.ensure("web-disk0", "/dev/vdb").await.unwrap();

        let calls = mapper.calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["create web-disk0 /dev/vdb"]);
    }

    #[tokio::test]
    async fn test_conflict_repoints_holder_to_recorded_device() {
        let (_dir, store, mapper, manager) = test_setup();

        // db-disk0 holds /dev/vdb at the mapper level, but its own mapping
        // row says its device is /dev/vdd now.
        manager.ensure("db-disk0", "/dev/vdb").await.unwrap();
        store
            .create_mapping(&mapping_row("vol-db", "db-disk0", "/dev/vdd"))
            .unwrap();

        let path = manager.ensure("web-disk0", "/dev/vdb").await.unwrap();
        assert_eq!(path, "/dev/mapper/web-disk0");

        let targets = mapper.targets.lock().unwrap().clone();
        assert_eq!(targets["db-disk0"], "/dev/vdd");
        assert_eq!(targets["web-disk0"], "/dev/vdb");
    }

    #[tokio::test]
    async fn test_unresolvable_conflict_is_an_error() {
        let (_dir, _store, _mapper, manager) = test_setup();

        // db-disk0 holds /dev/vdb with no mapping row to fall back on.
        manager.ensure("db-disk0", "/dev/vdb").await.unwrap();

        let err = manager.ensure("web-disk0", "/dev/vdb").await.unwrap_err();
        match err {
            VolumeError::IdentityConflict {
                real_path,
                existing_name,
            } => {
                assert_eq!(real_path, "/dev/vdb");
                assert_eq!(existing_name, "db-disk0");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_remove_tears_down_mapping_and_row() {
        let (_dir, store, mapper, manager) = test_setup();

        manager.ensure("web-disk0", "/dev/vdb").await.unwrap();
        manager.remove("web-disk0").await.unwrap();

        assert!(mapper.targets.lock().unwrap().is_empty());
        assert!(store.get_persistent_name("web-disk0").unwrap().is_none());

        // Removing an absent name is not an error.
        manager.remove("web-disk0").await.unwrap();
    }
}
