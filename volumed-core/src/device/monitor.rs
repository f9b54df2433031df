use crate::error::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// A block device appearing on or leaving the host bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Appeared { path: String, size_bytes: u64 },
    Disappeared { path: String },
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Directory scanned for block device entries, `/sys/block` in
    /// production.
    pub scan_dir: PathBuf,
    pub poll_interval: Duration,
    /// Consecutive scans a change must survive before it is emitted.
    /// Filters transient bus flaps during hot-plug.
    pub debounce_scans: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            scan_dir: PathBuf::from("/sys/block"),
            poll_interval: Duration::from_millis(500),
            debounce_scans: 2,
        }
    }
}

/// Polls the sysfs block directory for virtio disks and broadcasts
/// appear/disappear events. The kernel offers no portable notification for
/// hot-plugged virtio devices, so this is a diff over periodic snapshots.
pub struct DeviceMonitor {
    config: MonitorConfig,
    tx: broadcast::Sender<DeviceEvent>,
}

struct MonitorState {
    // Devices already announced, path -> size.
    known: HashMap<String, u64>,
    // Candidate appearances, path -> (size, consecutive sightings).
    appearing: HashMap<String, (u64, u32)>,
    // Candidate disappearances, path -> consecutive misses.
    vanishing: HashMap<String, u32>,
}

impl DeviceMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { config, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }

    /// Spawn the polling loop. Existing devices at startup are absorbed
    /// into the baseline without events; only changes are announced.
    pub fn spawn(&self) -> tokio::task::JoinHandle<()> {
        let config = self.config.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let baseline = match scan_devices(&config.scan_dir).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(error = %e, "initial device scan failed, starting empty");
                    HashMap::new()
                }
            };
            info!(
                devices = baseline.len(),
                scan_dir = %config.scan_dir.display(),
                "device monitor started"
            );

            let mut state = MonitorState {
                known: baseline,
                appearing: HashMap::new(),
                vanishing: HashMap::new(),
            };
            let mut interval = tokio::time::interval(config.poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                match scan_devices(&config.scan_dir).await {
                    Ok(snapshot) => {
                        for event in step(&mut state, &snapshot, config.debounce_scans) {
                            debug!(?event, "device event");
                            // Send only fails with no subscribers; fine.
                            let _ = tx.send(event);
                        }
                    }
                    Err(e) => warn!(error = %e, "device scan failed"),
                }
            }
        })
    }
}

/// One debounced diff step against a fresh snapshot. Returns the events
/// that graduated past the debounce threshold this round.
fn step(
    state: &mut MonitorState,
    snapshot: &HashMap<String, u64>,
    debounce_scans: u32,
) -> Vec<DeviceEvent> {
    let mut events = Vec::new();

    // New or returning paths.
    for (path, size) in snapshot {
        if state.known.contains_key(path) {
            state.vanishing.remove(path);
            continue;
        }
        let entry = state.appearing.entry(path.clone()).or_insert((*size, 0));
        entry.0 = *size;
        entry.1 += 1;
        if entry.1 >= debounce_scans {
            state.appearing.remove(path);
            state.known.insert(path.clone(), *size);
            events.push(DeviceEvent::Appeared {
                path: path.clone(),
                size_bytes: *size,
            });
        }
    }

    // Paths gone from the snapshot.
    state.appearing.retain(|path, _| snapshot.contains_key(path));
    let missing: Vec<String> = state
        .known
        .keys()
        .filter(|path| !snapshot.contains_key(*path))
        .cloned()
        .collect();
    for path in missing {
        let misses = state.vanishing.entry(path.clone()).or_insert(0);
        *misses += 1;
        if *misses >= debounce_scans {
            state.vanishing.remove(&path);
            state.known.remove(&path);
            events.push(DeviceEvent::Disappeared { path });
        }
    }

    events
}

/// Scan for virtio disks: entries named `vd*`, size read from the `size`
/// file in 512-byte sectors.
async fn scan_devices(scan_dir: &std::path::Path) -> Result<HashMap<String, u64>> {
    let mut devices = HashMap::new();
    let mut entries = tokio::fs::read_dir(scan_dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("vd") {
            continue;
        }
        let size_file = entry.path().join("size");
        let sectors = match tokio::fs::read_to_string(&size_file).await {
            Ok(raw) => match raw.trim().parse::<u64>() {
                Ok(sectors) => sectors,
                Err(_) => {
                    warn!(device = %name, raw = raw.trim(), "unparseable size file");
                    continue;
                }
            },
            // Device raced away between readdir and the size read.
            Err(_) => continue,
        };
        devices.insert(format!("/dev/{}", name), sectors * 512);
    }

    Ok(devices)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn add_device(dir: &std::path::Path, name: &str, sectors: u64) {
        let dev = dir.join(name);
        tokio::fs::create_dir_all(&dev).await.unwrap();
        tokio::fs::write(dev.join("size"), format!("{}\n", sectors))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_scan_filters_and_sizes() {
        let dir = tempfile::tempdir().unwrap();
        add_device(dir.path(), "vda", 104857600).await;
        add_device(dir.path(), "vdb", 2048).await;
        add_device(dir.path(), "sda", 4096).await;
        add_device(dir.path(), "loop0", 8).await;

        let snapshot = scan_devices(dir.path()).await.unwrap();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["/dev/vda"], 104857600 * 512);
        assert_eq!(snapshot["/dev/vdb"], 2048 * 512);
    }

    #[test]
    fn test_appear_requires_consecutive_scans() {
        let mut state = MonitorState {
            known: HashMap::new(),
            appearing: HashMap::new(),
            vanishing: HashMap::new(),
        };
        let with_vdb: HashMap<String, u64> =
            [("/dev/vdb".to_string(), 1024 * 512)].into_iter().collect();
        let empty = HashMap::new();

        // One sighting, then gone: the flap is suppressed.
        assert!(step(&mut state, &with_vdb, 2).is_empty());
        assert!(step(&mut state, &empty, 2).is_empty());

        // Two consecutive sightings graduate.
        assert!(step(&mut state, &with_vdb, 2).is_empty());
        let events = step(&mut state, &with_vdb, 2);
        assert_eq!(
            events,
            vec![DeviceEvent::Appeared {
                path: "/dev/vdb".to_string(),
                size_bytes: 1024 * 512,
            }]
        );

        // Stable afterwards, no repeat events.
        assert!(step(&mut state, &with_vdb, 2).is_empty());
    }

    #[test]
    fn test_disappear_is_debounced_too() {
        let with_vdb: HashMap<String, u64> =
            [("/dev/vdb".to_string(), 1024 * 512)].into_iter().collect();
        let empty = HashMap::new();
        let mut state = MonitorState {
            known: with_vdb.clone(),
            appearing: HashMap::new(),
            vanishing: HashMap::new(),
        };

        // One miss then back: no event.
        assert!(step(&mut state, &empty, 2).is_empty());
        assert!(step(&mut state, &with_vdb, 2).is_empty());

        // Two consecutive misses announce the disappearance.
        assert!(step(&mut state, &empty, 2).is_empty());
        let events = step(&mut state, &empty, 2);
        assert_eq!(
            events,
            vec![DeviceEvent::Disappeared {
                path: "/dev/vdb".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_monitor_broadcasts_hotplug() {
        let dir = tempfile::tempdir().unwrap();
        add_device(dir.path(), "vda", 204800).await;

        let monitor = DeviceMonitor::new(MonitorConfig {
            scan_dir: dir.path().to_path_buf(),
            poll_interval: Duration::from_millis(10),
            debounce_scans: 2,
        });
        let mut rx = monitor.subscribe();
        let handle = monitor.spawn();

        // vda predates the monitor: baseline, no event. vdb is hot-plugged.
        tokio::time::sleep(Duration::from_millis(30)).await;
        add_device(dir.path(), "vdb", 104857600).await;

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            DeviceEvent::Appeared {
                path: "/dev/vdb".to_string(),
                size_bytes: 104857600 * 512,
            }
        );

        handle.abort();
    }
}
