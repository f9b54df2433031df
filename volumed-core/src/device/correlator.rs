use super::monitor::DeviceEvent;
use crate::error::{Result, VolumeError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info, warn};

/// Block device matched to an attach expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub path: String,
    pub size_bytes: u64,
}

struct Expectation {
    seq: u64,
    volume_id: String,
    vm_id: String,
    expected_size: u64,
    tx: oneshot::Sender<DeviceInfo>,
}

/// Matches provider attach completions to the block devices that surface
/// on the host. The hypervisor does not tag virtio devices with volume
/// ids, so matching is by exact size with submission order breaking ties.
///
/// The vm_id on an expectation does not narrow the match: every attach
/// this daemon submits targets the one local appliance VM, so a device
/// event cannot be attributed to a different VM than any other. It is
/// carried for log and health output only.
pub struct DeviceCorrelator {
    table: Arc<Mutex<Vec<Expectation>>>,
    seq: AtomicU64,
}

pub struct ExpectationHandle {
    seq: u64,
    volume_id: String,
    rx: Option<oneshot::Receiver<DeviceInfo>>,
    table: Arc<Mutex<Vec<Expectation>>>,
}

impl DeviceCorrelator {
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(Vec::new())),
            seq: AtomicU64::new(0),
        }
    }

    /// Consume monitor events and resolve expectations until the sender
    /// side of the channel goes away.
    pub fn spawn_dispatcher(
        &self,
        mut events: broadcast::Receiver<DeviceEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let table = Arc::clone(&self.table);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(DeviceEvent::Appeared { path, size_bytes }) => {
                        resolve(&table, &path, size_bytes);
                    }
                    Ok(DeviceEvent::Disappeared { path }) => {
                        debug!(path = %path, "device disappeared");
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "correlator lagged behind device events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Register interest in the next device of `expected_size` for an
    /// attach to `vm_id`. Must be called before the provider attach is
    /// submitted so that the registration order mirrors submission order.
    pub fn register(&self, volume_id: &str, vm_id: &str, expected_size: u64) -> ExpectationHandle {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.push(Expectation {
            seq,
            volume_id: volume_id.to_string(),
            vm_id: vm_id.to_string(),
            expected_size,
            tx,
        });
        ExpectationHandle {
            seq,
            volume_id: volume_id.to_string(),
            rx: Some(rx),
            table: Arc::clone(&self.table),
        }
    }

    /// Pending expectations, oldest first. Exposed for health reporting.
    pub fn pending(&self) -> Vec<(String, u64)> {
        let table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table
            .iter()
            .map(|e| (e.volume_id.clone(), e.expected_size))
            .collect()
    }
}

impl Default for DeviceCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpectationHandle {
    /// Withdraw the expectation without waiting. Used when the provider
    /// attach fails before any device is due.
    pub fn cancel(self) {}

    /// Wait for the matching device, or time out with the expectation
    /// withdrawn so a late device cannot satisfy a dead waiter.
    pub async fn await_device(mut self, timeout: Duration) -> Result<DeviceInfo> {
        let rx = match self.rx.take() {
            Some(rx) => rx,
            None => {
                return Err(VolumeError::Internal(
                    "expectation already awaited".to_string(),
                ))
            }
        };
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(info)) => Ok(info),
            // Sender dropped without a match; treated as timeout.
            Ok(Err(_)) | Err(_) => Err(VolumeError::CorrelationTimeout {
                volume_id: self.volume_id.clone(),
                timeout_secs: timeout.as_secs(),
            }),
        }
    }
}

// An expectation must not outlive its waiter. Whether the attach timed
// out, was cancelled, or the whole stage task was dropped, a leaked
// entry would consume the device owed to the next same-size attach.
impl Drop for ExpectationHandle {
    fn drop(&mut self) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.retain(|e| e.seq != self.seq);
    }
}

fn resolve(table: &Mutex<Vec<Expectation>>, path: &str, size_bytes: u64) {
    let mut table = table.lock().unwrap_or_else(|e| e.into_inner());

    let mut candidates: Vec<usize> = table
        .iter()
        .enumerate()
        .filter(|(_, e)| e.expected_size == size_bytes)
        .map(|(i, _)| i)
        .collect();

    if candidates.is_empty() {
        // Device not solicited by any pending attach. Operator-created
        // disks land here; record and move on.
        info!(path = %path, size_bytes, "ignoring unsolicited device");
        return;
    }

    candidates.sort_by_key(|&i| table[i].seq);
    if candidates.len() > 1 {
        warn!(
            path = %path,
            size_bytes,
            candidates = candidates.len(),
            winner = %table[candidates[0]].volume_id,
            vm_id = %table[candidates[0]].vm_id,
            "multiple pending attaches match this size, using submission order"
        );
    }

    let expectation = table.remove(candidates[0]);
    debug!(
        path = %path,
        volume_id = %expectation.volume_id,
        "correlated device"
    );
    // Receiver dropped means the waiter already timed out.
    let _ = expectation.tx.send(DeviceInfo {
        path: path.to_string(),
        size_bytes,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn channel() -> (broadcast::Sender<DeviceEvent>, broadcast::Receiver<DeviceEvent>) {
        broadcast::channel(16)
    }

    #[tokio::test]
    async fn test_exact_size_match() {
        let correlator = DeviceCorrelator::new();
        let (tx, rx) = channel();
        let dispatcher = correlator.spawn_dispatcher(rx);

        let small = correlator.register("vol-small", "vm-1", 10 * GIB);
        let large = correlator.register("vol-large", "vm-1", 50 * GIB);

        // The large disk appears first; it must not satisfy the small
        // expectation even though that one registered earlier.
        tx.send(DeviceEvent::Appeared {
            path: "/dev/vdc".to_string(),
            size_bytes: 50 * GIB,
        })
        .unwrap();
        tx.send(DeviceEvent::Appeared {
            path: "/dev/vdb".to_string(),
            size_bytes: 10 * GIB,
        })
        .unwrap();

        let matched = large.await_device(Duration::from_secs(2)).await.unwrap();
        assert_eq!(matched.path, "/dev/vdc");
        let matched = small.await_device(Duration::from_secs(2)).await.unwrap();
        assert_eq!(matched.path, "/dev/vdb");

        dispatcher.abort();
    }

    #[tokio::test]
    async fn test_equal_sizes_resolve_in_submission_order() {
        let correlator = DeviceCorrelator::new();
        let (tx, rx) = channel();
        let dispatcher = correlator.spawn_dispatcher(rx);

        let first = correlator.register("vol-first", "vm-1", 20 * GIB);
        let second = correlator.register("vol-second", "vm-1", 20 * GIB);

        tx.send(DeviceEvent::Appeared {
            path: "/dev/vdb".to_string(),
            size_bytes: 20 * GIB,
        })
        .unwrap();
        tx.send(DeviceEvent::Appeared {
            path: "/dev/vdc".to_string(),
            size_bytes: 20 * GIB,
        })
        .unwrap();

        let matched = first.await_device(Duration::from_secs(2)).await.unwrap();
        assert_eq!(matched.path, "/dev/vdb");
        let matched = second.await_device(Duration::from_secs(2)).await.unwrap();
        assert_eq!(matched.path, "/dev/vdc");

        dispatcher.abort();
    }

    #[tokio::test]
    async fn test_unsolicited_device_is_ignored() {
        let correlator = DeviceCorrelator::new();
        let (tx, rx) = channel();
        let dispatcher = correlator.spawn_dispatcher(rx);

        let handle = correlator.register("vol-1", "vm-1", 10 * GIB);

        // Wrong size: nothing should match, the expectation stays pending.
        tx.send(DeviceEvent::Appeared {
            path: "/dev/vdz".to_string(),
            size_bytes: 99 * GIB,
        })
        .unwrap();

        let err = handle.await_device(Duration::from_millis(100)).await;
        assert!(matches!(
            err,
            Err(VolumeError::CorrelationTimeout { .. })
        ));

        dispatcher.abort();
    }

    #[tokio::test]
    async fn test_cancel_withdraws_expectation() {
        let correlator = DeviceCorrelator::new();
        let (tx, rx) = channel();
        let dispatcher = correlator.spawn_dispatcher(rx);

        let abandoned = correlator.register("vol-abandoned", "vm-1", 20 * GIB);
        abandoned.cancel();
        assert!(correlator.pending().is_empty());

        // The next same-size attach gets the device the cancelled waiter
        // would otherwise have consumed.
        let fresh = correlator.register("vol-fresh", "vm-1", 20 * GIB);
        tx.send(DeviceEvent::Appeared {
            path: "/dev/vdb".to_string(),
            size_bytes: 20 * GIB,
        })
        .unwrap();

        let matched = fresh.await_device(Duration::from_secs(2)).await.unwrap();
        assert_eq!(matched.path, "/dev/vdb");

        dispatcher.abort();
    }

    #[tokio::test]
    async fn test_timeout_withdraws_expectation() {
        let correlator = DeviceCorrelator::new();
        let (tx, rx) = channel();
        let dispatcher = correlator.spawn_dispatcher(rx);

        let stale = correlator.register("vol-stale", "vm-1", 20 * GIB);
        let err = stale.await_device(Duration::from_millis(20)).await;
        assert!(matches!(err, Err(VolumeError::CorrelationTimeout { .. })));
        assert!(correlator.pending().is_empty());

        // A later same-size attach gets the device, not the dead waiter.
        let fresh = correlator.register("vol-fresh", "vm-1", 20 * GIB);
        tx.send(DeviceEvent::Appeared {
            path: "/dev/vdb".to_string(),
            size_bytes: 20 * GIB,
        })
        .unwrap();

        let matched = fresh.await_device(Duration::from_secs(2)).await.unwrap();
        assert_eq!(matched.path, "/dev/vdb");

        dispatcher.abort();
    }
}
