use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::models::DeviceSnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HardwareEvent {
    Connected(DeviceSnapshot),
    Disconnected(PathBuf),
    Changed(DeviceSnapshot),
    InitialScanComplete(usize),
    /// The watcher could not start; no further events follow.
    MonitorError(String),
}

pub trait HardwareAdapter: Send + Sync {
    /// Start watching for USB partitions. Calling it again while running is a no-op.
    fn start(&self, event_sender: mpsc::Sender<HardwareEvent>);

    /// Stop the watcher and wait (bounded) for it to exit.
    fn stop(&self);

    /// Schedule a full re-enumeration, e.g. after a mount or unmount.
    fn rescan(&self);

    fn connected_devices(&self) -> Vec<DeviceSnapshot>;

    fn get_device(&self, path: &Path) -> Option<DeviceSnapshot>;
}

/// Deduplicated view of attached partitions, keyed by device node.
///
/// Every `apply_*` call returns the event describing the transition, or `None`
/// when the table already reflected the new state.
#[derive(Clone, Default)]
pub struct DeviceTable {
    inner: Arc<RwLock<HashMap<PathBuf, DeviceSnapshot>>>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<DeviceSnapshot> {
        let mut devices: Vec<_> = self.inner.read().values().cloned().collect();
        devices.sort_by(|a, b| a.device_node.cmp(&b.device_node));
        devices
    }

    pub fn get(&self, path: &Path) -> Option<DeviceSnapshot> {
        self.inner.read().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn apply_add(&self, device: DeviceSnapshot) -> Option<HardwareEvent> {
        let mut map = self.inner.write();
        match map.get(&device.device_node) {
            Some(existing) if *existing == device => None,
            Some(_) => {
                map.insert(device.device_node.clone(), device.clone());
                Some(HardwareEvent::Changed(device))
            }
            None => {
                map.insert(device.device_node.clone(), device.clone());
                Some(HardwareEvent::Connected(device))
            }
        }
    }

    /// A change for a node we never reported is treated as an add, since the
    /// partition may only now have become classifiable.
    pub fn apply_change(&self, device: DeviceSnapshot) -> Option<HardwareEvent> {
        self.apply_add(device)
    }

    pub fn apply_remove(&self, path: &Path) -> Option<HardwareEvent> {
        self.inner
            .write()
            .remove(path)
            .map(|dev| HardwareEvent::Disconnected(dev.device_node))
    }

    /// Diff a fresh enumeration against the table.
    pub fn reconcile(&self, scanned: Vec<DeviceSnapshot>) -> Vec<HardwareEvent> {
        let present: Vec<PathBuf> = scanned.iter().map(|d| d.device_node.clone()).collect();
        let mut events: Vec<HardwareEvent> =
            scanned.into_iter().filter_map(|d| self.apply_add(d)).collect();

        let vanished: Vec<PathBuf> = self
            .inner
            .read()
            .keys()
            .filter(|path| !present.contains(path))
            .cloned()
            .collect();
        events.extend(vanished.iter().filter_map(|path| self.apply_remove(path)));
        events
    }
}
