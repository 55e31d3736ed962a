use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::core::hardware::{DeviceTable, HardwareAdapter, HardwareEvent};
use crate::core::models::DeviceSnapshot;

enum SimulatedCommand {
    InjectAdd(DeviceSnapshot),
    InjectChange(DeviceSnapshot),
    InjectRemove(PathBuf),
    Rescan,
}

/// Drives a [`SimulatedAdapter`] from tests or the interactive simulator.
#[derive(Clone)]
pub struct Simulator {
    tx: mpsc::UnboundedSender<SimulatedCommand>,
}

impl Simulator {
    /// Plug in a device backed by `path`, which may be any readable file.
    pub fn add_device(&self, serial: &str, path: impl Into<PathBuf>) -> DeviceSnapshot {
        let device_node = path.into();
        let size_bytes = std::fs::metadata(&device_node)
            .map(|m| m.len())
            .unwrap_or(0);
        let device = DeviceSnapshot {
            device_node,
            serial: serial.to_string(),
            vendor: "Simulated".to_string(),
            model: "Flash Drive".to_string(),
            label: format!("SIM_{serial}"),
            fs_type: "vfat".to_string(),
            size_bytes,
            removable: true,
            ..Default::default()
        };
        self.add_snapshot(device.clone());
        device
    }

    pub fn add_snapshot(&self, device: DeviceSnapshot) {
        let _ = self.tx.send(SimulatedCommand::InjectAdd(device));
    }

    pub fn change_device(&self, device: DeviceSnapshot) {
        let _ = self.tx.send(SimulatedCommand::InjectChange(device));
    }

    pub fn remove_device(&self, path: impl Into<PathBuf>) {
        let _ = self.tx.send(SimulatedCommand::InjectRemove(path.into()));
    }
}

pub struct SimulatedAdapter {
    table: DeviceTable,
    tx: mpsc::UnboundedSender<SimulatedCommand>,
    // Taken by the bridge task on the first `start()`.
    cmd_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<SimulatedCommand>>>>,
    bridge: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SimulatedAdapter {
    pub fn new() -> (Self, Simulator) {
        let (tx, rx) = mpsc::unbounded_channel();

        (
            Self {
                table: DeviceTable::new(),
                tx: tx.clone(),
                cmd_rx: Arc::new(Mutex::new(Some(rx))),
                bridge: Mutex::new(None),
            },
            Simulator { tx },
        )
    }
}

impl HardwareAdapter for SimulatedAdapter {
    fn start(&self, event_sender: mpsc::Sender<HardwareEvent>) {
        let Some(mut rx) = self.cmd_rx.lock().take() else {
            debug!("Simulated adapter already started");
            return;
        };

        info!("Simulated adapter listening for controller commands");
        let table = self.table.clone();

        let handle = tokio::spawn(async move {
            let initial = table.len();
            if event_sender
                .send(HardwareEvent::InitialScanComplete(initial))
                .await
                .is_err()
            {
                return;
            }

            while let Some(cmd) = rx.recv().await {
                let events = match cmd {
                    SimulatedCommand::InjectAdd(device) => table.apply_add(device).into_iter().collect(),
                    SimulatedCommand::InjectChange(device) => {
                        table.apply_change(device).into_iter().collect()
                    }
                    SimulatedCommand::InjectRemove(path) => {
                        table.apply_remove(&path).into_iter().collect()
                    }
                    SimulatedCommand::Rescan => table.reconcile(table.snapshot()),
                };

                for event in events {
                    if event_sender.send(event).await.is_err() {
                        return;
                    }
                }
            }
        });
        *self.bridge.lock() = Some(handle);
    }

    fn stop(&self) {
        if let Some(handle) = self.bridge.lock().take() {
            handle.abort();
            info!("Simulated adapter stopped");
        }
    }

    fn rescan(&self) {
        let _ = self.tx.send(SimulatedCommand::Rescan);
    }

    fn connected_devices(&self) -> Vec<DeviceSnapshot> {
        self.table.snapshot()
    }

    fn get_device(&self, path: &Path) -> Option<DeviceSnapshot> {
        self.table.get(path)
    }
}
