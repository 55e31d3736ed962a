//! udev-backed watcher for USB storage partitions.
//!
//! A dedicated thread owns the udev monitor socket and polls it together with a
//! wakeup socket used by `stop` and `rescan`. The device table is shared with
//! callers so queries never touch the thread.

use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::hardware::{DeviceTable, HardwareAdapter, HardwareEvent};
use crate::core::models::DeviceSnapshot;
use crate::core::mount::MountTable;
use crate::error::DeviceAccessError;

const POLL_TIMEOUT_MS: u16 = 500;
const STOP_GRACE: Duration = Duration::from_secs(5);
const SECTOR_SIZE: u64 = 512;

enum Control {
    Stop,
    Rescan,
}

struct Worker {
    commands: std_mpsc::Sender<Control>,
    wake: UnixStream,
    done: std_mpsc::Receiver<()>,
    thread: JoinHandle<()>,
}

impl Worker {
    fn signal(&self, control: Control) {
        let _ = self.commands.send(control);
        if let Err(e) = (&self.wake).write_all(&[1]) {
            debug!(error = %e, "Failed to wake watcher thread");
        }
    }
}

pub struct LinuxAdapter {
    table: DeviceTable,
    worker: Mutex<Option<Worker>>,
    grace: Duration,
}

impl Default for LinuxAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl LinuxAdapter {
    pub fn new() -> Self {
        Self {
            table: DeviceTable::new(),
            worker: Mutex::new(None),
            grace: STOP_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|w| !w.thread.is_finished())
    }

    /// One-shot enumeration of attached USB partitions.
    pub fn enumerate() -> Result<Vec<DeviceSnapshot>, DeviceAccessError> {
        let mounts = MountTable::load();
        let mut enumerator = udev::Enumerator::new().map_err(DeviceAccessError::Enumerate)?;
        enumerator
            .match_subsystem("block")
            .map_err(DeviceAccessError::Enumerate)?;
        enumerator
            .match_property("DEVTYPE", "partition")
            .map_err(DeviceAccessError::Enumerate)?;

        let mut devices = Vec::new();
        for device in enumerator
            .scan_devices()
            .map_err(DeviceAccessError::Enumerate)?
        {
            let props = PartitionProps::from_device(&device);
            if !props.is_usb_storage_partition() {
                continue;
            }
            match props.into_snapshot(&mounts) {
                Ok(snapshot) => devices.push(snapshot),
                Err(e) => warn!(error = %e, "Skipping device"),
            }
        }
        devices.sort_by(|a, b| a.device_node.cmp(&b.device_node));
        Ok(devices)
    }
}

impl HardwareAdapter for LinuxAdapter {
    fn start(&self, event_sender: mpsc::Sender<HardwareEvent>) {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|w| !w.thread.is_finished()) {
            debug!("Watcher already running");
            return;
        }

        let (wake_tx, wake_rx) = match UnixStream::pair() {
            Ok(pair) => pair,
            Err(e) => {
                error!(error = %e, "Failed to create watcher wakeup socket");
                let _ = event_sender.try_send(HardwareEvent::MonitorError(e.to_string()));
                return;
            }
        };
        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let (done_tx, done_rx) = std_mpsc::channel();
        let table = self.table.clone();
        let errors = event_sender.clone();

        let spawned = std::thread::Builder::new()
            .name("usb-watcher".into())
            .spawn(move || {
                watch_loop(table, event_sender, cmd_rx, wake_rx);
                let _ = done_tx.send(());
            });

        match spawned {
            Ok(thread) => {
                *worker = Some(Worker {
                    commands: cmd_tx,
                    wake: wake_tx,
                    done: done_rx,
                    thread,
                });
            }
            Err(e) => {
                error!(error = %e, "Failed to spawn watcher thread");
                let _ = errors.try_send(HardwareEvent::MonitorError(e.to_string()));
            }
        }
    }

    fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        worker.signal(Control::Stop);

        match worker.done.recv_timeout(self.grace) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                if worker.thread.join().is_err() {
                    error!("Watcher thread panicked");
                }
                info!("Device watcher stopped");
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                warn!(
                    grace_secs = self.grace.as_secs(),
                    "Watcher thread did not exit in time, detaching it"
                );
            }
        }
    }

    fn rescan(&self) {
        if let Some(worker) = self.worker.lock().as_ref() {
            worker.signal(Control::Rescan);
        }
    }

    fn connected_devices(&self) -> Vec<DeviceSnapshot> {
        self.table.snapshot()
    }

    fn get_device(&self, path: &Path) -> Option<DeviceSnapshot> {
        self.table.get(path)
    }
}

impl Drop for LinuxAdapter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_monitor() -> Result<udev::MonitorSocket, DeviceAccessError> {
    udev::MonitorBuilder::new()
        .and_then(|b| b.match_subsystem_devtype("block", "partition"))
        .and_then(|b| b.listen())
        .map_err(DeviceAccessError::MonitorInit)
}

/// Returns false once the receiver is gone.
fn publish(events: &mpsc::Sender<HardwareEvent>, batch: Vec<HardwareEvent>) -> bool {
    for event in batch {
        if events.blocking_send(event).is_err() {
            return false;
        }
    }
    true
}

fn full_scan(table: &DeviceTable) -> Vec<HardwareEvent> {
    match LinuxAdapter::enumerate() {
        Ok(devices) => table.reconcile(devices),
        Err(e) => {
            warn!(error = %e, "Device enumeration failed");
            Vec::new()
        }
    }
}

fn watch_loop(
    table: DeviceTable,
    events: mpsc::Sender<HardwareEvent>,
    commands: std_mpsc::Receiver<Control>,
    mut wake: UnixStream,
) {
    let socket = match open_monitor() {
        Ok(socket) => socket,
        Err(e) => {
            error!(error = %e, "Cannot monitor block devices");
            let _ = events.blocking_send(HardwareEvent::MonitorError(e.to_string()));
            return;
        }
    };
    if let Err(e) = wake.set_nonblocking(true) {
        warn!(error = %e, "Wakeup socket stays blocking");
    }

    table.clear();
    let mut initial = full_scan(&table);
    initial.push(HardwareEvent::InitialScanComplete(table.len()));
    info!(count = table.len(), "Initial device scan complete");
    if !publish(&events, initial) {
        return;
    }

    loop {
        let (udev_ready, wake_ready) = {
            let mut fds = [
                PollFd::new(socket.as_fd(), PollFlags::POLLIN),
                PollFd::new(wake.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
                Ok(0) => (false, false),
                Ok(_) => (readable(&fds[0]), readable(&fds[1])),
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    error!(error = %e, "poll on udev monitor failed");
                    break;
                }
            }
        };

        if wake_ready {
            drain(&mut wake);
        }

        let mut rescan = false;
        loop {
            match commands.try_recv() {
                Ok(Control::Rescan) => rescan = true,
                Ok(Control::Stop) | Err(std_mpsc::TryRecvError::Disconnected) => {
                    debug!("Watcher loop exiting");
                    return;
                }
                Err(std_mpsc::TryRecvError::Empty) => break,
            }
        }

        if udev_ready {
            let batch: Vec<HardwareEvent> = socket
                .iter()
                .filter_map(|event| classify_event(&table, &event))
                .collect();
            if !publish(&events, batch) {
                return;
            }
        }

        if rescan {
            debug!("Rescanning block devices");
            if !publish(&events, full_scan(&table)) {
                return;
            }
        }
    }
}

fn readable(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
}

fn drain(wake: &mut UnixStream) {
    let mut buf = [0u8; 64];
    loop {
        match wake.read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(_) => break,
        }
    }
}

fn classify_event(table: &DeviceTable, event: &udev::Event) -> Option<HardwareEvent> {
    let device = event.device();
    match event.event_type() {
        udev::EventType::Remove => {
            let node = device.devnode()?;
            table.apply_remove(node)
        }
        udev::EventType::Add | udev::EventType::Change => {
            let props = PartitionProps::from_device(&device);
            if !props.is_usb_storage_partition() {
                return None;
            }
            match props.into_snapshot(&MountTable::load()) {
                Ok(snapshot) if event.event_type() == udev::EventType::Add => {
                    table.apply_add(snapshot)
                }
                Ok(snapshot) => table.apply_change(snapshot),
                Err(e) => {
                    warn!(error = %e, "Skipping device");
                    None
                }
            }
        }
        _ => None,
    }
}

/// Plain-data view of the udev properties used to classify a partition.
#[derive(Debug, Clone, Default)]
struct PartitionProps {
    devnode: Option<PathBuf>,
    syspath: PathBuf,
    devtype: String,
    id_bus: String,
    usb_driver: String,
    has_usb_parent: bool,
    usb_device_class: String,
    vendor: String,
    model: String,
    serial: String,
    fs_type: String,
    label: String,
    size_sectors: Option<String>,
    parent_devnode: Option<PathBuf>,
    removable: Option<bool>,
}

fn os_to_string(value: Option<&std::ffi::OsStr>) -> String {
    value
        .map(|v| v.to_string_lossy().trim().to_string())
        .unwrap_or_default()
}

fn first_non_empty(primary: String, fallback: String) -> String {
    if primary.is_empty() { fallback } else { primary }
}

impl PartitionProps {
    fn from_device(device: &udev::Device) -> Self {
        let usb_parent = device
            .parent_with_subsystem_devtype("usb", "usb_device")
            .ok()
            .flatten();
        let disk = device
            .parent_with_subsystem_devtype("block", "disk")
            .ok()
            .flatten();

        let attr = |name: &str| {
            usb_parent
                .as_ref()
                .map(|p| os_to_string(p.attribute_value(name)))
                .unwrap_or_default()
        };
        let prop = |name: &str| os_to_string(device.property_value(name));

        Self {
            devnode: device.devnode().map(Path::to_path_buf),
            syspath: device.syspath().to_path_buf(),
            devtype: os_to_string(device.devtype()),
            id_bus: prop("ID_BUS"),
            usb_driver: prop("ID_USB_DRIVER"),
            has_usb_parent: usb_parent.is_some(),
            usb_device_class: attr("bDeviceClass"),
            vendor: first_non_empty(attr("manufacturer"), prop("ID_VENDOR")),
            model: first_non_empty(attr("product"), prop("ID_MODEL")),
            serial: first_non_empty(attr("serial"), prop("ID_SERIAL_SHORT")),
            fs_type: prop("ID_FS_TYPE"),
            label: prop("ID_FS_LABEL"),
            size_sectors: device
                .attribute_value("size")
                .map(|v| v.to_string_lossy().trim().to_string()),
            parent_devnode: disk.as_ref().and_then(|d| d.devnode().map(Path::to_path_buf)),
            removable: disk
                .as_ref()
                .and_then(|d| d.attribute_value("removable"))
                .map(|v| v.to_string_lossy().trim() == "1"),
        }
    }

    fn is_usb_storage_partition(&self) -> bool {
        if self.devtype != "partition" || self.id_bus != "usb" || !self.has_usb_parent {
            return false;
        }
        matches!(self.usb_driver.as_str(), "usb-storage" | "uas")
            || matches!(self.usb_device_class.as_str(), "" | "00" | "08")
    }

    fn into_snapshot(self, mounts: &MountTable) -> Result<DeviceSnapshot, DeviceAccessError> {
        let device_node = self.devnode.ok_or_else(|| DeviceAccessError::Malformed {
            path: self.syspath.clone(),
            reason: "no device node".into(),
        })?;
        let size_bytes = match self.size_sectors.as_deref() {
            None => 0,
            Some(raw) => raw
                .parse::<u64>()
                .map(|sectors| sectors.saturating_mul(SECTOR_SIZE))
                .map_err(|_| DeviceAccessError::Malformed {
                    path: device_node.clone(),
                    reason: format!("unparseable size {raw:?}"),
                })?,
        };

        Ok(DeviceSnapshot {
            mount_point: mounts.mount_point(&device_node),
            device_node,
            parent_device: self.parent_devnode,
            serial: self.serial,
            vendor: self.vendor,
            model: self.model,
            label: self.label,
            fs_type: self.fs_type,
            size_bytes,
            removable: self.removable.unwrap_or(true),
        })
    }
}
