//! Per-device verification state machine.
//!
//! The orchestrator is a single task that owns all per-device state. Watcher,
//! hasher, store and command channels feed one biased `select!`, so a
//! disconnect queued ahead of a hash completion is always seen first. Slow
//! collaborators (mounts, confirmations, alerts) run in spawned tasks and
//! report back over an internal channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::hardware::{HardwareAdapter, HardwareEvent};
use super::hasher::{HashAlgorithm, HashEvent, HashJob, HashResult, IntegrityHasher};
use super::models::{DeviceIdentity, DeviceRecord, DeviceSnapshot, TrustLevel, VerificationStatus};
use super::mount::{MountEvent, MountService, UnmountOptions};
use super::notifications::{AlertEvent, ModifiedAction, NotificationChannel};
use super::policy::ConfirmationPolicy;
use crate::config::AppConfig;
use crate::context::AppContext;
use crate::error::StoreError;
use crate::logging::SECURITY_TARGET;
use crate::store::{HashVerification, StoreEvent, WhitelistStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorCommand {
    Eject(PathBuf),
    Rehash(PathBuf),
    Mount(PathBuf),
    Unmount(PathBuf),
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationEvent {
    StatusChanged {
        device: PathBuf,
        identity: DeviceIdentity,
        status: VerificationStatus,
    },
    Modified {
        device: PathBuf,
        identity: DeviceIdentity,
        expected: String,
        actual: String,
    },
    Rejected {
        device: PathBuf,
        identity: DeviceIdentity,
    },
    /// The fresh hash used a different algorithm than the stored baseline.
    Unverifiable {
        device: PathBuf,
        identity: DeviceIdentity,
        stored_algorithm: String,
        used_algorithm: HashAlgorithm,
    },
    HashCancelled {
        device: PathBuf,
    },
    Mount(MountEvent),
}

/// Receiving ends the orchestrator consumes.
pub struct OrchestratorInputs {
    pub hardware: mpsc::Receiver<HardwareEvent>,
    pub hashes: mpsc::Receiver<HashEvent>,
    pub commands: mpsc::Receiver<OrchestratorCommand>,
    pub store_events: mpsc::UnboundedReceiver<StoreEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterHash {
    Mount,
    Eject,
    Nothing,
}

#[derive(Debug)]
enum Internal {
    NewDeviceDecision {
        device: PathBuf,
        accepted: bool,
    },
    ModifiedDecision {
        device: PathBuf,
        result: HashResult,
        accepted: bool,
    },
    Mount(MountEvent),
}

struct TrackedDevice {
    snapshot: DeviceSnapshot,
    identity: DeviceIdentity,
    status: VerificationStatus,
    job_id: Option<String>,
    after_hash: AfterHash,
}

pub struct VerificationOrchestrator {
    config: Arc<AppConfig>,
    store: Arc<WhitelistStore>,
    hasher: IntegrityHasher,
    mounter: Arc<dyn MountService>,
    policy: Arc<dyn ConfirmationPolicy>,
    notifier: Option<Arc<dyn NotificationChannel>>,
    watcher: Option<Arc<dyn HardwareAdapter>>,
    events: mpsc::UnboundedSender<VerificationEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: Option<mpsc::UnboundedReceiver<Internal>>,
    devices: HashMap<PathBuf, TrackedDevice>,
    jobs: HashMap<String, PathBuf>,
}

impl VerificationOrchestrator {
    pub fn new(
        ctx: &AppContext,
        mounter: Arc<dyn MountService>,
        policy: Arc<dyn ConfirmationPolicy>,
    ) -> (Self, mpsc::UnboundedReceiver<VerificationEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            config: ctx.config.clone(),
            store: ctx.store.clone(),
            hasher: ctx.hasher.clone(),
            mounter,
            policy,
            notifier: None,
            watcher: None,
            events,
            internal_tx,
            internal_rx: Some(internal_rx),
            devices: HashMap::new(),
            jobs: HashMap::new(),
        };
        (orchestrator, events_rx)
    }

    pub fn with_notifier(mut self, notifier: Option<Arc<dyn NotificationChannel>>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Watcher to ask for a rescan after mount state changes.
    pub fn with_watcher(mut self, watcher: Arc<dyn HardwareAdapter>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Drive the state machine until `Shutdown`, or until the command channel closes.
    pub async fn run(mut self, inputs: OrchestratorInputs) -> Result<()> {
        let OrchestratorInputs {
            mut hardware,
            mut hashes,
            mut commands,
            mut store_events,
        } = inputs;
        let mut internal = self
            .internal_rx
            .take()
            .ok_or_else(|| anyhow!("orchestrator already ran"))?;

        let mut hardware_open = true;
        let mut store_open = true;

        info!("Verification orchestrator started");
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(OrchestratorCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                event = hardware.recv(), if hardware_open => match event {
                    Some(event) => self.on_hardware(event).await?,
                    None => {
                        debug!("Hardware channel closed");
                        hardware_open = false;
                    }
                },
                Some(message) = internal.recv() => self.on_internal(message).await,
                Some(event) = hashes.recv() => self.on_hash_event(event).await,
                event = store_events.recv(), if store_open => match event {
                    Some(event) => self.on_store_event(event),
                    None => store_open = false,
                },
            }
        }

        self.hasher.cancel_all().await;
        info!(tracked = self.devices.len(), "Verification orchestrator stopped");
        Ok(())
    }

    // ----- hardware -----

    async fn on_hardware(&mut self, event: HardwareEvent) -> Result<()> {
        match event {
            HardwareEvent::Connected(snapshot) => self.on_connected(snapshot).await,
            HardwareEvent::Changed(snapshot) => self.on_changed(snapshot).await,
            HardwareEvent::Disconnected(path) => self.on_disconnected(&path).await,
            HardwareEvent::InitialScanComplete(count) => {
                info!(count, "Initial device scan complete");
            }
            HardwareEvent::MonitorError(message) => {
                error!(error = %message, "Device watcher failed");
                return Err(anyhow!("device watcher failed: {message}"));
            }
        }
        Ok(())
    }

    async fn on_connected(&mut self, snapshot: DeviceSnapshot) {
        let path = snapshot.device_node.clone();
        let identity = snapshot.identity();
        if let Some(tracked) = self.devices.get_mut(&path) {
            if tracked.identity == identity {
                tracked.snapshot = snapshot;
                return;
            }
            self.on_disconnected(&path).await;
        }

        info!(
            device = %path.display(),
            identity = %identity,
            name = %snapshot.display_name(),
            "USB device connected"
        );
        self.devices.insert(
            path.clone(),
            TrackedDevice {
                snapshot: snapshot.clone(),
                identity: identity.clone(),
                status: VerificationStatus::Unknown,
                job_id: None,
                after_hash: AfterHash::Nothing,
            },
        );

        let Some(record) = self.store.get_device(&identity) else {
            self.on_new_device(&path, snapshot);
            return;
        };

        self.log_store_result(self.store.update_device_info(&identity, snapshot.info()));
        self.log_store_result(self.store.update_last_seen(&identity));

        if self.config.auto_hash_on_connect {
            let algorithm = self.algorithm_for(&record);
            self.start_hash(&path, algorithm, AfterHash::Mount).await;
            return;
        }

        self.set_status(&path, VerificationStatus::Pending);
        if record.auto_mount || record.trust_level == TrustLevel::AlwaysAllow {
            self.request_mount(&path);
        }
    }

    fn on_new_device(&mut self, path: &Path, snapshot: DeviceSnapshot) {
        self.set_status(path, VerificationStatus::NewDevice);
        self.alert(AlertEvent::NewDevice {
            identity: snapshot.identity(),
            device_label: snapshot.display_name(),
            device_node: snapshot.device_node.clone(),
            size_bytes: snapshot.size_bytes,
        });

        if !self.config.require_confirmation_for_new {
            let _ = self.internal_tx.send(Internal::NewDeviceDecision {
                device: path.to_path_buf(),
                accepted: true,
            });
            return;
        }

        let policy = self.policy.clone();
        let internal = self.internal_tx.clone();
        let device = path.to_path_buf();
        tokio::spawn(async move {
            let accepted = policy.confirm_new_device(&snapshot).await;
            let _ = internal.send(Internal::NewDeviceDecision { device, accepted });
        });
    }

    async fn on_changed(&mut self, snapshot: DeviceSnapshot) {
        let path = snapshot.device_node.clone();
        let Some(tracked) = self.devices.get_mut(&path) else {
            self.on_connected(snapshot).await;
            return;
        };

        if tracked.identity != snapshot.identity() {
            info!(device = %path.display(), "Different device on the same node");
            self.on_disconnected(&path).await;
            self.on_connected(snapshot).await;
            return;
        }

        debug!(
            device = %path.display(),
            mount_point = ?snapshot.mount_point,
            "Device changed"
        );
        tracked.snapshot = snapshot;
    }

    async fn on_disconnected(&mut self, path: &Path) {
        let Some(tracked) = self.devices.remove(path) else {
            return;
        };
        info!(
            device = %path.display(),
            identity = %tracked.identity,
            status = %tracked.status,
            "USB device disconnected"
        );

        // The job stays in `jobs` so its Cancelled event can be reported.
        if let Some(job_id) = tracked.job_id {
            if !self.hasher.cancel_hash(&job_id).await {
                debug!(job_id = %job_id, "Job already finished at disconnect");
            }
        }
    }

    // ----- internal -----

    async fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::NewDeviceDecision { device, accepted } => {
                self.on_new_device_decision(&device, accepted).await
            }
            Internal::ModifiedDecision {
                device,
                result,
                accepted,
            } => self.on_modified_decision(&device, result, accepted),
            Internal::Mount(event) => self.on_mount_event(event),
        }
    }

    async fn on_new_device_decision(&mut self, path: &Path, accepted: bool) {
        let Some(tracked) = self.devices.get(path) else {
            debug!(device = %path.display(), "Decision for a device that is gone");
            return;
        };
        let identity = tracked.identity.clone();

        if !accepted {
            info!(device = %path.display(), identity = %identity, "New device rejected");
            self.emit(VerificationEvent::Rejected {
                device: path.to_path_buf(),
                identity,
            });
            return;
        }

        let record = DeviceRecord::new(&tracked.snapshot, self.config.default_trust());
        match self.store.add_device(record) {
            Ok(()) => info!(identity = %identity, "Device added to whitelist"),
            Err(StoreError::DuplicateDevice(_)) => {
                debug!(identity = %identity, "Device was whitelisted meanwhile")
            }
            Err(e) => {
                error!(identity = %identity, error = %e, "Failed to whitelist device");
                self.set_status(path, VerificationStatus::Error);
                return;
            }
        }

        if self.config.auto_hash_on_connect {
            let algorithm = self.config.hash_algorithm.clone();
            self.start_hash(path, algorithm, AfterHash::Mount).await;
        } else {
            self.set_status(path, VerificationStatus::Pending);
            self.request_mount(path);
        }
    }

    fn on_modified_decision(&mut self, path: &Path, result: HashResult, accepted: bool) {
        let Some(tracked) = self.devices.get(path) else {
            return;
        };
        let identity = tracked.identity.clone();

        if !accepted {
            warn!(
                target: SECURITY_TARGET,
                device = %path.display(),
                identity = %identity,
                "Modified device not accepted, leaving it unmounted"
            );
            return;
        }

        warn!(
            target: SECURITY_TARGET,
            identity = %identity,
            hash = %result.hash,
            "New baseline accepted for modified device"
        );
        self.log_store_result(self.store.update_hash(
            &identity,
            &result.hash,
            result.algorithm.as_str(),
            result.duration_ms,
        ));
        self.log_store_result(self.store.update_last_seen(&identity));
        self.set_status(path, VerificationStatus::Verified);
        self.request_mount(path);
    }

    // ----- hashing -----

    fn algorithm_for(&self, record: &DeviceRecord) -> String {
        if record.has_hash() {
            record.hash_algorithm.clone()
        } else {
            self.config.hash_algorithm.clone()
        }
    }

    async fn start_hash(&mut self, path: &Path, algorithm: String, after: AfterHash) {
        let Some(tracked) = self.devices.get_mut(path) else {
            return;
        };
        if tracked.job_id.is_some() {
            if after == AfterHash::Eject {
                tracked.after_hash = AfterHash::Eject;
            }
            debug!(device = %path.display(), "Hash already in progress");
            return;
        }

        let job = hash_job_for(&self.config, &tracked.snapshot, algorithm);
        let job_id = self.hasher.start_hash(job).await;

        tracked.job_id = Some(job_id.clone());
        tracked.after_hash = after;
        self.jobs.insert(job_id, path.to_path_buf());
        self.set_status(path, VerificationStatus::Hashing);
    }

    async fn on_hash_event(&mut self, event: HashEvent) {
        match event {
            HashEvent::Started { job_id, device_path } => {
                debug!(job_id = %job_id, device = %device_path.display(), "Hash started");
            }
            HashEvent::Progress { .. } => {}
            HashEvent::Completed(result) => {
                if let Some((path, after)) = self.finish_job(&result.job_id) {
                    self.on_hash_completed(&path, result, after);
                }
            }
            HashEvent::Failed(result) => {
                if let Some((path, after)) = self.finish_job(&result.job_id) {
                    self.on_hash_failed(&path, result, after);
                }
            }
            HashEvent::Cancelled { job_id, device_path } => {
                self.jobs.remove(&job_id);
                if let Some(tracked) = self.devices.get_mut(&device_path) {
                    if tracked.job_id.as_deref() == Some(job_id.as_str()) {
                        tracked.job_id = None;
                        tracked.after_hash = AfterHash::Nothing;
                        tracked.status = VerificationStatus::Pending;
                    }
                }
                info!(job_id = %job_id, device = %device_path.display(), "Hash cancelled");
                self.emit(VerificationEvent::HashCancelled {
                    device: device_path,
                });
            }
        }
    }

    /// Detach a finished job from its device. `None` for stale jobs.
    fn finish_job(&mut self, job_id: &str) -> Option<(PathBuf, AfterHash)> {
        let path = self.jobs.remove(job_id)?;
        let tracked = self.devices.get_mut(&path)?;
        if tracked.job_id.as_deref() != Some(job_id) {
            return None;
        }
        tracked.job_id = None;
        let after = std::mem::replace(&mut tracked.after_hash, AfterHash::Nothing);
        Some((path, after))
    }

    fn on_hash_completed(&mut self, path: &Path, result: HashResult, after: AfterHash) {
        let Some(tracked) = self.devices.get(path) else {
            return;
        };
        let identity = tracked.identity.clone();
        let snapshot = tracked.snapshot.clone();

        if let Some(stored) = self
            .store
            .get_device(&identity)
            .filter(|record| record.has_hash())
            .map(|record| record.hash_algorithm)
            .filter(|stored| HashAlgorithm::from_name(stored) != Some(result.algorithm))
        {
            self.on_algorithm_mismatch(path, &identity, &snapshot, stored, &result, after);
            return;
        }

        match self.store.verify_hash(&identity, &result.hash) {
            HashVerification::Match | HashVerification::NoBaseline => {
                info!(
                    identity = %identity,
                    algorithm = %result.algorithm,
                    duration_ms = result.duration_ms,
                    "Device verified"
                );
                self.log_store_result(self.store.update_hash(
                    &identity,
                    &result.hash,
                    result.algorithm.as_str(),
                    result.duration_ms,
                ));
                self.log_store_result(self.store.update_last_seen(&identity));
                self.set_status(path, VerificationStatus::Verified);
                self.after_hash(path, after);
            }
            HashVerification::Mismatch { expected, actual } => {
                error!(
                    target: SECURITY_TARGET,
                    device = %path.display(),
                    identity = %identity,
                    expected = %expected,
                    actual = %actual,
                    "Device contents changed since last verification"
                );
                self.store.report_mismatch(&identity, &expected, &actual);
                self.set_status(path, VerificationStatus::Modified);
                self.emit(VerificationEvent::Modified {
                    device: path.to_path_buf(),
                    identity: identity.clone(),
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
                self.alert(AlertEvent::Modified {
                    identity,
                    device_label: snapshot.display_name(),
                    expected: expected.clone(),
                    actual,
                    action: self.modified_action(after),
                });

                if after == AfterHash::Eject {
                    self.eject(path);
                } else if self.config.block_modified_devices {
                    warn!(target: SECURITY_TARGET, device = %path.display(), "Mount refused for modified device");
                } else if self.config.require_confirmation_for_modified {
                    let policy = self.policy.clone();
                    let internal = self.internal_tx.clone();
                    let device = path.to_path_buf();
                    tokio::spawn(async move {
                        let accepted = policy
                            .accept_modified(&snapshot, &expected, &result.hash)
                            .await;
                        let _ = internal.send(Internal::ModifiedDecision {
                            device,
                            result,
                            accepted,
                        });
                    });
                } else {
                    self.after_hash(path, after);
                }
            }
            HashVerification::UnknownDevice => {
                warn!(identity = %identity, "Hash finished for a device no longer whitelisted");
                self.set_status(path, VerificationStatus::Unknown);
                if after == AfterHash::Eject {
                    self.eject(path);
                }
            }
        }
    }

    /// Mirrors the branch order in the mismatch arm of `on_hash_completed`.
    fn modified_action(&self, after: AfterHash) -> ModifiedAction {
        if after == AfterHash::Eject {
            ModifiedAction::Ejecting
        } else if self.config.block_modified_devices {
            ModifiedAction::Blocked
        } else if self.config.require_confirmation_for_modified {
            ModifiedAction::AwaitingDecision
        } else if after == AfterHash::Mount {
            ModifiedAction::MountedWithoutRebaseline
        } else {
            ModifiedAction::NoAction
        }
    }

    /// Digests from different algorithms never compare equal, so the device is
    /// neither verified nor flagged as modified. The stored baseline is kept.
    fn on_algorithm_mismatch(
        &mut self,
        path: &Path,
        identity: &DeviceIdentity,
        snapshot: &DeviceSnapshot,
        stored: String,
        result: &HashResult,
        after: AfterHash,
    ) {
        warn!(
            target: SECURITY_TARGET,
            device = %path.display(),
            identity = %identity,
            stored = %stored,
            used = %result.algorithm,
            requested = %result.requested_algorithm,
            "Cannot verify device: baseline uses a different hash algorithm"
        );
        self.set_status(path, VerificationStatus::Error);
        self.emit(VerificationEvent::Unverifiable {
            device: path.to_path_buf(),
            identity: identity.clone(),
            stored_algorithm: stored.clone(),
            used_algorithm: result.algorithm,
        });
        self.alert(AlertEvent::HashFailed {
            identity: identity.clone(),
            device_label: snapshot.display_name(),
            error: format!(
                "baseline was recorded with {stored}, device was hashed with {}",
                result.algorithm
            ),
        });
        if after == AfterHash::Eject {
            self.eject(path);
        }
    }

    fn on_hash_failed(&mut self, path: &Path, result: HashResult, after: AfterHash) {
        let Some(tracked) = self.devices.get(path) else {
            return;
        };
        let error = result.error.unwrap_or_else(|| "unknown error".to_string());
        warn!(device = %path.display(), identity = %tracked.identity, error = %error, "Verification failed");
        self.alert(AlertEvent::HashFailed {
            identity: tracked.identity.clone(),
            device_label: tracked.snapshot.display_name(),
            error,
        });
        self.set_status(path, VerificationStatus::Error);
        if after == AfterHash::Eject {
            self.eject(path);
        }
    }

    fn after_hash(&mut self, path: &Path, after: AfterHash) {
        match after {
            AfterHash::Mount => self.request_mount(path),
            AfterHash::Eject => self.eject(path),
            AfterHash::Nothing => {}
        }
    }

    // ----- commands -----

    async fn on_command(&mut self, command: OrchestratorCommand) {
        debug!(?command, "Command received");
        match command {
            OrchestratorCommand::Eject(path) => {
                let Some(tracked) = self.devices.get_mut(&path) else {
                    warn!(device = %path.display(), "Eject requested for unknown device");
                    return;
                };
                if tracked.job_id.is_some() {
                    tracked.after_hash = AfterHash::Eject;
                    return;
                }
                let record = self.store.get_device(&tracked.identity);
                match record {
                    Some(record) if self.config.auto_hash_on_eject => {
                        let algorithm = self.algorithm_for(&record);
                        self.start_hash(&path, algorithm, AfterHash::Eject).await;
                    }
                    _ => self.eject(&path),
                }
            }
            OrchestratorCommand::Rehash(path) => {
                let Some(tracked) = self.devices.get(&path) else {
                    warn!(device = %path.display(), "Rehash requested for unknown device");
                    return;
                };
                match self.store.get_device(&tracked.identity) {
                    Some(record) => {
                        let algorithm = self.algorithm_for(&record);
                        self.start_hash(&path, algorithm, AfterHash::Nothing).await;
                    }
                    None => warn!(device = %path.display(), "Device is not whitelisted"),
                }
            }
            OrchestratorCommand::Mount(path) => match self.devices.get(&path).map(|t| t.status) {
                Some(VerificationStatus::Modified | VerificationStatus::NewDevice) => {
                    warn!(device = %path.display(), "Refusing to mount unverified device");
                }
                Some(_) => self.request_mount(&path),
                None => warn!(device = %path.display(), "Mount requested for unknown device"),
            },
            OrchestratorCommand::Unmount(path) => self.request_unmount(&path),
            OrchestratorCommand::Shutdown => {}
        }
    }

    // ----- mounting -----

    fn request_mount(&self, path: &Path) {
        let Some(tracked) = self.devices.get(path) else {
            return;
        };
        if tracked.snapshot.is_mounted() {
            debug!(device = %path.display(), "Already mounted");
            return;
        }

        let mut options = self.config.mount_options();
        if !tracked.snapshot.fs_type.is_empty() {
            options.filesystem = Some(tracked.snapshot.fs_type.clone());
        }
        let mounter = self.mounter.clone();
        let internal = self.internal_tx.clone();
        let path = path.to_path_buf();
        tokio::spawn(async move {
            let event = match mounter.mount(&path, &options).await {
                Ok(mount_point) => MountEvent::MountCompleted {
                    path,
                    mount_point: Some(mount_point),
                    success: true,
                    error: None,
                },
                Err(e) => MountEvent::MountCompleted {
                    path,
                    mount_point: None,
                    success: false,
                    error: Some(e.to_string()),
                },
            };
            let _ = internal.send(Internal::Mount(event));
        });
    }

    fn request_unmount(&self, path: &Path) {
        let mounter = self.mounter.clone();
        let internal = self.internal_tx.clone();
        let path = path.to_path_buf();
        tokio::spawn(async move {
            let result = mounter.unmount(&path, &UnmountOptions::default()).await;
            let _ = internal.send(Internal::Mount(MountEvent::UnmountCompleted {
                path,
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            }));
        });
    }

    /// Unmount if mounted, then power off the drive.
    fn eject(&self, path: &Path) {
        let Some(tracked) = self.devices.get(path) else {
            return;
        };
        let mounted = tracked.snapshot.is_mounted();
        let power_target = tracked.snapshot.power_target().to_path_buf();
        let mounter = self.mounter.clone();
        let internal = self.internal_tx.clone();
        let path = path.to_path_buf();
        info!(device = %path.display(), "Ejecting device");

        tokio::spawn(async move {
            if mounted {
                let result = mounter.unmount(&path, &UnmountOptions::default()).await;
                let ok = result.is_ok();
                let _ = internal.send(Internal::Mount(MountEvent::UnmountCompleted {
                    path: path.clone(),
                    success: ok,
                    error: result.err().map(|e| e.to_string()),
                }));
                if !ok {
                    return;
                }
            }
            let result = mounter.power_off(&power_target).await;
            let _ = internal.send(Internal::Mount(MountEvent::PowerOffCompleted {
                path,
                success: result.is_ok(),
                error: result.err().map(|e| e.to_string()),
            }));
        });
    }

    fn on_mount_event(&mut self, event: MountEvent) {
        match &event {
            MountEvent::MountCompleted {
                path,
                mount_point,
                success: true,
                ..
            } => {
                info!(device = %path.display(), mount_point = ?mount_point, "Device mounted");
                if let Some(tracked) = self.devices.get_mut(path) {
                    tracked.snapshot.mount_point = mount_point.clone();
                }
            }
            MountEvent::UnmountCompleted {
                path, success: true, ..
            } => {
                info!(device = %path.display(), "Device unmounted");
                if let Some(tracked) = self.devices.get_mut(path) {
                    tracked.snapshot.mount_point = None;
                }
            }
            MountEvent::PowerOffCompleted {
                path, success: true, ..
            } => {
                info!(device = %path.display(), "Device powered off, safe to remove");
            }
            MountEvent::MountCompleted { path, error, .. }
            | MountEvent::UnmountCompleted { path, error, .. }
            | MountEvent::PowerOffCompleted { path, error, .. } => {
                warn!(
                    device = %path.display(),
                    error = error.as_deref().unwrap_or("unknown error"),
                    "Disk operation failed"
                );
            }
        }

        if let Some(watcher) = &self.watcher {
            watcher.rescan();
        }
        self.emit(VerificationEvent::Mount(event));
    }

    // ----- store -----

    fn on_store_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::Error(message) => error!(error = %message, "Whitelist store error"),
            StoreEvent::HashMismatch { device_id, .. } => {
                debug!(identity = %device_id, "Mismatch recorded")
            }
            other => debug!(event = ?other, "Whitelist store event"),
        }
    }

    fn log_store_result(&self, result: Result<(), StoreError>) {
        if let Err(e) = result {
            warn!(error = %e, "Whitelist update failed");
        }
    }

    // ----- output -----

    fn set_status(&mut self, path: &Path, status: VerificationStatus) {
        let Some(tracked) = self.devices.get_mut(path) else {
            return;
        };
        if tracked.status == status {
            return;
        }
        tracked.status = status;
        let identity = tracked.identity.clone();
        debug!(device = %path.display(), status = %status, "Status changed");
        self.emit(VerificationEvent::StatusChanged {
            device: path.to_path_buf(),
            identity,
            status,
        });
    }

    fn emit(&self, event: VerificationEvent) {
        let _ = self.events.send(event);
    }

    fn alert(&self, event: AlertEvent) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(event).await {
                warn!(error = %e, "Failed to deliver alert");
            }
        });
    }
}

fn hash_job_for(config: &AppConfig, snapshot: &DeviceSnapshot, algorithm: String) -> HashJob {
    HashJob::new(&snapshot.device_node)
        .with_algorithm(algorithm)
        .with_buffer_size(config.hash_buffer_size())
        .with_mmap(config.use_memory_mapping && !snapshot.removable)
}
