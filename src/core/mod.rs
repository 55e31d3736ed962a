pub mod hardware;
pub mod hasher;
pub mod models;
pub mod mount;
pub mod notifications;
pub mod orchestrator;
pub mod policy;
pub mod progress;

pub use hardware::{DeviceTable, HardwareAdapter, HardwareEvent};
pub use hasher::{HashAlgorithm, HashEvent, HashJob, HashResult, IntegrityHasher};
pub use models::{
    DeviceIdentity, DeviceInfo, DeviceRecord, DeviceSnapshot, TrustLevel, VerificationStatus,
};
pub use mount::{MountEvent, MountOptions, MountService, MountTable, UnmountOptions};
pub use orchestrator::{
    OrchestratorCommand, OrchestratorInputs, VerificationEvent, VerificationOrchestrator,
};
pub use policy::{AlwaysDeny, AutoApprove, ConfirmationPolicy, TerminalPrompt};
pub use progress::ProgressTracker;
