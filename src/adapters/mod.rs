use std::sync::Arc;

use crate::core::hardware::HardwareAdapter;

#[cfg(target_os = "linux")]
pub mod linux;
pub mod simulated;
pub mod udisks;

#[cfg(target_os = "linux")]
pub use linux::LinuxAdapter;
pub use simulated::{SimulatedAdapter, Simulator};
pub use udisks::UdisksMounter;

/// The simulator handle is returned when the simulated adapter is in use.
pub fn get_adapter(simulation: bool) -> (Arc<dyn HardwareAdapter>, Option<Simulator>) {
    #[cfg(target_os = "linux")]
    if !simulation {
        return (Arc::new(LinuxAdapter::new()), None);
    }

    if !simulation {
        tracing::warn!("No hardware adapter for this platform, using the simulator");
    }
    let (adapter, controller) = SimulatedAdapter::new();
    (Arc::new(adapter), Some(controller))
}
