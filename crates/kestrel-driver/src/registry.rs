//! Device registry
//!
//! An explicit registry of live devices, passed by reference to whoever
//! needs lookups. The most-recently-registered accessor exists for test
//! harnesses that bring up a device in one place and poke it from another;
//! production code should thread the `Arc<Device>` itself.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::device::Device;

/// Registry of live [`Device`]s. Holds weak references only — dropping the
/// last real handle tears the device down regardless of registration.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: Mutex<Vec<Weak<Device>>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device. Call once, right after bring-up.
    pub fn register(&self, device: &Arc<Device>) {
        let mut devices = self.devices.lock();
        devices.retain(|weak| weak.strong_count() > 0);
        devices.push(Arc::downgrade(device));
    }

    /// Every registered device still alive, oldest first.
    #[must_use]
    pub fn devices(&self) -> Vec<Arc<Device>> {
        self.devices
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// The most recently registered device still alive. Test-harness
    /// lookup; prefer passing the handle explicitly.
    #[must_use]
    pub fn most_recent(&self) -> Option<Arc<Device>> {
        self.devices
            .lock()
            .iter()
            .rev()
            .find_map(Weak::upgrade)
    }
}
