//! Process-wide per-device mutual exclusion.
//!
//! Some device-global mutations (loading device code, instantiating
//! command buffers) must not race with each other, while unrelated work on
//! the same device keeps running concurrently. Each `(platform, ordinal)`
//! pair gets one long-lived lock. A short global lock guards only the lookup
//! and insertion; entries are never removed because devices live for the
//! whole process.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Identifies a device platform (e.g. "host", "cuda").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlatformId(&'static str);

impl PlatformId {
    /// Host-simulated platform.
    pub const HOST: PlatformId = PlatformId("host");

    /// Creates a platform identifier.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Returns the platform name.
    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of one device: platform plus ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceKey {
    /// Platform of the device.
    pub platform: PlatformId,
    /// Device ordinal within the platform.
    pub ordinal: usize,
}

impl DeviceKey {
    /// Creates a device key.
    pub const fn new(platform: PlatformId, ordinal: usize) -> Self {
        Self { platform, ordinal }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.ordinal)
    }
}

/// Lazily-populated registry of per-device locks.
pub struct DeviceMutexRegistry {
    mutexes: Mutex<HashMap<DeviceKey, &'static Mutex<()>>>,
}

static GLOBAL_REGISTRY: Lazy<DeviceMutexRegistry> = Lazy::new(DeviceMutexRegistry::new);

impl DeviceMutexRegistry {
    fn new() -> Self {
        Self {
            mutexes: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the process-wide registry.
    pub fn global() -> &'static DeviceMutexRegistry {
        &GLOBAL_REGISTRY
    }

    /// Returns the lock for `key`, creating it on first use.
    pub fn get(&self, key: DeviceKey) -> &'static Mutex<()> {
        let mut mutexes = self.mutexes.lock();
        *mutexes.entry(key).or_insert_with(|| {
            tracing::trace!(device = %key, "Created device mutex");
            Box::leak(Box::new(Mutex::new(())))
        })
    }

    /// Number of devices with a registered lock.
    pub fn len(&self) -> usize {
        self.mutexes.lock().len()
    }

    /// Returns true if no lock has been created yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Returns the process-wide lock for `key`.
pub fn device_mutex(key: DeviceKey) -> &'static Mutex<()> {
    DeviceMutexRegistry::global().get(key)
}
