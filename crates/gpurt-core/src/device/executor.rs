//! Device executors, executable sources and loaded kernels.
//!
//! The host platform stands in for a GPU: device code is a text module that
//! declares entry points (`.entry <name>`), and each declared entry point is
//! backed by a host function registered on the executor. Loading a kernel
//! takes the per-device mutex and caches the result by kernel name and
//! source fingerprint, so repeated initialization does not reload code.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use super::buffer::DeviceRegion;
use super::stream::Stream;
use crate::device_mutex::{device_mutex, DeviceKey, PlatformId};
use crate::error::{Result, RuntimeError};

/// Compiled device code: text form plus binary form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutableSource {
    /// Textual device code (PTX-like).
    pub text: String,
    /// Binary device code.
    pub binary: Vec<u8>,
}

impl ExecutableSource {
    /// Creates a source from text only.
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            binary: Vec::new(),
        }
    }

    /// Returns true if the text declares an entry point named `kernel`.
    pub fn declares(&self, kernel: &str) -> bool {
        self.text.lines().any(|line| {
            let mut parts = line.split_whitespace();
            parts.next() == Some(".entry") && parts.next() == Some(kernel)
        })
    }

    /// SHA-256 fingerprint of text and binary, as lowercase hex.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.text.as_bytes());
        hasher.update(&self.binary);
        format!("{:x}", hasher.finalize())
    }
}

/// Launch geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchDimensions {
    /// Number of blocks.
    pub blocks: u32,
    /// Threads per block.
    pub threads_per_block: u32,
    /// Dynamic shared memory in bytes.
    pub shared_memory_bytes: u32,
}

impl LaunchDimensions {
    /// Creates launch dimensions without shared memory.
    pub const fn new(blocks: u32, threads_per_block: u32) -> Self {
        Self {
            blocks,
            threads_per_block,
            shared_memory_bytes: 0,
        }
    }

    /// Total number of threads.
    pub fn total_threads(&self) -> u64 {
        self.blocks as u64 * self.threads_per_block as u64
    }
}

impl Default for LaunchDimensions {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

/// Host implementation of a device kernel.
pub type HostKernelFn = Arc<dyn Fn(&LaunchDimensions, &[DeviceRegion]) -> Result<()> + Send + Sync>;

/// A kernel loaded onto a device.
pub struct LoadedKernel {
    name: String,
    device: DeviceKey,
    function: HostKernelFn,
}

impl LoadedKernel {
    /// Kernel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Device the kernel is loaded on.
    pub fn device(&self) -> DeviceKey {
        self.device
    }

    pub(crate) fn invoke(&self, dims: &LaunchDimensions, args: &[DeviceRegion]) -> Result<()> {
        (self.function)(dims, args)
    }
}

impl fmt::Debug for LoadedKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedKernel")
            .field("name", &self.name)
            .field("device", &self.device)
            .finish()
    }
}

/// One device: owns streams, kernel implementations and the loaded-kernel
/// cache.
pub struct StreamExecutor {
    key: DeviceKey,
    name: String,
    implementations: RwLock<HashMap<String, HostKernelFn>>,
    loaded: RwLock<HashMap<(String, String), Arc<LoadedKernel>>>,
    kernel_loads: AtomicU64,
}

impl StreamExecutor {
    /// Creates a host-simulated device.
    pub fn host(ordinal: usize) -> Arc<Self> {
        Self::new(DeviceKey::new(PlatformId::HOST, ordinal))
    }

    /// Creates an executor for an arbitrary device key.
    pub fn new(key: DeviceKey) -> Arc<Self> {
        tracing::debug!(device = %key, "Created stream executor");
        Arc::new(Self {
            key,
            name: format!("{} device {}", key.platform, key.ordinal),
            implementations: RwLock::new(HashMap::new()),
            loaded: RwLock::new(HashMap::new()),
            kernel_loads: AtomicU64::new(0),
        })
    }

    /// Device identity.
    pub fn key(&self) -> DeviceKey {
        self.key
    }

    /// Device ordinal.
    pub fn ordinal(&self) -> usize {
        self.key.ordinal
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers the host implementation of a kernel entry point.
    pub fn register_kernel<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&LaunchDimensions, &[DeviceRegion]) -> Result<()> + Send + Sync + 'static,
    {
        self.implementations.write().insert(name.into(), Arc::new(f));
    }

    /// Creates a new stream on this device.
    pub fn create_stream(self: &Arc<Self>, label: impl Into<String>) -> Arc<Stream> {
        Arc::new(Stream::new(Arc::clone(self), label))
    }

    /// Loads `kernel` from `source`, serialized with other code loads on
    /// this device. Cached by name and source fingerprint.
    pub fn load_kernel(&self, kernel: &str, source: &ExecutableSource) -> Result<Arc<LoadedKernel>> {
        let cache_key = (kernel.to_string(), source.fingerprint());
        if let Some(loaded) = self.loaded.read().get(&cache_key) {
            return Ok(Arc::clone(loaded));
        }

        let _guard = device_mutex(self.key).lock();

        // Another thread may have loaded it while we waited.
        if let Some(loaded) = self.loaded.read().get(&cache_key) {
            return Ok(Arc::clone(loaded));
        }

        if !source.declares(kernel) {
            return Err(RuntimeError::KernelNotFound(format!(
                "{} is not declared in the executable source",
                kernel
            )));
        }
        let function = self
            .implementations
            .read()
            .get(kernel)
            .cloned()
            .ok_or_else(|| {
                RuntimeError::KernelNotFound(format!("{} has no implementation on {}", kernel, self.key))
            })?;

        let loaded = Arc::new(LoadedKernel {
            name: kernel.to_string(),
            device: self.key,
            function,
        });
        self.loaded.write().insert(cache_key, Arc::clone(&loaded));
        self.kernel_loads.fetch_add(1, Ordering::Relaxed);

        tracing::info!(device = %self.key, kernel = kernel, "Loaded kernel");
        Ok(loaded)
    }

    /// Number of kernels actually loaded (cache misses).
    pub fn kernel_loads(&self) -> u64 {
        self.kernel_loads.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for StreamExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamExecutor")
            .field("key", &self.key)
            .field("name", &self.name)
            .finish()
    }
}
