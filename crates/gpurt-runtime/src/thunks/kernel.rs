//! Kernel launches.

use std::collections::HashMap;
use std::sync::Arc;

use gpurt_core::device::{BufferSlice, LaunchDimensions, LoadedKernel};
use gpurt_core::error::{Result, RuntimeError};
use gpurt_core::DeviceKey;
use parking_lot::Mutex;

use crate::params::{ExecuteParams, InitializeParams};

/// Launches a kernel from the executable source over a list of buffer
/// arguments.
///
/// The kernel is loaded during initialization, once per device.
#[derive(Debug)]
pub struct KernelThunk {
    kernel_name: String,
    args: Vec<BufferSlice>,
    dims: LaunchDimensions,
    loaded: Mutex<HashMap<DeviceKey, Arc<LoadedKernel>>>,
}

impl KernelThunk {
    /// Creates a launch of `kernel_name`.
    pub fn new(kernel_name: impl Into<String>, args: Vec<BufferSlice>, dims: LaunchDimensions) -> Self {
        Self {
            kernel_name: kernel_name.into(),
            args,
            dims,
            loaded: Mutex::new(HashMap::new()),
        }
    }

    /// Kernel entry point name.
    pub fn kernel_name(&self) -> &str {
        &self.kernel_name
    }

    /// Buffer arguments in launch order.
    pub fn args(&self) -> &[BufferSlice] {
        &self.args
    }

    /// Launch geometry.
    pub fn dims(&self) -> LaunchDimensions {
        self.dims
    }

    pub(crate) fn initialize(&self, params: &InitializeParams<'_>) -> Result<()> {
        let device = params.executor.key();
        if self.loaded.lock().contains_key(&device) {
            return Ok(());
        }
        let kernel = params.executor.load_kernel(&self.kernel_name, params.src)?;
        tracing::info!(
            device = %device,
            kernel = %self.kernel_name,
            threads = self.dims.total_threads(),
            "Initialized kernel thunk"
        );
        self.loaded.lock().insert(device, kernel);
        Ok(())
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let device = params.stream.device();
        let kernel = self.loaded.lock().get(&device).cloned().ok_or_else(|| {
            RuntimeError::Internal(format!("kernel {} is not loaded on {}", self.kernel_name, device))
        })?;
        let args = self
            .args
            .iter()
            .map(|slice| params.region(slice))
            .collect::<Result<Vec<_>>>()?;
        params.stream.launch(&kernel, &self.dims, &args)
    }
}
