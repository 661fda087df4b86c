//! Ordered device work queues and completion events.
//!
//! The host device executes each operation at enqueue time, which preserves
//! the in-order guarantee of a stream. Every operation is also appended to
//! the stream's op log so callers can inspect what was issued where.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::buffer::DeviceRegion;
use super::executor::{LaunchDimensions, LoadedKernel, StreamExecutor};
use crate::device_mutex::DeviceKey;
use crate::error::{Result, RuntimeError};

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(1);

/// An operation issued onto a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOp {
    /// Kernel launch.
    Launch {
        /// Kernel name.
        kernel: String,
    },
    /// Device-to-device copy.
    MemcpyD2D {
        /// Bytes copied.
        bytes: usize,
    },
    /// Host-to-device copy.
    MemcpyH2D {
        /// Bytes copied.
        bytes: usize,
    },
    /// Device-to-host copy.
    MemcpyD2H {
        /// Bytes copied.
        bytes: usize,
    },
    /// 32-bit pattern fill.
    Memset32 {
        /// Bytes filled.
        bytes: usize,
        /// Fill pattern.
        value: u32,
    },
    /// Zero fill.
    Memzero {
        /// Bytes zeroed.
        bytes: usize,
    },
    /// Vendor library routine.
    Library {
        /// Routine name.
        routine: &'static str,
    },
    /// Collective or point-to-point communication.
    Communication {
        /// Operation name.
        op: &'static str,
    },
    /// Event recorded on this stream.
    RecordEvent {
        /// Event id.
        event: u64,
    },
    /// Stream waits for an event.
    WaitEvent {
        /// Event id.
        event: u64,
    },
}

/// Completion handle that joins work across streams.
pub struct Event {
    id: u64,
    recorded_on: Mutex<Option<u64>>,
}

impl Event {
    /// Creates an unrecorded event.
    pub fn new() -> Self {
        Self {
            id: NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed),
            recorded_on: Mutex::new(None),
        }
    }

    /// Event id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns true once the event has been recorded on a stream.
    pub fn is_recorded(&self) -> bool {
        self.recorded_on.lock().is_some()
    }

    /// Stream the event was recorded on.
    pub fn recorded_on(&self) -> Option<u64> {
        *self.recorded_on.lock()
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("id", &self.id)
            .field("recorded_on", &self.recorded_on())
            .finish()
    }
}

/// An ordered device work queue.
pub struct Stream {
    id: u64,
    label: String,
    executor: Arc<StreamExecutor>,
    ops: Mutex<Vec<StreamOp>>,
}

impl Stream {
    pub(crate) fn new(executor: Arc<StreamExecutor>, label: impl Into<String>) -> Self {
        Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            executor,
            ops: Mutex::new(Vec::new()),
        }
    }

    /// Stream id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stream label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Executor owning this stream.
    pub fn executor(&self) -> &Arc<StreamExecutor> {
        &self.executor
    }

    /// Device this stream belongs to.
    pub fn device(&self) -> DeviceKey {
        self.executor.key()
    }

    /// Snapshot of every operation issued so far.
    pub fn ops(&self) -> Vec<StreamOp> {
        self.ops.lock().clone()
    }

    /// Number of operations issued so far.
    pub fn op_count(&self) -> usize {
        self.ops.lock().len()
    }

    fn push(&self, op: StreamOp) {
        tracing::trace!(stream = self.id, label = %self.label, op = ?op, "Stream op");
        self.ops.lock().push(op);
    }

    /// Copies `src` into `dst`. Sizes must match.
    pub fn memcpy_d2d(&self, dst: &DeviceRegion, src: &DeviceRegion) -> Result<()> {
        if dst.size() != src.size() {
            return Err(RuntimeError::InvalidArgument(format!(
                "memcpy size mismatch: dst {} bytes, src {} bytes",
                dst.size(),
                src.size()
            )));
        }
        dst.write(&src.read())?;
        self.push(StreamOp::MemcpyD2D { bytes: src.size() });
        Ok(())
    }

    /// Copies host bytes into `dst`.
    pub fn memcpy_h2d(&self, dst: &DeviceRegion, src: &[u8]) -> Result<()> {
        dst.write(src)?;
        self.push(StreamOp::MemcpyH2D { bytes: src.len() });
        Ok(())
    }

    /// Copies `src` out to host memory.
    pub fn memcpy_d2h(&self, src: &DeviceRegion) -> Result<Vec<u8>> {
        let bytes = src.read();
        self.push(StreamOp::MemcpyD2H { bytes: bytes.len() });
        Ok(bytes)
    }

    /// Fills `dst` with a repeated 32-bit pattern.
    pub fn memset32(&self, dst: &DeviceRegion, value: u32) -> Result<()> {
        if dst.size() % 4 != 0 {
            return Err(RuntimeError::InvalidArgument(format!(
                "memset32 on {} bytes, not a multiple of 4",
                dst.size()
            )));
        }
        let pattern = vec![value; dst.size() / 4];
        dst.write_from(&pattern)?;
        self.push(StreamOp::Memset32 {
            bytes: dst.size(),
            value,
        });
        Ok(())
    }

    /// Zeroes `dst`.
    pub fn memzero(&self, dst: &DeviceRegion) -> Result<()> {
        dst.fill(0);
        self.push(StreamOp::Memzero { bytes: dst.size() });
        Ok(())
    }

    /// Launches a loaded kernel.
    pub fn launch(
        &self,
        kernel: &LoadedKernel,
        dims: &LaunchDimensions,
        args: &[DeviceRegion],
    ) -> Result<()> {
        if kernel.device() != self.device() {
            return Err(RuntimeError::InvalidArgument(format!(
                "kernel {} loaded on {} launched on {}",
                kernel.name(),
                kernel.device(),
                self.device()
            )));
        }
        kernel.invoke(dims, args)?;
        self.push(StreamOp::Launch {
            kernel: kernel.name().to_string(),
        });
        Ok(())
    }

    /// Runs a library routine in stream order.
    pub fn run_library<F>(&self, routine: &'static str, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        f()?;
        self.push(StreamOp::Library { routine });
        Ok(())
    }

    /// Runs a communication operation in stream order.
    pub fn run_communication<F>(&self, op: &'static str, f: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        f()?;
        self.push(StreamOp::Communication { op });
        Ok(())
    }

    /// Records `event` after all previously issued work.
    pub fn record_event(&self, event: &Event) {
        *event.recorded_on.lock() = Some(self.id);
        self.push(StreamOp::RecordEvent { event: event.id });
    }

    /// Makes subsequent work wait for `event`. Waiting on an event that was
    /// never recorded would block forever on a device, so it is an error.
    pub fn wait_for(&self, event: &Event) -> Result<()> {
        if !event.is_recorded() {
            return Err(RuntimeError::EventNotRecorded(format!(
                "stream {} waits on event {} which was never recorded",
                self.label, event.id
            )));
        }
        self.push(StreamOp::WaitEvent { event: event.id });
        Ok(())
    }

    /// Blocks until all issued work is complete.
    pub fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("device", &self.device())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BufferSlice, BufferTable};

    #[test]
    fn test_ops_recorded_in_order() {
        let executor = StreamExecutor::host(0);
        let stream = executor.create_stream("main");
        let table = BufferTable::with_sizes(&[16, 16]);
        let a = table.whole(0).unwrap();
        let b = table.whole(1).unwrap();

        stream.memset32(&a, 7).unwrap();
        stream.memcpy_d2d(&b, &a).unwrap();
        stream.memzero(&a).unwrap();

        assert_eq!(
            stream.ops(),
            vec![
                StreamOp::Memset32 { bytes: 16, value: 7 },
                StreamOp::MemcpyD2D { bytes: 16 },
                StreamOp::Memzero { bytes: 16 },
            ]
        );
        assert_eq!(b.read_as::<u32>(), vec![7; 4]);
        assert_eq!(a.read_as::<u32>(), vec![0; 4]);
    }

    #[test]
    fn test_memcpy_size_mismatch() {
        let executor = StreamExecutor::host(0);
        let stream = executor.create_stream("main");
        let table = BufferTable::with_sizes(&[16]);
        let a = table.resolve(&BufferSlice::new(0, 0, 8)).unwrap();
        let b = table.resolve(&BufferSlice::new(0, 8, 4)).unwrap();
        assert!(stream.memcpy_d2d(&b, &a).is_err());
        assert_eq!(stream.op_count(), 0);
    }

    #[test]
    fn test_wait_on_unrecorded_event_fails() {
        let executor = StreamExecutor::host(0);
        let main = executor.create_stream("main");
        let side = executor.create_stream("side");
        let event = Event::new();

        assert!(matches!(
            main.wait_for(&event),
            Err(RuntimeError::EventNotRecorded(_))
        ));

        side.record_event(&event);
        assert_eq!(event.recorded_on(), Some(side.id()));
        main.wait_for(&event).unwrap();
        assert_eq!(main.ops(), vec![StreamOp::WaitEvent { event: event.id() }]);
    }
}
