//! Asynchronous start/done pairs.
//!
//! An [`AsyncOperation`] is created as a unit: it owns the start thunk, the
//! done thunk and the [`AsyncHandle`] they share. There is no other way to
//! construct either half, so every start has exactly one matching done.
//!
//! ```text
//!   main stream   ──[record ready]────────────────────[wait done]──►
//!                        │                                 ▲
//!   async stream  ───────[wait ready][collective][record done]──────►
//!                 start thunk                       done thunk
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use gpurt_core::device::{BufferSlice, Event};
use gpurt_core::error::{Result, RuntimeError};
use gpurt_core::DeviceKey;
use parking_lot::Mutex;

use crate::kind::ThunkKind;
use crate::params::{ExecuteParams, InitializeParams, ThunkInfo};
use crate::thunk::{Thunk, ThunkOp};
use crate::thunks::collective::{require_context, CollectiveOp};
use crate::thunks::host::{HostRecvStart, HostSendStart};

/// Completion handle shared by the two halves of an async pair.
///
/// Holds at most one outstanding completion event per device.
pub struct AsyncHandle {
    name: String,
    pending: Mutex<HashMap<DeviceKey, Arc<Event>>>,
}

impl AsyncHandle {
    fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Name of the operation, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if a start on `device` has not been consumed by its done.
    pub fn is_pending(&self, device: DeviceKey) -> bool {
        self.pending.lock().contains_key(&device)
    }

    /// Registers a new outstanding start on `device` and returns the event
    /// its done will wait on.
    pub(crate) fn begin(&self, device: DeviceKey) -> Result<Arc<Event>> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&device) {
            return Err(RuntimeError::AsyncPairing(format!(
                "{} started again on {} before its done ran",
                self.name, device
            )));
        }
        let event = Arc::new(Event::new());
        pending.insert(device, Arc::clone(&event));
        Ok(event)
    }

    /// Drops an outstanding start whose work failed to issue.
    pub(crate) fn abandon(&self, device: DeviceKey) {
        self.pending.lock().remove(&device);
    }

    /// Consumes the outstanding start on `device`.
    pub(crate) fn finish(&self, device: DeviceKey) -> Result<Arc<Event>> {
        self.pending.lock().remove(&device).ok_or_else(|| {
            RuntimeError::AsyncPairing(format!(
                "{} done ran on {} without a pending start",
                self.name, device
            ))
        })
    }
}

impl fmt::Debug for AsyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("name", &self.name)
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}

/// Work issued by the start half of an async pair.
#[derive(Debug)]
pub enum AsyncWork {
    /// A collective on an async stream.
    Collective(CollectiveOp),
    /// A send to the host.
    HostSend(HostSendStart),
    /// A receive from the host.
    HostRecv(HostRecvStart),
}

impl AsyncWork {
    /// Kind of the start thunk.
    pub fn start_kind(&self) -> ThunkKind {
        match self {
            AsyncWork::Collective(op) => op.start_kind(),
            AsyncWork::HostSend(_) => ThunkKind::Send,
            AsyncWork::HostRecv(_) => ThunkKind::Recv,
        }
    }

    /// Kind of the done thunk.
    pub fn done_kind(&self) -> ThunkKind {
        match self {
            AsyncWork::Collective(op) => op.done_kind(),
            AsyncWork::HostSend(_) => ThunkKind::SendDone,
            AsyncWork::HostRecv(_) => ThunkKind::RecvDone,
        }
    }
}

/// Start half of an async pair.
#[derive(Debug)]
pub struct AsyncStartThunk {
    pub(crate) work: AsyncWork,
    pub(crate) handle: Arc<AsyncHandle>,
}

impl AsyncStartThunk {
    /// The issued work.
    pub fn work(&self) -> &AsyncWork {
        &self.work
    }

    /// The shared handle.
    pub fn handle(&self) -> &Arc<AsyncHandle> {
        &self.handle
    }

    pub(crate) fn initialize(&self, params: &InitializeParams<'_>) -> Result<()> {
        match &self.work {
            AsyncWork::Collective(_) => require_context(params).map(|_| ()),
            AsyncWork::HostSend(_) | AsyncWork::HostRecv(_) => Ok(()),
        }
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let device = params.stream.device();
        let done = self.handle.begin(device)?;
        if let Err(err) = self.issue(params, &done) {
            self.handle.abandon(device);
            return Err(err);
        }
        tracing::trace!(
            op = %self.work.start_kind(),
            name = %self.handle.name,
            device = %device,
            "Issued async start"
        );
        Ok(())
    }

    fn issue(&self, params: &ExecuteParams<'_>, done: &Event) -> Result<()> {
        let stream = match &self.work {
            AsyncWork::Collective(_) => params.async_stream(0),
            AsyncWork::HostSend(_) => params.d2h_stream(),
            AsyncWork::HostRecv(_) => params.h2d_stream(),
        };

        // Work issued before the start must be visible to the async stream.
        let ready = Event::new();
        params.stream.record_event(&ready);
        stream.wait_for(&ready)?;

        match &self.work {
            AsyncWork::Collective(op) => op.run(params, stream)?,
            AsyncWork::HostSend(send) => send.run(params, stream)?,
            AsyncWork::HostRecv(recv) => recv.run(params, stream)?,
        }
        stream.record_event(done);
        Ok(())
    }
}

/// Done half of an async pair.
#[derive(Debug)]
pub struct AsyncDoneThunk {
    pub(crate) kind: ThunkKind,
    pub(crate) handle: Arc<AsyncHandle>,
}

impl AsyncDoneThunk {
    /// The shared handle.
    pub fn handle(&self) -> &Arc<AsyncHandle> {
        &self.handle
    }

    /// Makes the main stream wait for the paired start's work.
    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let done = self.handle.finish(params.stream.device())?;
        params.stream.wait_for(&done)
    }
}

/// A start/done pair sharing one completion handle.
#[derive(Debug)]
pub struct AsyncOperation {
    start: Thunk,
    done: Thunk,
    handle: Arc<AsyncHandle>,
}

impl AsyncOperation {
    /// Pairs `work` with a done, naming the thunks after `start_info` and
    /// `done_info`.
    pub fn new(work: AsyncWork, start_info: ThunkInfo, done_info: ThunkInfo) -> Self {
        let handle = AsyncHandle::new(start_info.profile_annotation.clone());
        let done_kind = work.done_kind();
        let start = Thunk::new(
            start_info,
            ThunkOp::AsyncStart(AsyncStartThunk {
                work,
                handle: Arc::clone(&handle),
            }),
        );
        let done = Thunk::new(
            done_info,
            ThunkOp::AsyncDone(AsyncDoneThunk {
                kind: done_kind,
                handle: Arc::clone(&handle),
            }),
        );
        Self {
            start,
            done,
            handle,
        }
    }

    /// An async collective.
    pub fn collective(op: CollectiveOp, start_info: ThunkInfo, done_info: ThunkInfo) -> Self {
        Self::new(AsyncWork::Collective(op), start_info, done_info)
    }

    /// An async send of `source` to the host on `channel`.
    pub fn host_send(channel: i64, source: BufferSlice, start_info: ThunkInfo, done_info: ThunkInfo) -> Self {
        Self::new(
            AsyncWork::HostSend(HostSendStart { channel, source }),
            start_info,
            done_info,
        )
    }

    /// An async receive from the host on `channel` into `destination`.
    pub fn host_recv(
        channel: i64,
        destination: BufferSlice,
        start_info: ThunkInfo,
        done_info: ThunkInfo,
    ) -> Self {
        Self::new(
            AsyncWork::HostRecv(HostRecvStart {
                channel,
                destination,
            }),
            start_info,
            done_info,
        )
    }

    /// The start thunk.
    pub fn start(&self) -> &Thunk {
        &self.start
    }

    /// The done thunk.
    pub fn done(&self) -> &Thunk {
        &self.done
    }

    /// The shared handle.
    pub fn handle(&self) -> &Arc<AsyncHandle> {
        &self.handle
    }

    /// Splits into `(start, done)` for placement in a sequence.
    pub fn into_thunks(self) -> (Thunk, Thunk) {
        (self.start, self.done)
    }
}
