//! Host-device transfer callbacks: infeed, outfeed and host send/recv.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::error::{Result, RuntimeError};

/// Callbacks through which device programs exchange data with the host.
pub trait HostTransfer: Send + Sync {
    /// Takes the next buffer the host queued for infeed.
    fn infeed(&self) -> Result<Vec<u8>>;

    /// Hands a buffer to the host through outfeed.
    fn outfeed(&self, data: Vec<u8>) -> Result<()>;

    /// Sends device data to the host on `channel`.
    fn send_to_host(&self, channel: i64, data: Vec<u8>) -> Result<()>;

    /// Receives host data for the device on `channel`.
    fn recv_from_host(&self, channel: i64) -> Result<Vec<u8>>;
}

/// Queue-backed [`HostTransfer`] implementation.
#[derive(Debug, Default)]
pub struct HostTransferQueues {
    infeed: Mutex<VecDeque<Vec<u8>>>,
    outfeed: Mutex<VecDeque<Vec<u8>>>,
    to_host: Mutex<HashMap<i64, VecDeque<Vec<u8>>>>,
    from_host: Mutex<HashMap<i64, VecDeque<Vec<u8>>>>,
}

impl HostTransferQueues {
    /// Creates empty queues.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a buffer for the next infeed.
    pub fn push_infeed(&self, data: Vec<u8>) {
        self.infeed.lock().push_back(data);
    }

    /// Takes the oldest outfeed buffer.
    pub fn pop_outfeed(&self) -> Option<Vec<u8>> {
        self.outfeed.lock().pop_front()
    }

    /// Queues host data to be received by the device on `channel`.
    pub fn push_to_device(&self, channel: i64, data: Vec<u8>) {
        self.from_host.lock().entry(channel).or_default().push_back(data);
    }

    /// Takes the oldest buffer the device sent on `channel`.
    pub fn pop_from_device(&self, channel: i64) -> Option<Vec<u8>> {
        self.to_host.lock().get_mut(&channel).and_then(|q| q.pop_front())
    }
}

impl HostTransfer for HostTransferQueues {
    fn infeed(&self) -> Result<Vec<u8>> {
        self.infeed
            .lock()
            .pop_front()
            .ok_or_else(|| RuntimeError::HostTransfer("infeed queue is empty".to_string()))
    }

    fn outfeed(&self, data: Vec<u8>) -> Result<()> {
        self.outfeed.lock().push_back(data);
        Ok(())
    }

    fn send_to_host(&self, channel: i64, data: Vec<u8>) -> Result<()> {
        self.to_host.lock().entry(channel).or_default().push_back(data);
        Ok(())
    }

    fn recv_from_host(&self, channel: i64) -> Result<Vec<u8>> {
        self.from_host
            .lock()
            .get_mut(&channel)
            .and_then(|q| q.pop_front())
            .ok_or_else(|| {
                RuntimeError::HostTransfer(format!("no host data pending on channel {}", channel))
            })
    }
}
