//! Host transfer: infeed, outfeed and the work behind async send/recv.

use gpurt_core::device::{BufferSlice, Stream};
use gpurt_core::error::{Result, RuntimeError};

use crate::params::ExecuteParams;

/// Copies one host infeed buffer into each destination, in order.
#[derive(Debug, Clone)]
pub struct InfeedThunk {
    destinations: Vec<BufferSlice>,
}

impl InfeedThunk {
    /// Creates an infeed into `destinations`.
    pub fn new(destinations: Vec<BufferSlice>) -> Self {
        Self { destinations }
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let host = params.host_transfer()?;
        for slice in &self.destinations {
            let region = params.region(slice)?;
            let data = host.infeed()?;
            if data.len() != region.size() {
                return Err(RuntimeError::HostTransfer(format!(
                    "infeed buffer of {} bytes for {} byte destination {}",
                    data.len(),
                    region.size(),
                    slice
                )));
            }
            params.stream.memcpy_h2d(&region, &data)?;
        }
        Ok(())
    }
}

/// Copies each source out to the host outfeed, in order.
#[derive(Debug, Clone)]
pub struct OutfeedThunk {
    sources: Vec<BufferSlice>,
}

impl OutfeedThunk {
    /// Creates an outfeed of `sources`.
    pub fn new(sources: Vec<BufferSlice>) -> Self {
        Self { sources }
    }

    pub(crate) fn execute(&self, params: &ExecuteParams<'_>) -> Result<()> {
        let host = params.host_transfer()?;
        for slice in &self.sources {
            let region = params.region(slice)?;
            host.outfeed(params.stream.memcpy_d2h(&region)?)?;
        }
        Ok(())
    }
}

/// Send of a device slice to the host on a channel.
#[derive(Debug, Clone)]
pub struct HostSendStart {
    pub(crate) channel: i64,
    pub(crate) source: BufferSlice,
}

impl HostSendStart {
    /// Channel id.
    pub fn channel(&self) -> i64 {
        self.channel
    }

    pub(crate) fn run(&self, params: &ExecuteParams<'_>, stream: &Stream) -> Result<()> {
        let host = params.host_transfer()?;
        let region = params.region(&self.source)?;
        host.send_to_host(self.channel, stream.memcpy_d2h(&region)?)
    }
}

/// Receive of host data into a device slice on a channel.
#[derive(Debug, Clone)]
pub struct HostRecvStart {
    pub(crate) channel: i64,
    pub(crate) destination: BufferSlice,
}

impl HostRecvStart {
    /// Channel id.
    pub fn channel(&self) -> i64 {
        self.channel
    }

    pub(crate) fn run(&self, params: &ExecuteParams<'_>, stream: &Stream) -> Result<()> {
        let host = params.host_transfer()?;
        let region = params.region(&self.destination)?;
        let data = host.recv_from_host(self.channel)?;
        if data.len() != region.size() {
            return Err(RuntimeError::HostTransfer(format!(
                "channel {} delivered {} bytes for {} byte destination",
                self.channel,
                data.len(),
                region.size()
            )));
        }
        stream.memcpy_h2d(&region, &data)
    }
}
