use crate::channel::{ChannelId, ChannelInfo, ChannelParams, DriverApi, Operations};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::utils;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::Instant;
use tracing::trace;

pub const DEFAULT_MEMORY_CAPACITY: usize = 1024;

#[derive(Debug)]
struct Ring {
    bytes: Mutex<VecDeque<u8>>,
    capacity: usize,
    readable: Condvar,
}

/// In-process loopback: whatever a channel sends, the same channel
/// receives. Each open channel gets its own bounded ring.
///
/// Clones share their rings, so a clone kept outside the [`ChannelDriver`]
/// can [`inject`](MemoryDriver::inject) and [`drain`](MemoryDriver::drain).
///
/// [`ChannelDriver`]: crate::channel::ChannelDriver
#[derive(Debug, Default, Clone)]
pub struct MemoryDriver {
    rings: Arc<RwLock<HashMap<ChannelId, Arc<Ring>>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn ring(&self, channel: ChannelId) -> Result<Arc<Ring>> {
        utils::read(&self.rings).get(&channel).cloned().ok_or(Error::Illegal)
    }

    /// Queues bytes as if they had arrived from the far end.
    pub fn inject(&self, channel: ChannelId, data: &[u8]) -> Result<()> {
        let ring = self.ring(channel)?;
        let mut bytes = utils::lock(&ring.bytes);
        if ring.capacity - bytes.len() < data.len() {
            return Err(Error::NoSpace);
        }
        bytes.extend(data);
        ring.readable.notify_all();
        Ok(())
    }

    /// Removes and returns everything queued on the channel.
    pub fn drain(&self, channel: ChannelId) -> Result<Vec<u8>> {
        let ring = self.ring(channel)?;
        let mut bytes = utils::lock(&ring.bytes);
        Ok(bytes.drain(..).collect())
    }
}

impl DriverApi for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn operations(&self) -> Operations {
        Operations::SEND | Operations::RECV
    }

    fn accepts(&self, params: &ChannelParams) -> bool {
        matches!(params, ChannelParams::None | ChannelParams::Memory { .. })
    }

    fn open(&self, channel: &ChannelInfo) -> Result<()> {
        let capacity = match channel.config().params {
            ChannelParams::Memory { capacity } if capacity > 0 => capacity,
            ChannelParams::Memory { .. } => return Err(Error::Illegal),
            _ => DEFAULT_MEMORY_CAPACITY,
        };
        utils::write(&self.rings).insert(
            channel.id(),
            Arc::new(Ring {
                bytes: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                readable: Condvar::new(),
            }),
        );
        Ok(())
    }

    fn close(&self, channel: &ChannelInfo) -> Result<()> {
        utils::write(&self.rings).remove(&channel.id());
        Ok(())
    }

    /// Writes as much as fits; `Partial` if the ring filled up first.
    fn send(&self, channel: &ChannelInfo, frame: &mut Frame, count: usize) -> Result<()> {
        let ring = self.ring(channel.id())?;
        let mut bytes = utils::lock(&ring.bytes);
        let room = ring.capacity - bytes.len();
        let n = count.min(room).min(frame.available_data());
        bytes.extend(frame.take_data(n)?);
        ring.readable.notify_all();
        trace!("{}: queued {} of {} bytes", channel.name(), n, count);

        if n < count {
            return Err(Error::Partial);
        }
        Ok(())
    }

    /// Waits up to the transaction timeout for data, then takes up to
    /// `count` bytes of whatever is queued.
    fn recv(&self, channel: &ChannelInfo, frame: &mut Frame, count: usize) -> Result<()> {
        let ring = self.ring(channel.id())?;
        let timeout = channel.config().transaction_timeout;
        let deadline = Instant::now() + timeout;

        let mut bytes = utils::lock(&ring.bytes);
        while bytes.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::Timeout);
            }
            let (guard, _) = ring
                .readable
                .wait_timeout(bytes, remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            bytes = guard;
        }

        let n = count.min(bytes.len()).min(frame.available_space());
        for byte in bytes.drain(..n) {
            frame.put_u8_unchecked(byte);
        }
        trace!("{}: received {} bytes", channel.name(), n);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelDriver};
    use std::time::Duration;

    fn open_channel(driver: &Arc<ChannelDriver>, capacity: usize) -> Channel {
        let channel = Channel::builder("loop", Arc::clone(driver))
            .params(ChannelParams::Memory { capacity })
            .transaction_timeout(Duration::from_millis(20))
            .build()
            .unwrap();
        channel.open().unwrap();
        channel
    }

    #[test]
    fn test_send_is_received_on_same_channel() {
        let driver = Arc::new(ChannelDriver::new(MemoryDriver::new()));
        driver.initialize().unwrap();
        let channel = open_channel(&driver, 16);

        let mut out = Frame::from_slice(b"ping");
        channel.send(&mut out, None).unwrap();
        assert_eq!(out.available_data(), 0);

        let mut input = Frame::with_capacity(8);
        channel.recv(&mut input, None).unwrap();
        assert_eq!(input.written(), b"ping");
    }

    #[test]
    fn test_full_ring_is_partial_and_empty_ring_times_out() {
        let driver = Arc::new(ChannelDriver::new(MemoryDriver::new()));
        driver.initialize().unwrap();
        let channel = open_channel(&driver, 3);

        let mut out = Frame::from_slice(b"abcd");
        assert_eq!(channel.send(&mut out, None).unwrap_err(), Error::Partial);
        assert_eq!(out.unread(), b"d");

        let mut input = Frame::with_capacity(8);
        channel.recv(&mut input, None).unwrap();
        assert_eq!(input.written(), b"abc");
        assert_eq!(channel.recv(&mut input, None).unwrap_err(), Error::Timeout);
    }

    #[test]
    fn test_inject_and_drain_through_clone() {
        let memory = MemoryDriver::new();
        let driver = Arc::new(ChannelDriver::new(memory.clone()));
        driver.initialize().unwrap();
        let channel = open_channel(&driver, 8);

        memory.inject(channel.id(), &[1, 2, 3]).unwrap();
        assert_eq!(memory.inject(channel.id(), &[0; 6]).unwrap_err(), Error::NoSpace);
        let mut input = Frame::with_capacity(2);
        channel.recv(&mut input, None).unwrap();
        assert_eq!(input.written(), &[1, 2]);
        assert_eq!(memory.drain(channel.id()).unwrap(), vec![3]);

        channel.close().unwrap();
        assert_eq!(memory.drain(channel.id()).unwrap_err(), Error::Illegal);
    }
}
