use crate::channel::{ChannelInfo, ChannelParams, DriverApi, Operations, RecursiveLock, Transfer};
use crate::error::Result;
use crate::frame::Frame;
use std::time::Duration;

pub const DEFAULT_BUS_TIMEOUT: Duration = Duration::from_millis(200);

/// Serialises every primitive of the wrapped driver behind one bus lock, for
/// transports where several channels share a physical medium.
///
/// The lock is recursive, so a primitive of the inner driver may call back
/// into another on the same thread.
pub struct SharedBusDriver<D> {
    inner: D,
    bus: RecursiveLock,
    timeout: Duration,
    name: String,
}

impl<D: DriverApi> SharedBusDriver<D> {
    pub fn new(inner: D) -> Self {
        Self::with_timeout(inner, DEFAULT_BUS_TIMEOUT)
    }

    pub fn with_timeout(inner: D, timeout: Duration) -> Self {
        let name = format!("bus:{}", inner.name());
        Self {
            inner,
            bus: RecursiveLock::new(),
            timeout,
            name,
        }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn bus_lock(&self) -> &RecursiveLock {
        &self.bus
    }

    fn exclusive<R>(&self, f: impl FnOnce(&D) -> Result<R>) -> Result<R> {
        self.bus.acquire(self.timeout)?;
        let result = f(&self.inner);
        self.bus.release()?;
        result
    }
}

impl<D: DriverApi> DriverApi for SharedBusDriver<D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn operations(&self) -> Operations {
        self.inner.operations()
    }

    fn accepts(&self, params: &ChannelParams) -> bool {
        self.inner.accepts(params)
    }

    fn initialize(&self) -> Result<()> {
        self.inner.initialize()
    }

    fn deinitialize(&self) -> Result<()> {
        self.inner.deinitialize()
    }

    fn open(&self, channel: &ChannelInfo) -> Result<()> {
        self.exclusive(|inner| inner.open(channel))
    }

    fn close(&self, channel: &ChannelInfo) -> Result<()> {
        self.exclusive(|inner| inner.close(channel))
    }

    fn send(&self, channel: &ChannelInfo, frame: &mut Frame, count: usize) -> Result<()> {
        self.exclusive(|inner| inner.send(channel, frame, count))
    }

    fn recv(&self, channel: &ChannelInfo, frame: &mut Frame, count: usize) -> Result<()> {
        self.exclusive(|inner| inner.recv(channel, frame, count))
    }

    fn transact(
        &self,
        channel: &ChannelInfo,
        send: Option<Transfer<'_>>,
        delay: Duration,
        recv: Option<Transfer<'_>>,
    ) -> Result<()> {
        self.exclusive(|inner| inner.transact(channel, send, delay, recv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ChannelDriver};
    use crate::drivers::MemoryDriver;
    use crate::error::Error;
    use std::sync::Arc;

    #[test]
    fn test_bus_held_elsewhere_times_out_io() {
        let bus = Arc::new(SharedBusDriver::with_timeout(MemoryDriver::new(), Duration::from_millis(10)));
        let driver = Arc::new(ChannelDriver::new(Arc::clone(&bus)));
        driver.initialize().unwrap();
        assert_eq!(driver.name(), "bus:memory");

        let channel = Channel::builder("a", driver).build().unwrap();
        channel.open().unwrap();

        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let holder = {
            let bus = Arc::clone(&bus);
            std::thread::spawn(move || {
                bus.bus_lock().acquire(Duration::from_secs(1)).unwrap();
                held_tx.send(()).unwrap();
                done_rx.recv().unwrap();
                bus.bus_lock().release().unwrap();
            })
        };
        held_rx.recv().unwrap();

        let mut out = Frame::from_slice(b"x");
        assert_eq!(channel.send(&mut out, None).unwrap_err(), Error::Timeout);
        assert_eq!(out.available_data(), 1);

        done_tx.send(()).unwrap();
        holder.join().unwrap();
        channel.send(&mut out, None).unwrap();
    }
}
