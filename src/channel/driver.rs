use super::{ChannelInfo, ChannelParams};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::utils::lock;
use bitflags::bitflags;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

bitflags! {
    /// Data-movement primitives a driver implements natively.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Operations: u8 {
        const SEND = 0x01;
        const RECV = 0x02;
        const TRANSACT = 0x04;
    }
}

/// One side of a transaction: the frame and how many bytes to move.
pub struct Transfer<'a> {
    pub frame: &'a mut Frame,
    pub count: usize,
}

impl<'a> Transfer<'a> {
    pub fn new(frame: &'a mut Frame, count: usize) -> Self {
        Self { frame, count }
    }
}

/// Transport implementation shared by every channel of one kind.
///
/// A driver declares which of `send`, `recv` and `transact` it implements
/// through [`DriverApi::operations`]; the channel layer composes the rest.
/// Undeclared primitives keep their `NotImplemented` defaults.
///
/// Per-channel state is kept by the driver itself, keyed by
/// [`ChannelInfo::id`].
pub trait DriverApi: Send + Sync {
    fn name(&self) -> &str;

    fn operations(&self) -> Operations;

    /// Whether channels with these transport parameters can use this driver.
    fn accepts(&self, params: &ChannelParams) -> bool;

    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn deinitialize(&self) -> Result<()> {
        Ok(())
    }

    fn open(&self, _channel: &ChannelInfo) -> Result<()> {
        Ok(())
    }

    fn close(&self, _channel: &ChannelInfo) -> Result<()> {
        Ok(())
    }

    /// Moves `count` bytes from the frame's unread region to the transport.
    fn send(&self, _channel: &ChannelInfo, _frame: &mut Frame, _count: usize) -> Result<()> {
        Err(Error::NotImplemented)
    }

    /// Receives up to `count` bytes into the frame's unwritten region.
    fn recv(&self, _channel: &ChannelInfo, _frame: &mut Frame, _count: usize) -> Result<()> {
        Err(Error::NotImplemented)
    }

    /// Send, wait `delay`, then receive, as one transport operation.
    fn transact(
        &self,
        _channel: &ChannelInfo,
        _send: Option<Transfer<'_>>,
        _delay: Duration,
        _recv: Option<Transfer<'_>>,
    ) -> Result<()> {
        Err(Error::NotImplemented)
    }
}

impl<T: DriverApi + ?Sized> DriverApi for std::sync::Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn operations(&self) -> Operations {
        (**self).operations()
    }

    fn accepts(&self, params: &ChannelParams) -> bool {
        (**self).accepts(params)
    }

    fn initialize(&self) -> Result<()> {
        (**self).initialize()
    }

    fn deinitialize(&self) -> Result<()> {
        (**self).deinitialize()
    }

    fn open(&self, channel: &ChannelInfo) -> Result<()> {
        (**self).open(channel)
    }

    fn close(&self, channel: &ChannelInfo) -> Result<()> {
        (**self).close(channel)
    }

    fn send(&self, channel: &ChannelInfo, frame: &mut Frame, count: usize) -> Result<()> {
        (**self).send(channel, frame, count)
    }

    fn recv(&self, channel: &ChannelInfo, frame: &mut Frame, count: usize) -> Result<()> {
        (**self).recv(channel, frame, count)
    }

    fn transact(
        &self,
        channel: &ChannelInfo,
        send: Option<Transfer<'_>>,
        delay: Duration,
        recv: Option<Transfer<'_>>,
    ) -> Result<()> {
        (**self).transact(channel, send, delay, recv)
    }
}

/// A driver instance plus its one-time initialization state.
pub struct ChannelDriver {
    api: Box<dyn DriverApi>,
    initialized: AtomicBool,
    lifecycle: Mutex<()>,
}

impl ChannelDriver {
    pub fn new(api: impl DriverApi + 'static) -> Self {
        Self::from_box(Box::new(api))
    }

    pub fn from_box(api: Box<dyn DriverApi>) -> Self {
        Self {
            api,
            initialized: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        self.api.name()
    }

    pub fn api(&self) -> &dyn DriverApi {
        self.api.as_ref()
    }

    pub fn operations(&self) -> Operations {
        self.api.operations()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// `Illegal` on double initialization, `NotImplemented` for a driver
    /// that moves no data. The flag flips only after the driver's own setup
    /// succeeded.
    pub fn initialize(&self) -> Result<()> {
        let _lifecycle = lock(&self.lifecycle);
        if self.is_initialized() {
            return Err(Error::Illegal);
        }
        if self.operations().is_empty() {
            return Err(Error::NotImplemented);
        }

        self.api.initialize()?;
        self.initialized.store(true, Ordering::Release);
        debug!("driver {} initialized ({:?})", self.name(), self.operations());
        Ok(())
    }

    /// `Illegal` unless initialized.
    pub fn deinitialize(&self) -> Result<()> {
        let _lifecycle = lock(&self.lifecycle);
        if !self.is_initialized() {
            return Err(Error::Illegal);
        }

        self.api.deinitialize()?;
        self.initialized.store(false, Ordering::Release);
        debug!("driver {} deinitialized", self.name());
        Ok(())
    }
}

impl core::fmt::Debug for ChannelDriver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ChannelDriver")
            .field("name", &self.name())
            .field("operations", &self.operations())
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
