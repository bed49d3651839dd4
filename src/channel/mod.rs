//! Lockable, timeout-aware communication endpoints over pluggable drivers.
//!
//! A [`Channel`] pairs immutable configuration with open/lock state and a
//! shared [`ChannelDriver`]. Sends are serialised by the channel's send
//! lock and receives by its recv lock; the two are independent so a
//! full-duplex transport can write and read at the same time.

pub mod compose;
pub mod driver;
pub mod lock;

pub use driver::{ChannelDriver, DriverApi, Operations, Transfer};
pub use lock::RecursiveLock;

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::utils;
use arrayvec::ArrayString;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use tracing::{debug, warn};

pub const MAX_CHANNEL_NAME: usize = 32;
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(100);
pub const DEFAULT_TRANSACTION_TIMEOUT: Duration = Duration::from_millis(100);

static NEXT_CHANNEL_ID: AtomicU16 = AtomicU16::new(1);

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChannelFlags: u8 {
        /// I/O calls do not take the send/recv locks; the caller brackets
        /// them with [`Channel::lock`] / [`Channel::unlock`] instead.
        const NO_AUTO_LOCK = 0x01;
    }
}

/// Transport-specific parameters of one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelParams {
    None,
    Memory { capacity: usize },
    Tcp { host: String, port: u16 },
    Remote { host: String, port: u16, config: String },
    Portmapped { host: String, portmapper_port: u16, name: String, config: String },
    Peripheral { model: String, config: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Used when an I/O call passes no lock timeout of its own.
    pub lock_timeout: Duration,
    /// Upper bound a driver waits on the transport.
    pub transaction_timeout: Duration,
    pub flags: ChannelFlags,
    pub params: ChannelParams,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            transaction_timeout: DEFAULT_TRANSACTION_TIMEOUT,
            flags: ChannelFlags::empty(),
            params: ChannelParams::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u16);

impl core::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

/// What a driver sees of a channel.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    id: ChannelId,
    name: ArrayString<MAX_CHANNEL_NAME>,
    config: ChannelConfig,
}

impl ChannelInfo {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

/// Validating constructor for [`Channel`].
pub struct ChannelBuilder {
    name: String,
    driver: Arc<ChannelDriver>,
    config: ChannelConfig,
}

impl ChannelBuilder {
    pub fn new(name: &str, driver: Arc<ChannelDriver>) -> Self {
        Self {
            name: name.to_string(),
            driver,
            config: ChannelConfig::default(),
        }
    }

    pub fn config(mut self, config: ChannelConfig) -> Self {
        self.config = config;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.config.transaction_timeout = timeout;
        self
    }

    pub fn flags(mut self, flags: ChannelFlags) -> Self {
        self.config.flags = flags;
        self
    }

    pub fn params(mut self, params: ChannelParams) -> Self {
        self.config.params = params;
        self
    }

    /// `Illegal` for an empty or over-long name, a zero timeout, or
    /// parameters the driver does not accept.
    pub fn build(self) -> Result<Channel> {
        if self.name.is_empty() {
            return Err(Error::Illegal);
        }
        let name = ArrayString::from(&self.name).map_err(|_| Error::Illegal)?;
        if self.config.lock_timeout.is_zero() || self.config.transaction_timeout.is_zero() {
            return Err(Error::Illegal);
        }
        if !self.driver.api().accepts(&self.config.params) {
            warn!(
                "channel {}: driver {} rejects {:?}",
                self.name,
                self.driver.name(),
                self.config.params
            );
            return Err(Error::Illegal);
        }

        let id = ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed));
        Ok(Channel {
            info: ChannelInfo {
                id,
                name,
                config: self.config,
            },
            driver: self.driver,
            open: AtomicBool::new(false),
            transition: Mutex::new(()),
            send_lock: OnceLock::new(),
            recv_lock: OnceLock::new(),
        })
    }
}

/// Releases an auto-acquired lock when dropped.
struct HeldLock<'a>(Option<&'a RecursiveLock>);

impl Drop for HeldLock<'_> {
    fn drop(&mut self) {
        // A concurrent close may have force-released it in the meantime.
        if let Some(lock) = self.0.filter(|lock| lock.is_held_by_current_thread()) {
            let _ = lock.release();
        }
    }
}

pub struct Channel {
    info: ChannelInfo,
    driver: Arc<ChannelDriver>,
    open: AtomicBool,
    transition: Mutex<()>,
    // Created on first open, kept across close/reopen.
    send_lock: OnceLock<RecursiveLock>,
    recv_lock: OnceLock<RecursiveLock>,
}

impl Channel {
    pub fn builder(name: &str, driver: Arc<ChannelDriver>) -> ChannelBuilder {
        ChannelBuilder::new(name, driver)
    }

    pub fn id(&self) -> ChannelId {
        self.info.id
    }

    pub fn name(&self) -> &str {
        self.info.name()
    }

    pub fn info(&self) -> &ChannelInfo {
        &self.info
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.info.config
    }

    pub fn driver(&self) -> &Arc<ChannelDriver> {
        &self.driver
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// The lock guarding one direction, once provisioned by [`Channel::open`].
    pub fn direction_lock(&self, direction: Direction) -> Option<&RecursiveLock> {
        match direction {
            Direction::Send => self.send_lock.get(),
            Direction::Recv => self.recv_lock.get(),
        }
    }

    /// CLOSED -> OPEN. `Illegal` if already open or the driver is not
    /// initialized.
    pub fn open(&self) -> Result<()> {
        let _transition = utils::lock(&self.transition);
        if self.is_open() || !self.driver.is_initialized() {
            return Err(Error::Illegal);
        }

        self.send_lock.get_or_init(RecursiveLock::new);
        self.recv_lock.get_or_init(RecursiveLock::new);
        self.driver.api().open(&self.info)?;
        self.open.store(true, Ordering::Release);

        debug!("channel {} ({}) open on {}", self.name(), self.id(), self.driver.name());
        Ok(())
    }

    /// OPEN -> CLOSED, force-releasing both locks. The channel is closed
    /// even if the driver reports an error, which is returned.
    pub fn close(&self) -> Result<()> {
        let _transition = utils::lock(&self.transition);
        if !self.is_open() {
            return Err(Error::Illegal);
        }

        let result = self.driver.api().close(&self.info);
        self.open.store(false, Ordering::Release);
        for direction in [Direction::Send, Direction::Recv] {
            if let Some(lock) = self.direction_lock(direction) {
                lock.force_release();
            }
        }

        debug!("channel {} ({}) closed", self.name(), self.id());
        result
    }

    /// Sends every unread byte of `frame`.
    pub fn send(&self, frame: &mut Frame, timeout: Option<Duration>) -> Result<()> {
        self.ensure_ready()?;
        let count = frame.available_data();
        if count == 0 {
            return Ok(());
        }

        let _held = self.auto_lock(Direction::Send, timeout)?;
        compose::send(self.driver.api(), &self.info, Transfer::new(frame, count))
    }

    /// Receives into the unwritten region of `frame`.
    pub fn recv(&self, frame: &mut Frame, timeout: Option<Duration>) -> Result<()> {
        self.ensure_ready()?;
        let count = frame.available_space();
        if count == 0 {
            return Ok(());
        }

        let _held = self.auto_lock(Direction::Recv, timeout)?;
        compose::recv(self.driver.api(), &self.info, Transfer::new(frame, count))
    }

    /// Sends `send`'s unread bytes, waits `delay`, then receives into `recv`.
    ///
    /// Only the locks for sides that actually move data are taken, send
    /// first. If the second cannot be acquired the first is released before
    /// the error is returned.
    pub fn transact(
        &self,
        send: Option<&mut Frame>,
        delay: Duration,
        recv: Option<&mut Frame>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.ensure_ready()?;
        let send = send
            .filter(|frame| frame.available_data() > 0)
            .map(|frame| {
                let count = frame.available_data();
                Transfer::new(frame, count)
            });
        let recv = recv
            .filter(|frame| frame.available_space() > 0)
            .map(|frame| {
                let count = frame.available_space();
                Transfer::new(frame, count)
            });
        if send.is_none() && recv.is_none() {
            return Ok(());
        }

        let _send_held = if send.is_some() {
            Some(self.auto_lock(Direction::Send, timeout)?)
        } else {
            None
        };
        let _recv_held = if recv.is_some() {
            Some(self.auto_lock(Direction::Recv, timeout)?)
        } else {
            None
        };

        compose::transact(self.driver.api(), &self.info, send, delay, recv)
    }

    /// Takes both locks so several calls run as one unit; send first, with
    /// the same unwinding as [`Channel::transact`].
    pub fn lock(&self, timeout: Option<Duration>) -> Result<()> {
        self.ensure_ready()?;
        self.lock_direction(Direction::Send, timeout)?;
        if let Err(e) = self.lock_direction(Direction::Recv, timeout) {
            let _ = self.unlock_direction(Direction::Send);
            return Err(e);
        }
        Ok(())
    }

    pub fn unlock(&self) -> Result<()> {
        let recv = self.unlock_direction(Direction::Recv);
        let send = self.unlock_direction(Direction::Send);
        recv.and(send)
    }

    /// `Nack` if the lock was never provisioned.
    pub fn lock_direction(&self, direction: Direction, timeout: Option<Duration>) -> Result<()> {
        let lock = self.direction_lock(direction).ok_or(Error::Nack)?;
        lock.acquire(self.lock_timeout(timeout)).map_err(|e| {
            warn!("channel {}: {:?} lock not acquired: {}", self.name(), direction, e);
            e
        })
    }

    pub fn unlock_direction(&self, direction: Direction) -> Result<()> {
        self.direction_lock(direction).ok_or(Error::Nack)?.release()
    }

    fn lock_timeout(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.info.config.lock_timeout)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.is_open() && self.driver.is_initialized() {
            Ok(())
        } else {
            Err(Error::Illegal)
        }
    }

    fn auto_lock(&self, direction: Direction, timeout: Option<Duration>) -> Result<HeldLock<'_>> {
        if self.info.config.flags.contains(ChannelFlags::NO_AUTO_LOCK) {
            return Ok(HeldLock(None));
        }
        match self.lock_direction(direction, timeout) {
            Ok(()) => Ok(HeldLock(self.direction_lock(direction))),
            // No lock object: run unlocked.
            Err(Error::Nack) => Ok(HeldLock(None)),
            Err(e) => Err(e),
        }
    }
}

impl core::fmt::Debug for Channel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.info.id)
            .field("name", &self.info.name())
            .field("driver", &self.driver.name())
            .field("open", &self.is_open())
            .finish()
    }
}
