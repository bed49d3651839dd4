use crate::channel::{ChannelId, ChannelInfo, ChannelParams, DriverApi, Operations};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::sim::{self, Peripheral};
use crate::utils;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

type SharedPeripheral = Arc<Mutex<Box<dyn Peripheral>>>;

/// Attaches each channel to its own in-process simulated peripheral.
///
/// Reads poll the model until it has data or the transaction timeout
/// passes, which gives the same observable behaviour as a remote peripheral
/// without a socket.
#[derive(Default)]
pub struct PeripheralDriver {
    devices: RwLock<HashMap<ChannelId, SharedPeripheral>>,
}

impl PeripheralDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn device(&self, channel: ChannelId) -> Result<SharedPeripheral> {
        utils::read(&self.devices).get(&channel).cloned().ok_or(Error::Illegal)
    }

    /// Runs `f` against the model behind an open channel.
    pub fn with_device<R>(&self, channel: ChannelId, f: impl FnOnce(&mut dyn Peripheral) -> R) -> Result<R> {
        let device = self.device(channel)?;
        let mut model = utils::lock(&device);
        Ok(f(model.as_mut()))
    }
}

impl DriverApi for PeripheralDriver {
    fn name(&self) -> &str {
        "peripheral"
    }

    fn operations(&self) -> Operations {
        Operations::SEND | Operations::RECV
    }

    fn accepts(&self, params: &ChannelParams) -> bool {
        matches!(params, ChannelParams::Peripheral { .. })
    }

    fn open(&self, channel: &ChannelInfo) -> Result<()> {
        let ChannelParams::Peripheral { model, config } = &channel.config().params else {
            return Err(Error::Illegal);
        };
        let mut device = sim::create(model)?;
        device.configure(config)?;
        utils::write(&self.devices).insert(channel.id(), Arc::new(Mutex::new(device)));
        debug!("{}: attached {} model", channel.name(), model);
        Ok(())
    }

    fn close(&self, channel: &ChannelInfo) -> Result<()> {
        utils::write(&self.devices).remove(&channel.id());
        Ok(())
    }

    fn send(&self, channel: &ChannelInfo, frame: &mut Frame, count: usize) -> Result<()> {
        let device = self.device(channel.id())?;
        let data = frame.unread().get(..count).ok_or(Error::NoSpace)?;
        let written = utils::lock(&device).write(data)?.min(count);
        frame.advance(written as isize)?;
        if written < count {
            return Err(Error::Partial);
        }
        Ok(())
    }

    fn recv(&self, channel: &ChannelInfo, frame: &mut Frame, count: usize) -> Result<()> {
        let device = self.device(channel.id())?;
        let deadline = Instant::now() + channel.config().transaction_timeout;
        let max = count.min(frame.available_space());
        loop {
            let data = utils::lock(&device).read(max);
            if !data.is_empty() {
                return frame.put_bytes(&data);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}
