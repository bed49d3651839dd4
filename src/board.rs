//! Everything one satellite instance owns, built from a [`BoardConfig`].

use crate::channel::{Channel, ChannelDriver};
use crate::config::BoardConfig;
use crate::drivers::{self, DriverKind, MemoryDriver};
use crate::error::{Error, Result};
use crate::frame_pool::FramePool;
use crate::nvram::{FileBackend, Nvram};
use crate::platform::Platform;
use crate::subsystems::{CdhSubsystem, PlatformSubsystem, PowerSubsystem, ThermalSubsystem};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub struct Board {
    config: BoardConfig,
    drivers: HashMap<String, Arc<ChannelDriver>>,
    channels: HashMap<String, Arc<Channel>>,
    memory: HashMap<String, MemoryDriver>,
    pool: Arc<FramePool>,
    nvram: Arc<Nvram>,
}

impl Board {
    /// Initializes every driver and builds every channel (closed). `Exist`
    /// for duplicate driver or channel names, `NoEnt` for a channel naming
    /// an unknown driver.
    pub fn new(config: BoardConfig) -> Result<Self> {
        let mut drivers = HashMap::new();
        let mut memory = HashMap::new();
        for dc in &config.drivers {
            if drivers.contains_key(&dc.name) {
                return Err(Error::Exist);
            }
            let api = match dc.kind {
                DriverKind::Memory => {
                    let driver = MemoryDriver::new();
                    memory.insert(dc.name.clone(), driver.clone());
                    drivers::wrap(driver, dc.bus_timeout())
                }
                kind => kind.create(dc.bus_timeout()),
            };
            let driver = Arc::new(ChannelDriver::from_box(api));
            driver.initialize()?;
            drivers.insert(dc.name.clone(), driver);
        }

        let mut channels = HashMap::new();
        for spec in &config.channels {
            if channels.contains_key(&spec.name) {
                return Err(Error::Exist);
            }
            let driver = drivers.get(&spec.driver).ok_or(Error::NoEnt)?;
            let channel = Channel::builder(&spec.name, Arc::clone(driver))
                .config(spec.channel_config())
                .build()?;
            channels.insert(spec.name.clone(), Arc::new(channel));
        }

        let nvram = match &config.nvram {
            Some(path) => Nvram::new(FileBackend::new(path)),
            None => Nvram::in_memory(),
        };
        if let Err(e) = nvram.reload() {
            warn!("nvram not restored ({}), starting from defaults", e);
        }
        nvram.save(|data| data.boot_count += 1);
        nvram.flush()?;
        info!("🛰️ board up, boot #{}", nvram.read(|data| data.boot_count));

        let pool = Arc::new(FramePool::new(config.frame_pool.frames, config.frame_pool.frame_size));
        Ok(Self {
            config,
            drivers,
            channels,
            memory,
            pool,
            nvram: Arc::new(nvram),
        })
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub fn channel(&self, name: &str) -> Result<Arc<Channel>> {
        self.channels.get(name).cloned().ok_or(Error::NoEnt)
    }

    pub fn driver(&self, name: &str) -> Result<Arc<ChannelDriver>> {
        self.drivers.get(name).cloned().ok_or(Error::NoEnt)
    }

    /// Test handle of a memory driver, sharing its rings.
    pub fn memory_driver(&self, name: &str) -> Result<MemoryDriver> {
        self.memory.get(name).cloned().ok_or(Error::NoEnt)
    }

    pub fn frame_pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    pub fn nvram(&self) -> &Arc<Nvram> {
        &self.nvram
    }

    pub fn open_all(&self) -> Result<()> {
        for channel in self.channels.values() {
            if !channel.is_open() {
                channel.open()?;
            }
        }
        Ok(())
    }

    /// Opens every channel and registers the platform, power, thermal and
    /// CDH subsystems on a new platform manager. Nothing runs yet.
    pub fn assemble(&self) -> Result<Arc<Platform>> {
        self.open_all()?;
        let wiring = &self.config.subsystems;
        let platform = Platform::new(self.config.platform.timing());

        platform.register(Arc::new(PlatformSubsystem::new(Arc::clone(&self.nvram))))?;
        platform.register(Arc::new(PowerSubsystem::new(
            self.channel(&wiring.power)?,
            Arc::clone(&self.nvram),
        )))?;
        platform.register(Arc::new(ThermalSubsystem::new(
            self.channel(&wiring.thermal)?,
            Arc::clone(&self.nvram),
        )))?;
        platform.register(Arc::new(CdhSubsystem::new(
            self.channel(&wiring.uplink)?,
            self.channel(&wiring.downlink)?,
            Arc::clone(&self.pool),
            Arc::clone(&self.nvram),
            wiring.beacon_interval_ms.map(Duration::from_millis),
        )))?;
        Ok(platform)
    }

    /// [`Board::assemble`], then boot into the configured initial mode.
    pub fn boot(&self) -> Result<Arc<Platform>> {
        let platform = self.assemble()?;
        platform.boot(self.config.platform.initial_mode)?;
        Ok(platform)
    }

    /// Closes every open channel and deinitializes every driver. Keeps
    /// going past failures and returns the first one.
    pub fn power_down(&self) -> Result<()> {
        let mut result = Ok(());
        for channel in self.channels.values().filter(|c| c.is_open()) {
            if let Err(e) = channel.close() {
                warn!("closing {} failed: {}", channel.name(), e);
                result = result.and(Err(e));
            }
        }
        for (name, driver) in &self.drivers {
            if driver.is_initialized() {
                if let Err(e) = driver.deinitialize() {
                    warn!("deinitializing {} failed: {}", name, e);
                    result = result.and(Err(e));
                }
            }
        }
        if let Err(e) = self.nvram.flush() {
            result = result.and(Err(e));
        }
        result
    }
}

impl core::fmt::Debug for Board {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Board")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .field("nvram", &self.nvram)
            .finish()
    }
}
