//! Subsystem framework: identity, per-subsystem state shared with the
//! platform manager, and the default main task.

pub mod cdh;
pub mod command;
pub mod platform;
pub mod power;
pub mod thermal;

pub use cdh::CdhSubsystem;
pub use command::{CommandDescriptor, CommandSpec, CommandTable, SelfTest, SelfTestReport, SelfTestTable};
pub use platform::PlatformSubsystem;
pub use power::PowerSubsystem;
pub use thermal::ThermalSubsystem;

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::platform::Platform;
use crate::utils;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use tracing::warn;

pub const MAX_SUBSYSTEMS: usize = 8;
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum SubsystemId {
    Platform = 0,
    Power = 1,
    Aocs = 2,
    Cdh = 3,
    Thermal = 4,
    Payload = 5,
    Memory = 6,
}

impl SubsystemId {
    pub const ALL: [SubsystemId; 7] = [
        SubsystemId::Platform,
        SubsystemId::Power,
        SubsystemId::Aocs,
        SubsystemId::Cdh,
        SubsystemId::Thermal,
        SubsystemId::Payload,
        SubsystemId::Memory,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    /// `NoEnt` for an id no subsystem carries.
    pub fn from_code(code: u8) -> Result<Self> {
        Self::ALL.get(code as usize).copied().ok_or(Error::NoEnt)
    }

    pub fn name(self) -> &'static str {
        match self {
            SubsystemId::Platform => "platform",
            SubsystemId::Power => "power",
            SubsystemId::Aocs => "aocs",
            SubsystemId::Cdh => "cdh",
            SubsystemId::Thermal => "thermal",
            SubsystemId::Payload => "payload",
            SubsystemId::Memory => "memory",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|id| id.name() == name)
            .ok_or(Error::NoEnt)
    }
}

impl core::fmt::Display for SubsystemId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Satellite-wide operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum SatelliteMode {
    Booting = 0,
    Initializing = 1,
    Survival = 2,
    Mission = 3,
    LowPower = 4,
}

impl SatelliteMode {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// `Illegal` for an unknown code.
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(SatelliteMode::Booting),
            1 => Ok(SatelliteMode::Initializing),
            2 => Ok(SatelliteMode::Survival),
            3 => Ok(SatelliteMode::Mission),
            4 => Ok(SatelliteMode::LowPower),
            _ => Err(Error::Illegal),
        }
    }
}

impl core::str::FromStr for SatelliteMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "booting" => Ok(SatelliteMode::Booting),
            "initializing" => Ok(SatelliteMode::Initializing),
            "survival" => Ok(SatelliteMode::Survival),
            "mission" => Ok(SatelliteMode::Mission),
            "low_power" | "low-power" => Ok(SatelliteMode::LowPower),
            _ => Err(Error::Illegal),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum SubsystemStatus {
    Booting = 0,
    Ready = 1,
    ModeChangePending = 2,
    /// Terminal for the subsystem.
    FatalError = 3,
}

/// Static description of one subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubsystemConfig {
    pub id: SubsystemId,
    pub name: &'static str,
    /// Higher starts first.
    pub priority: u8,
    pub stack_size: usize,
    /// One bit per internal task that must report in every heartbeat window.
    pub heartbeats: u32,
}

impl SubsystemConfig {
    pub fn new(id: SubsystemId) -> Self {
        Self {
            id,
            name: id.name(),
            priority: 1,
            stack_size: DEFAULT_STACK_SIZE,
            heartbeats: 0x1,
        }
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn heartbeats(mut self, mask: u32) -> Self {
        self.heartbeats = mask;
        self
    }
}

/// Mutable state the platform manager and the subsystem's own task share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemState {
    pub status: SubsystemStatus,
    /// Mode this subsystem last acknowledged.
    pub mode: SatelliteMode,
    pub requested_mode: SatelliteMode,
    /// Expected heartbeat bits not yet reported in the current window.
    pub heartbeat_missing: u32,
    /// Free slot for subsystem-specific status.
    pub argument: u32,
    pub last_error: Option<Error>,
}

#[derive(Debug)]
pub struct SubsystemCore {
    config: SubsystemConfig,
    state: Mutex<SubsystemState>,
    signal: Condvar,
    platform: Mutex<Weak<Platform>>,
}

impl SubsystemCore {
    pub fn new(config: SubsystemConfig) -> Self {
        let heartbeats = config.heartbeats;
        Self {
            config,
            state: Mutex::new(SubsystemState {
                status: SubsystemStatus::Booting,
                mode: SatelliteMode::Booting,
                requested_mode: SatelliteMode::Booting,
                heartbeat_missing: heartbeats,
                argument: 0,
                last_error: None,
            }),
            signal: Condvar::new(),
            platform: Mutex::new(Weak::new()),
        }
    }

    pub fn id(&self) -> SubsystemId {
        self.config.id
    }

    pub fn name(&self) -> &'static str {
        self.config.name
    }

    pub fn config(&self) -> &SubsystemConfig {
        &self.config
    }

    pub fn snapshot(&self) -> SubsystemState {
        *self.state()
    }

    pub fn status(&self) -> SubsystemStatus {
        self.state().status
    }

    pub fn set_argument(&self, argument: u32) {
        self.state().argument = argument;
    }

    /// The platform this subsystem is registered with, while it exists.
    pub fn platform(&self) -> Option<Arc<Platform>> {
        utils::lock(&self.platform).upgrade()
    }

    pub(crate) fn attach(&self, platform: Weak<Platform>) {
        *utils::lock(&self.platform) = platform;
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SubsystemState> {
        utils::lock(&self.state)
    }

    pub(crate) fn signal(&self) -> &Condvar {
        &self.signal
    }
}

/// One independently scheduled satellite function.
///
/// Implementors provide their [`SubsystemCore`] and command dispatch; the
/// hooks default to doing nothing and [`Subsystem::run`] defaults to
/// [`main_loop`].
pub trait Subsystem: Send + Sync + 'static {
    fn core(&self) -> &SubsystemCore;

    /// Dispatches the command whose id is the first unread byte of `iframe`.
    fn execute_command(&self, iframe: &mut Frame, oframe: &mut Frame, sequence: u32) -> Result<()>;

    fn describe(&self) -> Vec<CommandDescriptor> {
        Vec::new()
    }

    /// Runs once on the subsystem's task before it first reports ready.
    fn boot(&self, _platform: &Platform) -> Result<()> {
        Ok(())
    }

    /// Adapts to a new satellite mode; an error is fatal for the subsystem.
    fn enter_mode(&self, _platform: &Platform, _mode: SatelliteMode) -> Result<()> {
        Ok(())
    }

    /// Called once per period when no mode change is pending.
    fn periodic(&self, _platform: &Platform) -> Result<()> {
        Ok(())
    }

    fn self_test(&self) -> Vec<SelfTestReport> {
        Vec::new()
    }

    fn run(self: Arc<Self>, platform: Arc<Platform>) {
        main_loop(self.as_ref(), &platform);
    }
}

/// Boot, report ready, then alternate between acknowledging mode changes
/// and heartbeating until the platform stops.
pub fn main_loop<S: Subsystem + ?Sized>(ss: &S, platform: &Platform) {
    let core = ss.core();
    if let Err(e) = ss.boot(platform) {
        platform.ss_report_error(core, e);
        return;
    }
    platform.ss_is_ready(core);

    let period = platform.timing().period;
    while platform.is_running() {
        match platform.wait_mode_change(core, period) {
            Some(mode) => match ss.enter_mode(platform, mode) {
                Ok(()) => {
                    platform.ss_is_ready(core);
                    // Failed by the platform while entering the mode.
                    if core.status() == SubsystemStatus::FatalError {
                        return;
                    }
                }
                Err(e) => {
                    platform.ss_report_error(core, e);
                    return;
                }
            },
            None => {
                if let Err(e) = ss.periodic(platform) {
                    warn!("{}: periodic work failed: {}", core.name(), e);
                }
                platform.ss_is_alive(core, core.config().heartbeats);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_codes() {
        for id in SubsystemId::ALL {
            assert_eq!(SubsystemId::from_code(id.code()).unwrap(), id);
            assert_eq!(SubsystemId::from_name(id.name()).unwrap(), id);
        }
        assert_eq!(SubsystemId::from_code(7).unwrap_err(), Error::NoEnt);
    }

    #[test]
    fn test_mode_codes() {
        assert_eq!(SatelliteMode::from_code(4).unwrap(), SatelliteMode::LowPower);
        assert_eq!(SatelliteMode::from_code(5).unwrap_err(), Error::Illegal);
        assert_eq!("low-power".parse::<SatelliteMode>().unwrap(), SatelliteMode::LowPower);
    }
}
