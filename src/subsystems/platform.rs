use super::{
    CommandDescriptor, CommandSpec, CommandTable, SatelliteMode, Subsystem, SubsystemConfig, SubsystemCore,
    SubsystemId, SubsystemStatus,
};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::nvram::Nvram;
use crate::platform::{Platform, TransitionState};
use crate::utils;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::warn;

pub const CMD_GET_MODE: u8 = 0;
pub const CMD_SET_MODE: u8 = 1;
pub const CMD_GET_STATUS: u8 = 2;
pub const CMD_GET_FAULTS: u8 = 3;
pub const CMD_GET_UPTIME: u8 = 4;
pub const CMD_RESOLVE_FAULT: u8 = 5;
pub const CMD_CLEAR_FAULTS: u8 = 6;

/// Ground-facing view of the platform manager. Its task also drives
/// transition bookkeeping and the heartbeat window.
pub struct PlatformSubsystem {
    core: SubsystemCore,
    nvram: Arc<Nvram>,
    last_heartbeat_check: Mutex<Instant>,
}

static COMMANDS: [Option<CommandSpec<PlatformSubsystem>>; 7] = [
    Some(CommandSpec::new(
        "get_mode",
        "Current satellite mode",
        "",
        "mode:u8",
        PlatformSubsystem::cmd_get_mode,
    )),
    Some(CommandSpec::new(
        "set_mode",
        "Request a satellite mode change",
        "mode:u8",
        "",
        PlatformSubsystem::cmd_set_mode,
    )),
    Some(CommandSpec::new(
        "get_status",
        "Status of every registered subsystem",
        "",
        "count:u8 [id:u8 status:u8 mode:u8 error:u8]*",
        PlatformSubsystem::cmd_get_status,
    )),
    Some(CommandSpec::new(
        "get_faults",
        "Unresolved faults, oldest first",
        "",
        "count:u8 [id:u32 ssid:u8 kind:u8 timestamp_ms:u32]*",
        PlatformSubsystem::cmd_get_faults,
    )),
    Some(CommandSpec::new(
        "get_uptime",
        "Milliseconds since start",
        "",
        "uptime_ms:u64",
        PlatformSubsystem::cmd_get_uptime,
    )),
    Some(CommandSpec::new(
        "resolve_fault",
        "Mark a fault resolved",
        "id:u32",
        "",
        PlatformSubsystem::cmd_resolve_fault,
    )),
    Some(CommandSpec::new(
        "clear_faults",
        "Drop resolved faults from the history",
        "",
        "cleared:u8",
        PlatformSubsystem::cmd_clear_faults,
    )),
];
static COMMAND_TABLE: CommandTable<PlatformSubsystem> = CommandTable::new(&COMMANDS);

const STATUS_ENTRY_SIZE: usize = 4;
const FAULT_ENTRY_SIZE: usize = 10;

impl PlatformSubsystem {
    pub fn new(nvram: Arc<Nvram>) -> Self {
        Self {
            core: SubsystemCore::new(SubsystemConfig::new(SubsystemId::Platform).priority(5)),
            nvram,
            last_heartbeat_check: Mutex::new(Instant::now()),
        }
    }

    fn platform(&self) -> Result<Arc<Platform>> {
        self.core.platform().ok_or(Error::Illegal)
    }

    fn cmd_get_mode(&self, _iframe: &mut Frame, oframe: &mut Frame, _seq: u32) -> Result<()> {
        oframe.put_u8(self.platform()?.current_mode().code())
    }

    /// Only requests the change; commands run on the CDH task, which has to
    /// acknowledge the new mode itself.
    fn cmd_set_mode(&self, iframe: &mut Frame, _oframe: &mut Frame, _seq: u32) -> Result<()> {
        let mode = SatelliteMode::from_code(iframe.get_u8()?)?;
        if matches!(mode, SatelliteMode::Booting | SatelliteMode::Initializing) {
            return Err(Error::Illegal);
        }
        self.platform()?.request_mode_change(mode)
    }

    fn cmd_get_status(&self, _iframe: &mut Frame, oframe: &mut Frame, _seq: u32) -> Result<()> {
        let statuses = self.platform()?.statuses();
        if !oframe.has_enough_space(1 + statuses.len() * STATUS_ENTRY_SIZE) {
            return Err(Error::NoSpace);
        }
        oframe.put_u8_unchecked(statuses.len() as u8);
        for report in statuses {
            oframe.put_u8_unchecked(report.id.code());
            oframe.put_u8_unchecked(report.state.status as u8);
            oframe.put_u8_unchecked(report.state.mode.code());
            oframe.put_u8_unchecked(report.state.last_error.map_or(0, |e| e.code()));
        }
        Ok(())
    }

    /// As many unresolved faults as fit.
    fn cmd_get_faults(&self, _iframe: &mut Frame, oframe: &mut Frame, _seq: u32) -> Result<()> {
        let mut active = self.platform()?.active_faults();
        let room = oframe.available_space().checked_sub(1).ok_or(Error::NoSpace)? / FAULT_ENTRY_SIZE;
        active.truncate(room.min(255));
        oframe.put_u8_unchecked(active.len() as u8);
        for fault in active {
            oframe.put_u32_unchecked(fault.id);
            oframe.put_u8_unchecked(fault.subsystem.code());
            oframe.put_u8_unchecked(fault.kind.code());
            oframe.put_u32_unchecked(fault.timestamp as u32);
        }
        Ok(())
    }

    fn cmd_get_uptime(&self, _iframe: &mut Frame, oframe: &mut Frame, _seq: u32) -> Result<()> {
        oframe.put_u64(utils::uptime_ms())
    }

    /// `NoEnt` if no fault carries the id.
    fn cmd_resolve_fault(&self, iframe: &mut Frame, _oframe: &mut Frame, _seq: u32) -> Result<()> {
        let id = iframe.get_u32()?;
        if !self.platform()?.resolve_fault(id) {
            return Err(Error::NoEnt);
        }
        Ok(())
    }

    fn cmd_clear_faults(&self, _iframe: &mut Frame, oframe: &mut Frame, _seq: u32) -> Result<()> {
        let cleared = self.platform()?.clear_resolved_faults();
        oframe.put_u8(cleared.min(255) as u8)
    }
}

impl Subsystem for PlatformSubsystem {
    fn core(&self) -> &SubsystemCore {
        &self.core
    }

    fn execute_command(&self, iframe: &mut Frame, oframe: &mut Frame, sequence: u32) -> Result<()> {
        COMMAND_TABLE.execute(self, iframe, oframe, sequence)
    }

    fn describe(&self) -> Vec<CommandDescriptor> {
        COMMAND_TABLE.describe()
    }

    fn enter_mode(&self, _platform: &Platform, mode: SatelliteMode) -> Result<()> {
        if !matches!(mode, SatelliteMode::Booting | SatelliteMode::Initializing) {
            self.nvram.save(|data| data.last_mode = mode);
        }
        Ok(())
    }

    fn periodic(&self, platform: &Platform) -> Result<()> {
        if let TransitionState::TimedOut(mode) = platform.poll_transition() {
            warn!("transition to {:?} finished with failed subsystems", mode);
        }

        let window = platform.timing().heartbeat_window;
        let due = {
            let mut last = utils::lock(&self.last_heartbeat_check);
            let due = last.elapsed() >= window;
            if due {
                *last = Instant::now();
            }
            due
        };
        if due {
            let report = platform.check_heartbeats();
            let fatal = platform
                .statuses()
                .iter()
                .filter(|r| r.state.status == SubsystemStatus::FatalError)
                .count();
            self.core.set_argument(((report.missed.len() as u32) << 8) | fatal as u32);
        }
        Ok(())
    }
}
