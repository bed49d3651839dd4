use super::{
    CommandDescriptor, CommandSpec, CommandTable, SatelliteMode, SelfTest, SelfTestReport, SelfTestTable, Subsystem,
    SubsystemConfig, SubsystemCore, SubsystemId,
};
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::nvram::Nvram;
use crate::platform::Platform;
use crate::sim::{EPS_REG_SET_POWER_SAVE, EPS_REG_SET_RAIL, EPS_REG_SET_SOLAR, EPS_REG_STATUS, EPS_STATUS_LEN};
use crate::utils;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Below this the satellite drops from mission to low-power mode.
pub const LOW_BATTERY_MV: u16 = 3300;

pub const CMD_GET_STATUS: u8 = 0;
pub const CMD_SET_RAIL: u8 = 1;
pub const CMD_SET_POWER_SAVE: u8 = 3;
pub const CMD_SET_SOLAR: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PowerStatus {
    pub battery_mv: u16,
    pub battery_ma: i16,
    pub solar_mv: u16,
    pub solar_ma: u16,
    pub battery_level: u8,
    pub flags: u8,
    pub rails: u8,
}

impl PowerStatus {
    pub fn decode(frame: &mut Frame) -> Result<Self> {
        if !frame.has_enough_data(EPS_STATUS_LEN) {
            return Err(Error::Partial);
        }
        Ok(Self {
            battery_mv: frame.get_u16_unchecked(),
            battery_ma: frame.get_i16_unchecked(),
            solar_mv: frame.get_u16_unchecked(),
            solar_ma: frame.get_u16_unchecked(),
            battery_level: frame.get_u8_unchecked(),
            flags: frame.get_u8_unchecked(),
            rails: frame.get_u8_unchecked(),
        })
    }

    pub fn encode(&self, frame: &mut Frame) -> Result<()> {
        if !frame.has_enough_space(EPS_STATUS_LEN) {
            return Err(Error::NoSpace);
        }
        frame.put_u16_unchecked(self.battery_mv);
        frame.put_i16_unchecked(self.battery_ma);
        frame.put_u16_unchecked(self.solar_mv);
        frame.put_u16_unchecked(self.solar_ma);
        frame.put_u8_unchecked(self.battery_level);
        frame.put_u8_unchecked(self.flags);
        frame.put_u8_unchecked(self.rails);
        Ok(())
    }
}

/// Electrical power subsystem, driving an EPS board over one channel.
pub struct PowerSubsystem {
    core: SubsystemCore,
    eps: Arc<Channel>,
    nvram: Arc<Nvram>,
    last_status: Mutex<Option<PowerStatus>>,
}

static COMMANDS: [Option<CommandSpec<PowerSubsystem>>; 5] = [
    Some(CommandSpec::new(
        "get_status",
        "Read battery, solar and rail state from the EPS",
        "",
        "battery_mv:u16 battery_ma:i16 solar_mv:u16 solar_ma:u16 level:u8 flags:u8 rails:u8",
        PowerSubsystem::cmd_get_status,
    )),
    Some(CommandSpec::new(
        "set_rail",
        "Switch one power rail",
        "rail:u8 on:u8",
        "",
        PowerSubsystem::cmd_set_rail,
    )),
    None,
    Some(CommandSpec::new(
        "set_power_save",
        "Enable or disable power saving; persisted",
        "on:u8",
        "",
        PowerSubsystem::cmd_set_power_save,
    )),
    Some(CommandSpec::new(
        "set_solar",
        "Connect or disconnect the solar array",
        "on:u8",
        "",
        PowerSubsystem::cmd_set_solar,
    )),
];
static COMMAND_TABLE: CommandTable<PowerSubsystem> = CommandTable::new(&COMMANDS);

static SELF_TESTS: [SelfTest<PowerSubsystem>; 1] = [SelfTest {
    name: "eps_link",
    run: PowerSubsystem::test_eps_link,
}];
static SELF_TEST_TABLE: SelfTestTable<PowerSubsystem> = SelfTestTable::new(&SELF_TESTS);

impl PowerSubsystem {
    pub fn new(eps: Arc<Channel>, nvram: Arc<Nvram>) -> Self {
        Self {
            core: SubsystemCore::new(SubsystemConfig::new(SubsystemId::Power).priority(3)),
            eps,
            nvram,
            last_status: Mutex::new(None),
        }
    }

    pub fn last_status(&self) -> Option<PowerStatus> {
        *utils::lock(&self.last_status)
    }

    /// Fresh status from the EPS; `Partial` on a short answer.
    pub fn read_status(&self) -> Result<PowerStatus> {
        let mut request = Frame::from_slice(&[EPS_REG_STATUS]);
        let mut response = Frame::with_capacity(EPS_STATUS_LEN);
        self.eps
            .transact(Some(&mut request), Duration::ZERO, Some(&mut response), None)?;
        response.reset_for_reading();
        let status = PowerStatus::decode(&mut response)?;

        *utils::lock(&self.last_status) = Some(status);
        self.core.set_argument(u32::from(status.battery_mv));
        Ok(status)
    }

    fn eps_write(&self, bytes: &[u8]) -> Result<()> {
        let mut frame = Frame::from_slice(bytes);
        self.eps.send(&mut frame, None)
    }

    fn set_power_save(&self, on: bool) -> Result<()> {
        self.eps_write(&[EPS_REG_SET_POWER_SAVE, u8::from(on)])
    }

    fn cmd_get_status(&self, _iframe: &mut Frame, oframe: &mut Frame, _seq: u32) -> Result<()> {
        self.read_status()?.encode(oframe)
    }

    fn cmd_set_rail(&self, iframe: &mut Frame, _oframe: &mut Frame, _seq: u32) -> Result<()> {
        let rail = iframe.get_u8()?;
        let on = iframe.get_u8()?;
        self.eps_write(&[EPS_REG_SET_RAIL, rail, on])
    }

    fn cmd_set_power_save(&self, iframe: &mut Frame, _oframe: &mut Frame, _seq: u32) -> Result<()> {
        let on = iframe.get_u8()? != 0;
        self.set_power_save(on)?;
        self.nvram.save(|data| data.power_save = on);
        Ok(())
    }

    fn cmd_set_solar(&self, iframe: &mut Frame, _oframe: &mut Frame, _seq: u32) -> Result<()> {
        let on = iframe.get_u8()?;
        self.eps_write(&[EPS_REG_SET_SOLAR, on])
    }

    fn test_eps_link(&self) -> Result<()> {
        let status = self.read_status()?;
        if status.battery_mv == 0 {
            return Err(Error::Error);
        }
        Ok(())
    }
}

impl Subsystem for PowerSubsystem {
    fn core(&self) -> &SubsystemCore {
        &self.core
    }

    fn execute_command(&self, iframe: &mut Frame, oframe: &mut Frame, sequence: u32) -> Result<()> {
        COMMAND_TABLE.execute(self, iframe, oframe, sequence)
    }

    fn describe(&self) -> Vec<CommandDescriptor> {
        COMMAND_TABLE.describe()
    }

    fn boot(&self, _platform: &Platform) -> Result<()> {
        let power_save = self.nvram.read(|data| data.power_save);
        self.set_power_save(power_save)
    }

    fn enter_mode(&self, _platform: &Platform, mode: SatelliteMode) -> Result<()> {
        let power_save = match mode {
            SatelliteMode::LowPower | SatelliteMode::Survival => true,
            _ => self.nvram.read(|data| data.power_save),
        };
        self.set_power_save(power_save)
    }

    fn periodic(&self, platform: &Platform) -> Result<()> {
        let status = self.read_status()?;
        if status.battery_mv < LOW_BATTERY_MV && platform.current_mode() == SatelliteMode::Mission {
            warn!("🔋 battery at {} mV, requesting low-power mode", status.battery_mv);
            match platform.request_mode_change(SatelliteMode::LowPower) {
                Ok(()) | Err(Error::Busy) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn self_test(&self) -> Vec<SelfTestReport> {
        let reports = SELF_TEST_TABLE.run_all(self);
        info!("power self test: {}/{} passed", reports.iter().filter(|r| r.passed()).count(), reports.len());
        reports
    }
}
