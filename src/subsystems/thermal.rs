use super::{
    CommandDescriptor, CommandSpec, CommandTable, SatelliteMode, SelfTest, SelfTestReport, SelfTestTable, Subsystem,
    SubsystemConfig, SubsystemCore, SubsystemId,
};
use crate::channel::Channel;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::nvram::Nvram;
use crate::platform::Platform;
use crate::sim::{THERMAL_READ_LEN, THERMAL_REG_READ, THERMAL_REG_SET_HEATER};
use crate::utils;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

pub const CMD_GET_TEMPERATURES: u8 = 0;
pub const CMD_SET_HEATER: u8 = 1;
pub const CMD_SET_THERMOSTAT: u8 = 2;

/// Centi-degrees Celsius.
pub const DEFAULT_HEATER_ON_BELOW: i16 = 500;
pub const DEFAULT_HEATER_OFF_ABOVE: i16 = 1500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Temperatures {
    pub core_cc: i16,
    pub battery_cc: i16,
    pub panel_cc: i16,
    pub heater: bool,
}

impl Temperatures {
    pub fn decode(frame: &mut Frame) -> Result<Self> {
        if !frame.has_enough_data(THERMAL_READ_LEN) {
            return Err(Error::Partial);
        }
        Ok(Self {
            core_cc: frame.get_i16_unchecked(),
            battery_cc: frame.get_i16_unchecked(),
            panel_cc: frame.get_i16_unchecked(),
            heater: frame.get_u8_unchecked() != 0,
        })
    }

    pub fn encode(&self, frame: &mut Frame) -> Result<()> {
        frame.put_i16(self.core_cc)?;
        frame.put_i16(self.battery_cc)?;
        frame.put_i16(self.panel_cc)?;
        frame.put_u8(u8::from(self.heater))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thermostat {
    pub on_below: i16,
    pub off_above: i16,
}

impl Default for Thermostat {
    fn default() -> Self {
        Self {
            on_below: DEFAULT_HEATER_ON_BELOW,
            off_above: DEFAULT_HEATER_OFF_ABOVE,
        }
    }
}

impl Thermostat {
    /// Desired heater state for a core temperature, keeping `current`
    /// inside the hysteresis band.
    pub fn decide(&self, core_cc: i16, current: bool) -> bool {
        if core_cc < self.on_below {
            true
        } else if core_cc > self.off_above {
            false
        } else {
            current
        }
    }
}

/// Temperature sensing and heater control. The heater is only driven by
/// the thermostat while enabled in NVRAM, except in survival mode.
pub struct ThermalSubsystem {
    core: SubsystemCore,
    sensor: Arc<Channel>,
    nvram: Arc<Nvram>,
    thermostat: Mutex<Thermostat>,
    survival: Mutex<bool>,
    last: Mutex<Option<Temperatures>>,
}

static COMMANDS: [Option<CommandSpec<ThermalSubsystem>>; 3] = [
    Some(CommandSpec::new(
        "get_temperatures",
        "Read core, battery and panel temperatures",
        "",
        "core:i16 battery:i16 panel:i16 heater:u8",
        ThermalSubsystem::cmd_get_temperatures,
    )),
    Some(CommandSpec::new(
        "set_heater",
        "Enable or disable heater control; persisted",
        "on:u8",
        "",
        ThermalSubsystem::cmd_set_heater,
    )),
    Some(CommandSpec::new(
        "set_thermostat",
        "Set the heater hysteresis band in centi-degrees",
        "on_below:i16 off_above:i16",
        "",
        ThermalSubsystem::cmd_set_thermostat,
    )),
];
static COMMAND_TABLE: CommandTable<ThermalSubsystem> = CommandTable::new(&COMMANDS);

static SELF_TESTS: [SelfTest<ThermalSubsystem>; 1] = [SelfTest {
    name: "sensor_range",
    run: ThermalSubsystem::test_sensor_range,
}];
static SELF_TEST_TABLE: SelfTestTable<ThermalSubsystem> = SelfTestTable::new(&SELF_TESTS);

impl ThermalSubsystem {
    pub fn new(sensor: Arc<Channel>, nvram: Arc<Nvram>) -> Self {
        Self {
            core: SubsystemCore::new(SubsystemConfig::new(SubsystemId::Thermal).priority(2)),
            sensor,
            nvram,
            thermostat: Mutex::new(Thermostat::default()),
            survival: Mutex::new(false),
            last: Mutex::new(None),
        }
    }

    pub fn thermostat(&self) -> Thermostat {
        *utils::lock(&self.thermostat)
    }

    pub fn last_reading(&self) -> Option<Temperatures> {
        *utils::lock(&self.last)
    }

    pub fn read_temperatures(&self) -> Result<Temperatures> {
        let mut request = Frame::from_slice(&[THERMAL_REG_READ]);
        let mut response = Frame::with_capacity(THERMAL_READ_LEN);
        self.sensor
            .transact(Some(&mut request), Duration::ZERO, Some(&mut response), None)?;
        response.reset_for_reading();
        let reading = Temperatures::decode(&mut response)?;
        *utils::lock(&self.last) = Some(reading);
        self.core.set_argument(reading.core_cc as u16 as u32);
        Ok(reading)
    }

    fn set_heater(&self, on: bool) -> Result<()> {
        let mut frame = Frame::from_slice(&[THERMAL_REG_SET_HEATER, u8::from(on)]);
        self.sensor.send(&mut frame, None)
    }

    fn heater_allowed(&self) -> bool {
        *utils::lock(&self.survival) || self.nvram.read(|data| data.heater)
    }

    /// One thermostat step: read, decide, switch if needed.
    pub fn regulate(&self) -> Result<Temperatures> {
        let reading = self.read_temperatures()?;
        let wanted = self.heater_allowed() && self.thermostat().decide(reading.core_cc, reading.heater);
        if wanted != reading.heater {
            debug!("heater {} at {} cC", if wanted { "on" } else { "off" }, reading.core_cc);
            self.set_heater(wanted)?;
        }
        Ok(reading)
    }

    fn cmd_get_temperatures(&self, _iframe: &mut Frame, oframe: &mut Frame, _seq: u32) -> Result<()> {
        self.read_temperatures()?.encode(oframe)
    }

    fn cmd_set_heater(&self, iframe: &mut Frame, _oframe: &mut Frame, _seq: u32) -> Result<()> {
        let on = iframe.get_u8()? != 0;
        self.nvram.save(|data| data.heater = on);
        if !on && !*utils::lock(&self.survival) {
            self.set_heater(false)?;
        }
        Ok(())
    }

    fn cmd_set_thermostat(&self, iframe: &mut Frame, _oframe: &mut Frame, _seq: u32) -> Result<()> {
        let on_below = iframe.get_i16()?;
        let off_above = iframe.get_i16()?;
        if on_below >= off_above {
            return Err(Error::Illegal);
        }
        *utils::lock(&self.thermostat) = Thermostat { on_below, off_above };
        Ok(())
    }

    fn test_sensor_range(&self) -> Result<()> {
        let reading = self.read_temperatures()?;
        // -100 C to +150 C
        if !(-10_000..=15_000).contains(&reading.core_cc) {
            return Err(Error::Error);
        }
        Ok(())
    }
}

impl Subsystem for ThermalSubsystem {
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
        let survival = mode == SatelliteMode::Survival;
        *utils::lock(&self.survival) = survival;
        if survival {
            info!("🌡️ survival mode: heater control forced on");
        }
        self.regulate().map(|_| ())
    }

    fn periodic(&self, _platform: &Platform) -> Result<()> {
        self.regulate().map(|_| ())
    }

    fn self_test(&self) -> Vec<SelfTestReport> {
        SELF_TEST_TABLE.run_all(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thermostat_hysteresis() {
        let t = Thermostat::default();
        assert!(t.decide(0, false));
        assert!(!t.decide(2000, true));
        assert!(t.decide(1000, true));
        assert!(!t.decide(1000, false));
    }
}
