//! Simulated hardware behind the peripheral and remote drivers.
//!
//! Each model is a register-style device: a write carries one command
//! (`[register][args..]`), and whatever the command produces is queued for
//! the next read. Models advance their physics on demand from the time
//! elapsed since the previous access.

pub mod server;

use crate::error::{Error, Result};
use heapless::Deque;
use std::time::Instant;

pub const LOOPBACK_CAPACITY: usize = 4096;
const RESPONSE_CAPACITY: usize = 64;

pub const MODEL_LOOPBACK: &str = "loopback";
pub const MODEL_EPS: &str = "eps";
pub const MODEL_THERMAL: &str = "thermal";

/// A device a channel can talk to.
pub trait Peripheral: Send {
    fn model(&self) -> &'static str;

    /// Applies `key=value` pairs separated by `,` or whitespace.
    fn configure(&mut self, config: &str) -> Result<()>;

    /// Accepts bytes from the host; returns how many were consumed, which
    /// may be fewer than offered.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Up to `max` pending bytes, possibly none.
    fn read(&mut self, max: usize) -> Vec<u8>;

    fn pending(&self) -> usize;
}

/// Instantiates a model by name; `NoEnt` for unknown models.
pub fn create(model: &str) -> Result<Box<dyn Peripheral>> {
    match model {
        MODEL_LOOPBACK => Ok(Box::new(Loopback::new())),
        MODEL_EPS => Ok(Box::new(EpsModel::new())),
        MODEL_THERMAL => Ok(Box::new(ThermalModel::new())),
        _ => Err(Error::NoEnt),
    }
}

fn config_pairs(config: &str) -> impl Iterator<Item = Result<(&str, &str)>> {
    config
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .map(|item| item.split_once('=').ok_or(Error::Illegal))
}

fn parse_value<T: std::str::FromStr>(value: &str) -> Result<T> {
    value.parse().map_err(|_| Error::Illegal)
}

fn drain<const N: usize>(queue: &mut Deque<u8, N>, max: usize) -> Vec<u8> {
    let count = max.min(queue.len());
    (0..count).filter_map(|_| queue.pop_front()).collect()
}

/// Echoes written bytes back, bounded by [`LOOPBACK_CAPACITY`].
#[derive(Debug, Default)]
pub struct Loopback {
    buffer: Deque<u8, LOOPBACK_CAPACITY>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Peripheral for Loopback {
    fn model(&self) -> &'static str {
        MODEL_LOOPBACK
    }

    fn configure(&mut self, config: &str) -> Result<()> {
        config_pairs(config).try_for_each(|pair| pair.map(|_| ()))
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        let mut written = 0;
        for &byte in data {
            if self.buffer.push_back(byte).is_err() {
                break;
            }
            written += 1;
        }
        Ok(written)
    }

    fn read(&mut self, max: usize) -> Vec<u8> {
        drain(&mut self.buffer, max)
    }

    fn pending(&self) -> usize {
        self.buffer.len()
    }
}

// Electrical power system registers.
pub const EPS_REG_STATUS: u8 = 0x01;
pub const EPS_REG_SET_RAIL: u8 = 0x02;
pub const EPS_REG_SET_SOLAR: u8 = 0x03;
pub const EPS_REG_SET_POWER_SAVE: u8 = 0x04;
/// battery_mv u16, battery_ma i16, solar_mv u16, solar_ma u16, level u8,
/// flags u8, rails u8
pub const EPS_STATUS_LEN: usize = 11;
pub const EPS_FLAG_CHARGING: u8 = 0x01;
pub const EPS_FLAG_SOLAR: u8 = 0x02;
pub const EPS_FLAG_POWER_SAVE: u8 = 0x04;
pub const EPS_RAIL_COUNT: u8 = 8;

const NOMINAL_VOLTAGE: u16 = 3700;
const CRITICAL_VOLTAGE: u16 = 3200;
const MAX_VOLTAGE: u16 = 4200;
const NOMINAL_CURRENT_MA: u16 = 500;
const SOLAR_CURRENT_MA: u16 = 800;
const INTERNAL_RESISTANCE_MOHM: u16 = 100;

/// Battery, solar array and switchable power rails.
#[derive(Debug)]
pub struct EpsModel {
    battery_mv: u16,
    battery_ma: i16,
    solar_mv: u16,
    solar_ma: u16,
    rails: u8,
    solar_enabled: bool,
    power_save: bool,
    elapsed_ms: u64,
    last_step: Instant,
    responses: Deque<u8, RESPONSE_CAPACITY>,
}

impl EpsModel {
    pub fn new() -> Self {
        Self {
            battery_mv: NOMINAL_VOLTAGE,
            battery_ma: -(NOMINAL_CURRENT_MA as i16),
            solar_mv: 0,
            solar_ma: 0,
            rails: 0xFF,
            solar_enabled: true,
            power_save: false,
            elapsed_ms: 0,
            last_step: Instant::now(),
            responses: Deque::new(),
        }
    }

    pub fn battery_mv(&self) -> u16 {
        self.battery_mv
    }

    pub fn power_save(&self) -> bool {
        self.power_save
    }

    pub fn rails(&self) -> u8 {
        self.rails
    }

    fn battery_level(&self) -> u8 {
        let range = u32::from(MAX_VOLTAGE - CRITICAL_VOLTAGE);
        let above = u32::from(self.battery_mv.saturating_sub(CRITICAL_VOLTAGE));
        ((above * 100) / range).min(100) as u8
    }

    fn step(&mut self) {
        let dt_ms = self.last_step.elapsed().as_millis() as u64;
        self.last_step = Instant::now();
        self.elapsed_ms += dt_ms;
        let dt_s = dt_ms as f32 / 1000.0;

        if self.solar_enabled {
            let orbit_factor = (self.elapsed_ms as f32 * 0.001).sin().abs();
            let efficiency = 0.7 + 0.3 * orbit_factor;
            self.solar_mv = (f32::from(MAX_VOLTAGE) * efficiency) as u16;
            self.solar_ma = (f32::from(SOLAR_CURRENT_MA) * efficiency) as u16;
        } else {
            self.solar_mv = 0;
            self.solar_ma = 0;
        }

        let load_ma = if self.power_save {
            NOMINAL_CURRENT_MA / 2
        } else {
            NOMINAL_CURRENT_MA
        };
        let net_ma = self.solar_ma as i16 - load_ma as i16;
        self.battery_ma = net_ma;

        let sag = (f32::from(net_ma) * f32::from(INTERNAL_RESISTANCE_MOHM) / 1000.0) as i32;
        let target = i32::from(NOMINAL_VOLTAGE) + sag;
        let change = ((target - i32::from(self.battery_mv)) as f32 * dt_s * 0.1) as i32;
        self.battery_mv = (i32::from(self.battery_mv) + change).clamp(0, i32::from(MAX_VOLTAGE)) as u16;
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.battery_ma > 0 {
            flags |= EPS_FLAG_CHARGING;
        }
        if self.solar_enabled {
            flags |= EPS_FLAG_SOLAR;
        }
        if self.power_save {
            flags |= EPS_FLAG_POWER_SAVE;
        }
        flags
    }

    fn queue_status(&mut self) -> Result<()> {
        let mut status = [0u8; EPS_STATUS_LEN];
        status[0..2].copy_from_slice(&self.battery_mv.to_be_bytes());
        status[2..4].copy_from_slice(&self.battery_ma.to_be_bytes());
        status[4..6].copy_from_slice(&self.solar_mv.to_be_bytes());
        status[6..8].copy_from_slice(&self.solar_ma.to_be_bytes());
        status[8] = self.battery_level();
        status[9] = self.flags();
        status[10] = self.rails;
        queue(&mut self.responses, &status)
    }
}

impl Default for EpsModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Peripheral for EpsModel {
    fn model(&self) -> &'static str {
        MODEL_EPS
    }

    fn configure(&mut self, config: &str) -> Result<()> {
        for pair in config_pairs(config) {
            match pair? {
                ("battery_mv", value) => self.battery_mv = parse_value::<u16>(value)?.min(MAX_VOLTAGE),
                ("solar", value) => self.solar_enabled = parse_value(value)?,
                ("rails", value) => self.rails = parse_value(value)?,
                _ => return Err(Error::Illegal),
            }
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.step();
        match data {
            [EPS_REG_STATUS, ..] => self.queue_status()?,
            [EPS_REG_SET_RAIL, rail, on, ..] => {
                if *rail >= EPS_RAIL_COUNT {
                    return Err(Error::Illegal);
                }
                if *on != 0 {
                    self.rails |= 1 << rail;
                } else {
                    self.rails &= !(1 << rail);
                }
            }
            [EPS_REG_SET_SOLAR, on, ..] => self.solar_enabled = *on != 0,
            [EPS_REG_SET_POWER_SAVE, on, ..] => self.power_save = *on != 0,
            [] | [EPS_REG_SET_RAIL | EPS_REG_SET_SOLAR | EPS_REG_SET_POWER_SAVE, ..] => {
                return Err(Error::Illegal)
            }
            _ => return Err(Error::Nack),
        }
        Ok(data.len())
    }

    fn read(&mut self, max: usize) -> Vec<u8> {
        drain(&mut self.responses, max)
    }

    fn pending(&self) -> usize {
        self.responses.len()
    }
}

// Thermal control registers.
pub const THERMAL_REG_READ: u8 = 0x01;
pub const THERMAL_REG_SET_HEATER: u8 = 0x02;
/// core, battery and panel temperatures as i16 centi-degrees, heater u8
pub const THERMAL_READ_LEN: usize = 7;

const NOMINAL_TEMP_C: f32 = 20.0;
const HEATER_POWER_W: f32 = 50.0;
const INTERNAL_HEAT_W: f32 = 25.0;
const THERMAL_MASS_J_PER_K: f32 = 2000.0;
const THERMAL_CONDUCTIVITY: f32 = 0.95;

/// Lumped thermal mass heated by electronics and a heater, losing heat to
/// a configurable ambient.
#[derive(Debug)]
pub struct ThermalModel {
    core_c: f32,
    ambient_c: f32,
    heater_on: bool,
    last_step: Instant,
    responses: Deque<u8, RESPONSE_CAPACITY>,
}

impl ThermalModel {
    pub fn new() -> Self {
        Self {
            core_c: NOMINAL_TEMP_C,
            ambient_c: -20.0,
            heater_on: false,
            last_step: Instant::now(),
            responses: Deque::new(),
        }
    }

    pub fn core_c(&self) -> f32 {
        self.core_c
    }

    pub fn heater_on(&self) -> bool {
        self.heater_on
    }

    fn step(&mut self) {
        let dt_s = self.last_step.elapsed().as_secs_f32();
        self.last_step = Instant::now();

        let heater_w = if self.heater_on { HEATER_POWER_W } else { 0.0 };
        let loss_w = (self.core_c - self.ambient_c) * THERMAL_CONDUCTIVITY * 10.0;
        let net_w = INTERNAL_HEAT_W + heater_w - loss_w;
        self.core_c += net_w * dt_s / THERMAL_MASS_J_PER_K;
    }

    fn battery_c(&self) -> f32 {
        self.core_c + INTERNAL_HEAT_W * 0.1
    }

    fn panel_c(&self) -> f32 {
        self.ambient_c + (self.ambient_c - self.core_c) / 3.0
    }

    fn queue_reading(&mut self) -> Result<()> {
        let mut reading = [0u8; THERMAL_READ_LEN];
        reading[0..2].copy_from_slice(&centi(self.core_c).to_be_bytes());
        reading[2..4].copy_from_slice(&centi(self.battery_c()).to_be_bytes());
        reading[4..6].copy_from_slice(&centi(self.panel_c()).to_be_bytes());
        reading[6] = u8::from(self.heater_on);
        queue(&mut self.responses, &reading)
    }
}

impl Default for ThermalModel {
    fn default() -> Self {
        Self::new()
    }
}

fn centi(celsius: f32) -> i16 {
    (celsius * 100.0).round().clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

fn queue<const N: usize>(responses: &mut Deque<u8, N>, bytes: &[u8]) -> Result<()> {
    if N - responses.len() < bytes.len() {
        return Err(Error::Busy);
    }
    for &byte in bytes {
        responses.push_back(byte).map_err(|_| Error::Busy)?;
    }
    Ok(())
}

impl Peripheral for ThermalModel {
    fn model(&self) -> &'static str {
        MODEL_THERMAL
    }

    fn configure(&mut self, config: &str) -> Result<()> {
        for pair in config_pairs(config) {
            match pair? {
                ("ambient_c", value) => self.ambient_c = parse_value(value)?,
                ("core_c", value) => self.core_c = parse_value(value)?,
                ("heater", value) => self.heater_on = parse_value(value)?,
                _ => return Err(Error::Illegal),
            }
        }
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.step();
        match data {
            [THERMAL_REG_READ, ..] => self.queue_reading()?,
            [THERMAL_REG_SET_HEATER, on, ..] => self.heater_on = *on != 0,
            [] | [THERMAL_REG_SET_HEATER] => return Err(Error::Illegal),
            _ => return Err(Error::Nack),
        }
        Ok(data.len())
    }

    fn read(&mut self, max: usize) -> Vec<u8> {
        drain(&mut self.responses, max)
    }

    fn pending(&self) -> usize {
        self.responses.len()
    }
}
