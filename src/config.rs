//! Board description loaded from JSON.

use crate::channel::{ChannelConfig, ChannelFlags, ChannelParams};
use crate::drivers::bus::DEFAULT_BUS_TIMEOUT;
use crate::drivers::DriverKind;
use crate::error::{Error, Result};
use crate::platform::PlatformTiming;
use crate::subsystems::SatelliteMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverConfig {
    pub name: String,
    pub kind: DriverKind,
    /// Serialise every channel of this driver behind one bus lock.
    #[serde(default)]
    pub shared_bus: bool,
    #[serde(default = "default_bus_timeout_ms")]
    pub bus_timeout_ms: u64,
}

impl DriverConfig {
    pub fn new(name: &str, kind: DriverKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            shared_bus: false,
            bus_timeout_ms: default_bus_timeout_ms(),
        }
    }

    pub fn shared_bus(mut self) -> Self {
        self.shared_bus = true;
        self
    }

    pub fn bus_timeout(&self) -> Option<Duration> {
        self.shared_bus.then(|| Duration::from_millis(self.bus_timeout_ms))
    }
}

fn default_bus_timeout_ms() -> u64 {
    DEFAULT_BUS_TIMEOUT.as_millis() as u64
}

fn default_lock_timeout_ms() -> u64 {
    100
}

fn default_transaction_timeout_ms() -> u64 {
    100
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub name: String,
    /// Name of a [`DriverConfig`].
    pub driver: String,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_transaction_timeout_ms")]
    pub transaction_timeout_ms: u64,
    #[serde(default)]
    pub no_auto_lock: bool,
    pub params: ChannelParams,
}

impl ChannelSpec {
    pub fn new(name: &str, driver: &str, params: ChannelParams) -> Self {
        Self {
            name: name.to_string(),
            driver: driver.to_string(),
            lock_timeout_ms: default_lock_timeout_ms(),
            transaction_timeout_ms: default_transaction_timeout_ms(),
            no_auto_lock: false,
            params,
        }
    }

    pub fn transaction_timeout_ms(mut self, ms: u64) -> Self {
        self.transaction_timeout_ms = ms;
        self
    }

    pub fn channel_config(&self) -> ChannelConfig {
        let mut flags = ChannelFlags::empty();
        if self.no_auto_lock {
            flags |= ChannelFlags::NO_AUTO_LOCK;
        }
        ChannelConfig {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            transaction_timeout: Duration::from_millis(self.transaction_timeout_ms),
            flags,
            params: self.params.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FramePoolConfig {
    pub frames: usize,
    pub frame_size: usize,
}

impl Default for FramePoolConfig {
    fn default() -> Self {
        Self {
            frames: 16,
            frame_size: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformConfig {
    pub period_ms: u64,
    pub mode_change_timeout_ms: u64,
    pub heartbeat_window_ms: u64,
    #[serde(default)]
    pub escalate_heartbeat: bool,
    pub initial_mode: SatelliteMode,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        let timing = PlatformTiming::default();
        Self {
            period_ms: timing.period.as_millis() as u64,
            mode_change_timeout_ms: timing.mode_change_timeout.as_millis() as u64,
            heartbeat_window_ms: timing.heartbeat_window.as_millis() as u64,
            escalate_heartbeat: timing.escalate_heartbeat,
            initial_mode: SatelliteMode::Mission,
        }
    }
}

impl PlatformConfig {
    pub fn timing(&self) -> PlatformTiming {
        PlatformTiming {
            period: Duration::from_millis(self.period_ms),
            mode_change_timeout: Duration::from_millis(self.mode_change_timeout_ms),
            heartbeat_window: Duration::from_millis(self.heartbeat_window_ms),
            escalate_heartbeat: self.escalate_heartbeat,
        }
    }
}

/// Which channel each subsystem talks through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsystemWiring {
    pub power: String,
    pub thermal: String,
    pub uplink: String,
    pub downlink: String,
    #[serde(default)]
    pub beacon_interval_ms: Option<u64>,
}

impl Default for SubsystemWiring {
    fn default() -> Self {
        Self {
            power: "eps".into(),
            thermal: "thermal".into(),
            uplink: "uplink".into(),
            downlink: "downlink".into(),
            beacon_interval_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardConfig {
    pub drivers: Vec<DriverConfig>,
    pub channels: Vec<ChannelSpec>,
    #[serde(default)]
    pub frame_pool: FramePoolConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
    #[serde(default)]
    pub subsystems: SubsystemWiring,
    /// Volatile NVRAM when absent.
    #[serde(default)]
    pub nvram: Option<PathBuf>,
}

impl Default for BoardConfig {
    /// Self-contained host board: simulated EPS and thermal boards on one
    /// shared bus, uplink and downlink as memory loopbacks.
    fn default() -> Self {
        Self {
            drivers: vec![
                DriverConfig::new("i2c", DriverKind::Peripheral).shared_bus(),
                DriverConfig::new("loopback", DriverKind::Memory),
            ],
            channels: vec![
                ChannelSpec::new(
                    "eps",
                    "i2c",
                    ChannelParams::Peripheral {
                        model: "eps".into(),
                        config: String::new(),
                    },
                ),
                ChannelSpec::new(
                    "thermal",
                    "i2c",
                    ChannelParams::Peripheral {
                        model: "thermal".into(),
                        config: String::new(),
                    },
                ),
                ChannelSpec::new("uplink", "loopback", ChannelParams::Memory { capacity: 1024 })
                    .transaction_timeout_ms(20),
                ChannelSpec::new("downlink", "loopback", ChannelParams::Memory { capacity: 4096 })
                    .transaction_timeout_ms(20),
            ],
            frame_pool: FramePoolConfig::default(),
            platform: PlatformConfig::default(),
            subsystems: SubsystemWiring::default(),
            nvram: None,
        }
    }
}

impl BoardConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| {
            warn!("invalid board config: {}", e);
            Error::Illegal
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|_| Error::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = BoardConfig::from_json(
            r#"{
                "drivers": [{"name": "mem", "kind": "memory"}],
                "channels": [{"name": "a", "driver": "mem", "params": {"memory": {"capacity": 8}}}]
            }"#,
        )
        .unwrap();
        assert_eq!(config.channels[0].lock_timeout_ms, 100);
        assert!(!config.drivers[0].shared_bus);
        assert_eq!(config.drivers[0].bus_timeout(), None);
        assert_eq!(config.platform.initial_mode, SatelliteMode::Mission);
        assert_eq!(config.subsystems.power, "eps");
    }

    #[test]
    fn test_default_board_serialises() {
        let config = BoardConfig::default();
        let restored = BoardConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(restored, config);
    }

    #[test]
    fn test_garbage_is_illegal() {
        assert_eq!(BoardConfig::from_json("{").unwrap_err(), Error::Illegal);
    }
}
