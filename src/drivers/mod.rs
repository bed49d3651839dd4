//! Channel drivers.

pub mod bus;
pub mod memory;
pub mod peripheral;
pub mod remote;
pub mod tcp;

pub use bus::SharedBusDriver;
pub use memory::MemoryDriver;
pub use peripheral::PeripheralDriver;
pub use remote::{PortmapClient, RemoteDriver};
pub use tcp::TcpDriver;

use crate::channel::DriverApi;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    Memory,
    Tcp,
    Remote,
    Portmapped,
    Peripheral,
}

impl DriverKind {
    /// A fresh driver of this kind. With `shared_bus`, every operation is
    /// serialised behind one bus lock taken with that timeout.
    pub fn create(self, shared_bus: Option<Duration>) -> Box<dyn DriverApi> {
        match self {
            DriverKind::Memory => wrap(MemoryDriver::new(), shared_bus),
            DriverKind::Tcp => wrap(TcpDriver::new(), shared_bus),
            DriverKind::Remote => wrap(RemoteDriver::new(), shared_bus),
            DriverKind::Portmapped => wrap(RemoteDriver::portmapped(), shared_bus),
            DriverKind::Peripheral => wrap(PeripheralDriver::new(), shared_bus),
        }
    }
}

pub fn wrap<D: DriverApi + 'static>(driver: D, shared_bus: Option<Duration>) -> Box<dyn DriverApi> {
    match shared_bus {
        Some(timeout) => Box::new(SharedBusDriver::with_timeout(driver, timeout)),
        None => Box::new(driver),
    }
}
