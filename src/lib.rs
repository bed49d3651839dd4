//! # satcore
//!
//! Flight-software core for a small satellite: bounded frames, lockable
//! channels over pluggable drivers, per-subsystem command dispatch and a
//! platform manager that walks every subsystem task through satellite-wide
//! mode changes.
//!
//! ## Features
//!
//! - **Frames**: fixed-capacity byte buffers with a read/write cursor, typed
//!   big/little-endian accessors and a 24-bit command MAC
//! - **Channels**: send/recv/transact with per-direction recursive locks,
//!   timeouts, and fallback composition for drivers that only implement part
//!   of the primitive set
//! - **Drivers**: memory loopback, TCP, remote peripherals over RPC (direct or
//!   through a portmapper), in-process simulated peripherals, shared-bus
//!   serialisation
//! - **Subsystems**: power, thermal, command & data handling and platform,
//!   each with a static command table
//! - **Platform**: mode-change barrier, heartbeat windows, bounded fault log
//!
//! ## Quick Start
//!
//! ```no_run
//! use satcore::board::Board;
//! use satcore::config::BoardConfig;
//!
//! let board = Board::new(BoardConfig::default())?;
//! let platform = board.boot()?;
//! println!("mode: {:?}", platform.current_mode());
//! platform.shutdown()?;
//! board.power_down()?;
//! # Ok::<(), satcore::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`frame`] / [`frame_pool`] - buffers and the shared pool
//! - [`channel`] - the channel layer and the driver contract
//! - [`drivers`] - shipped driver implementations
//! - [`protocol`] - command frame and remote-peripheral wire formats
//! - [`subsystems`] - subsystem framework and the concrete subsystems
//! - [`platform`] - mode manager
//! - [`board`] / [`config`] - wiring a satellite together from JSON
//! - [`sim`] - simulated peripherals and their TCP server

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

pub mod board;
pub mod channel;
pub mod config;
pub mod drivers;
pub mod error;
pub mod fault;
pub mod frame;
pub mod frame_pool;
pub mod nvram;
pub mod platform;
pub mod protocol;
pub mod sim;
pub mod subsystems;
pub mod utils;

pub use board::Board;
pub use channel::{Channel, ChannelDriver, DriverApi};
pub use error::{Error, Result};
pub use frame::Frame;
pub use platform::Platform;
