//! ==============================================================================
//! sensorbox - watchdog-supervised temperature sensor node
//! ==============================================================================
//!
//! reads one-wire temperature probes, shows them on a small screen and
//! publishes hourly readings to a git-backed content store. every wait is
//! bounded and watchdog-fed; only a dead screen or a missing probe halts it.
//!
//! module map:
//!     - config.rs     sensorbox.toml schema and loader
//!     - domain.rs     RomCode, Sensor, DeviceState, Record
//!     - error.rs      unified error type
//!     - hal/          capability traits, linux and simulated peripherals
//!     - watchdog.rs   hardware watchdog and fed sleeps
//!     - sensing.rs    bus discovery and conversion cycles
//!     - network/      wifi, ntp, remote sensor config, http transport
//!     - publish.rs    per-sensor record upserts
//!     - status.rs     everything drawn on screen
//!     - bringup.rs    power-on sequence and halt states
//!     - runtime.rs    the supervised run loop
//!
//! ==============================================================================

pub mod bringup;
pub mod config;
pub mod domain;
pub mod error;
pub mod hal;
pub mod network;
pub mod publish;
pub mod runtime;
pub mod sensing;
pub mod status;
pub mod watchdog;

pub use bringup::{bring_up, BringUp, HaltReason, HaltedDevice};
pub use config::DeviceConfig;
pub use error::{Error, Result};
pub use hal::{OperatingMode, Peripherals};
pub use runtime::{CycleOutcome, SensorBox};
