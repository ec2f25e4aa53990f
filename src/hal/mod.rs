//! ==============================================================================
//! hal - Hardware Abstraction Layer
//! ==============================================================================
//!
//! purpose:
//!     one capability trait per peripheral the device talks to, and the
//!     bundle that hands a full set of them to the bring-up sequencer.
//!     abstracts away the difference between running on a real Raspberry Pi
//!     (sysfs one-wire, NetworkManager, /dev/watchdog) and a development
//!     machine or test harness (simulations).
//!
//! design philosophy:
//!     - "Explicit Mode": `OperatingMode` picks the implementations. nothing
//!       falls back to a mock because an import failed.
//!     - "Compile Anywhere": rppal is only pulled in by feature="hardware".
//!     - "Observable Fakes": every simulation is a cheap clone over shared
//!       state so a test can keep a handle after moving it into the device.
//!
//! relationships:
//!     - used by: bringup.rs, runtime.rs, sensing.rs, network/*
//!     - implements: linux.rs (real), sim.rs (simulation)
//!
//! ==============================================================================

pub mod linux;
pub mod sim;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::DeviceConfig;
use crate::domain::{RomCode, WifiIdentity};
use crate::error::{BusError, ClockError, DisplayError, RadioError, Result};
use crate::network::{HttpClient, TimeTransport};
use crate::watchdog::{HardwareWatchdog, NoopWatchdog, Watchdog};

/// How the device was started; selects every peripheral implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OperatingMode {
    /// Real peripherals, hardware watchdog armed.
    Production,
    /// Real peripherals, watchdog disabled.
    Development,
    /// Simulated peripherals, watchdog disabled.
    UnitTesting,
}

impl OperatingMode {
    pub fn watchdog_enabled(self) -> bool {
        matches!(self, OperatingMode::Production)
    }
}

// ==============================================================================
// capability traits
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    Black,
    White,
    Gray,
    Red,
    Green,
    Yellow,
}

/// Top-left pixel coordinate of a draw call.
pub type Point = (i32, i32);

/// Screen the device reports its status on.
pub trait DisplaySurface {
    fn init(&mut self) -> std::result::Result<(), DisplayError>;
    fn fill(&mut self, color: Color) -> std::result::Result<(), DisplayError>;
    fn text(&mut self, at: Point, text: &str, color: Color, size: u8) -> std::result::Result<(), DisplayError>;
    fn hline(&mut self, at: Point, length: u32, color: Color) -> std::result::Result<(), DisplayError>;
}

/// One-wire bus with DS18x20-style temperature probes.
pub trait OneWireBus {
    fn scan(&mut self) -> std::result::Result<Vec<RomCode>, BusError>;
    /// Start a conversion on every device; readings are valid after the settle time.
    fn convert_all(&mut self) -> std::result::Result<(), BusError>;
    fn read_celsius(&mut self, rom: &RomCode) -> std::result::Result<f64, BusError>;
}

/// Station-mode Wi-Fi radio.
///
/// Every call must return well inside the watchdog interval; callers feed
/// between calls, not during them.
#[async_trait(?Send)]
pub trait RadioLink {
    async fn activate(&mut self) -> std::result::Result<(), RadioError>;
    /// SSIDs currently visible.
    async fn scan(&mut self) -> std::result::Result<Vec<String>, RadioError>;
    /// Begin associating; completion is observed through `is_connected`.
    async fn connect(&mut self, ssid: &str, passphrase: &str) -> std::result::Result<(), RadioError>;
    async fn is_connected(&mut self) -> bool;
    async fn identity(&mut self) -> Option<WifiIdentity>;
}

/// Wall clock the device stamps readings with.
pub trait ClockSource {
    fn now(&self) -> DateTime<Utc>;
    fn set(&mut self, now: DateTime<Utc>) -> std::result::Result<(), ClockError>;
}

pub trait StatusLed {
    fn set(&mut self, on: bool);
    fn toggle(&mut self);
}

// ==============================================================================
// peripheral bundle
// ==============================================================================

/// Every capability the device needs, already chosen for an operating mode.
pub struct Peripherals {
    pub display: Box<dyn DisplaySurface>,
    pub bus: Box<dyn OneWireBus>,
    pub radio: Box<dyn RadioLink>,
    pub clock: Box<dyn ClockSource>,
    pub led: Box<dyn StatusLed>,
    pub watchdog: Box<dyn Watchdog>,
    pub http: Box<dyn HttpClient>,
    pub time: Box<dyn TimeTransport>,
}

impl Peripherals {
    pub fn for_mode(mode: OperatingMode, config: &DeviceConfig) -> Result<Self> {
        tracing::info!("Selecting peripherals for {:?} mode", mode);
        match mode {
            OperatingMode::UnitTesting => Ok(Self::simulated(config)),
            OperatingMode::Production | OperatingMode::Development => {
                let watchdog: Box<dyn Watchdog> = if mode.watchdog_enabled() {
                    Box::new(HardwareWatchdog::open(&config.hardware.watchdog_device)?)
                } else {
                    Box::new(NoopWatchdog)
                };
                Ok(Self {
                    display: Box::new(linux::ConsoleDisplay::new()),
                    bus: Box::new(linux::SysfsOneWire::new(&config.hardware.one_wire_root)),
                    radio: Box::new(linux::NmcliRadio::new()),
                    clock: Box::new(linux::SystemClock::new()),
                    led: linux::status_led(config.hardware.status_led_pin),
                    watchdog,
                    http: Box::new(crate::network::http::ReqwestClient::new(
                        std::time::Duration::from_secs(config.remote.http_timeout_secs),
                    )?),
                    time: Box::new(crate::network::ntp::UdpTimeTransport),
                })
            }
        }
    }

    /// A self-consistent simulated device: every configured probe is on the bus,
    /// every configured network is visible, publishing succeeds.
    pub fn simulated(config: &DeviceConfig) -> Self {
        sim::SimRig::for_config(config).peripherals()
    }
}

/// Whether the developer jumper is fitted. Always false without GPIO access.
pub fn dev_jumper_engaged(config: &DeviceConfig) -> bool {
    match config.hardware.dev_jumper_pin {
        Some(pin) => linux::read_dev_jumper(pin),
        None => false,
    }
}
