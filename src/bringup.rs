//! ==============================================================================
//! bringup.rs - device bring-up sequencer
//! ==============================================================================
//!
//! purpose:
//!     take a set of peripherals from power-on to a running `SensorBox`, or to
//!     one of the two terminal halt states. steps run strictly in order and
//!     the watchdog is fed before and after each one.
//!
//! ```text
//!     1. display init          fatal  -> Halt::DisplayUnavailable
//!     2. sensor bus discovery  fatal  -> Halt::MissingSensors
//!     3. radio bring-up        degraded, retried by the run loop
//!     4. clock sync            degraded, retried by the run loop
//!     5. remote config         degraded, retried by the run loop
//! ```
//!
//! relationships:
//!     - used by: main.rs, tests/integration_tests.rs
//!     - produces: runtime::SensorBox
//!
//! ==============================================================================

use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::DeviceConfig;
use crate::domain::DeviceState;
use crate::hal::{Color, Peripherals};
use crate::network::{ntp, remote_config, wifi};
use crate::runtime::SensorBox;
use crate::sensing::{discover_sensors, Discovery};
use crate::status::{boot_line, show_fault, BootRow};
use crate::watchdog::sleep_fed;

/// Fed ticks spent on a degraded-boot fault screen before continuing.
const DEGRADED_NOTICE_TICKS: u32 = 5;

/// Pause of one halted iteration.
const HALT_PAUSE: Duration = Duration::from_secs(2);

const LED_FLASH_STEP: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// The panel could not be initialized.
    DisplayUnavailable(String),
    /// Labels of configured sensors that are not on the bus.
    MissingSensors(Vec<String>),
}

pub enum BringUp {
    Ready(SensorBox),
    Halted(HaltedDevice),
}

/// A device that stopped on a fatal fault. It keeps feeding the watchdog so
/// it stays in this state until someone fixes the wiring.
pub struct HaltedDevice {
    reason: HaltReason,
    peripherals: Peripherals,
}

impl HaltedDevice {
    pub fn reason(&self) -> &HaltReason {
        &self.reason
    }

    /// Hold forever.
    pub async fn hold(mut self) {
        loop {
            self.hold_once().await;
        }
    }

    /// Run `iterations` halted iterations, then return.
    pub async fn hold_for(&mut self, iterations: u32) {
        for _ in 0..iterations {
            self.hold_once().await;
        }
    }

    async fn hold_once(&mut self) {
        if let HaltReason::DisplayUnavailable(_) = self.reason {
            self.flash_led(3).await;
        }
        tokio::time::sleep(HALT_PAUSE).await;
        self.peripherals.watchdog.feed();
    }

    async fn flash_led(&mut self, times: u32) {
        let led = self.peripherals.led.as_mut();
        led.set(false);
        for _ in 0..times * 2 {
            tokio::time::sleep(LED_FLASH_STEP).await;
            led.toggle();
        }
        led.set(false);
    }
}

/// Missing sensors as shown on the fault screen.
pub fn missing_sensors_message(labels: &[String]) -> String {
    format!("Could not initialize sensor(s): {}; check connections", labels.join(", "))
}

/// Run the bring-up sequence.
pub async fn bring_up(config: DeviceConfig, mut p: Peripherals) -> BringUp {
    info!("Bring-up starting ({} configured sensors)", config.sensors.len());

    // 1. display
    p.watchdog.feed();
    if let Err(e) = p.display.init() {
        error!("Could not initialize display: {}", e);
        return BringUp::Halted(HaltedDevice { reason: HaltReason::DisplayUnavailable(e.to_string()), peripherals: p });
    }
    if let Err(e) = p.display.fill(Color::Black) {
        warn!("Could not clear display: {}", e);
    }
    let display = p.display.as_mut();
    boot_line(display, BootRow::Starting, "STARTING", Color::Green);
    boot_line(
        display,
        BootRow::Version,
        &format!("Version {}.{}", env!("CARGO_PKG_VERSION_MAJOR"), env!("CARGO_PKG_VERSION_MINOR")),
        Color::White,
    );
    boot_line(display, BootRow::Screen, "Screen:  OK", Color::White);
    p.watchdog.feed();

    // 2. sensors
    let discovery = match discover_sensors(p.bus.as_mut(), &config.sensors) {
        Ok(discovery) => discovery,
        Err(e) => {
            // a bus that cannot be scanned has no usable sensors on it
            warn!("Sensor bus scan failed: {}", e);
            Discovery::Missing(config.sensors.iter().map(|w| w.label.clone()).collect())
        }
    };
    p.watchdog.feed();
    let sensors = match discovery {
        Discovery::Found(sensors) => sensors,
        Discovery::Missing(labels) => {
            show_fault(p.display.as_mut(), &missing_sensors_message(&labels));
            return BringUp::Halted(HaltedDevice { reason: HaltReason::MissingSensors(labels), peripherals: p });
        }
    };
    boot_line(p.display.as_mut(), BootRow::Sensors, "Sensors: OK", Color::White);
    p.watchdog.feed();
    let mut state = DeviceState::new(sensors);

    // 3. radio
    if let Err(e) = p.radio.activate().await {
        warn!("{}", e);
    }
    p.watchdog.feed();
    state.wifi = if p.radio.is_connected().await {
        p.radio.identity().await
    } else {
        wifi::connect_wifi(p.radio.as_mut(), p.watchdog.as_mut(), &config.wifi).await
    };
    p.watchdog.feed();

    if state.wifi.is_some() {
        boot_line(p.display.as_mut(), BootRow::Wifi, "Wi-Fi:   OK", Color::White);

        // 4. clock
        state.time_synced =
            ntp::sync_clock(p.time.as_mut(), p.clock.as_mut(), &config.time.server, config.time.timeout()).await;
        p.watchdog.feed();
        if state.time_synced {
            let today = p.clock.now().format("Date: %m/%d").to_string();
            boot_line(p.display.as_mut(), BootRow::Clock, "Clock:   OK", Color::White);
            boot_line(p.display.as_mut(), BootRow::Date, &today, Color::White);
        } else {
            show_fault(
                p.display.as_mut(),
                "CLOCK SYNC ERROR, will continue to boot in 5 seconds and retry sync later.",
            );
            sleep_fed(p.watchdog.as_mut(), DEGRADED_NOTICE_TICKS).await;
        }

        // 5. remote config
        state.config_retrieved =
            remote_config::refresh_sensor_config(p.http.as_ref(), &config.remote.config_url, &mut state.sensors)
                .await;
        p.watchdog.feed();
        if state.config_retrieved {
            boot_line(p.display.as_mut(), BootRow::Config, "Config:  OK", Color::White);
        } else {
            boot_line(p.display.as_mut(), BootRow::Config, "Config: ERR", Color::Red);
            show_fault(
                p.display.as_mut(),
                "Could not retrieve sensor config data, will continue to boot in 5 seconds and retry later.",
            );
            sleep_fed(p.watchdog.as_mut(), DEGRADED_NOTICE_TICKS).await;
        }
    } else {
        let display = p.display.as_mut();
        boot_line(display, BootRow::Wifi, "Wi-Fi:  NOT", Color::Yellow);
        boot_line(display, BootRow::Clock, "READY, CHECK", Color::Yellow);
        boot_line(display, BootRow::Date, "NETWORK", Color::Yellow);
        boot_line(display, BootRow::Config, "WILL RETRY", Color::Yellow);
        sleep_fed(p.watchdog.as_mut(), 2).await;
    }
    p.watchdog.feed();

    boot_line(p.display.as_mut(), BootRow::Booting, "BOOTING UP!", Color::White);
    p.watchdog.feed();
    info!(
        "Bring-up complete: wifi={} synced={} config={}",
        state.wifi.is_some(),
        state.time_synced,
        state.config_retrieved
    );

    BringUp::Ready(SensorBox::new(config, p, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::{SimDisplay, SimRig};

    #[tokio::test(start_paused = true)]
    async fn test_boot_screen_rows() {
        let config = DeviceConfig::default();
        let rig = SimRig::for_config(&config);

        let BringUp::Ready(_) = bring_up(config, rig.peripherals()).await else {
            panic!("expected bring-up to succeed");
        };
        // no wifi configured: degraded boot
        let history = rig.display.history();
        assert_eq!(history[0], "STARTING");
        assert_eq!(history[1], "Version 3.6");
        assert!(history.contains(&"WILL RETRY".to_string()));
        assert_eq!(history.last().map(String::as_str), Some("BOOTING UP!"));
        assert!(rig.display.initialized());
        assert!(rig.radio.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_display_halt_flashes_and_feeds() {
        let config = DeviceConfig::default();
        let mut rig = SimRig::for_config(&config);
        rig.display = SimDisplay::failing();

        let BringUp::Halted(mut halted) = bring_up(config, rig.peripherals()).await else {
            panic!("expected halt");
        };
        assert!(matches!(halted.reason(), HaltReason::DisplayUnavailable(_)));

        let feeds = rig.watchdog.feeds();
        halted.hold_for(4).await;
        assert_eq!(rig.watchdog.feeds(), feeds + 4);
        assert_eq!(rig.led.toggles(), 24);
        assert!(!rig.led.on());
        assert!(rig.watchdog.longest_gap() < crate::watchdog::WATCHDOG_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_failure_halts_with_every_label() {
        let config = DeviceConfig::default();
        let rig = SimRig::for_config(&config);
        rig.bus.fail_scan(true);

        let BringUp::Halted(halted) = bring_up(config, rig.peripherals()).await else {
            panic!("expected halt");
        };
        assert_eq!(halted.reason(), &HaltReason::MissingSensors(vec!["1".to_string(), "2".to_string()]));
    }
}
