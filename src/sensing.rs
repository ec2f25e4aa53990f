//! ==============================================================================
//! sensing.rs - bus discovery and temperature sampling
//! ==============================================================================
//!
//! purpose:
//!     - match the configured wiring table against what the one-wire bus reports
//!     - run one conversion cycle over every configured probe
//!
//! relationships:
//!     - used by: bringup.rs (discover_sensors), runtime.rs (update_temperatures)
//!     - uses: hal::OneWireBus
//!
//! ==============================================================================

use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::SensorWiring;
use crate::domain::{celsius_to_fahrenheit, RomCode, Sensor};
use crate::error::{Error, Result};
use crate::hal::OneWireBus;
use crate::watchdog::Watchdog;

/// Conversion time of a 12-bit DS18x20 reading.
pub const SETTLE_TIME: Duration = Duration::from_millis(750);

#[derive(Debug, Clone, PartialEq)]
pub enum Discovery {
    /// One sensor per configured pair, in configured order.
    Found(Vec<Sensor>),
    /// Labels of configured sensors the bus did not report.
    Missing(Vec<String>),
}

/// Scan the bus and check every configured address is present.
/// Devices on the bus that are not configured are ignored.
pub fn discover_sensors(bus: &mut dyn OneWireBus, wiring: &[SensorWiring]) -> Result<Discovery> {
    let scanned: HashSet<RomCode> = bus.scan()?.into_iter().collect();
    debug!("Bus reports {} device(s)", scanned.len());

    let missing: Vec<String> = wiring
        .iter()
        .filter(|w| !scanned.contains(&w.address))
        .map(|w| w.label.clone())
        .collect();
    if !missing.is_empty() {
        return Ok(Discovery::Missing(missing));
    }

    Ok(Discovery::Found(
        wiring.iter().map(|w| Sensor::new(w.address, w.label.clone())).collect(),
    ))
}

/// Convert, settle, then read every sensor in order.
///
/// A read may block for a full conversion when the bus has no bulk
/// conversion, so the watchdog is fed after every sensor.
///
/// The first failing sensor aborts the cycle: its reading becomes `None`,
/// sensors before it hold this cycle's value, sensors after it keep the
/// previous cycle's value.
pub async fn update_temperatures(
    bus: &mut dyn OneWireBus,
    watchdog: &mut dyn Watchdog,
    sensors: &mut [Sensor],
) -> Result<()> {
    bus.convert_all()?;
    tokio::time::sleep(SETTLE_TIME).await;
    watchdog.feed();

    for sensor in sensors.iter_mut() {
        let reading = bus.read_celsius(&sensor.address());
        watchdog.feed();
        match reading {
            Ok(celsius) => {
                let fahrenheit = celsius_to_fahrenheit(celsius);
                debug!("{} ({}): {:.2} F", sensor.label(), sensor.address(), fahrenheit);
                sensor.set_temperature(Some(fahrenheit));
            }
            Err(source) => {
                warn!("Read of {} ({}) failed: {}", sensor.label(), sensor.address(), source);
                sensor.set_temperature(None);
                return Err(Error::SensorRead { label: sensor.label().to_string(), source });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::{SimBus, SimWatchdog};

    fn rom(last: u8) -> RomCode {
        RomCode::new([0x28, 1, 2, 3, 4, 5, 6, last])
    }

    fn wiring() -> Vec<SensorWiring> {
        vec![
            SensorWiring { label: "A1".to_string(), address: rom(0xA1) },
            SensorWiring { label: "B2".to_string(), address: rom(0xB2) },
        ]
    }

    #[test]
    fn test_discovery_ignores_extra_devices() {
        let bus = SimBus::new();
        bus.attach(rom(0xC3), 5.0);
        bus.attach(rom(0xB2), 5.0);
        bus.attach(rom(0xA1), 5.0);

        let found = discover_sensors(&mut bus.clone(), &wiring()).unwrap();
        let Discovery::Found(sensors) = found else { panic!("expected sensors") };
        let addresses: Vec<RomCode> = sensors.iter().map(|s| s.address()).collect();
        assert_eq!(addresses, vec![rom(0xA1), rom(0xB2)]);
        assert_eq!(sensors[0].label(), "A1");
    }

    #[test]
    fn test_discovery_reports_missing_labels() {
        let bus = SimBus::new();
        bus.attach(rom(0xA1), 5.0);
        let found = discover_sensors(&mut bus.clone(), &wiring()).unwrap();
        assert_eq!(found, Discovery::Missing(vec!["B2".to_string()]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_converts_and_waits() {
        let bus = SimBus::new();
        bus.attach(rom(0xA1), 0.0);
        bus.attach(rom(0xB2), 100.0);
        let mut sensors: Vec<Sensor> = wiring().iter().map(|w| Sensor::new(w.address, w.label.clone())).collect();
        let start = tokio::time::Instant::now();

        update_temperatures(&mut bus.clone(), &mut SimWatchdog::new(), &mut sensors).await.unwrap();

        assert!(start.elapsed() >= SETTLE_TIME);
        assert_eq!(bus.conversions(), 1);
        assert_eq!(sensors[0].last_temperature_f(), Some(32.0));
        assert_eq!(sensors[1].last_temperature_f(), Some(212.0));
    }

    // real clock: the reads block the thread
    #[tokio::test]
    async fn test_feeds_after_every_blocking_read() {
        let bus = SimBus::new();
        let mut sensors = Vec::new();
        for i in 0..11u8 {
            bus.attach(rom(i), 3.0);
            sensors.push(Sensor::new(rom(i), i.to_string()));
        }
        bus.set_read_time(Duration::from_millis(150));
        let watchdog = SimWatchdog::new();

        update_temperatures(&mut bus.clone(), &mut watchdog.clone(), &mut sensors).await.unwrap();

        // one after the settle time, one per sensor
        assert_eq!(watchdog.feeds(), 12);
        // all eleven reads back to back would take 1.65 s
        assert!(watchdog.longest_gap() < Duration::from_millis(1200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_read_is_tagged_with_label() {
        let bus = SimBus::new();
        bus.attach(rom(0xA1), 10.0);
        bus.attach(rom(0xB2), 10.0);
        let mut sensors: Vec<Sensor> = wiring().iter().map(|w| Sensor::new(w.address, w.label.clone())).collect();
        update_temperatures(&mut bus.clone(), &mut SimWatchdog::new(), &mut sensors).await.unwrap();

        bus.set_temperature(rom(0xB2), 20.0);
        bus.fail_reads(rom(0xA1));
        let err = update_temperatures(&mut bus.clone(), &mut SimWatchdog::new(), &mut sensors).await.unwrap_err();

        match err {
            Error::SensorRead { label, .. } => assert_eq!(label, "A1"),
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(sensors[0].last_temperature_f(), None);
        // not reached this cycle, keeps the previous value
        assert_eq!(sensors[1].last_temperature_f(), Some(50.0));
    }
}
