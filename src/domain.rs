//! ==============================================================================
//! domain.rs - sensors, device state and published records
//! ==============================================================================
//!
//! purpose:
//!     the data the device carries between bring-up and every loop cycle.
//!
//! ownership rules:
//!     - `Sensor::set_temperature` is called only by sensing.rs
//!     - `Sensor::assign` (label, name, active flag) only by network/remote_config.rs
//!     - `DeviceState` is owned by the run loop, nothing else holds it
//!
//! ==============================================================================

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::time::Instant;

use crate::error::{BusError, Error, Result};

pub const UNKNOWN_NAME: &str = "UNKNOWN_NAME";
pub const INACTIVE_NAME: &str = "INACTIVE SENSOR";

/// Calendar format used in record paths and bodies.
pub const RECORD_TIME_FORMAT: &str = "%Y-%m-%d-%H-%M-%S";

// ==============================================================================
// one-wire rom code
// ==============================================================================

/// 64-bit one-wire ROM code in bus order: family byte, 48-bit serial (LSB first), CRC.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RomCode([u8; 8]);

impl RomCode {
    pub const fn new(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn family(&self) -> u8 {
        self.0[0]
    }

    /// Lowercase hex, the identifier used in config, paths and records.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whether the trailing byte is the Maxim CRC-8 of the first seven.
    pub fn crc_valid(&self) -> bool {
        crc8_maxim(&self.0[..7]) == self.0[7]
    }
}

impl FromStr for RomCode {
    type Err = BusError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut bytes = [0u8; 8];
        hex::decode_to_slice(s.trim(), &mut bytes)
            .map_err(|e| BusError::InvalidRom(format!("{}: {}", s, e)))?;
        Ok(Self(bytes))
    }
}

impl TryFrom<String> for RomCode {
    type Error = BusError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RomCode> for String {
    fn from(rom: RomCode) -> Self {
        rom.to_hex()
    }
}

impl fmt::Display for RomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RomCode({})", self.to_hex())
    }
}

/// Dallas/Maxim CRC-8 (polynomial x^8 + x^5 + x^4 + 1, reflected).
pub fn crc8_maxim(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in data {
        let mut b = byte;
        for _ in 0..8 {
            let mix = (crc ^ b) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            b >>= 1;
        }
    }
    crc
}

// ==============================================================================
// sensor
// ==============================================================================

/// One physical probe. Only the sensing engine writes the temperature and
/// only the remote config applier writes label, name and active flag.
#[derive(Debug, Clone, PartialEq)]
pub struct Sensor {
    address: RomCode,
    label: String,
    display_name: String,
    last_temperature_f: Option<f64>,
    is_active: bool,
}

impl Sensor {
    pub fn new(address: RomCode, label: impl Into<String>) -> Self {
        Self {
            address,
            label: label.into(),
            display_name: UNKNOWN_NAME.to_string(),
            last_temperature_f: None,
            is_active: false,
        }
    }

    pub fn address(&self) -> RomCode {
        self.address
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn last_temperature_f(&self) -> Option<f64> {
        self.last_temperature_f
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub(crate) fn set_temperature(&mut self, fahrenheit: Option<f64>) {
        self.last_temperature_f = fahrenheit;
    }

    pub(crate) fn assign(&mut self, label: String, display_name: String, is_active: bool) {
        self.label = label;
        self.display_name = display_name;
        self.is_active = is_active;
    }
}

/// Convert a probe reading to the unit published downstream.
pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

// ==============================================================================
// device state
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WifiIdentity {
    pub ssid: String,
    pub ip: String,
}

/// Everything the run loop knows about the device.
#[derive(Debug, Clone)]
pub struct DeviceState {
    pub sensors: Vec<Sensor>,
    pub wifi: Option<WifiIdentity>,
    /// Set once by the first successful sync, never cleared.
    pub time_synced: bool,
    /// Set once by the first successful config fetch, never cleared.
    pub config_retrieved: bool,
    pub last_sensed_at: Option<DateTime<Utc>>,
    pub last_published_at: Option<DateTime<Utc>>,
    pub last_publish_had_errors: bool,
    /// Monotonic time of the last fully successful publish.
    pub last_publish_instant: Option<Instant>,
}

impl DeviceState {
    pub fn new(sensors: Vec<Sensor>) -> Self {
        Self {
            sensors,
            wifi: None,
            time_synced: false,
            config_retrieved: false,
            last_sensed_at: None,
            last_published_at: None,
            last_publish_had_errors: false,
            last_publish_instant: None,
        }
    }
}

// ==============================================================================
// record
// ==============================================================================

/// One published reading. Only built from a sensor that has a temperature.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub address_hex: String,
    pub sensor_name: String,
    pub temperature_f: f64,
    pub measured_at: DateTime<Utc>,
}

impl Record {
    pub fn from_sensor(sensor: &Sensor, measured_at: DateTime<Utc>) -> Result<Self> {
        let temperature_f = sensor
            .last_temperature_f
            .ok_or_else(|| Error::IncompleteRecord { address: sensor.address.to_hex() })?;
        Ok(Self {
            address_hex: sensor.address.to_hex(),
            sensor_name: sensor.display_name.clone(),
            temperature_f,
            measured_at,
        })
    }

    pub fn timestamp(&self) -> String {
        self.measured_at.format(RECORD_TIME_FORMAT).to_string()
    }

    /// `_posts/<hex>/<timestamp>_<hex>_<name>.html`
    pub fn path(&self) -> String {
        let name = self.sensor_name.replace(' ', "_");
        format!(
            "_posts/{hex}/{ts}_{hex}_{name}.html",
            hex = self.address_hex,
            ts = self.timestamp(),
            name = name
        )
    }

    pub fn body(&self) -> String {
        // {:?} keeps the trailing ".0" on whole degrees
        format!(
            "---\nsensor_id: {}\nsensor_name: {}\ntemperature: {:?}\nmeasurement_time: {}\n---\n{{}}\n",
            self.address_hex,
            self.sensor_name,
            self.temperature_f,
            self.timestamp()
        )
    }

    pub fn encoded_body(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.body())
    }
}

// ==============================================================================
// tests
// ==============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn rom() -> RomCode {
        "28ff641e8216035c".parse().unwrap()
    }

    #[test]
    fn test_fahrenheit_conversion_exact() {
        assert_eq!(celsius_to_fahrenheit(0.0), 32.0);
        assert_eq!(celsius_to_fahrenheit(100.0), 212.0);
        assert_eq!(celsius_to_fahrenheit(-40.0), -40.0);
    }

    #[test]
    fn test_rom_code_hex() {
        let rom = rom();
        assert_eq!(rom.to_hex(), "28ff641e8216035c");
        assert_eq!(rom.family(), 0x28);
        assert!("28ff".parse::<RomCode>().is_err());
        assert!("zz".parse::<RomCode>().is_err());
    }

    #[test]
    fn test_crc8_known_rom() {
        // example ROM from the DS18B20 datasheet family, CRC computed over 7 bytes
        let mut bytes = [0x28, 0x2d, 0x35, 0x8f, 0x03, 0x00, 0x00, 0x00];
        bytes[7] = crc8_maxim(&bytes[..7]);
        assert!(RomCode::new(bytes).crc_valid());
        bytes[7] ^= 0xFF;
        assert!(!RomCode::new(bytes).crc_valid());
        assert_eq!(crc8_maxim(&[]), 0);
    }

    #[test]
    fn test_new_sensor_defaults() {
        let s = Sensor::new(rom(), "3");
        assert_eq!(s.display_name, UNKNOWN_NAME);
        assert_eq!(s.last_temperature_f, None);
        assert!(!s.is_active);
    }

    #[test]
    fn test_assign_keeps_reading() {
        let mut s = Sensor::new(rom(), "3");
        s.set_temperature(Some(41.0));
        s.assign("7".to_string(), "Prep Fridge".to_string(), true);
        assert_eq!(s.label(), "7");
        assert_eq!(s.display_name(), "Prep Fridge");
        assert!(s.is_active());
        assert_eq!(s.last_temperature_f(), Some(41.0));
        assert_eq!(s.address(), rom());
    }

    #[test]
    fn test_record_path_and_body() {
        let mut s = Sensor::new(rom(), "3");
        s.display_name = "Walk In Freezer".to_string();
        s.last_temperature_f = Some(32.0);
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 4, 5, 9).unwrap();
        let record = Record::from_sensor(&s, at).unwrap();

        assert_eq!(
            record.path(),
            "_posts/28ff641e8216035c/2024-03-07-04-05-09_28ff641e8216035c_Walk_In_Freezer.html"
        );
        assert_eq!(
            record.body(),
            "---\nsensor_id: 28ff641e8216035c\nsensor_name: Walk In Freezer\ntemperature: 32.0\n\
             measurement_time: 2024-03-07-04-05-09\n---\n{}\n"
        );
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(record.encoded_body())
            .unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), record.body());
    }

    #[test]
    fn test_record_requires_temperature() {
        let s = Sensor::new(rom(), "3");
        let err = Record::from_sensor(&s, Utc::now()).unwrap_err();
        assert!(matches!(err, Error::IncompleteRecord { .. }));
    }
}
