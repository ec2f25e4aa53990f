//! ==============================================================================
//! linux.rs - peripherals of a Raspberry Pi running Linux
//! ==============================================================================
//!
//! purpose:
//!     capability implementations backed by kernel interfaces and system tools.
//!
//! ```text
//!     - SysfsOneWire:   w1-gpio / w1-therm drivers under /sys/bus/w1/devices
//!     - NmcliRadio:     NetworkManager through `nmcli` subprocesses
//!     - SystemClock:    OS clock plus a correction offset
//!     - ConsoleDisplay: status frames written to the log
//!     - GpioLed / dev jumper: rppal, only with feature="hardware"
//! ```
//!
//! ==============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{ClockSource, Color, DisplaySurface, OneWireBus, Point, RadioLink, StatusLed};
use crate::domain::{crc8_maxim, RomCode, WifiIdentity};
use crate::error::{BusError, ClockError, DisplayError, RadioError};

// ==============================================================================
// display
// ==============================================================================

/// Writes every drawn string to the `display` log target.
#[derive(Debug, Default)]
pub struct ConsoleDisplay {
    ready: bool,
}

impl ConsoleDisplay {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DisplaySurface for ConsoleDisplay {
    fn init(&mut self) -> Result<(), DisplayError> {
        self.ready = true;
        info!(target: "display", "console display ready");
        Ok(())
    }

    fn fill(&mut self, color: Color) -> Result<(), DisplayError> {
        if !self.ready {
            return Err(DisplayError::Draw("display not initialized".to_string()));
        }
        debug!(target: "display", "---- {:?} ----", color);
        Ok(())
    }

    fn text(&mut self, at: Point, text: &str, color: Color, _size: u8) -> Result<(), DisplayError> {
        if !self.ready {
            return Err(DisplayError::Draw("display not initialized".to_string()));
        }
        match color {
            Color::Red => warn!(target: "display", "[{:>3},{:>3}] {}", at.0, at.1, text),
            _ => info!(target: "display", "[{:>3},{:>3}] {}", at.0, at.1, text),
        }
        Ok(())
    }

    fn hline(&mut self, _at: Point, _length: u32, _color: Color) -> Result<(), DisplayError> {
        Ok(())
    }
}

// ==============================================================================
// one-wire bus (w1 sysfs)
// ==============================================================================

/// DS18S20, DS1822, DS18B20, DS1825, DS28EA00
const THERMOMETER_FAMILIES: [u8; 5] = [0x10, 0x22, 0x28, 0x3b, 0x42];

/// Rebuild the 8-byte ROM code from a sysfs slave name such as `28-0316821e64ff`.
///
/// The kernel prints the 48-bit serial most significant byte first and drops
/// the CRC; the ROM code carries the serial least significant byte first.
pub fn rom_from_sysfs_name(name: &str) -> Option<RomCode> {
    let (family, serial) = name.split_once('-')?;
    if family.len() != 2 || serial.len() != 12 {
        return None;
    }
    let family = u8::from_str_radix(family, 16).ok()?;
    if !THERMOMETER_FAMILIES.contains(&family) {
        return None;
    }
    let mut serial_bytes = [0u8; 6];
    hex::decode_to_slice(serial, &mut serial_bytes).ok()?;

    let mut bytes = [0u8; 8];
    bytes[0] = family;
    for (i, b) in serial_bytes.iter().rev().enumerate() {
        bytes[1 + i] = *b;
    }
    bytes[7] = crc8_maxim(&bytes[..7]);
    Some(RomCode::new(bytes))
}

pub fn sysfs_name(rom: &RomCode) -> String {
    let bytes = rom.as_bytes();
    let serial: Vec<u8> = bytes[1..7].iter().rev().copied().collect();
    format!("{:02x}-{}", bytes[0], hex::encode(serial))
}

/// Parse the two-line `w1_slave` report, e.g.
///
/// ```text
/// 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
/// 72 01 4b 46 7f ff 0e 10 57 t=23125
/// ```
pub fn parse_w1_slave(device: &str, report: &str) -> Result<f64, BusError> {
    let mut lines = report.lines();
    let status = lines.next().unwrap_or_default();
    if !status.trim_end().ends_with("YES") {
        return Err(BusError::Crc(device.to_string()));
    }
    let data = lines.next().unwrap_or_default();
    let (_, millis) = data.rsplit_once("t=").ok_or_else(|| BusError::Malformed {
        device: device.to_string(),
        detail: format!("no t= field in {:?}", data),
    })?;
    parse_millidegrees(device, millis)
}

fn parse_millidegrees(device: &str, text: &str) -> Result<f64, BusError> {
    text.trim()
        .parse::<i64>()
        .map(|m| m as f64 / 1000.0)
        .map_err(|e| BusError::Malformed { device: device.to_string(), detail: e.to_string() })
}

/// Kernel w1 bus. Scan lists slave directories; reading a slave file makes
/// the driver talk to the device.
#[derive(Debug, Clone)]
pub struct SysfsOneWire {
    root: PathBuf,
}

impl SysfsOneWire {
    pub fn new(root: &Path) -> Self {
        Self { root: root.to_path_buf() }
    }

    fn masters(&self) -> Result<Vec<PathBuf>, BusError> {
        Ok(fs::read_dir(&self.root)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("w1_bus_master"))
            .map(|e| e.path())
            .collect())
    }
}

impl OneWireBus for SysfsOneWire {
    fn scan(&mut self) -> Result<Vec<RomCode>, BusError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| BusError::Scan(format!("{}: {}", self.root.display(), e)))?;
        let mut found: Vec<RomCode> = entries
            .filter_map(|e| e.ok())
            .filter_map(|e| rom_from_sysfs_name(&e.file_name().to_string_lossy()))
            .collect();
        found.sort_by_key(|rom| *rom.as_bytes());
        debug!("w1 scan found {:?}", found);
        Ok(found)
    }

    fn convert_all(&mut self) -> Result<(), BusError> {
        // without bulk support each slave read converts on its own
        for master in self.masters()? {
            let trigger = master.join("therm_bulk_read");
            if trigger.exists() {
                fs::write(&trigger, "trigger")
                    .map_err(|e| BusError::Conversion(format!("{}: {}", trigger.display(), e)))?;
            }
        }
        Ok(())
    }

    fn read_celsius(&mut self, rom: &RomCode) -> Result<f64, BusError> {
        let name = sysfs_name(rom);
        let device = self.root.join(&name);
        if !device.is_dir() {
            return Err(BusError::NoResponse(rom.to_hex()));
        }
        let temperature = device.join("temperature");
        if temperature.exists() {
            return parse_millidegrees(&name, &fs::read_to_string(temperature)?);
        }
        parse_w1_slave(&name, &fs::read_to_string(device.join("w1_slave"))?)
    }
}

// ==============================================================================
// radio (NetworkManager)
// ==============================================================================

/// Longest a single nmcli call may take. Below the watchdog interval so the
/// caller can still feed after a hung NetworkManager.
pub const NMCLI_TIMEOUT: Duration = Duration::from_secs(5);

/// Run a tool to completion, killing it once `limit` has passed.
async fn run_bounded(program: &str, args: &[&str], limit: Duration) -> Result<String, RadioError> {
    let command = format!("{} {}", program, args.join(" "));
    let child = Command::new(program).args(args).kill_on_drop(true).output();
    let output = tokio::time::timeout(limit, child)
        .await
        .map_err(|_| RadioError::Timeout(command.clone()))??;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(RadioError::Activation(format!("{}: {}", command, stderr.trim())));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn nmcli(args: &[&str]) -> Result<String, RadioError> {
    run_bounded("nmcli", args, NMCLI_TIMEOUT).await
}

/// Undo nmcli terse-mode escaping (`\:` and `\\`).
fn unescape_terse(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Split a terse line on unescaped colons.
fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut escaped = false;
    for c in line.chars() {
        if escaped {
            current.push('\\');
            current.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == ':' {
            fields.push(unescape_terse(&current));
            current.clear();
        } else {
            current.push(c);
        }
    }
    fields.push(unescape_terse(&current));
    fields
}

/// `nmcli -t -f SSID dev wifi list` output, hidden networks dropped.
pub fn parse_ssid_list(output: &str) -> Vec<String> {
    let mut ssids: Vec<String> = Vec::new();
    for line in output.lines().map(unescape_terse) {
        if !line.is_empty() && !ssids.contains(&line) {
            ssids.push(line);
        }
    }
    ssids
}

/// `nmcli -t -f DEVICE,TYPE,STATE device` output: is `interface` associated?
pub fn parse_device_connected(output: &str, interface: &str) -> bool {
    output.lines().map(split_terse).any(|fields| {
        fields.len() >= 3 && fields[0] == interface && fields[1] == "wifi" && fields[2] == "connected"
    })
}

/// `nmcli -t -f ACTIVE,SSID dev wifi` output: SSID of the active network.
pub fn parse_active_ssid(output: &str) -> Option<String> {
    output
        .lines()
        .map(split_terse)
        .find(|fields| fields.len() >= 2 && fields[0] == "yes")
        .map(|fields| fields[1].clone())
}

/// `nmcli -g IP4.ADDRESS device show` output, prefix length stripped.
pub fn parse_ip4(output: &str) -> Option<String> {
    let first = output.lines().next()?.split('|').next()?.trim();
    let address = first.split('/').next()?.trim();
    (!address.is_empty()).then(|| address.to_string())
}

/// Station-mode Wi-Fi through NetworkManager.
#[derive(Debug, Clone)]
pub struct NmcliRadio {
    interface: String,
}

impl Default for NmcliRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl NmcliRadio {
    pub fn new() -> Self {
        Self { interface: "wlan0".to_string() }
    }
}

#[async_trait(?Send)]
impl RadioLink for NmcliRadio {
    async fn activate(&mut self) -> Result<(), RadioError> {
        nmcli(&["radio", "wifi", "on"]).await?;
        Ok(())
    }

    async fn scan(&mut self) -> Result<Vec<String>, RadioError> {
        match nmcli(&["-t", "-f", "SSID", "dev", "wifi", "list", "--rescan", "yes"]).await {
            Ok(out) => Ok(parse_ssid_list(&out)),
            Err(RadioError::Timeout(command)) => Err(RadioError::Timeout(command)),
            Err(e) => Err(RadioError::Scan(e.to_string())),
        }
    }

    async fn connect(&mut self, ssid: &str, passphrase: &str) -> Result<(), RadioError> {
        // --wait 0 returns once activation has started; progress is polled
        nmcli(&[
            "--wait", "0", "dev", "wifi", "connect", ssid, "password", passphrase, "ifname", self.interface.as_str(),
        ])
        .await
        .map(|_| ())
        .map_err(|e| RadioError::Connect { ssid: ssid.to_string(), reason: e.to_string() })
    }

    async fn is_connected(&mut self) -> bool {
        match nmcli(&["-t", "-f", "DEVICE,TYPE,STATE", "device"]).await {
            Ok(out) => parse_device_connected(&out, &self.interface),
            Err(e) => {
                debug!("{}", e);
                false
            }
        }
    }

    async fn identity(&mut self) -> Option<WifiIdentity> {
        let active = nmcli(&["-t", "-f", "ACTIVE,SSID", "dev", "wifi"]).await.ok()?;
        let ssid = parse_active_ssid(&active)?;
        let ip = nmcli(&["-g", "IP4.ADDRESS", "device", "show", self.interface.as_str()])
            .await
            .ok()
            .and_then(|out| parse_ip4(&out))
            .unwrap_or_default();
        Some(WifiIdentity { ssid, ip })
    }
}

// ==============================================================================
// clock
// ==============================================================================

/// OS clock corrected by the last sync. The process normally lacks the
/// privilege to set the system time, so the correction is kept in-process.
#[derive(Debug, Clone, Default)]
pub struct SystemClock {
    offset: chrono::Duration,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClockSource for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.offset
    }

    fn set(&mut self, now: DateTime<Utc>) -> Result<(), ClockError> {
        if now.timestamp() <= 0 {
            return Err(ClockError::OutOfRange(now.timestamp()));
        }
        self.offset = now - Utc::now();
        debug!("Clock offset now {} ms", self.offset.num_milliseconds());
        Ok(())
    }
}

// ==============================================================================
// status led and dev jumper
// ==============================================================================

/// LED stand-in that only logs.
#[derive(Debug, Default)]
pub struct LogLed {
    on: bool,
}

impl StatusLed for LogLed {
    fn set(&mut self, on: bool) {
        self.on = on;
        debug!("[LED] {}", if on { "on" } else { "off" });
    }

    fn toggle(&mut self) {
        let on = !self.on;
        self.set(on);
    }
}

#[cfg(feature = "hardware")]
pub struct GpioLed {
    pin: rppal::gpio::OutputPin,
}

#[cfg(feature = "hardware")]
impl GpioLed {
    pub fn new(pin: u8) -> Result<Self, rppal::gpio::Error> {
        let pin = rppal::gpio::Gpio::new()?.get(pin)?.into_output_low();
        Ok(Self { pin })
    }
}

#[cfg(feature = "hardware")]
impl StatusLed for GpioLed {
    fn set(&mut self, on: bool) {
        if on {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
    }

    fn toggle(&mut self) {
        self.pin.toggle();
    }
}

/// The status LED on `pin`, or a logging stand-in when there is no GPIO.
#[cfg(feature = "hardware")]
pub fn status_led(pin: Option<u8>) -> Box<dyn StatusLed> {
    match pin.map(GpioLed::new) {
        Some(Ok(led)) => Box::new(led),
        Some(Err(e)) => {
            warn!("Status LED unavailable, logging instead: {}", e);
            Box::new(LogLed::default())
        }
        None => Box::new(LogLed::default()),
    }
}

#[cfg(not(feature = "hardware"))]
pub fn status_led(_pin: Option<u8>) -> Box<dyn StatusLed> {
    Box::new(LogLed::default())
}

/// Jumper from `pin` to GND; the pin is pulled up so fitted reads low.
#[cfg(feature = "hardware")]
pub fn read_dev_jumper(pin: u8) -> bool {
    match rppal::gpio::Gpio::new().and_then(|gpio| gpio.get(pin)) {
        Ok(pin) => pin.into_input_pullup().is_low(),
        Err(e) => {
            warn!("Dev jumper pin {} unreadable: {}", pin, e);
            false
        }
    }
}

#[cfg(not(feature = "hardware"))]
pub fn read_dev_jumper(pin: u8) -> bool {
    debug!("Dev jumper on pin {} ignored without the hardware feature", pin);
    false
}
