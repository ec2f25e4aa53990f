//! ==============================================================================
//! sim.rs - simulated peripherals
//! ==============================================================================
//!
//! purpose:
//!     in-memory stand-ins for every capability trait, used in unit-testing
//!     mode and by the test suites. each one is a cheap `Clone` over shared
//!     state: one clone goes into the device, the other stays with the caller
//!     to script faults and inspect what happened.
//!
//! time:
//!     everything that waits or measures time uses tokio's clock, so a test
//!     running with a paused runtime sees a 30 s cooldown finish instantly.
//!
//! ==============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use super::{ClockSource, Color, DisplaySurface, OneWireBus, Peripherals, Point, RadioLink, StatusLed};
use crate::config::DeviceConfig;
use crate::domain::{RomCode, WifiIdentity};
use crate::error::{BusError, ClockError, DisplayError, NetworkError, RadioError};
use crate::network::ntp::{response_packet, NTP_PACKET_LEN};
use crate::network::{HttpClient, HttpResponse, TimeTransport};
use crate::watchdog::Watchdog;

/// Address handed out by [`SimRadio`] on association.
pub const SIM_IP: &str = "192.168.4.20";

/// 2021-01-01T00:00:00Z, where an unsynced board clock starts.
const UNSYNCED_EPOCH: i64 = 1_609_459_200;

fn lock<T>(state: &Mutex<T>) -> MutexGuard<'_, T> {
    // a panicking test thread must not cascade into every other handle
    state.lock().unwrap_or_else(|e| e.into_inner())
}

// ==============================================================================
// rig
// ==============================================================================

/// One handle per simulated peripheral, consistent with a configuration.
#[derive(Clone)]
pub struct SimRig {
    pub display: SimDisplay,
    pub bus: SimBus,
    pub radio: SimRadio,
    pub clock: SimClock,
    pub led: SimLed,
    pub watchdog: SimWatchdog,
    pub http: SimHttp,
    pub time: SimTimeTransport,
}

impl SimRig {
    /// Every configured probe is on the bus (20 °C, 21 °C, ...), every
    /// configured network is visible, publishing succeeds.
    pub fn for_config(config: &DeviceConfig) -> Self {
        let bus = SimBus::new();
        for (i, wiring) in config.sensors.iter().enumerate() {
            bus.attach(wiring.address, 20.0 + i as f64);
        }
        let radio = SimRadio::new();
        for network in &config.wifi {
            radio.add_network(&network.ssid, &network.passphrase);
        }
        Self {
            display: SimDisplay::new(),
            bus,
            radio,
            clock: SimClock::unsynced(),
            led: SimLed::new(),
            watchdog: SimWatchdog::new(),
            http: SimHttp::new(),
            time: SimTimeTransport::new(),
        }
    }

    pub fn peripherals(&self) -> Peripherals {
        Peripherals {
            display: Box::new(self.display.clone()),
            bus: Box::new(self.bus.clone()),
            radio: Box::new(self.radio.clone()),
            clock: Box::new(self.clock.clone()),
            led: Box::new(self.led.clone()),
            watchdog: Box::new(self.watchdog.clone()),
            http: Box::new(self.http.clone()),
            time: Box::new(self.time.clone()),
        }
    }
}

// ==============================================================================
// display
// ==============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct DrawnText {
    pub at: Point,
    pub text: String,
    pub color: Color,
    pub size: u8,
}

#[derive(Debug, Default)]
struct DisplayState {
    initialized: bool,
    fail_init: bool,
    fail_draw: bool,
    background: Option<Color>,
    frame: Vec<DrawnText>,
    history: Vec<String>,
    rules: usize,
}

/// Records what is on screen. A `fill` starts a new frame.
#[derive(Debug, Clone, Default)]
pub struct SimDisplay {
    state: Arc<Mutex<DisplayState>>,
}

impl SimDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// A panel that is not connected: `init` fails.
    pub fn failing() -> Self {
        let display = Self::new();
        lock(&display.state).fail_init = true;
        display
    }

    pub fn set_fail_draw(&self, fail: bool) {
        lock(&self.state).fail_draw = fail;
    }

    pub fn initialized(&self) -> bool {
        lock(&self.state).initialized
    }

    pub fn background(&self) -> Option<Color> {
        lock(&self.state).background
    }

    /// Text of the current frame in draw order.
    pub fn frame(&self) -> Vec<String> {
        lock(&self.state).frame.iter().map(|t| t.text.clone()).collect()
    }

    pub fn frame_items(&self) -> Vec<DrawnText> {
        lock(&self.state).frame.clone()
    }

    pub fn frame_joined(&self) -> String {
        self.frame().join("\n")
    }

    /// Every string ever drawn, across frames.
    pub fn history(&self) -> Vec<String> {
        lock(&self.state).history.clone()
    }

    /// Whether some line of the current frame contains `needle`.
    pub fn shows(&self, needle: &str) -> bool {
        lock(&self.state).frame.iter().any(|t| t.text.contains(needle))
    }

    pub fn rules_drawn(&self) -> usize {
        lock(&self.state).rules
    }
}

impl DisplaySurface for SimDisplay {
    fn init(&mut self) -> Result<(), DisplayError> {
        let mut state = lock(&self.state);
        if state.fail_init {
            return Err(DisplayError::Unavailable("no panel on the SPI bus".to_string()));
        }
        state.initialized = true;
        Ok(())
    }

    fn fill(&mut self, color: Color) -> Result<(), DisplayError> {
        let mut state = lock(&self.state);
        if state.fail_draw {
            return Err(DisplayError::Draw("fill rejected".to_string()));
        }
        state.background = Some(color);
        state.frame.clear();
        Ok(())
    }

    fn text(&mut self, at: Point, text: &str, color: Color, size: u8) -> Result<(), DisplayError> {
        let mut state = lock(&self.state);
        if state.fail_draw {
            return Err(DisplayError::Draw(format!("text {:?} rejected", text)));
        }
        state.history.push(text.to_string());
        state.frame.push(DrawnText { at, text: text.to_string(), color, size });
        Ok(())
    }

    fn hline(&mut self, _at: Point, _length: u32, _color: Color) -> Result<(), DisplayError> {
        let mut state = lock(&self.state);
        if state.fail_draw {
            return Err(DisplayError::Draw("line rejected".to_string()));
        }
        state.rules += 1;
        Ok(())
    }
}

// ==============================================================================
// one-wire bus
// ==============================================================================

#[derive(Debug, Default)]
struct BusState {
    devices: Vec<(RomCode, f64)>,
    failing: HashSet<RomCode>,
    scan_fails: bool,
    conversions: usize,
    read_time: Duration,
}

/// Probes in attach order, each with a settable temperature.
#[derive(Debug, Clone, Default)]
pub struct SimBus {
    state: Arc<Mutex<BusState>>,
}

impl SimBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, rom: RomCode, celsius: f64) {
        let mut state = lock(&self.state);
        match state.devices.iter_mut().find(|(r, _)| *r == rom) {
            Some(device) => device.1 = celsius,
            None => state.devices.push((rom, celsius)),
        }
    }

    pub fn detach(&self, rom: RomCode) {
        lock(&self.state).devices.retain(|(r, _)| *r != rom);
    }

    pub fn set_temperature(&self, rom: RomCode, celsius: f64) {
        self.attach(rom, celsius);
    }

    /// Reads of `rom` fail until [`restore`](Self::restore).
    pub fn fail_reads(&self, rom: RomCode) {
        lock(&self.state).failing.insert(rom);
    }

    pub fn restore(&self, rom: RomCode) {
        lock(&self.state).failing.remove(&rom);
    }

    pub fn fail_scan(&self, fail: bool) {
        lock(&self.state).scan_fails = fail;
    }

    pub fn conversions(&self) -> usize {
        lock(&self.state).conversions
    }

    /// Make every read block the calling thread, like a kernel driver that
    /// converts on read.
    pub fn set_read_time(&self, read_time: Duration) {
        lock(&self.state).read_time = read_time;
    }
}

impl OneWireBus for SimBus {
    fn scan(&mut self) -> Result<Vec<RomCode>, BusError> {
        let state = lock(&self.state);
        if state.scan_fails {
            return Err(BusError::Scan("no presence pulse".to_string()));
        }
        Ok(state.devices.iter().map(|(rom, _)| *rom).collect())
    }

    fn convert_all(&mut self) -> Result<(), BusError> {
        lock(&self.state).conversions += 1;
        Ok(())
    }

    fn read_celsius(&mut self, rom: &RomCode) -> Result<f64, BusError> {
        let read_time = lock(&self.state).read_time;
        if !read_time.is_zero() {
            std::thread::sleep(read_time);
        }
        let state = lock(&self.state);
        if state.failing.contains(rom) {
            return Err(BusError::NoResponse(rom.to_hex()));
        }
        state
            .devices
            .iter()
            .find(|(r, _)| r == rom)
            .map(|(_, celsius)| *celsius)
            .ok_or_else(|| BusError::NoResponse(rom.to_hex()))
    }
}

// ==============================================================================
// radio
// ==============================================================================

#[derive(Debug)]
struct RadioState {
    active: bool,
    in_range: bool,
    networks: Vec<(String, String)>,
    connected: Option<String>,
    /// network being joined and polls left before it associates
    pending: Option<(String, u32)>,
    connect_polls: u32,
    scan_time: Duration,
    attempts: Vec<String>,
}

/// Access points in range with their passphrases. A wrong passphrase is
/// accepted by `connect` but never associates.
#[derive(Debug, Clone)]
pub struct SimRadio {
    state: Arc<Mutex<RadioState>>,
}

impl Default for SimRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRadio {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RadioState {
                active: false,
                in_range: true,
                networks: Vec::new(),
                connected: None,
                pending: None,
                connect_polls: 0,
                scan_time: Duration::ZERO,
                attempts: Vec::new(),
            })),
        }
    }

    pub fn add_network(&self, ssid: &str, passphrase: &str) {
        lock(&self.state).networks.push((ssid.to_string(), passphrase.to_string()));
    }

    /// Number of `is_connected` polls that report false before association.
    pub fn set_connect_polls(&self, polls: u32) {
        lock(&self.state).connect_polls = polls;
    }

    /// How long a scan takes to come back.
    pub fn set_scan_time(&self, scan_time: Duration) {
        lock(&self.state).scan_time = scan_time;
    }

    /// SSIDs passed to `connect`, in order.
    pub fn attempts(&self) -> Vec<String> {
        lock(&self.state).attempts.clone()
    }

    pub fn is_active(&self) -> bool {
        lock(&self.state).active
    }

    /// Drop the current association (access point rebooted).
    pub fn disconnect(&self) {
        let mut state = lock(&self.state);
        state.connected = None;
        state.pending = None;
    }

    /// Take every access point out of range, or bring them back.
    pub fn set_out_of_range(&self, out: bool) {
        let mut state = lock(&self.state);
        state.in_range = !out;
        if out {
            state.connected = None;
            state.pending = None;
        }
    }
}

#[async_trait(?Send)]
impl RadioLink for SimRadio {
    async fn activate(&mut self) -> Result<(), RadioError> {
        lock(&self.state).active = true;
        Ok(())
    }

    async fn scan(&mut self) -> Result<Vec<String>, RadioError> {
        let delay = lock(&self.state).scan_time;
        tokio::time::sleep(delay).await;
        let state = lock(&self.state);
        if !state.in_range {
            return Ok(Vec::new());
        }
        Ok(state.networks.iter().map(|(ssid, _)| ssid.clone()).collect())
    }

    async fn connect(&mut self, ssid: &str, passphrase: &str) -> Result<(), RadioError> {
        let mut state = lock(&self.state);
        state.attempts.push(ssid.to_string());
        state.connected = None;
        state.pending = None;
        let known = state.networks.iter().find(|(s, _)| s == ssid).cloned();
        match known {
            Some(_) if !state.in_range => Err(RadioError::Connect {
                ssid: ssid.to_string(),
                reason: "not in range".to_string(),
            }),
            Some((_, expected)) => {
                if expected == passphrase {
                    let polls = state.connect_polls;
                    state.pending = Some((ssid.to_string(), polls));
                }
                Ok(())
            }
            None => Err(RadioError::Connect { ssid: ssid.to_string(), reason: "not in range".to_string() }),
        }
    }

    async fn is_connected(&mut self) -> bool {
        let mut state = lock(&self.state);
        if state.connected.is_some() {
            return true;
        }
        match state.pending.take() {
            Some((ssid, 0)) => {
                state.connected = Some(ssid);
                true
            }
            Some((ssid, left)) => {
                state.pending = Some((ssid, left - 1));
                false
            }
            None => false,
        }
    }

    async fn identity(&mut self) -> Option<WifiIdentity> {
        lock(&self.state)
            .connected
            .clone()
            .map(|ssid| WifiIdentity { ssid, ip: SIM_IP.to_string() })
    }
}

// ==============================================================================
// clock
// ==============================================================================

#[derive(Debug)]
struct ClockState {
    base: DateTime<Utc>,
    anchor: Instant,
    sets: usize,
}

/// Wall clock driven by tokio time; `set` re-anchors it.
#[derive(Debug, Clone)]
pub struct SimClock {
    state: Arc<Mutex<ClockState>>,
}

impl SimClock {
    /// A board that booted without a time source.
    pub fn unsynced() -> Self {
        Self::at(DateTime::from_timestamp(UNSYNCED_EPOCH, 0).unwrap_or_default())
    }

    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            state: Arc::new(Mutex::new(ClockState { base: time, anchor: Instant::now(), sets: 0 })),
        }
    }

    pub fn sets(&self) -> usize {
        lock(&self.state).sets
    }
}

impl ClockSource for SimClock {
    fn now(&self) -> DateTime<Utc> {
        let state = lock(&self.state);
        let elapsed = chrono::Duration::from_std(state.anchor.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        state.base + elapsed
    }

    fn set(&mut self, now: DateTime<Utc>) -> Result<(), ClockError> {
        let mut state = lock(&self.state);
        state.base = now;
        state.anchor = Instant::now();
        state.sets += 1;
        Ok(())
    }
}

// ==============================================================================
// status led
// ==============================================================================

#[derive(Debug, Default)]
struct LedState {
    on: bool,
    toggles: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SimLed {
    state: Arc<Mutex<LedState>>,
}

impl SimLed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self) -> bool {
        lock(&self.state).on
    }

    pub fn toggles(&self) -> usize {
        lock(&self.state).toggles
    }
}

impl StatusLed for SimLed {
    fn set(&mut self, on: bool) {
        lock(&self.state).on = on;
    }

    fn toggle(&mut self) {
        let mut state = lock(&self.state);
        state.on = !state.on;
        state.toggles += 1;
    }
}

// ==============================================================================
// watchdog
// ==============================================================================

#[derive(Debug)]
struct WatchdogState {
    feeds: usize,
    last: Instant,
    longest: Duration,
}

/// Counts feeds and remembers the longest stretch without one.
#[derive(Debug, Clone)]
pub struct SimWatchdog {
    state: Arc<Mutex<WatchdogState>>,
}

impl Default for SimWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl SimWatchdog {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(WatchdogState { feeds: 0, last: Instant::now(), longest: Duration::ZERO })),
        }
    }

    pub fn feeds(&self) -> usize {
        lock(&self.state).feeds
    }

    /// Longest gap between feeds since creation, including the one still open.
    pub fn longest_gap(&self) -> Duration {
        let state = lock(&self.state);
        state.longest.max(state.last.elapsed())
    }
}

impl Watchdog for SimWatchdog {
    fn feed(&mut self) {
        let mut state = lock(&self.state);
        let gap = state.last.elapsed();
        state.longest = state.longest.max(gap);
        state.last = Instant::now();
        state.feeds += 1;
    }
}

// ==============================================================================
// http
// ==============================================================================

/// Scripted answer of [`SimHttp`].
#[derive(Debug, Clone)]
pub enum SimReply {
    Status(u16, String),
    TransportError(String),
    Timeout,
}

impl SimReply {
    fn into_result(self) -> Result<HttpResponse, NetworkError> {
        match self {
            SimReply::Status(status, body) => Ok(HttpResponse { status, body }),
            SimReply::TransportError(reason) => Err(NetworkError::Transport(reason)),
            SimReply::Timeout => Err(NetworkError::Timeout),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

#[derive(Debug)]
struct HttpState {
    get_reply: SimReply,
    put_reply: SimReply,
    put_failures: Vec<(String, SimReply)>,
    requests: Vec<SimRequest>,
}

/// GET answers 404 until a document is served; PUT answers 201.
#[derive(Debug, Clone)]
pub struct SimHttp {
    state: Arc<Mutex<HttpState>>,
}

impl Default for SimHttp {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHttp {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HttpState {
                get_reply: SimReply::Status(404, "Not Found".to_string()),
                put_reply: SimReply::Status(201, "{}".to_string()),
                put_failures: Vec::new(),
                requests: Vec::new(),
            })),
        }
    }

    pub fn serve_config(&self, document: &str) {
        self.set_get_reply(SimReply::Status(200, document.to_string()));
    }

    pub fn set_get_reply(&self, reply: SimReply) {
        lock(&self.state).get_reply = reply;
    }

    pub fn set_put_reply(&self, reply: SimReply) {
        lock(&self.state).put_reply = reply;
    }

    /// PUTs whose url contains `needle` get `reply` instead of the default.
    pub fn fail_put_matching(&self, needle: &str, reply: SimReply) {
        lock(&self.state).put_failures.push((needle.to_string(), reply));
    }

    pub fn clear_put_failures(&self) {
        lock(&self.state).put_failures.clear();
    }

    pub fn requests(&self) -> Vec<SimRequest> {
        lock(&self.state).requests.clone()
    }

    pub fn gets(&self) -> Vec<SimRequest> {
        self.requests().into_iter().filter(|r| r.method == "GET").collect()
    }

    pub fn puts(&self) -> Vec<SimRequest> {
        self.requests().into_iter().filter(|r| r.method == "PUT").collect()
    }
}

#[async_trait(?Send)]
impl HttpClient for SimHttp {
    async fn get(&self, url: &str) -> Result<HttpResponse, NetworkError> {
        let mut state = lock(&self.state);
        state.requests.push(SimRequest {
            method: "GET".to_string(),
            url: url.to_string(),
            headers: Vec::new(),
            body: None,
        });
        state.get_reply.clone().into_result()
    }

    async fn put_json(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        body: &serde_json::Value,
    ) -> Result<HttpResponse, NetworkError> {
        let mut state = lock(&self.state);
        state.requests.push(SimRequest {
            method: "PUT".to_string(),
            url: url.to_string(),
            headers: headers.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
            body: Some(body.clone()),
        });
        let reply = state
            .put_failures
            .iter()
            .find(|(needle, _)| url.contains(needle.as_str()))
            .map(|(_, reply)| reply.clone())
            .unwrap_or_else(|| state.put_reply.clone());
        reply.into_result()
    }
}

// ==============================================================================
// time server
// ==============================================================================

/// Scripted answer of [`SimTimeTransport`].
#[derive(Debug, Clone, PartialEq)]
pub enum SimTimeReply {
    Time(DateTime<Utc>),
    /// The host's real wall clock.
    Now,
    /// No answer: the exchange waits out its timeout.
    Timeout,
    Garbage(Vec<u8>),
}

#[derive(Debug)]
struct TimeState {
    queued: VecDeque<SimTimeReply>,
    fallback: SimTimeReply,
    exchanges: usize,
}

/// Answers from a queue, then with the fallback reply.
#[derive(Debug, Clone)]
pub struct SimTimeTransport {
    state: Arc<Mutex<TimeState>>,
}

impl Default for SimTimeTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTimeTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(TimeState {
                queued: VecDeque::new(),
                fallback: SimTimeReply::Now,
                exchanges: 0,
            })),
        }
    }

    pub fn queue(&self, reply: SimTimeReply) {
        lock(&self.state).queued.push_back(reply);
    }

    /// Reply used once the queue is empty.
    pub fn always(&self, reply: SimTimeReply) {
        lock(&self.state).fallback = reply;
    }

    pub fn exchanges(&self) -> usize {
        lock(&self.state).exchanges
    }
}

#[async_trait(?Send)]
impl TimeTransport for SimTimeTransport {
    async fn exchange(
        &mut self,
        _server: &str,
        _request: &[u8; NTP_PACKET_LEN],
        timeout: Duration,
    ) -> Result<Vec<u8>, NetworkError> {
        let reply = {
            let mut state = lock(&self.state);
            state.exchanges += 1;
            let fallback = state.fallback.clone();
            state.queued.pop_front().unwrap_or(fallback)
        };
        match reply {
            SimTimeReply::Time(time) => Ok(response_packet(time).to_vec()),
            SimTimeReply::Now => Ok(response_packet(Utc::now()).to_vec()),
            SimTimeReply::Timeout => {
                tokio::time::sleep(timeout).await;
                Err(NetworkError::Timeout)
            }
            SimTimeReply::Garbage(bytes) => Ok(bytes),
        }
    }
}
