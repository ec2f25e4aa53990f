//! ==============================================================================
//! integration_tests.rs - whole-device scenarios on simulated peripherals
//! ==============================================================================
//!
//! every test runs on a paused tokio clock, so the fed sleeps of bring-up
//! and the run loop complete instantly while still being measured.
//!
//! ==============================================================================

use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;
use tokio::time::Instant;

use sensorbox::domain::{RomCode, INACTIVE_NAME};
use sensorbox::hal::sim::{SimReply, SimRig, SimTimeReply};
use sensorbox::runtime::{COOLDOWN_TICKS, PUBLISH_INTERVAL};
use sensorbox::watchdog::WATCHDOG_INTERVAL;
use sensorbox::{bring_up, BringUp, CycleOutcome, DeviceConfig, HaltReason, SensorBox};

const CONFIG: &str = r#"
[[wifi]]
ssid = "shop"
passphrase = "pw"

[[sensors]]
label = "A1"
address = "28ff641e8216035c"

[[sensors]]
label = "B2"
address = "28ff9a3b80160474"

[remote]
config_url = "https://raw.example.com/_data/config.json"
owner = "okie"
repo = "TempSensors"
token = "secret"
"#;

const DOCUMENT: &str = r#"{
    "readme": "cable labels are written on each probe",
    "rom_hex_to_cable_number": {
        "28ff641e8216035c": "A1",
        "28ff9a3b80160474": "B2"
    },
    "sensors": {
        "A1": { "short_name": "Walk In Freezer", "maximum_temp": 10 },
        "B2": { "short_name": "Prep Fridge", "maximum_temp": 41 }
    }
}"#;

const A1: &str = "28ff641e8216035c";
const B2: &str = "28ff9a3b80160474";
const C3: &str = "28ff00000000c3c3";

fn rom(hex: &str) -> RomCode {
    hex.parse().unwrap()
}

fn ntp_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 12, 1, 6, 0, 0).unwrap()
}

fn config() -> DeviceConfig {
    DeviceConfig::parse(CONFIG).unwrap()
}

/// Simulation where everything works: network up, time server answers,
/// sensor config document served.
fn healthy_rig(config: &DeviceConfig) -> SimRig {
    let rig = SimRig::for_config(config);
    rig.http.serve_config(DOCUMENT);
    rig.time.always(SimTimeReply::Time(ntp_time()));
    rig
}

async fn ready(config: DeviceConfig, rig: &SimRig) -> SensorBox {
    match bring_up(config, rig.peripherals()).await {
        BringUp::Ready(device) => device,
        BringUp::Halted(halted) => panic!("unexpected halt: {:?}", halted.reason()),
    }
}

// ==============================================================================
// bring-up
// ==============================================================================

#[tokio::test(start_paused = true)]
async fn test_discovery_keeps_configured_order_and_ignores_extras() {
    let config = config();
    let rig = healthy_rig(&config);
    rig.bus.attach(rom(C3), 3.0);

    let device = ready(config, &rig).await;

    let sensors = &device.state().sensors;
    assert_eq!(sensors.len(), 2);
    assert_eq!(sensors[0].address(), rom(A1));
    assert_eq!(sensors[0].label(), "A1");
    assert_eq!(sensors[1].address(), rom(B2));
    assert_eq!(sensors[1].label(), "B2");
    assert!(rig.display.history().contains(&"BOOTING UP!".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_missing_sensor_halts_with_message() {
    let config = config();
    let rig = healthy_rig(&config);
    rig.bus.detach(rom(B2));

    let BringUp::Halted(mut halted) = bring_up(config, rig.peripherals()).await else {
        panic!("bring-up should halt");
    };

    assert_eq!(halted.reason(), &HaltReason::MissingSensors(vec!["B2".to_string()]));
    assert!(rig.display.shows("*EXCEPTION*"));
    assert_eq!(
        rig.display.frame()[1..].concat(),
        "Could not initialize sensor(s): B2; check connections"
    );
    // no network activity after the halt
    assert!(rig.radio.attempts().is_empty());

    let feeds = rig.watchdog.feeds();
    halted.hold_for(5).await;
    assert_eq!(rig.watchdog.feeds(), feeds + 5);
}

#[tokio::test(start_paused = true)]
async fn test_remote_config_applied_during_bring_up() {
    let config = config();
    let rig = healthy_rig(&config);

    let mut device = ready(config, &rig).await;

    let state = device.state();
    assert!(state.config_retrieved);
    assert!(state.time_synced);
    assert_eq!(state.sensors[0].display_name(), "Walk In Freezer");
    assert_eq!(state.sensors[1].display_name(), "Prep Fridge");
    assert!(state.sensors.iter().all(|s| s.is_active()));
    assert!(rig.display.history().contains(&"Config:  OK".to_string()));
    assert!(rig.display.history().contains(&"Date: 12/01".to_string()));

    // fetched once at bring-up, never again
    device.cycle().await;
    device.cycle().await;
    assert_eq!(rig.http.gets().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unmapped_sensor_becomes_inactive() {
    let config = config();
    let rig = healthy_rig(&config);
    rig.http.serve_config(
        r#"{"rom_hex_to_cable_number": {"28ff641e8216035c": "A1"},
            "sensors": {"A1": {"short_name": "Walk In Freezer"}}}"#,
    );

    let device = ready(config, &rig).await;

    let b2 = &device.state().sensors[1];
    assert_eq!(b2.display_name(), INACTIVE_NAME);
    assert!(!b2.is_active());
    assert_eq!(b2.label(), "B2");
}

// ==============================================================================
// run loop: clock and publishing
// ==============================================================================

#[tokio::test(start_paused = true)]
async fn test_no_publish_while_clock_unsynced() {
    let config = config();
    let rig = healthy_rig(&config);
    rig.time.always(SimTimeReply::Timeout);

    let mut device = ready(config, &rig).await;
    assert!(!device.state().time_synced);
    assert!(rig.display.history().iter().any(|l| l.starts_with("CLOCK SYNC ERROR")));

    for _ in 0..3 {
        assert_eq!(device.cycle().await, CycleOutcome::Completed { published: None });
    }
    tokio::time::advance(PUBLISH_INTERVAL + Duration::from_secs(100)).await;
    for _ in 0..3 {
        assert_eq!(device.cycle().await, CycleOutcome::Completed { published: None });
    }

    assert!(!device.state().time_synced);
    assert!(rig.http.puts().is_empty());
    assert!(device.state().last_published_at.is_none());
    // one attempt at bring-up, then one per cycle
    assert_eq!(rig.time.exchanges(), 7);
}

#[tokio::test(start_paused = true)]
async fn test_first_publish_after_late_sync_then_hourly() {
    let config = config();
    let rig = healthy_rig(&config);
    rig.time.queue(SimTimeReply::Timeout);

    let mut device = ready(config, &rig).await;
    assert!(!device.state().time_synced);

    assert_eq!(device.cycle().await, CycleOutcome::Completed { published: Some(true) });
    assert!(device.state().time_synced);
    assert_eq!(device.state().last_published_at, Some(ntp_time()));
    let puts = rig.http.puts();
    assert_eq!(puts.len(), 2);
    assert!(puts[0].url.ends_with(&format!(
        "_posts/{A1}/2024-12-01-06-00-00_{A1}_Walk_In_Freezer.html"
    )));
    assert!(puts[1].url.contains(&format!("_posts/{B2}/")));
    assert!(rig.display.shows("Push: 06:00:00 (UTC)"));

    // nothing due for the next hour
    assert_eq!(device.cycle().await, CycleOutcome::Completed { published: None });
    tokio::time::advance(PUBLISH_INTERVAL).await;
    assert_eq!(device.cycle().await, CycleOutcome::Completed { published: Some(true) });
    assert_eq!(rig.http.puts().len(), 4);
    // sticky: synced once, never asked again
    assert_eq!(rig.time.exchanges(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_publish_failure_sets_flag_and_retries() {
    let config = config();
    let rig = healthy_rig(&config);
    rig.http.fail_put_matching(B2, SimReply::Status(500, "server error".to_string()));

    let mut device = ready(config, &rig).await;

    assert_eq!(device.cycle().await, CycleOutcome::Completed { published: Some(false) });
    assert!(device.state().last_publish_had_errors);
    assert!(device.state().last_published_at.is_none());
    // the failing sensor did not stop the other one
    assert_eq!(rig.http.puts().len(), 2);
    assert!(rig.display.shows("Last Push Had Errors"));

    // never fully published, so the next cycle tries again
    rig.http.clear_put_failures();
    assert_eq!(device.cycle().await, CycleOutcome::Completed { published: Some(true) });
    assert!(!device.state().last_publish_had_errors);
    assert!(device.state().last_published_at.is_some());
    assert_eq!(rig.http.puts().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_publish_timeout_is_not_fatal() {
    let config = config();
    let rig = healthy_rig(&config);
    rig.http.set_put_reply(SimReply::Timeout);

    let mut device = ready(config, &rig).await;

    assert_eq!(device.cycle().await, CycleOutcome::Completed { published: Some(false) });
    assert!(device.state().last_publish_had_errors);
}

// ==============================================================================
// run loop: sensing and network faults
// ==============================================================================

#[tokio::test(start_paused = true)]
async fn test_sensing_failure_shows_fault_and_cools_down() {
    let config = config();
    let rig = healthy_rig(&config);
    let mut device = ready(config, &rig).await;
    assert!(matches!(device.cycle().await, CycleOutcome::Completed { .. }));

    rig.bus.fail_reads(rom(A1));
    let start = Instant::now();
    let outcome = device.cycle().await;

    let CycleOutcome::Faulted(message) = outcome else {
        panic!("expected a faulted cycle, got {:?}", outcome);
    };
    assert!(message.contains("sensor A1"));
    assert!(start.elapsed() >= Duration::from_secs(COOLDOWN_TICKS as u64));
    assert!(rig.display.shows("*EXCEPTION*"));
    assert_eq!(device.state().sensors[0].last_temperature_f(), None);
    // reached nothing past sensing: no second publish attempt
    assert_eq!(rig.http.puts().len(), 2);

    rig.bus.restore(rom(A1));
    assert!(matches!(device.cycle().await, CycleOutcome::Completed { .. }));
    assert!(device.state().sensors[0].last_temperature_f().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_readings_converted_to_fahrenheit() {
    let config = config();
    let rig = healthy_rig(&config);
    rig.bus.set_temperature(rom(A1), 0.0);
    rig.bus.set_temperature(rom(B2), 100.0);
    let mut device = ready(config, &rig).await;

    device.cycle().await;

    assert_eq!(device.state().sensors[0].last_temperature_f(), Some(32.0));
    assert_eq!(device.state().sensors[1].last_temperature_f(), Some(212.0));
    assert!(rig.display.shows("212.00 F"));
}

#[tokio::test(start_paused = true)]
async fn test_wifi_down_at_boot_recovers_later() {
    let config = config();
    let rig = healthy_rig(&config);
    rig.radio.set_out_of_range(true);

    let mut device = ready(config, &rig).await;
    assert!(device.state().wifi.is_none());
    assert!(rig.display.history().contains(&"WILL RETRY".to_string()));
    assert!(!device.state().time_synced);

    assert_eq!(device.cycle().await, CycleOutcome::Completed { published: None });
    assert!(rig.display.shows("****DISCONNECTED****"));

    rig.radio.set_out_of_range(false);
    assert_eq!(device.cycle().await, CycleOutcome::Completed { published: Some(true) });
    let state = device.state();
    assert_eq!(state.wifi.as_ref().map(|w| w.ssid.as_str()), Some("shop"));
    assert!(state.time_synced);
    assert!(state.config_retrieved);
    assert!(rig.display.shows("SSID: shop"));
}

#[tokio::test(start_paused = true)]
async fn test_dropped_wifi_reconnects_next_cycle() {
    let config = config();
    let rig = healthy_rig(&config);
    let mut device = ready(config, &rig).await;
    assert_eq!(rig.radio.attempts().len(), 1);

    rig.radio.disconnect();
    device.cycle().await;

    assert_eq!(rig.radio.attempts().len(), 2);
    assert!(device.state().wifi.is_some());
}

// ==============================================================================
// supervision
// ==============================================================================

#[tokio::test(start_paused = true)]
async fn test_watchdog_never_starves() {
    let config = config();
    let rig = healthy_rig(&config);
    rig.time.queue(SimTimeReply::Timeout);
    rig.radio.set_connect_polls(30);
    let mut device = ready(config, &rig).await;

    for i in 0..6 {
        if i == 3 {
            rig.bus.fail_reads(rom(B2));
        }
        device.cycle().await;
    }

    assert!(rig.watchdog.longest_gap() < WATCHDOG_INTERVAL);
}

#[tokio::test(start_paused = true)]
async fn test_run_until_stops_on_shutdown() {
    let config = config();
    let rig = healthy_rig(&config);
    let mut device = ready(config, &rig).await;

    device.run_until(tokio::time::sleep(Duration::from_secs(25))).await;

    // two full cycles fit in 25 s, only the first publishes
    assert_eq!(rig.http.puts().len(), 2);
    assert!(rig.bus.conversions() >= 2);
}
