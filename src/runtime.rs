//! ==============================================================================
//! runtime.rs - supervised run loop
//! ==============================================================================
//!
//! purpose:
//!     owns the device after a successful bring-up and repeats one cycle
//!     forever: sense, keep the network up, publish when due, redraw the
//!     status page, sleep. every wait is watchdog-fed.
//!
//! cycle:
//!
//! ```text
//!     sense ──err──> fault screen, 30 fed ticks ──────────────┐
//!       │                                                      │
//!       ▼                                                      │
//!     wifi up? ──no──> connect_wifi                            │
//!       │                                                      │
//!       ▼ (connected)                                          │
//!     sync clock once, fetch config once, publish if due       │
//!       │                                                      │
//!       ▼                                                      │
//!     status page, 10 fed ticks ─────────────────> next cycle <┘
//! ```
//!
//! relationships:
//!     - created by: bringup.rs
//!     - uses: sensing.rs, network/*, publish.rs, status.rs, watchdog.rs
//!
//! ==============================================================================

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::domain::DeviceState;
use crate::error::Result;
use crate::hal::Peripherals;
use crate::network::{ntp, remote_config, wifi};
use crate::publish::publish;
use crate::sensing::update_temperatures;
use crate::status::{render_status, show_fault};
use crate::watchdog::sleep_fed;

/// Minimum spacing of successful publishes.
pub const PUBLISH_INTERVAL: Duration = Duration::from_secs(3600);

/// Fed one-second ticks between cycles.
pub const CYCLE_TICKS: u32 = 10;

/// Fed one-second ticks after a faulted cycle.
pub const COOLDOWN_TICKS: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// `published` is `None` when no publish was due, otherwise whether
    /// every sensor was stored.
    Completed { published: Option<bool> },
    /// The cycle body failed with this message; the cooldown has run.
    Faulted(String),
}

/// A brought-up device: configuration, peripherals and the state they feed.
pub struct SensorBox {
    config: DeviceConfig,
    peripherals: Peripherals,
    state: DeviceState,
}

impl SensorBox {
    pub fn new(config: DeviceConfig, peripherals: Peripherals, state: DeviceState) -> Self {
        Self { config, peripherals, state }
    }

    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Run one cycle including its trailing wait.
    pub async fn cycle(&mut self) -> CycleOutcome {
        match self.cycle_body().await {
            Ok(published) => {
                sleep_fed(self.peripherals.watchdog.as_mut(), CYCLE_TICKS).await;
                CycleOutcome::Completed { published }
            }
            Err(e) => {
                let message = e.to_string();
                show_fault(self.peripherals.display.as_mut(), &message);
                sleep_fed(self.peripherals.watchdog.as_mut(), COOLDOWN_TICKS).await;
                CycleOutcome::Faulted(message)
            }
        }
    }

    async fn cycle_body(&mut self) -> Result<Option<bool>> {
        let p = &mut self.peripherals;
        let state = &mut self.state;

        update_temperatures(p.bus.as_mut(), p.watchdog.as_mut(), &mut state.sensors).await?;
        p.watchdog.feed();
        state.last_sensed_at = Some(p.clock.now());

        if state.wifi.is_none() || !p.radio.is_connected().await {
            state.wifi = None;
            state.wifi = wifi::connect_wifi(p.radio.as_mut(), p.watchdog.as_mut(), &self.config.wifi).await;
            p.watchdog.feed();
        }

        let mut published = None;
        if state.wifi.is_some() {
            if !state.time_synced {
                state.time_synced = ntp::sync_clock(
                    p.time.as_mut(),
                    p.clock.as_mut(),
                    &self.config.time.server,
                    self.config.time.timeout(),
                )
                .await;
                p.watchdog.feed();
            }
            if !state.config_retrieved {
                state.config_retrieved = remote_config::refresh_sensor_config(
                    p.http.as_ref(),
                    &self.config.remote.config_url,
                    &mut state.sensors,
                )
                .await;
                p.watchdog.feed();
            }
            if publish_due(state) {
                let measured_at = p.clock.now();
                let report = publish(
                    p.http.as_ref(),
                    p.watchdog.as_mut(),
                    &self.config.remote,
                    &state.sensors,
                    measured_at,
                )
                .await;
                let ok = report.all_successful();
                if ok {
                    state.last_published_at = Some(measured_at);
                    state.last_publish_instant = Some(Instant::now());
                } else {
                    warn!("{}/{} sensors failed to publish", report.failures.len(), report.attempted);
                }
                state.last_publish_had_errors = !ok;
                published = Some(ok);
                p.watchdog.feed();
            }
        }

        if let Err(e) = render_status(p.display.as_mut(), state) {
            warn!("Could not draw status page: {}", e);
        }
        Ok(published)
    }

    /// Cycle until `shutdown` completes. A cycle in progress is abandoned at
    /// its next suspension point. `std::future::pending()` cycles forever.
    pub async fn run_until<F: Future>(&mut self, shutdown: F) {
        info!("Entering run loop");
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, leaving run loop");
                    return;
                }
                outcome = self.cycle() => debug!("Cycle finished: {:?}", outcome),
            }
        }
    }
}

/// Connected is checked by the caller. Never publish on an unsynced clock.
///
/// The first publish happens on the first cycle that has a synced clock, which
/// is not the first cycle when the sync at bring-up failed. After that a
/// publish is due once an hour has passed since the last full success; a
/// failed round leaves that instant alone, so it is retried every cycle.
fn publish_due(state: &DeviceState) -> bool {
    if !state.time_synced {
        return false;
    }
    match state.last_publish_instant {
        None => true,
        Some(at) => at.elapsed() > PUBLISH_INTERVAL,
    }
}
