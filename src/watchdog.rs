//! Watchdog supervisor.
//!
//! The hardware timer reboots the device unless it is fed at least once every
//! [`WATCHDOG_INTERVAL`]. Every wait in the crate goes through [`sleep_fed`] or
//! feeds on a tighter cadence itself.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::Result;

/// Hardware reset interval.
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(8);

/// Length of one fed sleep tick.
pub const TICK: Duration = Duration::from_secs(1);

pub trait Watchdog {
    /// Reset the reboot timer. Never fails.
    fn feed(&mut self);
}

/// Used when protection is intentionally off (development, tests).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWatchdog;

impl Watchdog for NoopWatchdog {
    fn feed(&mut self) {}
}

// linux/watchdog.h: _IOWR('W', 6, int)
const WDIOC_SETTIMEOUT: libc::c_ulong = 0xC004_5706;

/// Linux watchdog device (`/dev/watchdog`).
///
/// The device is never magic-closed: if the process dies the timer keeps
/// running and the board reboots.
pub struct HardwareWatchdog {
    device: File,
}

impl HardwareWatchdog {
    /// Open the device and arm it with [`WATCHDOG_INTERVAL`].
    pub fn open(path: &Path) -> Result<Self> {
        let device = OpenOptions::new().write(true).open(path)?;
        set_timeout(&device, WATCHDOG_INTERVAL);
        info!("Watchdog armed on {} ({}s)", path.display(), WATCHDOG_INTERVAL.as_secs());
        let mut watchdog = Self { device };
        watchdog.feed();
        Ok(watchdog)
    }
}

fn set_timeout(device: &File, interval: Duration) {
    use std::os::unix::io::AsRawFd;

    let mut secs = interval.as_secs() as libc::c_int;
    // SAFETY: fd is open for the lifetime of `device`, secs outlives the call
    let rc = unsafe { libc::ioctl(device.as_raw_fd(), WDIOC_SETTIMEOUT as _, &mut secs) };
    if rc != 0 {
        warn!(
            "Could not set watchdog timeout, driver default applies: {}",
            std::io::Error::last_os_error()
        );
    } else {
        debug!("Watchdog timeout now {}s", secs);
    }
}

impl Watchdog for HardwareWatchdog {
    fn feed(&mut self) {
        if let Err(e) = self.device.write_all(b"\0").and_then(|_| self.device.flush()) {
            warn!("Watchdog feed failed: {}", e);
        }
    }
}

/// Sleep `ticks` seconds, feeding after every tick.
pub async fn sleep_fed(watchdog: &mut dyn Watchdog, ticks: u32) {
    for _ in 0..ticks {
        tokio::time::sleep(TICK).await;
        watchdog.feed();
    }
}
