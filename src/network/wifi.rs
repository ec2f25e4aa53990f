//! Wi-Fi (re)connection.

use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::WifiNetwork;
use crate::domain::WifiIdentity;
use crate::hal::RadioLink;
use crate::watchdog::Watchdog;

/// Upper bound for one association attempt.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const CONNECT_POLL: Duration = Duration::from_millis(200);

/// Try every visible network of `networks` in preference order and stop at
/// the first that associates. `None` means no network could be joined.
pub async fn connect_wifi(
    radio: &mut dyn RadioLink,
    watchdog: &mut dyn Watchdog,
    networks: &[WifiNetwork],
) -> Option<WifiIdentity> {
    watchdog.feed();
    let scanned = radio.scan().await;
    watchdog.feed();
    let visible: HashSet<String> = match scanned {
        Ok(ssids) => ssids.into_iter().collect(),
        Err(e) => {
            warn!("Wi-Fi scan failed: {}", e);
            return None;
        }
    };
    debug!("Visible networks: {:?}", visible);

    for network in networks {
        if !visible.contains(&network.ssid) {
            continue;
        }
        info!("Connecting to {}", network.ssid);
        let attempt = radio.connect(&network.ssid, &network.passphrase).await;
        watchdog.feed();
        if let Err(e) = attempt {
            warn!("{}", e);
            continue;
        }

        let started = Instant::now();
        let mut associated = radio.is_connected().await;
        while !associated {
            if started.elapsed() > CONNECT_TIMEOUT {
                warn!("Timed out joining {}", network.ssid);
                break;
            }
            tokio::time::sleep(CONNECT_POLL).await;
            watchdog.feed();
            associated = radio.is_connected().await;
        }

        if associated {
            let identity = radio.identity().await;
            watchdog.feed();
            let identity = identity.unwrap_or_else(|| WifiIdentity {
                ssid: network.ssid.clone(),
                ip: String::new(),
            });
            info!("Wi-Fi connected: {} ({})", identity.ssid, identity.ip);
            return Some(identity);
        }
    }

    warn!("No configured Wi-Fi network could be joined");
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::sim::{SimRadio, SimWatchdog};

    fn networks() -> Vec<WifiNetwork> {
        vec![
            WifiNetwork { ssid: "shop".to_string(), passphrase: "wrong".to_string() },
            WifiNetwork { ssid: "absent".to_string(), passphrase: "x".to_string() },
            WifiNetwork { ssid: "office".to_string(), passphrase: "pw".to_string() },
        ]
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_through_to_next_preference() {
        let radio = SimRadio::new();
        radio.add_network("shop", "right");
        radio.add_network("office", "pw");
        let watchdog = SimWatchdog::new();

        let identity = connect_wifi(&mut radio.clone(), &mut watchdog.clone(), &networks()).await;

        assert_eq!(identity.map(|i| i.ssid), Some("office".to_string()));
        // "absent" is never tried because it is not visible
        assert_eq!(radio.attempts(), vec!["shop".to_string(), "office".to_string()]);
        assert!(watchdog.longest_gap() <= CONNECT_POLL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_is_bounded_by_timeout() {
        let radio = SimRadio::new();
        radio.add_network("shop", "right");
        let watchdog = SimWatchdog::new();
        let start = Instant::now();

        let identity = connect_wifi(&mut radio.clone(), &mut watchdog.clone(), &networks()[..1]).await;

        assert!(identity.is_none());
        let waited = start.elapsed();
        assert!(waited >= CONNECT_TIMEOUT);
        assert!(waited <= CONNECT_TIMEOUT + 2 * CONNECT_POLL);
        assert!(watchdog.feeds() >= 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_visible() {
        let radio = SimRadio::new();
        let identity = connect_wifi(&mut radio.clone(), &mut SimWatchdog::new(), &networks()).await;
        assert!(identity.is_none());
        assert!(radio.attempts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_feeds_around_slow_scan() {
        let radio = SimRadio::new();
        radio.add_network("office", "pw");
        radio.set_scan_time(Duration::from_secs(5));
        let watchdog = SimWatchdog::new();

        let identity = connect_wifi(&mut radio.clone(), &mut watchdog.clone(), &networks()).await;

        assert!(identity.is_some());
        assert!(watchdog.longest_gap() <= Duration::from_secs(5));
        assert!(watchdog.longest_gap() < crate::watchdog::WATCHDOG_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_association_within_timeout() {
        let radio = SimRadio::new();
        radio.add_network("office", "pw");
        radio.set_connect_polls(20);
        let identity = connect_wifi(&mut radio.clone(), &mut SimWatchdog::new(), &networks()).await;
        assert_eq!(identity.unwrap().ip, crate::hal::sim::SIM_IP);
    }
}
