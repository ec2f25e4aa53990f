//! SNTP clock synchronization.
//!
//! One request, one response, no retries inside: the run loop calls
//! [`sync_clock`] again next cycle if this one fails.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::TimeTransport;
use crate::error::NetworkError;
use crate::hal::ClockSource;

pub const NTP_PORT: u16 = 123;
pub const NTP_PACKET_LEN: usize = 48;

/// Seconds between the NTP epoch (1900) and the Unix epoch (1970).
pub const NTP_UNIX_OFFSET: i64 = 2_208_988_800;

const TRANSMIT_SECONDS: usize = 40;

/// Client request: LI=0, VN=3, Mode=3.
pub fn request_packet() -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = 0x1B;
    packet
}

/// Server-shaped response carrying `time` in the transmit timestamp.
pub fn response_packet(time: DateTime<Utc>) -> [u8; NTP_PACKET_LEN] {
    let mut packet = [0u8; NTP_PACKET_LEN];
    packet[0] = 0x24; // LI=0, VN=4, Mode=4 (server)
    packet[1] = 2;
    let seconds = (time.timestamp() + NTP_UNIX_OFFSET) as u32;
    packet[TRANSMIT_SECONDS..TRANSMIT_SECONDS + 4].copy_from_slice(&seconds.to_be_bytes());
    packet
}

/// Transmit timestamp of a server response, second precision.
pub fn decode_transmit_time(packet: &[u8]) -> Result<DateTime<Utc>, NetworkError> {
    if packet.len() < NTP_PACKET_LEN {
        return Err(NetworkError::InvalidResponse(format!(
            "short packet ({} bytes)",
            packet.len()
        )));
    }
    // stratum 0 is a kiss-o'-death, the timestamp is meaningless
    if packet[1] == 0 {
        return Err(NetworkError::InvalidResponse("stratum 0".to_string()));
    }
    let seconds = u32::from_be_bytes([
        packet[TRANSMIT_SECONDS],
        packet[TRANSMIT_SECONDS + 1],
        packet[TRANSMIT_SECONDS + 2],
        packet[TRANSMIT_SECONDS + 3],
    ]) as i64;
    let unix = seconds - NTP_UNIX_OFFSET;
    if unix <= 0 {
        return Err(NetworkError::InvalidResponse(format!("transmit time {} before 1970", seconds)));
    }
    DateTime::from_timestamp(unix, 0)
        .ok_or_else(|| NetworkError::InvalidResponse(format!("transmit time {} out of range", seconds)))
}

/// Try once to set `clock` from `server`. Failures are logged, never returned.
pub async fn sync_clock(
    transport: &mut dyn TimeTransport,
    clock: &mut dyn ClockSource,
    server: &str,
    timeout: Duration,
) -> bool {
    info!("Starting SNTP synchronization with {}", server);
    let time = match transport
        .exchange(server, &request_packet(), timeout)
        .await
        .and_then(|packet| decode_transmit_time(&packet))
    {
        Ok(time) => time,
        Err(e) => {
            warn!("SNTP sync failed: {}", e);
            return false;
        }
    };
    match clock.set(time) {
        Ok(()) => {
            info!("SNTP sync successful: {} UTC", time.format("%Y-%m-%d %H:%M:%S"));
            true
        }
        Err(e) => {
            warn!("SNTP time {} could not be applied: {}", time, e);
            false
        }
    }
}

// ==============================================================================
// udp transport
// ==============================================================================

/// Real transport. The socket is created and dropped inside `exchange`, so it
/// is released on success, timeout and error alike.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpTimeTransport;

impl UdpTimeTransport {
    async fn resolve(server: &str) -> Result<SocketAddr, NetworkError> {
        tokio::net::lookup_host((server, NTP_PORT))
            .await
            .map_err(|_| NetworkError::Dns(server.to_string()))?
            .find(|addr| addr.is_ipv4())
            .ok_or_else(|| NetworkError::Dns(server.to_string()))
    }
}

#[async_trait(?Send)]
impl TimeTransport for UdpTimeTransport {
    async fn exchange(
        &mut self,
        server: &str,
        request: &[u8; NTP_PACKET_LEN],
        timeout: Duration,
    ) -> Result<Vec<u8>, NetworkError> {
        let server_addr = tokio::time::timeout(timeout, Self::resolve(server)).await??;
        debug!("Resolved {} to {}", server, server_addr);

        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.send_to(request, server_addr).await?;

        let mut response = [0u8; NTP_PACKET_LEN];
        let (len, from) = tokio::time::timeout(timeout, socket.recv_from(&mut response)).await??;
        debug!("Received {} bytes from {}", len, from);
        if from.ip() != server_addr.ip() {
            return Err(NetworkError::InvalidResponse(format!("reply from unexpected peer {}", from)));
        }
        Ok(response[..len].to_vec())
    }
}
