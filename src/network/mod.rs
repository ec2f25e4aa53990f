//! ==============================================================================
//! network - Network Resilience Manager
//! ==============================================================================
//!
//! purpose:
//!     the three independently retryable network operations of the device
//!     and the transports they run over.
//!
//! ```text
//!     - wifi.rs:           connect_wifi (preference-ordered, watchdog-fed polling)
//!     - ntp.rs:            sync_clock (one UDP exchange, never raises)
//!     - remote_config.rs:  refresh_sensor_config (all-or-nothing apply)
//!     - http.rs:           reqwest-backed HttpClient
//! ```
//!
//! every operation is idempotent and swallows its own failures; the run loop
//! decides the retry cadence.
//!
//! ==============================================================================

pub mod http;
pub mod ntp;
pub mod remote_config;
pub mod wifi;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::NetworkError;

/// Status and body of a completed HTTP exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    /// The content store answers 200 (updated) or 201 (created).
    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 201)
    }
}

#[async_trait(?Send)]
pub trait HttpClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, NetworkError>;

    async fn put_json(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        body: &serde_json::Value,
    ) -> Result<HttpResponse, NetworkError>;
}

/// One request/response exchange with a time server.
///
/// Implementations own their socket for the duration of the call only.
#[async_trait(?Send)]
pub trait TimeTransport {
    async fn exchange(
        &mut self,
        server: &str,
        request: &[u8; ntp::NTP_PACKET_LEN],
        timeout: Duration,
    ) -> Result<Vec<u8>, NetworkError>;
}
