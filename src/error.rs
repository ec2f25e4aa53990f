//! Error types for the sensor box.
//!
//! Each peripheral domain has its own small leaf error so that a capability
//! implementation only has to describe its own failures. They all fold into
//! [`Error`], which is what the bring-up sequencer and the run loop handle.

use std::io;

/// Result type alias using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("display error: {0}")]
    Display(#[from] DisplayError),

    #[error("one-wire bus error: {0}")]
    Bus(#[from] BusError),

    /// A single probe failed during a sensing cycle.
    #[error("Could not get temperature from sensor {label}: {source}")]
    SensorRead {
        label: String,
        #[source]
        source: BusError,
    },

    #[error("radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("clock error: {0}")]
    Clock(#[from] ClockError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("record for sensor {address} has no temperature reading")]
    IncompleteRecord { address: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum DisplayError {
    #[error("display not available: {0}")]
    Unavailable(String),

    #[error("draw failed: {0}")]
    Draw(String),
}

#[derive(thiserror::Error, Debug)]
pub enum BusError {
    #[error("bus scan failed: {0}")]
    Scan(String),

    #[error("temperature conversion failed: {0}")]
    Conversion(String),

    #[error("device {0} did not respond")]
    NoResponse(String),

    #[error("CRC mismatch reading {0}")]
    Crc(String),

    #[error("malformed reading from {device}: {detail}")]
    Malformed { device: String, detail: String },

    #[error("invalid ROM code: {0}")]
    InvalidRom(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum RadioError {
    #[error("radio could not be activated: {0}")]
    Activation(String),

    #[error("network scan failed: {0}")]
    Scan(String),

    #[error("connect to {ssid} failed: {reason}")]
    Connect { ssid: String, reason: String },

    #[error("{0} did not finish in time")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ClockError {
    #[error("timestamp {0} is out of range")]
    OutOfRange(i64),

    #[error("clock could not be set: {0}")]
    Set(String),
}

/// Failures of the HTTP and time-sync transports.
#[derive(thiserror::Error, Debug)]
pub enum NetworkError {
    #[error("DNS resolution failed for {0}")]
    Dns(String),

    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    #[error("request timed out")]
    Timeout,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("HTTP status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for NetworkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            NetworkError::Timeout
        } else {
            NetworkError::Transport(e.to_string())
        }
    }
}

impl From<tokio::time::error::Elapsed> for NetworkError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        NetworkError::Timeout
    }
}
