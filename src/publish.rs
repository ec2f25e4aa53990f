//! Publish pipeline: one upsert per sensor to the content store.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use crate::config::RemoteConfig;
use crate::domain::{Record, Sensor};
use crate::error::{NetworkError, Result};
use crate::network::http::USER_AGENT;
use crate::network::HttpClient;
use crate::watchdog::Watchdog;

/// Outcome of one publish round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub attempted: usize,
    /// (sensor address hex, reason) for every sensor that was not stored.
    pub failures: Vec<(String, String)>,
}

impl PublishReport {
    pub fn all_successful(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Upsert one record per sensor, all stamped `measured_at`.
///
/// A failing sensor never stops the others; the watchdog is fed between
/// requests since each one may take up to the HTTP timeout.
pub async fn publish(
    http: &dyn HttpClient,
    watchdog: &mut dyn Watchdog,
    remote: &RemoteConfig,
    sensors: &[Sensor],
    measured_at: DateTime<Utc>,
) -> PublishReport {
    let token = remote.resolved_token();
    let mut report = PublishReport::default();

    for sensor in sensors {
        report.attempted += 1;
        match publish_one(http, remote, &token, sensor, measured_at).await {
            Ok(path) => info!("Published {}", path),
            Err(e) => {
                warn!("Could not publish {}: {}", sensor.address(), e);
                report.failures.push((sensor.address().to_hex(), e.to_string()));
            }
        }
        watchdog.feed();
    }

    report
}

async fn publish_one(
    http: &dyn HttpClient,
    remote: &RemoteConfig,
    token: &str,
    sensor: &Sensor,
    measured_at: DateTime<Utc>,
) -> Result<String> {
    let record = Record::from_sensor(sensor, measured_at)?;
    let path = record.path();
    let body = json!({
        "message": format!("Updating {}", path),
        "content": record.encoded_body(),
        "branch": remote.branch,
    });
    let headers = [
        ("Accept", "application/vnd.github+json".to_string()),
        ("User-Agent", USER_AGENT.to_string()),
        ("Authorization", format!("Token {}", token)),
    ];

    let response = http.put_json(&remote.contents_url(&path), &headers, &body).await?;
    if !response.is_success() {
        return Err(NetworkError::Status { status: response.status, body: response.body }.into());
    }
    Ok(path)
}
