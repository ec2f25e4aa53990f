//! Remote sensor metadata.
//!
//! The document maps ROM hex to the cable label printed on each probe, and
//! cable labels to what the probe is currently monitoring:
//!
//! ```json
//! {
//!   "readme": "ignored by the device",
//!   "rom_hex_to_cable_number": { "28ff641e8216035c": "3" },
//!   "sensors": { "3": { "short_name": "Walk In Freezer", "maximum_temp": 10 } }
//! }
//! ```
//!
//! Other per-sensor keys (thresholds and so on) belong to the downstream
//! checks and are ignored here. Entries for cables this device does not carry
//! may be partial; only the entries of connected sensors need a `short_name`.

use serde::Deserialize;
use std::collections::HashMap;
use tracing::{info, warn};

use super::HttpClient;
use crate::domain::{Sensor, INACTIVE_NAME};
use crate::error::{NetworkError, Result};

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SensorConfigDocument {
    pub rom_hex_to_cable_number: HashMap<String, String>,
    pub sensors: HashMap<String, SensorDetails>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SensorDetails {
    #[serde(default)]
    pub short_name: Option<String>,
}

/// What the document says one sensor should look like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub label: String,
    pub display_name: String,
    pub is_active: bool,
}

impl SensorConfigDocument {
    /// Fails when the sensor's cable is monitored but has no `short_name`.
    pub fn assignment_for(&self, sensor: &Sensor) -> std::result::Result<Assignment, NetworkError> {
        let label = self
            .rom_hex_to_cable_number
            .get(&sensor.address().to_hex())
            .cloned();
        match label.as_ref().and_then(|l| self.sensors.get(l)) {
            Some(details) => {
                let display_name = details.short_name.clone().ok_or_else(|| {
                    NetworkError::InvalidResponse(format!(
                        "sensor entry {} has no short_name",
                        label.as_deref().unwrap_or_default()
                    ))
                })?;
                Ok(Assignment {
                    label: label.unwrap_or_else(|| sensor.label().to_string()),
                    display_name,
                    is_active: true,
                })
            }
            None => Ok(Assignment {
                label: label.unwrap_or_else(|| sensor.label().to_string()),
                display_name: INACTIVE_NAME.to_string(),
                is_active: false,
            }),
        }
    }

    /// Overwrite label, name and active flag of every sensor, or of none.
    pub fn apply(&self, sensors: &mut [Sensor]) -> Result<()> {
        let assignments = sensors
            .iter()
            .map(|s| self.assignment_for(s))
            .collect::<std::result::Result<Vec<Assignment>, NetworkError>>()?;
        for (sensor, assignment) in sensors.iter_mut().zip(assignments) {
            sensor.assign(assignment.label, assignment.display_name, assignment.is_active);
        }
        Ok(())
    }
}

pub async fn fetch_document(http: &dyn HttpClient, url: &str) -> Result<SensorConfigDocument> {
    let response = http.get(url).await?;
    if !response.is_success() {
        return Err(NetworkError::Status { status: response.status, body: response.body }.into());
    }
    Ok(serde_json::from_str(&response.body)?)
}

/// Fetch the document and apply it. On any failure the sensors are untouched
/// and `false` is returned.
pub async fn refresh_sensor_config(http: &dyn HttpClient, url: &str, sensors: &mut [Sensor]) -> bool {
    match fetch_document(http, url).await.and_then(|document| document.apply(sensors)) {
        Ok(()) => {
            let active = sensors.iter().filter(|s| s.is_active()).count();
            info!("Sensor config applied: {}/{} active", active, sensors.len());
            true
        }
        Err(e) => {
            warn!("Could not retrieve sensor config: {}", e);
            false
        }
    }
}
