//! reqwest-backed [`HttpClient`].

use async_trait::async_trait;
use std::time::Duration;

use super::{HttpClient, HttpResponse};
use crate::error::NetworkError;

pub const USER_AGENT: &str = "Temp Sensor";

pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Every request is bounded by `timeout` so a stalled server cannot
    /// outlast the watchdog.
    pub fn new(timeout: Duration) -> Result<Self, NetworkError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait(?Send)]
impl HttpClient for ReqwestClient {
    async fn get(&self, url: &str) -> Result<HttpResponse, NetworkError> {
        tracing::debug!("GET {}", url);
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }

    async fn put_json(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        body: &serde_json::Value,
    ) -> Result<HttpResponse, NetworkError> {
        tracing::debug!("PUT {}", url);
        let mut request = self.client.put(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }
}
