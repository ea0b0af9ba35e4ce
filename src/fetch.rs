//! HTTP license fetcher for remote ClearKey headers.
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::config::ProtectionConfig;
use crate::error::{Error, Result};
use crate::key_system::LicenseFetcher;

/// reqwest-backed [`LicenseFetcher`].
#[derive(Debug, Clone)]
pub struct HttpLicenseFetcher {
    client: Client,
    timeout: Duration,
}

impl HttpLicenseFetcher {
    /// Build a fetcher with the user agent and request timeout from `config`.
    pub fn new(config: &ProtectionConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            timeout: config.request_timeout(),
        })
    }
}

#[async_trait]
impl LicenseFetcher for HttpLicenseFetcher {
    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Error::network(format!("Failed to contact license server: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            debug!("License server answered {} for {}", status, url);
            return Err(Error::http_status(status.as_u16(), url));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::network(format!("Failed to read license response: {}", e)))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::network(format!("Invalid license response JSON: {}", e)))
    }
}
