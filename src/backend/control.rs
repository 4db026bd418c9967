//! HTTP control surface of a running backend.
//!
//! Two calls, both `POST` with an empty body: reload (re-read the source
//! directory) and graceful stop. Response bodies are ignored; any non-2xx
//! status or transport error is a failure.

use std::time::Duration;

use tracing::debug;

use crate::config::EndpointConfig;
use crate::{AppError, Result};

/// Client for one backend's control endpoints.
#[derive(Debug, Clone)]
pub struct BackendControl {
    client: reqwest::Client,
    address: String,
    endpoints: EndpointConfig,
    reload_timeout: Duration,
    stop_timeout: Duration,
}

impl BackendControl {
    /// Build a client for the backend at `address` (`http://host:port`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Control` if the HTTP client cannot be built.
    pub fn new(
        address: impl Into<String>,
        endpoints: EndpointConfig,
        reload_timeout: Duration,
        stop_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .map_err(|err| AppError::Control(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            address: address.into(),
            endpoints,
            reload_timeout,
            stop_timeout,
        })
    }

    /// Base address of the backend.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Ask the backend to re-read its source directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Control` on transport failure, timeout, or a
    /// non-success status.
    pub async fn reload(&self) -> Result<()> {
        self.post(&self.endpoints.reload, self.reload_timeout).await
    }

    /// Ask the backend to shut down.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Control` on transport failure, timeout, or a
    /// non-success status.
    pub async fn stop(&self) -> Result<()> {
        self.post(&self.endpoints.stop, self.stop_timeout).await
    }

    async fn post(&self, path: &str, timeout: Duration) -> Result<()> {
        let url = format!("{}{path}", self.address);
        let response = self
            .client
            .post(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|err| AppError::Control(format!("POST {url} failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::Control(format!("POST {url} returned {status}")));
        }

        debug!(%url, %status, "control request succeeded");
        Ok(())
    }
}
