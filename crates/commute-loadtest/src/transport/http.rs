//! Backend transport over HTTP.

use super::{BackendRequest, BackendTransport};
use crate::config::BackendSettings;
use crate::error::TransportError;
use async_trait::async_trait;
use tracing::trace;

/// Header carrying the shared load-test key.
pub const LOADTEST_KEY_HEADER: &str = "X-Loadtest-Key";

/// reqwest client for one device.
///
/// Keeps its own cookie store, so the session established by
/// authentication is sent with every later request from the same device.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    secret_key: Option<String>,
}

impl HttpBackend {
    pub fn new(settings: &BackendSettings) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().cookie_store(true).build()?;

        Ok(Self {
            client,
            base_url: settings.server_url.trim_end_matches('/').to_string(),
            secret_key: settings.secret_key.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl BackendTransport for HttpBackend {
    async fn send(&self, request: &BackendRequest) -> Result<u16, TransportError> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .timeout(request.timeout);

        if let Some(key) = &self.secret_key {
            builder = builder.header(LOADTEST_KEY_HEADER, key);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();

        // Drain the body so the connection can be reused
        let body = response.bytes().await.unwrap_or_default();
        trace!("{} {} -> {} ({} bytes)", request.method, url, status, body.len());

        Ok(status)
    }
}
