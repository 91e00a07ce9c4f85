//! Telephony provider recording download

use async_trait::async_trait;
use callhub_common::config::ProviderConfig;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Recording download errors
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("Provider answered HTTP {0}")]
    Status(u16),

    #[error("Download timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid recording URL: {0}")]
    InvalidUrl(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else if let Some(status) = err.status() {
            FetchError::Status(status.as_u16())
        } else {
            FetchError::Network(err.to_string())
        }
    }
}

/// Downloaded recording bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRecording {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Fetches recording media from the provider
#[async_trait]
pub trait RecordingFetcher: Send + Sync {
    async fn fetch(&self, recording_url: &str) -> Result<FetchedRecording, FetchError>;
}

/// Authenticated provider HTTP client
pub struct ProviderClient {
    http_client: reqwest::Client,
    account_sid: Option<String>,
    auth_token: Option<String>,
    extension: String,
}

impl ProviderClient {
    /// Build a client whose every download is bounded by `timeout`
    pub fn new(config: &ProviderConfig, timeout: Duration) -> Result<Self, FetchError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            extension: config.recording_extension.trim_start_matches('.').to_string(),
        })
    }

    /// Provider recording URLs name a resource; the media needs an extension
    fn media_url(&self, recording_url: &str) -> String {
        let (base, query) = match recording_url.split_once('?') {
            Some((base, query)) => (base, Some(query)),
            None => (recording_url, None),
        };
        let last_segment = base.rsplit('/').next().unwrap_or(base);

        let mut url = base.to_string();
        if !last_segment.contains('.') && !self.extension.is_empty() {
            url.push('.');
            url.push_str(&self.extension);
        }
        if let Some(query) = query {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

#[async_trait]
impl RecordingFetcher for ProviderClient {
    async fn fetch(&self, recording_url: &str) -> Result<FetchedRecording, FetchError> {
        if !(recording_url.starts_with("https://") || recording_url.starts_with("http://")) {
            return Err(FetchError::InvalidUrl(recording_url.to_string()));
        }

        let url = self.media_url(recording_url);
        debug!("Provider: downloading recording {}", url);

        let mut request = self.http_client.get(&url);
        if let Some(sid) = &self.account_sid {
            request = request.basic_auth(sid, self.auth_token.as_deref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;

        debug!("Provider: downloaded {} bytes from {}", bytes.len(), url);
        Ok(FetchedRecording {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}
