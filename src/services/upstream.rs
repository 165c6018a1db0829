//! Upstream agent client
//!
//! Opens the streaming response whose body the normalizer consumes. The
//! body is handed over untouched as a byte stream.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::StreamExt;
use reqwest::{header, Client};

use crate::{
    config::UpstreamSettings,
    error::{RelayError, Result},
};

use super::ByteStream;

/// Source of streaming agent responses
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Send the client's request body upstream and return the response body
    async fn open(&self, body: Bytes) -> Result<ByteStream>;
}

/// Forwards requests to an HTTP agent endpoint
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
    url: String,
}

impl HttpUpstream {
    /// Create a client for the configured endpoint
    ///
    /// # Errors
    ///
    /// Returns an error if no URL is configured or the token is not a valid
    /// header value
    pub fn new(settings: &UpstreamSettings) -> Result<Self> {
        let url = settings.url.clone().ok_or_else(|| {
            RelayError::ConfigValidation(
                "upstream.url is required (set RELAY_UPSTREAM_URL or --upstream)".to_string(),
            )
        })?;

        let client = Client::builder()
            .connect_timeout(Duration::from_millis(settings.connect_timeout_ms))
            .default_headers({
                let mut headers = header::HeaderMap::new();
                headers.insert(
                    header::ACCEPT,
                    header::HeaderValue::from_static("text/event-stream, application/json"),
                );
                if let Some(token) = &settings.bearer_token {
                    headers.insert(
                        header::AUTHORIZATION,
                        header::HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                            RelayError::ConfigValidation("Invalid upstream token format".to_string())
                        })?,
                    );
                }
                headers
            })
            .build()?;

        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstream {
    async fn open(&self, body: Bytes) -> Result<ByteStream> {
        tracing::debug!(url = %self.url, bytes = body.len(), "opening upstream stream");

        let response = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            return Err(RelayError::Upstream {
                status: status.as_u16(),
                message: error_text,
            });
        }

        let stream = response.bytes_stream().map(|chunk| chunk.map_err(RelayError::from));
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_is_required() {
        let err = HttpUpstream::new(&UpstreamSettings::default()).unwrap_err();
        assert!(matches!(err, RelayError::ConfigValidation(_)));
    }

    #[test]
    fn test_new_with_token() {
        let settings = UpstreamSettings {
            url: Some("http://127.0.0.1:9/run_sse".to_string()),
            bearer_token: Some("secret".to_string()),
            ..UpstreamSettings::default()
        };
        let upstream = HttpUpstream::new(&settings).unwrap();
        assert_eq!(upstream.url(), "http://127.0.0.1:9/run_sse");
    }

    #[test]
    fn test_token_with_newline_is_rejected() {
        let settings = UpstreamSettings {
            url: Some("http://127.0.0.1:9/run_sse".to_string()),
            bearer_token: Some("bad\ntoken".to_string()),
            ..UpstreamSettings::default()
        };
        assert!(HttpUpstream::new(&settings).is_err());
    }
}
