//! Remote layer archive sources.
//!
//! Layers are probed asynchronously before a bundle is committed to and then
//! read synchronously by the composer on a blocking thread.

use std::io::Read;

use async_trait::async_trait;
use bundler_core::error::{BundleError, Result};
use futures::TryStreamExt;
use reqwest::StatusCode;
use tokio::runtime::Handle;
use tokio_util::io::{StreamReader, SyncIoBridge};

/// Source of gzip-compressed tar layers addressed by URL.
#[async_trait]
pub trait LayerSource: Send + Sync {
    /// Confirm the layer exists without downloading it.
    async fn probe(&self, url: &str) -> Result<()>;

    /// Open the layer for reading. Called from a blocking thread.
    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>>;
}

/// HTTP(S) layer source backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpLayerSource {
    client: reqwest::Client,
}

impl HttpLayerSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn status_error(url: &str, status: StatusCode) -> BundleError {
    BundleError::SourceFetch {
        url: url.to_string(),
        message: format!("unexpected response status {}", status.as_u16()),
    }
}

#[async_trait]
impl LayerSource for HttpLayerSource {
    async fn probe(&self, url: &str) -> Result<()> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| BundleError::SourceFetch {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        if response.status() != StatusCode::OK {
            return Err(status_error(url, response.status()));
        }
        Ok(())
    }

    fn open(&self, url: &str) -> Result<Box<dyn Read + Send>> {
        let handle = Handle::try_current().map_err(|e| BundleError::SourceFetch {
            url: url.to_string(),
            message: format!("no async runtime available: {}", e),
        })?;

        let response = handle
            .block_on(self.client.get(url).send())
            .map_err(|e| BundleError::SourceFetch {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        if response.status() != StatusCode::OK {
            return Err(status_error(url, response.status()));
        }

        let body = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
        );
        Ok(Box::new(SyncIoBridge::new_with_handle(
            StreamReader::new(body),
            handle,
        )))
    }
}
