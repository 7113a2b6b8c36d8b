//! Shared server state.

use std::sync::Arc;
use std::time::Duration;

use bundler_core::error::{BundleError, Result};
use bundler_core::{BundlerConfig, RegistryAllowlist};
use bundler_runtime::{HttpLayerSource, ImageFetcher, LayerSource, ManifestResolver, RegistryArchivePuller};

use crate::lifecycle::StreamTracker;
use crate::lint::{HttpLinter, InstallerLinter};

/// State handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Immutable after start-up
    pub config: Arc<BundlerConfig>,

    pub resolver: ManifestResolver,

    pub allowlist: Arc<RegistryAllowlist>,

    /// Remote layer archives
    pub layers: Arc<dyn LayerSource>,

    /// Container image pulls for the prefetch pipeline
    pub images: Arc<dyn ImageFetcher>,

    /// Installer linter; `None` disables lint interception
    pub linter: Option<Arc<dyn InstallerLinter>>,

    /// Client for the reverse proxy; does not follow redirects
    pub proxy_client: reqwest::Client,

    pub streams: StreamTracker,
}

impl AppState {
    /// Build production collaborators from configuration.
    pub fn from_config(config: BundlerConfig) -> Result<Self> {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);

        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| BundleError::Config(format!("failed to build HTTP client: {}", e)))?;

        let proxy_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| BundleError::Config(format!("failed to build proxy client: {}", e)))?;

        let linter = config
            .lint_url
            .as_ref()
            .map(|url| Arc::new(HttpLinter::new(client.clone(), url.clone())) as Arc<dyn InstallerLinter>);

        Ok(Self {
            resolver: ManifestResolver::new(client.clone(), config.upstream_base()),
            allowlist: Arc::new(RegistryAllowlist::new(config.allowed_registries.iter().cloned())),
            layers: Arc::new(HttpLayerSource::new(client)),
            images: Arc::new(RegistryArchivePuller::new()),
            linter,
            proxy_client,
            streams: StreamTracker::new(),
            config: Arc::new(config),
        })
    }

    pub fn with_layer_source(mut self, layers: Arc<dyn LayerSource>) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_image_fetcher(mut self, images: Arc<dyn ImageFetcher>) -> Self {
        self.images = images;
        self
    }

    pub fn with_linter(mut self, linter: Arc<dyn InstallerLinter>) -> Self {
        self.linter = Some(linter);
        self
    }

    /// Upstream base URL without a trailing slash.
    pub fn upstream(&self) -> &str {
        self.config.upstream_base()
    }
}
