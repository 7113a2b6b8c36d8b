use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::allowlist::DEFAULT_ALLOWED_REGISTRIES;

/// Bundler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundlerConfig {
    /// Address the HTTP server binds to
    pub listen: SocketAddr,

    /// Base URL of the installer manifest service (also the proxy target)
    pub upstream_url: String,

    /// Parent directory for per-request image scratch directories
    pub scratch_dir: PathBuf,

    /// Registrable domains images may be pulled from
    pub allowed_registries: Vec<String>,

    /// Installer lint endpoint; interception is disabled when unset
    pub lint_url: Option<String>,

    /// Connect timeout for outbound HTTP clients in seconds
    pub connect_timeout_secs: u64,

    /// Build identifier reported by the health endpoint
    pub version: String,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3001)),
            upstream_url: "http://localhost:3000".to_string(),
            scratch_dir: PathBuf::from("/images"),
            allowed_registries: DEFAULT_ALLOWED_REGISTRIES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            lint_url: None,
            connect_timeout_secs: 30,
            version: crate::VERSION.to_string(),
        }
    }
}

impl BundlerConfig {
    /// Upstream base URL without a trailing slash.
    pub fn upstream_base(&self) -> &str {
        self.upstream_url.trim_end_matches('/')
    }
}
