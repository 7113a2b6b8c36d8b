//! Installer manifest resolution against the upstream installer API.
//!
//! The manifest lookup is the last point at which a failure can still be
//! reported with an HTTP status, so every failure mode maps onto a distinct
//! [`BundleError`] variant and nothing is retried.

use std::net::IpAddr;

use bundler_core::error::{BundleError, Result};
use bundler_core::BundleManifest;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT_ENCODING};
use reqwest::StatusCode;

/// Conventional download suffix stripped from installer ids.
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Installer identity taken from a bundle request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallerTarget {
    pub installer_id: String,
    pub kurl_version: Option<String>,
}

impl InstallerTarget {
    pub fn new(installer_id: &str, kurl_version: Option<&str>) -> Self {
        let installer_id = installer_id
            .strip_suffix(ARCHIVE_SUFFIX)
            .unwrap_or(installer_id);
        Self {
            installer_id: installer_id.to_string(),
            kurl_version: kurl_version
                .filter(|v| !v.is_empty())
                .map(str::to_string),
        }
    }

    /// Path of the manifest on the upstream API.
    pub fn manifest_path(&self) -> String {
        match self.kurl_version {
            Some(ref version) => format!("/bundle/version/{}/{}", version, self.installer_id),
            None => format!("/bundle/{}", self.installer_id),
        }
    }
}

impl std::fmt::Display for InstallerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kurl_version {
            Some(ref version) => write!(f, "{}@{}", self.installer_id, version),
            None => write!(f, "{}", self.installer_id),
        }
    }
}

/// Whether a header is connection-scoped.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Copy end-to-end request headers, adding `X-Forwarded-For` from the peer
/// address when the client did not send one.
pub fn forwarded_headers(incoming: &HeaderMap, remote: Option<IpAddr>) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(incoming.len() + 1);
    for (name, value) in incoming {
        if !is_hop_by_hop(name) {
            headers.append(name.clone(), value.clone());
        }
    }

    let forwarded_for = HeaderName::from_static(X_FORWARDED_FOR);
    if !headers.contains_key(&forwarded_for) {
        if let Some(ip) = remote {
            if let Ok(value) = HeaderValue::from_str(&ip.to_string()) {
                headers.insert(forwarded_for, value);
            }
        }
    }
    headers
}

/// Fetches bundle manifests from the upstream installer API.
#[derive(Debug, Clone)]
pub struct ManifestResolver {
    client: reqwest::Client,
    upstream: String,
}

impl ManifestResolver {
    pub fn new(client: reqwest::Client, upstream: impl Into<String>) -> Self {
        let upstream: String = upstream.into();
        Self {
            client,
            upstream: upstream.trim_end_matches('/').to_string(),
        }
    }

    /// Full manifest URL for a target.
    pub fn manifest_url(&self, target: &InstallerTarget) -> String {
        format!("{}{}", self.upstream, target.manifest_path())
    }

    /// Fetch and decode the manifest for `target`.
    ///
    /// The caller's headers are forwarded for request tracing.
    pub async fn resolve(
        &self,
        target: &InstallerTarget,
        headers: &HeaderMap,
        remote: Option<IpAddr>,
    ) -> Result<BundleManifest> {
        let url = self.manifest_url(target);

        let mut forwarded = forwarded_headers(headers, remote);
        // The body is decoded here, so ask for it uncompressed.
        forwarded.remove(ACCEPT_ENCODING);

        let response = self
            .client
            .get(&url)
            .headers(forwarded)
            .send()
            .await
            .map_err(|e| BundleError::UpstreamUnavailable(format!("error fetching {}: {}", url, e)))?;

        let status = response.status();
        let body = response.bytes().await.map_err(|e| {
            BundleError::UpstreamUnavailable(format!(
                "error reading response body from {}: {}",
                url, e
            ))
        })?;

        if status == StatusCode::NOT_FOUND {
            return Err(BundleError::NotFound {
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        if !status.is_success() {
            return Err(BundleError::UpstreamUnavailable(format!(
                "{} responded with status {}",
                url, status
            )));
        }

        let manifest = BundleManifest::from_json(&body).map_err(|e| match e {
            BundleError::ManifestDecode(message) => {
                BundleError::ManifestDecode(format!("{}: {}", url, message))
            }
            other => other,
        })?;

        tracing::debug!(
            installer = %target,
            layers = manifest.layers.len(),
            files = manifest.files.len(),
            images = manifest.images.len(),
            "Resolved bundle manifest"
        );

        Ok(manifest)
    }
}
