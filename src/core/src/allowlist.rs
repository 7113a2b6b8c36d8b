//! Registry allowlist for images embedded in bundles.

use std::collections::HashSet;

use crate::error::{BundleError, Result};
use crate::reference::ImageReference;

/// Registrable domains accepted when no allowlist is configured.
pub const DEFAULT_ALLOWED_REGISTRIES: &[&str] = &[
    "docker.io",
    "gcr.io",
    "ghcr.io",
    "azurecr.io",
    "ttl.sh",
    "ecr.us-east-1.amazonaws.com",
];

/// Fixed set of registrable registry domains, immutable after start-up.
#[derive(Debug, Clone)]
pub struct RegistryAllowlist {
    domains: HashSet<String>,
}

impl RegistryAllowlist {
    pub fn new<I, S>(domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            domains: domains
                .into_iter()
                .map(|d| {
                    let d: String = d.into();
                    d.trim().to_ascii_lowercase()
                })
                .filter(|d| !d.is_empty())
                .collect(),
        }
    }

    /// Whether images may be pulled from the registry named in `image`.
    ///
    /// Malformed references are never allowed.
    pub fn allows(&self, image: &str) -> bool {
        ImageReference::parse(image)
            .ok()
            .and_then(|reference| registrable_domain(&reference))
            .is_some_and(|domain| self.domains.contains(&domain))
    }

    /// Reject the first image whose registry is not allowed.
    pub fn check_all<'a, I>(&self, images: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a String>,
    {
        for image in images {
            if !self.allows(image) {
                tracing::warn!(image = %image, "Rejecting image from unsupported registry");
                return Err(BundleError::DisallowedImage(image.clone()));
            }
        }
        Ok(())
    }
}

impl Default for RegistryAllowlist {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_REGISTRIES.iter().copied())
    }
}

/// Effective TLD plus one label of the registry host.
///
/// Registries addressed with an explicit port have no registrable domain.
fn registrable_domain(reference: &ImageReference) -> Option<String> {
    if reference.has_port() {
        return None;
    }
    let host = reference.host().to_ascii_lowercase();
    psl::domain_str(&host).map(str::to_string)
}
