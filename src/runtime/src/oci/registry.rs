//! Registry-backed image puller.
//!
//! Uses the `oci-distribution` crate to fetch the manifest, config and layer
//! blobs of an image anonymously and packs them into a docker-archive.

use std::path::Path;

use async_trait::async_trait;
use bundler_core::error::{BundleError, Result};
use bundler_core::ImageReference;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{ImageIndexEntry, OciDescriptor};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use tokio::io::AsyncWriteExt;

use super::archive::{digest_hex, staging_dir, write_docker_archive};
use super::pull::ImageFetcher;

/// Pulls images from public registries into docker-archive files.
pub struct RegistryArchivePuller {
    client: Client,
}

impl RegistryArchivePuller {
    pub fn new() -> Self {
        let config = ClientConfig {
            protocol: ClientProtocol::Https,
            platform_resolver: Some(Box::new(linux_platform_resolver)),
            ..Default::default()
        };
        Self {
            client: Client::new(config),
        }
    }

    /// Stream one blob into `staging/<hex>`.
    async fn pull_blob_to(
        &self,
        image: &str,
        oci_ref: &Reference,
        descriptor: &OciDescriptor,
        staging: &Path,
    ) -> Result<()> {
        let hex = digest_hex(&descriptor.digest)?;
        let path = staging.join(hex);
        let mut file = tokio::fs::File::create(&path).await?;

        tracing::debug!(
            image = %image,
            digest = %descriptor.digest,
            size = descriptor.size,
            "Pulling blob"
        );

        self.client
            .pull_blob(oci_ref, descriptor, &mut file)
            .await
            .map_err(|e| BundleError::ImagePull {
                image: image.to_string(),
                message: format!("failed to pull blob {}: {}", descriptor.digest, e),
            })?;
        file.flush().await?;
        Ok(())
    }

    async fn pull_into(&self, image: &str, dest: &Path, staging: &Path) -> Result<()> {
        let reference = ImageReference::parse(image)?;
        let oci_ref = to_oci_reference(&reference)?;

        let (manifest, manifest_digest) = self
            .client
            .pull_image_manifest(&oci_ref, &RegistryAuth::Anonymous)
            .await
            .map_err(|e| BundleError::ImagePull {
                image: image.to_string(),
                message: format!("failed to pull manifest: {}", e),
            })?;

        tokio::fs::create_dir_all(staging).await?;

        self.pull_blob_to(image, &oci_ref, &manifest.config, staging)
            .await?;
        for layer in &manifest.layers {
            self.pull_blob_to(image, &oci_ref, layer, staging).await?;
        }

        let repo_tag = reference
            .tag
            .as_ref()
            .map(|tag| format!("{}/{}:{}", reference.registry, reference.repository, tag));
        let config_digest = manifest.config.digest.clone();
        let layer_digests: Vec<String> = manifest.layers.iter().map(|l| l.digest.clone()).collect();
        let dest = dest.to_path_buf();
        let staging = staging.to_path_buf();

        tokio::task::spawn_blocking(move || {
            write_docker_archive(
                &dest,
                &staging,
                repo_tag.as_deref(),
                &config_digest,
                &layer_digests,
            )
        })
        .await
        .map_err(|e| BundleError::Other(format!("archive task failed: {}", e)))??;

        tracing::info!(
            image = %image,
            digest = %manifest_digest,
            layers = manifest.layers.len(),
            "Image pulled"
        );
        Ok(())
    }
}

impl Default for RegistryArchivePuller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageFetcher for RegistryArchivePuller {
    async fn fetch(&self, image: &str, dest: &Path) -> Result<()> {
        let staging = staging_dir(dest);
        let result = self.pull_into(image, dest, &staging).await;
        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %staging.display(), error = %e, "Failed to remove staging directory");
            }
        }
        result
    }
}

/// Convert a normalized reference to an oci-distribution reference.
fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let full = reference.full_reference();
    full.parse::<Reference>()
        .map_err(|e| BundleError::InvalidReference(format!("{}: {}", full, e)))
}

/// Select the linux image matching the host CPU architecture.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .is_some_and(|p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}
