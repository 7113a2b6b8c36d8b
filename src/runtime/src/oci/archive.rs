//! Docker-archive packing for pulled images.
//!
//! A docker-archive is a plain tar holding `manifest.json`, the image config
//! and one directory per layer, loadable with `docker load`.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use bundler_core::error::{BundleError, Result};
use serde::{Deserialize, Serialize};

/// One image entry of a docker-archive `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ArchiveManifestEntry {
    pub config: String,
    pub repo_tags: Vec<String>,
    pub layers: Vec<String>,
}

/// Hex part of a content digest, rejecting anything unsafe as a file name.
pub fn digest_hex(digest: &str) -> Result<&str> {
    let hex = digest.split_once(':').map_or(digest, |(_, hex)| hex);
    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(BundleError::Other(format!("invalid blob digest {:?}", digest)));
    }
    Ok(hex)
}

/// Staging directory that holds raw blobs while `dest` is being built.
pub fn staging_dir(dest: &Path) -> PathBuf {
    dest.with_extension("blobs")
}

/// Pack blobs from `staging` (named by digest hex) into a docker-archive at `dest`.
pub fn write_docker_archive(
    dest: &Path,
    staging: &Path,
    repo_tag: Option<&str>,
    config_digest: &str,
    layer_digests: &[String],
) -> Result<()> {
    let archive_err = |path: &str, source: std::io::Error| BundleError::Archive {
        path: path.to_string(),
        source,
    };

    let file = File::create(dest).map_err(|e| archive_err(&dest.display().to_string(), e))?;
    let mut builder = tar::Builder::new(BufWriter::new(file));

    let config_hex = digest_hex(config_digest)?;
    let config_name = format!("{}.json", config_hex);
    builder
        .append_path_with_name(staging.join(config_hex), &config_name)
        .map_err(|e| archive_err(&config_name, e))?;

    let mut layers = Vec::with_capacity(layer_digests.len());
    for digest in layer_digests {
        let hex = digest_hex(digest)?;
        let name = format!("{}/layer.tar", hex);
        builder
            .append_path_with_name(staging.join(hex), &name)
            .map_err(|e| archive_err(&name, e))?;
        layers.push(name);
    }

    let manifest = vec![ArchiveManifestEntry {
        config: config_name,
        repo_tags: repo_tag.map(str::to_string).into_iter().collect(),
        layers,
    }];
    let manifest_json = serde_json::to_vec(&manifest)
        .map_err(|e| BundleError::Other(format!("failed to encode manifest.json: {}", e)))?;

    let mut header = tar::Header::new_gnu();
    header.set_size(manifest_json.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    builder
        .append_data(&mut header, "manifest.json", manifest_json.as_slice())
        .map_err(|e| archive_err("manifest.json", e))?;

    builder
        .into_inner()
        .and_then(|mut w| std::io::Write::flush(&mut w))
        .map_err(|e| archive_err(&dest.display().to_string(), e))?;
    Ok(())
}
