//! Bundle manifest served by the installer API.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Resolved description of one installer bundle.
///
/// Read-only once decoded; the composer and the prefetch pipeline only
/// borrow it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    /// URLs of gzip-compressed tar archives, in bundle order
    #[serde(default, deserialize_with = "null_as_default")]
    pub layers: Vec<String>,

    /// Destination path → literal file content
    #[serde(default, deserialize_with = "null_as_default")]
    pub files: BTreeMap<String, String>,

    /// Container image references to embed, in bundle order
    #[serde(default, deserialize_with = "null_as_default")]
    pub images: Vec<String>,
}

impl BundleManifest {
    /// Decode a manifest from the upstream JSON body.
    pub fn from_json(body: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }

    /// Number of top-level entries a successful bundle is built from.
    pub fn source_count(&self) -> usize {
        self.layers.len() + self.files.len() + self.images.len()
    }
}

/// Upstream emits `null` for empty sections.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BundleError;

    #[test]
    fn test_decode_full_manifest() {
        let body = br##"{
            "layers": ["https://dist/kubernetes-1.19.3.tar.gz", "https://dist/weave-2.7.0.tar.gz"],
            "files": {"install.sh": "#!/bin/bash\n", "join.sh": "echo join\n"},
            "images": ["nginx:1.25", "ghcr.io/org/app:v1"]
        }"##;
        let manifest = BundleManifest::from_json(body).unwrap();
        assert_eq!(manifest.layers.len(), 2);
        assert_eq!(manifest.files["install.sh"], "#!/bin/bash\n");
        assert_eq!(manifest.images, vec!["nginx:1.25", "ghcr.io/org/app:v1"]);
        assert_eq!(manifest.source_count(), 6);
    }

    #[test]
    fn test_decode_missing_sections_default_to_empty() {
        let manifest = BundleManifest::from_json(br#"{"layers": []}"#).unwrap();
        assert!(manifest.files.is_empty());
        assert!(manifest.images.is_empty());
    }

    #[test]
    fn test_decode_null_sections() {
        let manifest =
            BundleManifest::from_json(br#"{"layers": null, "files": null, "images": null}"#)
                .unwrap();
        assert_eq!(manifest, BundleManifest::default());
    }

    #[test]
    fn test_decode_malformed() {
        let err = BundleManifest::from_json(b"<html>oops</html>").unwrap_err();
        assert!(matches!(err, BundleError::ManifestDecode(_)));
    }
}
