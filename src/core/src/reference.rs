//! Container image reference parsing.
//!
//! Normalizes references like `nginx:1.25` or `ghcr.io/org/app@sha256:...`
//! the way docker does: bare names resolve to Docker Hub and single-component
//! Hub repositories live under `library/`.

use crate::error::{BundleError, Result};

/// Canonical registry for references without a domain.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Legacy Docker Hub hostname, normalized to [`DEFAULT_REGISTRY`].
const LEGACY_DEFAULT_REGISTRY: &str = "index.docker.io";

/// Tag applied when neither a tag nor a digest is given.
const DEFAULT_TAG: &str = "latest";

const MAX_NAME_LEN: usize = 255;
const MAX_TAG_LEN: usize = 128;

/// Parsed, normalized image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, possibly with a port (e.g. "ghcr.io", "localhost:5000")
    pub registry: String,
    /// Repository path (e.g. "library/nginx")
    pub repository: String,
    /// Tag, defaulted to "latest" when no digest is present
    pub tag: Option<String>,
    /// Digest (e.g. "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse and normalize an image reference string.
    ///
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `myuser/app:v1` → docker.io/myuser/app:v1
    /// - `ghcr.io/org/app@sha256:...` → ghcr.io/org/app@sha256:...
    /// - `localhost:5000/app` → localhost:5000/app:latest
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |why: &str| BundleError::InvalidReference(format!("{reference:?}: {why}"));

        if reference.is_empty() {
            return Err(invalid("empty reference"));
        }
        if reference.chars().any(char::is_whitespace) {
            return Err(invalid("contains whitespace"));
        }

        let (remainder, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                validate_digest(digest).map_err(|why| invalid(why))?;
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag colon can only appear after the last path separator;
        // anything before it may be a registry port.
        let last_slash = remainder.rfind('/').map_or(0, |i| i + 1);
        let (name, tag) = match remainder[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                (&remainder[..split], Some(remainder[split + 1..].to_string()))
            }
            None => (remainder, None),
        };

        if let Some(ref tag) = tag {
            validate_tag(tag).map_err(|why| invalid(why))?;
        }

        let (registry, repository) = split_registry(name);
        validate_registry(&registry).map_err(|why| invalid(why))?;
        validate_repository(&repository).map_err(|why| invalid(why))?;
        if registry.len() + 1 + repository.len() > MAX_NAME_LEN {
            return Err(invalid("name too long"));
        }

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Registry host without the port.
    pub fn host(&self) -> &str {
        self.registry
            .rsplit_once(':')
            .map_or(self.registry.as_str(), |(host, _)| host)
    }

    /// Whether the registry carries an explicit port.
    pub fn has_port(&self) -> bool {
        self.registry.contains(':')
    }

    /// Fully qualified reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = BundleError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Split a name into (registry, repository), applying Docker Hub defaults.
fn split_registry(name: &str) -> (String, String) {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            let registry = if first == LEGACY_DEFAULT_REGISTRY {
                DEFAULT_REGISTRY.to_string()
            } else {
                first.to_string()
            };
            let repository = if registry == DEFAULT_REGISTRY && !rest.contains('/') {
                format!("library/{rest}")
            } else {
                rest.to_string()
            };
            return (registry, repository);
        }
        return (DEFAULT_REGISTRY.to_string(), name.to_string());
    }
    (DEFAULT_REGISTRY.to_string(), format!("library/{name}"))
}

/// Dot-separated hostname labels with an optional numeric port.
fn validate_registry(registry: &str) -> std::result::Result<(), &'static str> {
    let (host, port) = match registry.split_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (registry, None),
    };
    if host.is_empty() {
        return Err("empty registry");
    }
    if let Some(port) = port {
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err("invalid registry port");
        }
    }
    for label in host.split('.') {
        let bytes = label.as_bytes();
        match (bytes.first(), bytes.last()) {
            (Some(first), Some(last))
                if first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric() => {}
            _ => return Err("invalid registry hostname"),
        }
        if !bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-') {
            return Err("invalid character in registry hostname");
        }
    }
    Ok(())
}

/// Path components are lowercase alphanumerics joined by `.`, `_`, `__` or runs of `-`.
fn validate_repository(repository: &str) -> std::result::Result<(), &'static str> {
    if repository.is_empty() {
        return Err("empty repository");
    }
    for component in repository.split('/') {
        if component.is_empty() {
            return Err("empty path component");
        }
        if component.chars().any(|c| c.is_ascii_uppercase()) {
            return Err("repository name must be lowercase");
        }
        let valid_chars = component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
        if !valid_chars {
            return Err("invalid character in repository");
        }
        let bytes = component.as_bytes();
        if !bytes[0].is_ascii_alphanumeric() || !bytes[bytes.len() - 1].is_ascii_alphanumeric() {
            return Err("path component must start and end with an alphanumeric");
        }
        if component.contains("..") || component.contains("___") || component.contains("._") {
            return Err("invalid separator in repository");
        }
    }
    Ok(())
}

fn validate_tag(tag: &str) -> std::result::Result<(), &'static str> {
    if tag.is_empty() || tag.len() > MAX_TAG_LEN {
        return Err("invalid tag length");
    }
    let mut chars = tag.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
        return Err("invalid tag format");
    }
    Ok(())
}

fn validate_digest(digest: &str) -> std::result::Result<(), &'static str> {
    match digest.split_once(':') {
        Some((algorithm, hex))
            if !algorithm.is_empty()
                && hex.len() >= 32
                && hex.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            Ok(())
        }
        _ => Err("invalid digest format: expected algorithm:hex"),
    }
}
