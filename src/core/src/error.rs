use thiserror::Error;

/// Bundler error types
#[derive(Error, Debug)]
pub enum BundleError {
    /// Upstream does not know the installer; `body` is forwarded verbatim
    #[error("Installer not found: {body}")]
    NotFound { body: String },

    /// Image registry is not on the allowlist (or the reference is malformed)
    #[error("Unsupported image registry {0}")]
    DisallowedImage(String),

    /// Image reference could not be parsed
    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    /// Manifest service unreachable or answered with an unexpected status
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Manifest body was not a valid bundle manifest
    #[error("Manifest decode error: {0}")]
    ManifestDecode(String),

    /// A layer source was unreachable or answered non-OK
    #[error("Source fetch failed: {url} - {message}")]
    SourceFetch { url: String, message: String },

    /// Pulling a container image failed
    #[error("Image pull failed: {image} - {message}")]
    ImagePull { image: String, message: String },

    /// Writing an archive entry failed
    #[error("Archive error at {path}: {source}")]
    Archive {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A failure after the response was committed; the bundle carries the corruption marker
    #[error("Bundle stream corrupted: {0}")]
    StreamCorruption(Box<BundleError>),

    /// Lint service error
    #[error("Lint error: {0}")]
    Lint(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BundleError {
    /// Whether this error was caused by the client going away mid-stream.
    ///
    /// Broken pipes and connection resets are expected when a download is
    /// cancelled and are not reported as anomalies.
    pub fn is_client_disconnect(&self) -> bool {
        match self {
            BundleError::Io(e) | BundleError::Archive { source: e, .. } => is_disconnect_kind(e),
            BundleError::StreamCorruption(inner) => inner.is_client_disconnect(),
            _ => false,
        }
    }
}

fn is_disconnect_kind(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset
    )
}

impl From<serde_json::Error> for BundleError {
    fn from(err: serde_json::Error) -> Self {
        BundleError::ManifestDecode(err.to_string())
    }
}

/// Result type alias for bundler operations
pub type Result<T> = std::result::Result<T, BundleError>;
