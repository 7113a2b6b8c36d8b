//! Bundler Core - foundational types shared by the bundle runtime and server.
//!
//! Holds the error taxonomy, configuration, the bundle manifest model and
//! the image reference / registry allowlist logic. Nothing here performs I/O.

pub mod allowlist;
pub mod config;
pub mod error;
pub mod manifest;
pub mod reference;

// Re-export commonly used types
pub use allowlist::{RegistryAllowlist, DEFAULT_ALLOWED_REGISTRIES};
pub use config::BundlerConfig;
pub use error::{BundleError, Result};
pub use manifest::BundleManifest;
pub use reference::ImageReference;

/// Bundler version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
