//! kURL bundler runtime.
//!
//! Everything that does I/O on behalf of a bundle request: manifest
//! resolution, layer sources, registry image pulls, the image prefetch
//! pipeline and the archive stream composer.

#![allow(clippy::result_large_err)]

pub mod composer;
pub mod layers;
pub mod oci;
pub mod prefetch;
pub mod resolver;
pub mod stream;

// Re-export common types
pub use composer::{ArchiveComposer, ComposerState, ERROR_ENTRY, IMAGE_OVERRIDES_DIR, INVALID_ENTRY, LAYER_PREFIX};
pub use layers::{HttpLayerSource, LayerSource};
pub use oci::{release_memory, ImageFetcher, RegistryArchivePuller};
pub use prefetch::ImagePrefetch;
pub use resolver::{forwarded_headers, InstallerTarget, ManifestResolver};
pub use stream::{body_channel, BodyStream, ChannelWriter};

/// Bundler runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
