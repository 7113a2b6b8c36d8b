//! Container image pulling for bundle image overrides.
//!
//! ```text
//! image reference ──► registry (manifest, config, layers)
//!                          │
//!                          ▼
//!                 <n>.blobs/<digest hex>      staging, removed afterwards
//!                          │
//!                          ▼
//!                 <n>.tar  (docker-archive)
//!                 ├── manifest.json
//!                 ├── <config hex>.json
//!                 └── <layer hex>/layer.tar
//! ```

pub mod archive;
mod pull;
pub mod registry;

pub use archive::{write_docker_archive, ArchiveManifestEntry};
pub use pull::{release_memory, ImageFetcher};
pub use registry::RegistryArchivePuller;
