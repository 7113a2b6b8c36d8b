//! Image pull capability used by the prefetch pipeline.

use std::path::Path;

use async_trait::async_trait;
use bundler_core::error::Result;

/// Pulls one container image into a local archive file.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Materialize `image` as a single archive file at `dest`.
    async fn fetch(&self, image: &str, dest: &Path) -> Result<()>;
}

/// Hand freed heap pages back to the OS.
///
/// Repeated pulls otherwise ratchet the resident size upwards until the
/// process is evicted.
pub fn release_memory() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // SAFETY: malloc_trim only walks allocator-owned free lists.
        unsafe {
            libc::malloc_trim(0);
        }
    }
}
