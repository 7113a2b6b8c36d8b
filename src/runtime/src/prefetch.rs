//! Background image prefetch pipeline.
//!
//! One worker task pulls the bundle's images strictly one after another into
//! a request-scoped scratch directory and hands each finished archive path
//! to the composer over a bounded channel. Because there is a single
//! producer, arrival order is submission order. The first failure is sent on
//! a separate error channel and the worker stops.
//!
//! The composer consumes the pipeline as a blocking [`Iterator`]. The
//! scratch directory is shared by the handle and the worker and is deleted
//! once both have let go of it, so an in-flight pull never writes into a
//! directory that has already been removed. After the handle is dropped the
//! worker finishes the pull it is in and starts no further ones.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bundler_core::error::{BundleError, Result};
use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::oci::{release_memory, ImageFetcher};

/// Name prefix of per-request scratch directories.
pub const SCRATCH_PREFIX: &str = "temp-image-pull";

/// Handle on one request's image prefetch.
pub struct ImagePrefetch {
    images: Vec<String>,
    paths: mpsc::Receiver<PathBuf>,
    errors: mpsc::Receiver<BundleError>,
    delivered: usize,
    finished: bool,
    scratch: Option<Arc<TempDir>>,
}

impl ImagePrefetch {
    /// Start pulling `images` in the background.
    ///
    /// The scratch directory is only created when there is at least one
    /// image.
    pub async fn start(
        images: Vec<String>,
        fetcher: Arc<dyn ImageFetcher>,
        scratch_root: &Path,
    ) -> Result<Self> {
        let (path_tx, paths) = mpsc::channel(images.len().max(1));
        let (error_tx, errors) = mpsc::channel(1);

        if images.is_empty() {
            return Ok(Self {
                images,
                paths,
                errors,
                delivered: 0,
                finished: false,
                scratch: None,
            });
        }

        let scratch = Arc::new(create_scratch(scratch_root.to_path_buf()).await?);
        tracing::debug!(
            images = images.len(),
            scratch = %scratch.path().display(),
            "Starting image prefetch"
        );

        tokio::spawn(run_worker(
            images.clone(),
            fetcher,
            scratch.clone(),
            path_tx,
            error_tx,
        ));

        Ok(Self {
            images,
            paths,
            errors,
            delivered: 0,
            finished: false,
            scratch: Some(scratch),
        })
    }

    /// Request-scoped scratch directory, if one was needed.
    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_deref().map(TempDir::path)
    }

    /// Number of images this pipeline was started with.
    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

async fn create_scratch(root: PathBuf) -> Result<TempDir> {
    tokio::fs::create_dir_all(&root).await?;
    tokio::task::spawn_blocking(move || {
        tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempdir_in(&root)
            .map_err(|e| {
                BundleError::Other(format!(
                    "error creating temp directory in {}: {}",
                    root.display(),
                    e
                ))
            })
    })
    .await
    .map_err(|e| BundleError::Other(format!("scratch directory task failed: {}", e)))?
}

impl Iterator for ImagePrefetch {
    type Item = Result<PathBuf>;

    /// Block until the next image archive is ready.
    ///
    /// Must not be called from an async context.
    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        if let Some(path) = self.paths.blocking_recv() {
            self.delivered += 1;
            return Some(Ok(path));
        }

        // The worker reports its error before dropping the path sender.
        self.finished = true;
        if let Ok(err) = self.errors.try_recv() {
            return Some(Err(err));
        }
        if self.delivered < self.images.len() {
            return Some(Err(BundleError::ImagePull {
                image: self.images[self.delivered].clone(),
                message: "image prefetch stopped before the image was pulled".to_string(),
            }));
        }
        None
    }
}

async fn run_worker(
    images: Vec<String>,
    fetcher: Arc<dyn ImageFetcher>,
    scratch: Arc<TempDir>,
    paths: mpsc::Sender<PathBuf>,
    errors: mpsc::Sender<BundleError>,
) {
    for (index, image) in images.iter().enumerate() {
        if paths.is_closed() {
            tracing::debug!("Bundle stream ended, stopping image prefetch");
            return;
        }

        let dest = scratch.path().join(format!("{}.tar", index));
        let result = fetcher.fetch(image, &dest).await;
        release_memory();

        if let Err(e) = result {
            tracing::error!(image = %image, error = %e, "Image prefetch failed");
            let _ = errors
                .send(BundleError::ImagePull {
                    image: image.clone(),
                    message: format!("failed to download image to path {}: {}", dest.display(), e),
                })
                .await;
            return;
        }

        tracing::debug!(image = %image, path = %dest.display(), "Image ready");
        if paths.send(dest).await.is_err() {
            tracing::debug!("Bundle stream ended, stopping image prefetch");
            return;
        }
    }
}
