//! Archive stream composer.
//!
//! Writes one bundle as a gzip-compressed tar stream:
//!
//! ```text
//! kurl/<layer entries...>          re-streamed from each layer, manifest order
//! <file path>                      one entry per inline file
//! kurl/image-overrides/<n>.tar     one entry per prefetched image, in order
//! ```
//!
//! Once bytes have left the process a failure can no longer change the HTTP
//! status, so a failed bundle instead ends with `ERROR.txt` and a header for
//! `INVALID BUNDLE` whose body never arrives. Any tar reader then fails with
//! an unexpected end of input.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use bundler_core::error::{BundleError, Result};
use bundler_core::BundleManifest;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::layers::LayerSource;

/// Directory every layer entry is rehosted under.
pub const LAYER_PREFIX: &str = "kurl";

/// Directory holding embedded image archives.
pub const IMAGE_OVERRIDES_DIR: &str = "kurl/image-overrides";

/// Diagnostic entry written when a bundle is incomplete.
pub const ERROR_ENTRY: &str = "ERROR.txt";

pub const ERROR_MESSAGE: &str = "Failed to generate archive resulting in an incomplete bundle.\n";

/// Trailing entry whose body is never written.
pub const INVALID_ENTRY: &str = "INVALID BUNDLE";

const INVALID_ENTRY_SIZE: u64 = 8;

const FILE_MODE: u32 = 0o644;

/// Composer progress through one bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposerState {
    Idle,
    WritingLayers,
    WritingFiles,
    DrainingImages,
    Closed,
    Corrupted,
}

impl ComposerState {
    fn is_terminal(self) -> bool {
        matches!(self, ComposerState::Closed | ComposerState::Corrupted)
    }
}

/// Writer that silently discards everything once sealed.
///
/// The tar builder always appends its end-of-archive blocks when it is
/// finished or dropped; after the corruption marker those blocks would
/// satisfy the marker's declared size.
struct Seal<W> {
    inner: W,
    sealed: bool,
}

impl<W: Write> Write for Seal<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.sealed {
            return Ok(buf.len());
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.sealed {
            return Ok(());
        }
        self.inner.flush()
    }
}

/// Builds one bundle into `W`.
pub struct ArchiveComposer<W: Write> {
    archive: tar::Builder<Seal<GzEncoder<W>>>,
    state: ComposerState,
    entries: usize,
}

impl<W: Write> ArchiveComposer<W> {
    pub fn new(writer: W) -> Self {
        let encoder = GzEncoder::new(writer, Compression::default());
        Self {
            archive: tar::Builder::new(Seal {
                inner: encoder,
                sealed: false,
            }),
            state: ComposerState::Idle,
            entries: 0,
        }
    }

    pub fn state(&self) -> ComposerState {
        self.state
    }

    /// Number of entries written so far.
    pub fn entries(&self) -> usize {
        self.entries
    }

    /// Write the whole bundle and close the stream.
    ///
    /// Layers first, then files, then images as they arrive from `images`.
    /// On failure the corruption marker is written and the error comes back
    /// as [`BundleError::StreamCorruption`].
    pub fn compose<I>(
        mut self,
        manifest: &BundleManifest,
        layers: &dyn LayerSource,
        images: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = Result<PathBuf>>,
    {
        match self.write_bundle(manifest, layers, images) {
            Ok(()) => self.finish().map(|_| ()),
            Err(e) => Err(self.abort(e)),
        }
    }

    fn write_bundle<I>(
        &mut self,
        manifest: &BundleManifest,
        layers: &dyn LayerSource,
        images: I,
    ) -> Result<()>
    where
        I: IntoIterator<Item = Result<PathBuf>>,
    {
        self.transition(ComposerState::WritingLayers);
        for url in &manifest.layers {
            self.pipe_layer(url, layers)?;
        }

        self.transition(ComposerState::WritingFiles);
        for (path, contents) in &manifest.files {
            self.write_blob(path, contents.as_bytes())?;
        }

        self.transition(ComposerState::DrainingImages);
        for (index, image) in images.into_iter().enumerate() {
            let src = image?;
            let dest = format!("{}/{}.tar", IMAGE_OVERRIDES_DIR, index);
            self.write_file(&src, &dest)?;
        }

        Ok(())
    }

    fn transition(&mut self, next: ComposerState) {
        tracing::trace!(from = ?self.state, to = ?next, "Composer state change");
        self.state = next;
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.state.is_terminal() {
            return Err(BundleError::Other(format!(
                "archive is {:?}, no further writes allowed",
                self.state
            )));
        }
        Ok(())
    }

    /// Re-stream a remote gzip tar layer entry by entry under [`LAYER_PREFIX`].
    pub fn pipe_layer(&mut self, url: &str, source: &dyn LayerSource) -> Result<()> {
        self.ensure_writable()?;

        let fetch_err = |what: &str, e: io::Error| BundleError::SourceFetch {
            url: url.to_string(),
            message: format!("{}: {}", what, e),
        };

        let reader = source.open(url)?;
        let mut layer = tar::Archive::new(GzDecoder::new(reader));
        let entries = layer.entries().map_err(|e| fetch_err("gunzip response", e))?;

        let mut count = 0usize;
        for entry in entries {
            let mut entry = entry.map_err(|e| fetch_err("next file", e))?;
            let entry_type = entry.header().entry_type();
            if entry_type.is_pax_global_extensions() {
                continue;
            }

            let path = entry.path().map_err(|e| fetch_err("entry path", e))?;
            let dest = rehosted_path(&path).ok_or_else(|| BundleError::SourceFetch {
                url: url.to_string(),
                message: format!("entry {} escapes the archive root", path.display()),
            })?;

            let mut header = entry.header().clone();
            let archive_err = |source: io::Error| BundleError::Archive {
                path: dest.display().to_string(),
                source,
            };

            if entry_type.is_symlink() || entry_type.is_hard_link() {
                let target = entry
                    .link_name()
                    .map_err(|e| fetch_err("entry link name", e))?
                    .map(|t| t.into_owned())
                    .unwrap_or_default();
                self.archive
                    .append_link(&mut header, &dest, &target)
                    .map_err(archive_err)?;
            } else {
                self.archive
                    .append_data(&mut header, &dest, &mut entry)
                    .map_err(archive_err)?;
            }
            count += 1;
            self.entries += 1;
        }

        tracing::debug!(url = %url, entries = count, "Layer piped");
        Ok(())
    }

    /// Write an in-memory blob as one entry.
    pub fn write_blob(&mut self, dest: &str, contents: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        let mut header = file_header(contents.len() as u64);
        self.archive
            .append_data(&mut header, dest, contents)
            .map_err(|source| BundleError::Archive {
                path: dest.to_string(),
                source,
            })?;
        self.entries += 1;
        Ok(())
    }

    /// Copy a local file as one entry.
    pub fn write_file(&mut self, src: &Path, dest: &str) -> Result<()> {
        self.ensure_writable()?;
        let archive_err = |source: io::Error| BundleError::Archive {
            path: dest.to_string(),
            source,
        };

        let file = File::open(src).map_err(|e| {
            BundleError::Other(format!("failed to open {}: {}", src.display(), e))
        })?;
        let size = file.metadata().map_err(archive_err)?.len();

        let mut header = file_header(size);
        self.archive
            .append_data(&mut header, dest, file.take(size))
            .map_err(archive_err)?;
        self.entries += 1;

        tracing::debug!(src = %src.display(), dest = %dest, size, "Image embedded");
        Ok(())
    }

    /// Close the archive cleanly and hand back the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.ensure_writable()?;
        self.transition(ComposerState::Closed);
        let seal = self.archive.into_inner()?;
        let mut writer = seal.inner.finish()?;
        writer.flush()?;
        Ok(writer)
    }

    /// Write the corruption marker, close the gzip layer and return the
    /// error wrapped as [`BundleError::StreamCorruption`].
    ///
    /// Marker writes are best-effort; a client that has gone away will not
    /// receive them anyway.
    pub fn abort(mut self, err: BundleError) -> BundleError {
        if self.state.is_terminal() {
            return BundleError::StreamCorruption(Box::new(err));
        }

        if let Err(e) = self.write_marker() {
            tracing::debug!(error = %e, "Failed to write corruption marker");
        }
        self.transition(ComposerState::Corrupted);

        self.archive.get_mut().sealed = true;
        match self.archive.into_inner() {
            Ok(seal) => {
                if let Err(e) = seal.inner.finish().and_then(|mut w| w.flush()) {
                    tracing::debug!(error = %e, "Failed to close gzip stream");
                }
            }
            Err(e) => tracing::debug!(error = %e, "Failed to close archive"),
        }

        BundleError::StreamCorruption(Box::new(err))
    }

    fn write_marker(&mut self) -> io::Result<()> {
        let mut header = file_header(ERROR_MESSAGE.len() as u64);
        self.archive
            .append_data(&mut header, ERROR_ENTRY, ERROR_MESSAGE.as_bytes())?;

        let mut invalid = file_header(INVALID_ENTRY_SIZE);
        invalid.set_path(INVALID_ENTRY)?;
        invalid.set_cksum();
        self.archive.get_mut().write_all(invalid.as_bytes())?;
        self.archive.get_mut().flush()
    }
}

fn file_header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(FILE_MODE);
    header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
    header
}

/// Map a layer entry path to its place in the bundle.
///
/// Returns `None` for paths that climb out of the layer root.
pub fn rehosted_path(path: &Path) -> Option<PathBuf> {
    let mut dest = PathBuf::from(LAYER_PREFIX);
    for component in path.components() {
        match component {
            Component::Normal(part) => dest.push(part),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            Component::ParentDir => return None,
        }
    }
    Some(dest)
}
