//! Bundled engine artifacts and their extraction to disk.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::Result;

/// Prefix of every extracted file name.
pub const EXTRACT_PREFIX: &str = "enet-jni-";

const CREATE_ATTEMPTS: usize = 8;

/// Somewhere bundled engine binaries can be looked up by resource path.
pub trait ArtifactSource: Send + Sync {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// The artifact bytes at `resource_path`, or `None` if this source lacks it.
    fn fetch(&self, resource_path: &str) -> Result<Option<Cow<'_, [u8]>>>;
}

/// A `natives/<tag>/<file>` tree on disk.
#[derive(Debug, Clone)]
pub struct DirectoryArtifacts {
    root: PathBuf,
}

impl DirectoryArtifacts {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ArtifactSource for DirectoryArtifacts {
    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }

    fn fetch(&self, resource_path: &str) -> Result<Option<Cow<'_, [u8]>>> {
        let path = resource_path
            .split('/')
            .fold(self.root.clone(), |acc, part| acc.join(part));
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(Cow::Owned(bytes))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Artifacts compiled into the embedding binary, typically with `include_bytes!`.
///
/// ```rust,ignore
/// let bundled = EmbeddedArtifacts::new()
///     .with("natives/linux-x86-64/libenet-jni.so", include_bytes!("../natives/linux-x86-64/libenet-jni.so"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct EmbeddedArtifacts {
    entries: HashMap<String, &'static [u8]>,
}

impl EmbeddedArtifacts {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, resource_path: impl Into<String>, bytes: &'static [u8]) -> Self {
        self.entries.insert(resource_path.into(), bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ArtifactSource for EmbeddedArtifacts {
    fn describe(&self) -> String {
        format!("embedded ({} artifacts)", self.entries.len())
    }

    fn fetch(&self, resource_path: &str) -> Result<Option<Cow<'_, [u8]>>> {
        Ok(self
            .entries
            .get(resource_path)
            .map(|bytes| Cow::Borrowed(*bytes)))
    }
}

/// An artifact written to a uniquely named temporary file.
///
/// The file is deleted when this value is dropped, or earlier through
/// [`ExtractedArtifact::release`].
#[derive(Debug)]
pub struct ExtractedArtifact {
    path: PathBuf,
    removed: bool,
}

impl ExtractedArtifact {
    /// Writes `bytes` to `<dir>/enet-jni-<random>-<file_name>`.
    pub fn extract(dir: &Path, file_name: &str, bytes: &[u8]) -> io::Result<Self> {
        let (path, mut file) = create_unique(dir, file_name)?;
        let artifact = Self {
            path,
            removed: false,
        };
        file.write_all(bytes)?;
        file.sync_all()?;
        debug!(path = %artifact.path.display(), len = bytes.len(), "Extracted engine artifact");
        Ok(artifact)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the file now. Unix keeps an already-mapped library usable.
    pub fn release(&mut self) {
        if self.removed {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Removed extracted artifact"),
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Could not remove extracted artifact"
            ),
        }
        self.removed = true;
    }
}

impl Drop for ExtractedArtifact {
    fn drop(&mut self) {
        self.release();
    }
}

fn create_unique(dir: &Path, file_name: &str) -> io::Result<(PathBuf, File)> {
    let mut last_err = None;
    for _ in 0..CREATE_ATTEMPTS {
        let candidate = dir.join(format!(
            "{EXTRACT_PREFIX}{:016x}-{file_name}",
            rand::random::<u64>()
        ));
        match OpenOptions::new().write(true).create_new(true).open(&candidate) {
            Ok(file) => return Ok((candidate, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => last_err = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AlreadyExists)))
}
