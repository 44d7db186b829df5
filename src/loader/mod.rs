//! # Engine Bootstrap
//!
//! Locates and loads the native engine once per process.
//!
//! ## Resolution Order
//! 1. The platform's library search path, using the configured library name
//! 2. A bundled artifact at `natives/<os>-<arch>/<file>`, extracted to a
//!    uniquely named temporary file and loaded from that path
//!
//! Resolution is a small state machine evaluated under a mutex:
//!
//! ```text
//! Unresolved --load ok--> Loaded   (engine shared by every later call)
//!            --load err-> Failed   (terminal; every later call gets the same error)
//! ```
//!
//! [`bootstrap`] and [`bootstrap_with`] drive one process-wide
//! [`EngineLoader`]. Build an `EngineLoader` directly for custom artifact
//! sources or tests.

pub mod artifacts;
pub mod platform;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::{debug, info, instrument, warn};

use crate::config::LoaderConfig;
use crate::engine::native::NativeEngine;
use crate::engine::Engine;
use crate::error::{constants, BridgeError, Result};

pub use artifacts::{ArtifactSource, DirectoryArtifacts, EmbeddedArtifacts, ExtractedArtifact};
pub use platform::{Arch, OsFamily, Platform};

/// How the engine library is actually opened.
pub trait LibraryOpener: Send + Sync {
    /// Opens `library_name` through the platform's search path.
    fn open_system(&self, library_name: &str) -> Result<Arc<dyn Engine>>;

    /// Opens the library file at `path`.
    fn open_path(&self, path: &Path) -> Result<Arc<dyn Engine>>;
}

/// `libloading`-backed opener producing [`NativeEngine`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeOpener;

impl LibraryOpener for NativeOpener {
    fn open_system(&self, library_name: &str) -> Result<Arc<dyn Engine>> {
        Ok(Arc::new(NativeEngine::open_system(library_name)?))
    }

    fn open_path(&self, path: &Path) -> Result<Arc<dyn Engine>> {
        Ok(Arc::new(NativeEngine::open_path(path)?))
    }
}

/// Where a loaded engine came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    /// Found by the system search path under this name.
    System(String),
    /// Extracted from a bundled artifact to this path.
    Extracted(PathBuf),
}

struct Loaded {
    engine: Arc<dyn Engine>,
    source: LoadSource,
    // Held until the loader drops where the file cannot be unlinked early.
    _artifact: Option<ExtractedArtifact>,
}

enum LoadState {
    Unresolved,
    Loaded(Loaded),
    Failed(String),
}

/// Once-only engine resolution.
pub struct EngineLoader {
    config: LoaderConfig,
    platform: Platform,
    opener: Box<dyn LibraryOpener>,
    sources: Vec<Box<dyn ArtifactSource>>,
    state: Mutex<LoadState>,
    extractions: AtomicUsize,
}

impl EngineLoader {
    /// Loader using the native opener, the current platform and, when
    /// configured, the `natives_dir` artifact tree.
    pub fn new(config: LoaderConfig) -> Self {
        Self::with_opener(config, NativeOpener)
    }

    pub fn with_opener(config: LoaderConfig, opener: impl LibraryOpener + 'static) -> Self {
        let mut sources: Vec<Box<dyn ArtifactSource>> = Vec::new();
        if let Some(ref dir) = config.natives_dir {
            sources.push(Box::new(DirectoryArtifacts::new(dir)));
        }
        Self {
            config,
            platform: Platform::current(),
            opener: Box::new(opener),
            sources,
            state: Mutex::new(LoadState::Unresolved),
            extractions: AtomicUsize::new(0),
        }
    }

    /// Overrides the detected platform.
    #[must_use]
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Adds a fallback artifact source, consulted after those already present.
    #[must_use]
    pub fn with_artifacts(mut self, source: impl ArtifactSource + 'static) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    pub fn config(&self) -> &LoaderConfig {
        &self.config
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    /// Resolves the engine on first call; later calls return the same result.
    pub fn load(&self) -> Result<Arc<dyn Engine>> {
        let mut state = self.lock();
        match &*state {
            LoadState::Loaded(loaded) => return Ok(Arc::clone(&loaded.engine)),
            LoadState::Failed(reason) => return Err(BridgeError::EngineUnavailable(reason.clone())),
            LoadState::Unresolved => {}
        }

        match self.resolve() {
            Ok(loaded) => {
                let engine = Arc::clone(&loaded.engine);
                *state = LoadState::Loaded(loaded);
                Ok(engine)
            }
            Err(e) => {
                let reason = match e {
                    BridgeError::EngineUnavailable(reason) => reason,
                    other => other.to_string(),
                };
                warn!(reason = %reason, "Native engine unavailable");
                *state = LoadState::Failed(reason.clone());
                Err(BridgeError::EngineUnavailable(reason))
            }
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(*self.lock(), LoadState::Loaded(_))
    }

    /// Where the engine was loaded from, once loaded.
    pub fn source(&self) -> Option<LoadSource> {
        match &*self.lock() {
            LoadState::Loaded(loaded) => Some(loaded.source.clone()),
            _ => None,
        }
    }

    /// Number of artifacts this loader has written to disk.
    pub fn extractions(&self) -> usize {
        self.extractions.load(Ordering::Relaxed)
    }

    fn lock(&self) -> MutexGuard<'_, LoadState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[instrument(
        skip(self),
        fields(platform = %self.platform, library = %self.config.library_name)
    )]
    fn resolve(&self) -> Result<Loaded> {
        info!("Resolving native engine");

        let system_err = match self.opener.open_system(&self.config.library_name) {
            Ok(engine) => {
                info!(engine = engine.name(), "Loaded engine from system search path");
                return Ok(Loaded {
                    engine,
                    source: LoadSource::System(self.config.library_name.clone()),
                    _artifact: None,
                });
            }
            Err(e) => e,
        };

        if !self.config.allow_fallback {
            return Err(BridgeError::EngineUnavailable(format!(
                "{}: {system_err}",
                constants::ERR_FALLBACK_DISABLED
            )));
        }
        warn!(error = %system_err, "System load failed; trying bundled artifact");

        if self.sources.is_empty() {
            return Err(BridgeError::EngineUnavailable(format!(
                "{} ({system_err})",
                constants::ERR_NO_ARTIFACT_SOURCE
            )));
        }

        let resource = self.platform.resource_path();
        let bytes = self.find_artifact(&resource).ok_or_else(|| {
            BridgeError::EngineUnavailable(format!(
                "{}: {resource}",
                constants::ERR_ARTIFACT_MISSING
            ))
        })?;

        let dir = self
            .config
            .temp_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let mut artifact =
            ExtractedArtifact::extract(&dir, self.platform.library_file_name(), &bytes)
                .map_err(|e| BridgeError::EngineUnavailable(format!("Extraction failed: {e}")))?;
        self.extractions.fetch_add(1, Ordering::Relaxed);
        info!(path = %artifact.path().display(), "Extracted bundled engine");

        let engine = self.opener.open_path(artifact.path())?;
        let source = LoadSource::Extracted(artifact.path().to_path_buf());
        info!(engine = engine.name(), "Loaded engine from extracted artifact");

        // A mapped library stays usable after unlink on unix.
        if cfg!(unix) {
            artifact.release();
        }

        Ok(Loaded {
            engine,
            source,
            _artifact: Some(artifact),
        })
    }

    fn find_artifact(&self, resource: &str) -> Option<Vec<u8>> {
        for source in &self.sources {
            match source.fetch(resource) {
                Ok(Some(bytes)) => {
                    debug!(source = %source.describe(), resource, "Found bundled artifact");
                    return Some(bytes.into_owned());
                }
                Ok(None) => debug!(source = %source.describe(), resource, "Artifact not present"),
                Err(e) => warn!(source = %source.describe(), error = %e, "Artifact source failed"),
            }
        }
        None
    }
}

static GLOBAL: OnceLock<EngineLoader> = OnceLock::new();

/// Resolves the process-wide engine with the default loader configuration.
pub fn bootstrap() -> Result<Arc<dyn Engine>> {
    bootstrap_with(&LoaderConfig::default())
}

/// Resolves the process-wide engine.
///
/// `config` only takes effect on the first call in the process.
pub fn bootstrap_with(config: &LoaderConfig) -> Result<Arc<dyn Engine>> {
    global_with(config, None).load()
}

/// Resolves the process-wide engine, falling back to `artifacts` (after any
/// configured `natives_dir`) when the system load fails.
///
/// Like the configuration, `artifacts` is only installed by the first
/// bootstrap call in the process.
pub fn bootstrap_with_artifacts(
    config: &LoaderConfig,
    artifacts: impl ArtifactSource + 'static,
) -> Result<Arc<dyn Engine>> {
    global_with(config, Some(Box::new(artifacts))).load()
}

fn global_with(
    config: &LoaderConfig,
    artifacts: Option<Box<dyn ArtifactSource>>,
) -> &'static EngineLoader {
    let mut artifacts = artifacts;
    let loader = GLOBAL.get_or_init(|| {
        let mut loader = EngineLoader::new(config.clone());
        loader.sources.extend(artifacts.take());
        loader
    });
    if loader.config() != config {
        debug!("Engine loader already configured; ignoring new loader configuration");
    }
    if let Some(source) = artifacts {
        debug!(source = %source.describe(), "Engine loader already configured; ignoring artifacts");
    }
    loader
}

/// The process-wide loader, if bootstrap has been attempted.
pub fn global_loader() -> Option<&'static EngineLoader> {
    GLOBAL.get()
}
