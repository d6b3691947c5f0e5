//! Static file lookup, serving and cache fallback.

use http::{HeaderValue, StatusCode, header};
use parking_lot::{Condvar, Mutex};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::DEFAULT_MIN_SIZE;
use crate::cache::artifact::{ArtifactState, ArtifactStore};
use crate::cache::walker::WalkQueue;
use crate::codec::{Encoding, Levels};
use crate::encoder::{self, apply_headers};
use crate::error::{Error, Result};
use crate::negotiate::{RequestInfo, decide_enabled};
use crate::sink::ResponseSink;

/// Default ceiling on compressed/source size for an artifact to be kept.
pub const DEFAULT_MAX_RATIO: f64 = 0.9;

const DEFAULT_CACHE_DIR_NAME: &str = "http-compression-cache";

/// Configuration for a [`StaticCache`].
#[derive(Debug, Clone)]
pub struct StaticConfig {
    /// Directory the served files live in.
    pub source_dir: PathBuf,
    /// Directory artifacts are written to.
    pub cache_dir: PathBuf,
    /// Background precompression levels.
    pub levels: Levels,
    /// Levels for compressing a miss on the fly.
    pub fallback_levels: Levels,
    /// Levels for warming the cache from a live response.
    pub warm_levels: Levels,
    /// Number of background compression workers.
    pub parallelism: usize,
    /// Files smaller than this are never precompressed.
    pub min_size: u64,
    /// Maximum compressed/source ratio worth keeping.
    pub max_ratio: f64,
    /// Whether to walk the whole source tree on startup.
    pub prewarm: bool,
}

impl StaticConfig {
    /// Creates a configuration serving files from `source_dir`.
    pub fn new(source_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            cache_dir: std::env::temp_dir().join(DEFAULT_CACHE_DIR_NAME),
            levels: Levels::BEST,
            fallback_levels: Levels::DYNAMIC,
            warm_levels: Levels::STATIC,
            parallelism: num_cpus::get(),
            min_size: DEFAULT_MIN_SIZE as u64,
            max_ratio: DEFAULT_MAX_RATIO,
            prewarm: true,
        }
    }

    /// Sets the cache directory.
    pub fn cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    /// Sets the background levels; 0 disables an encoding entirely.
    pub fn levels(mut self, gzip: u32, brotli: u32) -> Self {
        self.levels = Levels::new(gzip, brotli);
        self
    }

    /// Sets the levels used to compress a miss on the fly.
    pub fn fallback_levels(mut self, levels: Levels) -> Self {
        self.fallback_levels = levels;
        self
    }

    /// Sets the levels used to warm the cache from a live response.
    pub fn warm_levels(mut self, levels: Levels) -> Self {
        self.warm_levels = levels;
        self
    }

    /// Sets the number of background workers.
    pub fn parallelism(mut self, workers: usize) -> Self {
        self.parallelism = workers.max(1);
        self
    }

    /// Sets the smallest file size worth precompressing.
    pub fn min_size(mut self, min_size: u64) -> Self {
        self.min_size = min_size;
        self
    }

    /// Sets the maximum compressed/source ratio worth keeping.
    pub fn max_ratio(mut self, max_ratio: f64) -> Self {
        self.max_ratio = max_ratio;
        self
    }

    /// Enables or disables the startup walk of the source tree.
    pub fn prewarm(mut self, prewarm: bool) -> Self {
        self.prewarm = prewarm;
        self
    }
}

/// How a static request was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Served {
    /// A fresh artifact was streamed verbatim.
    CacheHit(Encoding),
    /// The source was compressed on the fly.
    Compressed(Encoding),
    /// The source was sent uncompressed.
    Raw,
    /// `304 Not Modified` with an empty body.
    NotModified,
}

/// Outcome of resolving a static request against the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Lookup {
    /// Negotiation chose identity.
    Uncompressed { source: PathBuf, len: u64 },
    /// A sentinel says the source is not worth compressing.
    Sentinel { source: PathBuf, len: u64 },
    NotModified,
    Hit {
        source: PathBuf,
        artifact: PathBuf,
        encoding: Encoding,
        len: u64,
    },
    /// Artifact absent or stale.
    Miss {
        source: PathBuf,
        encoding: Encoding,
        len: u64,
    },
}

/// Disk-backed cache of precompressed static files.
///
/// Cloning is cheap; clones share the walk queue and its worker thread.
#[derive(Clone)]
pub struct StaticCache {
    pub(crate) inner: Arc<Shared>,
}

pub(crate) struct Shared {
    pub(crate) config: StaticConfig,
    pub(crate) store: ArtifactStore,
    pub(crate) queue: Mutex<WalkQueue>,
    pub(crate) idle: Condvar,
}

impl StaticCache {
    /// Creates the cache directory, clears temp artifacts left by a previous
    /// run and, unless disabled, starts a background walk over the whole
    /// source tree.
    pub fn new(mut config: StaticConfig) -> Result<Self> {
        for encoding in [Encoding::Gzip, Encoding::Brotli] {
            config.levels.validate(encoding)?;
            config.fallback_levels.validate(encoding)?;
            config.warm_levels.validate(encoding)?;
        }
        config.source_dir = std::path::absolute(&config.source_dir)
            .map_err(|e| Error::cache_io(&config.source_dir, e))?;
        config.cache_dir = std::path::absolute(&config.cache_dir)
            .map_err(|e| Error::cache_io(&config.cache_dir, e))?;
        fs::create_dir_all(&config.cache_dir).map_err(|e| Error::cache_io(&config.cache_dir, e))?;

        let store = ArtifactStore::new(&config.source_dir, &config.cache_dir);
        let abandoned = store.remove_abandoned_temps();
        if abandoned > 0 {
            tracing::debug!(count = abandoned, "removed abandoned temp artifacts");
        }
        let prewarm = config.prewarm;
        let cache = Self {
            inner: Arc::new(Shared {
                config,
                store,
                queue: Mutex::new(WalkQueue::default()),
                idle: Condvar::new(),
            }),
        };
        tracing::debug!(
            source = %cache.inner.config.source_dir.display(),
            cache = %cache.inner.config.cache_dir.display(),
            "static cache ready"
        );
        if prewarm {
            cache.enqueue(cache.inner.config.source_dir.clone());
        }
        Ok(cache)
    }

    /// Returns the configuration, with absolute directories.
    pub fn config(&self) -> &StaticConfig {
        &self.inner.config
    }

    /// Returns the artifact layout.
    pub fn store(&self) -> &ArtifactStore {
        &self.inner.store
    }

    /// Serves the static file at `rel_path` into `sink`.
    ///
    /// Fails with [`Error::PathEscape`] before touching the filesystem when
    /// the path leaves the source directory, and with
    /// [`Error::SourceNotFound`] when the file does not exist.
    pub fn serve<W: ResponseSink>(&self, request: &RequestInfo, rel_path: &str, mut sink: W) -> Result<Served> {
        match self.lookup(request, rel_path)? {
            Lookup::Uncompressed { source, len } | Lookup::Sentinel { source, len } => {
                set_content_type(&mut sink, None, &source);
                sink.headers_mut().insert(header::CONTENT_LENGTH, HeaderValue::from(len));
                copy_source(&source, &mut sink)?;
                Ok(Served::Raw)
            }
            Lookup::NotModified => {
                sink.set_status(StatusCode::NOT_MODIFIED);
                Ok(Served::NotModified)
            }
            Lookup::Hit {
                source,
                artifact,
                encoding,
                len,
            } => {
                let stored = self.inner.store.read_mime(&source);
                set_content_type(&mut sink, stored.as_deref(), &source);
                apply_headers(encoding, sink.headers_mut());
                sink.headers_mut().insert(header::CONTENT_LENGTH, HeaderValue::from(len));
                let mut file = File::open(&artifact).map_err(|e| Error::cache_io(&artifact, e))?;
                io::copy(&mut file, &mut sink).map_err(|e| Error::partial_write(&e))?;
                tracing::trace!(path = %source.display(), %encoding, "static cache hit");
                Ok(Served::CacheHit(encoding))
            }
            Lookup::Miss { source, encoding, .. } => {
                self.enqueue_parent(&source);
                set_content_type(&mut sink, None, &source);
                let levels = &self.inner.config.fallback_levels;
                let encoding = if levels.enabled(encoding) {
                    encoding
                } else {
                    Encoding::Identity
                };
                let mut compressor = encoder::build(encoding, levels, &mut sink)?;
                copy_source(&source, &mut compressor)?;
                compressor.finish().map_err(|e| Error::partial_write(&e))?;
                tracing::debug!(path = %source.display(), %encoding, "static cache miss, compressed on the fly");
                Ok(match encoding {
                    Encoding::Identity => Served::Raw,
                    encoding => Served::Compressed(encoding),
                })
            }
        }
    }

    /// Resolves `rel_path` and classifies it against the cache.
    pub(crate) fn lookup(&self, request: &RequestInfo, rel_path: &str) -> Result<Lookup> {
        let store = &self.inner.store;
        let source = store.resolve(rel_path)?;
        let meta = fs::metadata(&source).map_err(|e| Error::SourceNotFound {
            path: source.clone(),
            source: e,
        })?;
        if !meta.is_file() {
            return Err(Error::SourceNotFound {
                path: source,
                source: io::Error::new(io::ErrorKind::NotFound, "not a regular file"),
            });
        }
        let len = meta.len();

        let content_type = guess_content_type(&source);
        let encoding = decide_enabled(request, content_type, &self.inner.config.levels);
        if !encoding.is_compressed() {
            return Ok(Lookup::Uncompressed { source, len });
        }

        let Ok(modified) = meta.modified() else {
            return Ok(Lookup::Miss { source, encoding, len });
        };
        let state = store.state(&source, modified, encoding);
        if let ArtifactState::Sentinel { fresh } = state {
            if !fresh {
                self.enqueue_parent(&source);
            }
            return Ok(Lookup::Sentinel { source, len });
        }

        if request
            .if_modified_since_time()
            .is_some_and(|since| modified < since)
        {
            return Ok(Lookup::NotModified);
        }

        match state {
            ArtifactState::Fresh { len: artifact_len } => {
                let Some(artifact) = store.artifact_path(&source, encoding) else {
                    return Ok(Lookup::Miss { source, encoding, len });
                };
                Ok(Lookup::Hit {
                    source,
                    artifact,
                    encoding,
                    len: artifact_len,
                })
            }
            _ => Ok(Lookup::Miss { source, encoding, len }),
        }
    }

    fn enqueue_parent(&self, source: &Path) {
        let dir = source
            .parent()
            .unwrap_or(&self.inner.config.source_dir)
            .to_path_buf();
        self.enqueue(dir);
    }
}

impl std::fmt::Debug for StaticCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCache")
            .field("config", &self.inner.config)
            .field("walking", &self.is_walking())
            .finish()
    }
}

/// Guesses a content type from a file extension.
pub(crate) fn guess_content_type(path: &Path) -> Option<&'static str> {
    mime_guess::from_path(path).first_raw()
}

fn set_content_type<W: ResponseSink>(sink: &mut W, stored: Option<&str>, source: &Path) {
    if sink.headers().contains_key(header::CONTENT_TYPE) {
        return;
    }
    let content_type = stored.or_else(|| guess_content_type(source));
    if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(ct).ok()) {
        sink.headers_mut().insert(header::CONTENT_TYPE, value);
    }
}

fn copy_source<W: Write>(source: &Path, sink: &mut W) -> Result<u64> {
    let mut file = File::open(source).map_err(|e| Error::SourceNotFound {
        path: source.to_path_buf(),
        source: e,
    })?;
    io::copy(&mut file, sink).map_err(|e| Error::partial_write(&e))
}
