//! On-disk cache layout, freshness and the atomic publish protocol.
//!
//! For a source file `P` under the source directory, artifacts live at the
//! same relative path under the cache directory: `P.gz`, `P.br` and the
//! `P.mime` sidecar. In-progress artifacts carry an extra `tmp` marker
//! (`P.gztmp`, `P.brtmp`) until they are renamed into place.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::codec::Encoding;
use crate::error::{Error, Result};

/// Suffix of the content-type sidecar.
pub const MIME_EXTENSION: &str = ".mime";

/// Marker appended to an artifact name while it is being written.
pub const TEMP_MARKER: &str = "tmp";

const CACHE_SUFFIXES: &[&str] = &[".gz", ".br", MIME_EXTENSION, ".gztmp", ".brtmp"];

const TEMP_SUFFIXES: &[&str] = &[".gztmp", ".brtmp"];

/// Physical state of one cache artifact relative to its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    /// No artifact on disk.
    Absent,
    /// Zero-length marker meaning "serve raw".
    Sentinel {
        /// Whether the marker is newer than the source.
        fresh: bool,
    },
    /// Populated and strictly newer than the source.
    Fresh {
        /// Artifact size in bytes.
        len: u64,
    },
    /// Populated but not newer than the source.
    Stale,
}

/// Maps source files to their cache artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    source_dir: PathBuf,
    cache_dir: PathBuf,
}

impl ArtifactStore {
    /// Creates a store for sources under `source_dir` cached in `cache_dir`.
    pub fn new(source_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            cache_dir: cache_dir.into(),
        }
    }

    /// Returns the source base directory.
    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    /// Returns the cache directory.
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Resolves a requested relative path against the source directory.
    ///
    /// Resolution is purely lexical and touches no file: `..` segments that
    /// would climb above the base are rejected as [`Error::PathEscape`].
    pub fn resolve(&self, requested: &str) -> Result<PathBuf> {
        let mut resolved = self.source_dir.clone();
        let mut depth = 0usize;
        for component in Path::new(requested).components() {
            match component {
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::ParentDir => {
                    if depth == 0 {
                        return Err(Error::PathEscape {
                            path: requested.to_owned(),
                        });
                    }
                    resolved.pop();
                    depth -= 1;
                }
                Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
            }
        }
        Ok(resolved)
    }

    /// Returns the artifact path for `source`, or `None` for identity or a
    /// source outside the base directory.
    pub fn artifact_path(&self, source: &Path, encoding: Encoding) -> Option<PathBuf> {
        self.cache_path(source, encoding.artifact_extension()?)
    }

    /// Returns the content-type sidecar path for `source`.
    pub fn mime_path(&self, source: &Path) -> Option<PathBuf> {
        self.cache_path(source, MIME_EXTENSION)
    }

    fn cache_path(&self, source: &Path, suffix: &str) -> Option<PathBuf> {
        let relative = source.strip_prefix(&self.source_dir).ok()?;
        let mut name: OsString = self.cache_dir.join(relative).into_os_string();
        name.push(suffix);
        Some(PathBuf::from(name))
    }

    /// Classifies the artifact of `source` for `encoding`.
    pub fn state(&self, source: &Path, source_modified: SystemTime, encoding: Encoding) -> ArtifactState {
        let Some(artifact) = self.artifact_path(source, encoding) else {
            return ArtifactState::Absent;
        };
        let Ok(meta) = fs::metadata(&artifact) else {
            return ArtifactState::Absent;
        };
        if !meta.is_file() {
            return ArtifactState::Absent;
        }
        let fresh = meta
            .modified()
            .is_ok_and(|modified| modified > source_modified);
        match (meta.len(), fresh) {
            (0, fresh) => ArtifactState::Sentinel { fresh },
            (len, true) => ArtifactState::Fresh { len },
            (_, false) => ArtifactState::Stale,
        }
    }

    /// Returns whether the artifact needs no regeneration.
    pub fn is_fresh(&self, source: &Path, source_modified: SystemTime, encoding: Encoding) -> bool {
        matches!(
            self.state(source, source_modified, encoding),
            ArtifactState::Fresh { .. } | ArtifactState::Sentinel { fresh: true }
        )
    }

    /// Reads the captured content type of `source`, if any.
    pub fn read_mime(&self, source: &Path) -> Option<String> {
        let content = fs::read_to_string(self.mime_path(source)?).ok()?;
        let content = content.trim();
        (!content.is_empty()).then(|| content.to_owned())
    }

    /// Writes the content-type sidecar of `source`.
    pub fn write_mime(&self, source: &Path, content_type: &str) -> Result<()> {
        let Some(path) = self.mime_path(source) else {
            return Ok(());
        };
        write_sidecar(&path, content_type)
    }

    /// Returns whether `path` is the cache directory nested inside the
    /// source tree.
    pub fn is_cache_dir(&self, path: &Path) -> bool {
        self.cache_dir != self.source_dir && path == self.cache_dir
    }

    /// Returns whether `path` looks like an artifact, sidecar or temp file of
    /// a cache co-located with the sources.
    pub fn is_cache_file(&self, path: &Path) -> bool {
        if self.cache_dir != self.source_dir {
            return false;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        CACHE_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
    }

    /// Deletes temp artifacts left behind by a process that died mid-write.
    ///
    /// Only safe before any writer of this cache directory is running.
    /// Returns the number of files removed.
    pub fn remove_abandoned_temps(&self) -> usize {
        let mut removed = 0;
        for entry in WalkDir::new(&self.cache_dir).into_iter().filter_map(|e| e.ok()) {
            let is_temp = entry.file_type().is_file()
                && entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| TEMP_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)));
            if !is_temp {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => tracing::debug!(
                    path = %entry.path().display(),
                    error = %err,
                    "cannot remove abandoned temp artifact"
                ),
            }
        }
        removed
    }
}

/// Writes a sidecar file and syncs it to disk.
pub(crate) fn write_sidecar(path: &Path, content_type: &str) -> Result<()> {
    let write = || -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(path)?;
        file.write_all(content_type.as_bytes())?;
        file.sync_all()
    };
    write().map_err(|e| Error::cache_io(path, e))
}

/// Returns whether `compressed` bytes are a worthwhile encoding of `source`
/// bytes under `max_ratio`.
pub fn worth_compressing(compressed: u64, source: u64, max_ratio: f64) -> bool {
    compressed as f64 <= source as f64 * max_ratio
}

/// How an artifact ended up on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    /// Compressed bytes were published.
    Artifact {
        /// Compressed size.
        len: u64,
    },
    /// Compression was not worth it; a zero-length sentinel was published.
    Sentinel,
}

/// Writes an artifact under a temporary name and publishes it by rename.
///
/// Readers only ever observe the old artifact or the complete new one. The
/// temp file is created exclusively, so at most one writer per artifact
/// exists at a time. An unpublished temp file is removed on drop.
#[derive(Debug)]
pub struct ArtifactWriter {
    path: PathBuf,
    temp: PathBuf,
    file: Option<BufWriter<File>>,
    written: u64,
    published: bool,
}

impl ArtifactWriter {
    /// Creates the temp file for the artifact at `path`.
    ///
    /// Fails with [`Error::ArtifactBusy`] when another writer already holds
    /// the temp file.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut temp = path.clone().into_os_string();
        temp.push(TEMP_MARKER);
        let temp = PathBuf::from(temp);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::cache_io(parent, e))?;
        }
        let file = match File::options().write(true).create_new(true).open(&temp) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::ArtifactBusy { path });
            }
            Err(err) => return Err(Error::cache_io(&temp, err)),
        };

        Ok(Self {
            path,
            temp,
            file: Some(BufWriter::new(file)),
            written: 0,
            published: false,
        })
    }

    /// Final artifact path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes and syncs the temp file, then closes it.
    pub fn close(&mut self) -> Result<u64> {
        if let Some(writer) = self.file.take() {
            let file = writer
                .into_inner()
                .map_err(|e| Error::cache_io(&self.temp, e.into_error()))?;
            file.sync_all().map_err(|e| Error::cache_io(&self.temp, e))?;
        }
        Ok(self.written)
    }

    /// Closes the temp file and renames it onto the final path.
    pub fn publish(&mut self) -> Result<()> {
        self.close()?;
        fs::rename(&self.temp, &self.path).map_err(|e| Error::cache_io(&self.path, e))?;
        self.published = true;
        Ok(())
    }

    /// Discards the written bytes and publishes a zero-length sentinel.
    pub fn publish_sentinel(&mut self) -> Result<()> {
        self.file = None;
        File::create(&self.temp)
            .and_then(|file| file.sync_all())
            .map_err(|e| Error::cache_io(&self.temp, e))?;
        self.written = 0;
        fs::rename(&self.temp, &self.path).map_err(|e| Error::cache_io(&self.path, e))?;
        self.published = true;
        Ok(())
    }

    /// Publishes the artifact, or a sentinel when it is not at most
    /// `max_ratio` of `source_len`.
    pub fn publish_checked(&mut self, source_len: u64, max_ratio: f64) -> Result<Published> {
        let len = self.close()?;
        if worth_compressing(len, source_len, max_ratio) {
            self.publish()?;
            Ok(Published::Artifact { len })
        } else {
            self.publish_sentinel()?;
            Ok(Published::Sentinel)
        }
    }

    /// Drops the temp file without publishing anything.
    pub fn discard(&mut self) {
        self.file = None;
        if !self.published {
            let _ = fs::remove_file(&self.temp);
        }
    }
}

impl Write for ArtifactWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(file) = self.file.as_mut() else {
            return Err(io::Error::other("artifact already closed"));
        };
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for ArtifactWriter {
    fn drop(&mut self) {
        self.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn store(dir: &Path) -> ArtifactStore {
        ArtifactStore::new(dir.join("src"), dir.join("cache"))
    }

    #[test]
    fn test_resolve_within_base() {
        let store = ArtifactStore::new("/srv/static", "/var/cache");
        assert_eq!(
            store.resolve("/css/app.css").unwrap(),
            PathBuf::from("/srv/static/css/app.css")
        );
        assert_eq!(
            store.resolve("js/./lib/../app.js").unwrap(),
            PathBuf::from("/srv/static/js/app.js")
        );
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let store = ArtifactStore::new("/srv/static", "/var/cache");
        for path in ["../etc/passwd", "/../secret", "a/../../b", "a/b/../../../c"] {
            let err = store.resolve(path).unwrap_err();
            assert!(err.is_path_escape(), "{path} should escape");
        }
    }

    #[test]
    fn test_artifact_naming() {
        let store = ArtifactStore::new("/srv/static", "/var/cache");
        let source = Path::new("/srv/static/css/app.css");
        assert_eq!(
            store.artifact_path(source, Encoding::Gzip).unwrap(),
            PathBuf::from("/var/cache/css/app.css.gz")
        );
        assert_eq!(
            store.artifact_path(source, Encoding::Brotli).unwrap(),
            PathBuf::from("/var/cache/css/app.css.br")
        );
        assert_eq!(
            store.mime_path(source).unwrap(),
            PathBuf::from("/var/cache/css/app.css.mime")
        );
        assert!(store.artifact_path(source, Encoding::Identity).is_none());
        assert!(store.artifact_path(Path::new("/etc/passwd"), Encoding::Gzip).is_none());
    }

    #[test]
    fn test_co_located_cache_files() {
        let store = ArtifactStore::new("/srv/static", "/srv/static");
        assert!(store.is_cache_file(Path::new("/srv/static/app.js.gz")));
        assert!(store.is_cache_file(Path::new("/srv/static/app.js.brtmp")));
        assert!(store.is_cache_file(Path::new("/srv/static/app.js.mime")));
        assert!(!store.is_cache_file(Path::new("/srv/static/app.js")));
        assert!(!store.is_cache_dir(Path::new("/srv/static")));

        let nested = ArtifactStore::new("/srv/static", "/srv/static/.cache");
        assert!(nested.is_cache_dir(Path::new("/srv/static/.cache")));
        assert!(!nested.is_cache_file(Path::new("/srv/static/app.js.gz")));
    }

    #[test]
    fn test_publish_is_atomic_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/app.js.gz");
        let mut writer = ArtifactWriter::create(&path).unwrap();
        writer.write_all(b"compressed").unwrap();

        let temp = dir.path().join("nested/app.js.gztmp");
        assert!(temp.exists());
        assert!(!path.exists());

        writer.publish().unwrap();
        assert!(!temp.exists());
        assert_eq!(fs::read(&path).unwrap(), b"compressed");
    }

    #[test]
    fn test_publish_checked_sentinel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg.gz");
        let mut writer = ArtifactWriter::create(&path).unwrap();
        writer.write_all(&[7u8; 950]).unwrap();

        let published = writer.publish_checked(1000, 0.9).unwrap();
        assert_eq!(published, Published::Sentinel);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_publish_checked_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.js.br");
        let mut writer = ArtifactWriter::create(&path).unwrap();
        writer.write_all(&[1u8; 100]).unwrap();

        let published = writer.publish_checked(1000, 0.9).unwrap();
        assert_eq!(published, Published::Artifact { len: 100 });
        assert_eq!(fs::metadata(&path).unwrap().len(), 100);
    }

    #[test]
    fn test_drop_removes_unpublished_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.js.gz");
        {
            let mut writer = ArtifactWriter::create(&path).unwrap();
            writer.write_all(b"partial").unwrap();
        }
        assert!(!dir.path().join("app.js.gztmp").exists());
        assert!(!path.exists());
    }

    #[test]
    fn test_worth_compressing_threshold() {
        assert!(worth_compressing(900, 1000, 0.9));
        assert!(!worth_compressing(901, 1000, 0.9));
        assert!(worth_compressing(10, 1000, 0.9));
    }

    #[test]
    fn test_state_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let source = dir.path().join("src/app.js");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, b"source").unwrap();
        let source_modified = SystemTime::now() - Duration::from_secs(3600);

        assert_eq!(store.state(&source, source_modified, Encoding::Gzip), ArtifactState::Absent);

        let artifact = store.artifact_path(&source, Encoding::Gzip).unwrap();
        fs::create_dir_all(artifact.parent().unwrap()).unwrap();
        fs::write(&artifact, b"").unwrap();
        assert_eq!(
            store.state(&source, source_modified, Encoding::Gzip),
            ArtifactState::Sentinel { fresh: true }
        );

        fs::write(&artifact, b"gz").unwrap();
        assert_eq!(
            store.state(&source, source_modified, Encoding::Gzip),
            ArtifactState::Fresh { len: 2 }
        );
        assert!(store.is_fresh(&source, source_modified, Encoding::Gzip));

        let future = SystemTime::now() + Duration::from_secs(3600);
        assert_eq!(store.state(&source, future, Encoding::Gzip), ArtifactState::Stale);
        assert!(!store.is_fresh(&source, future, Encoding::Gzip));
    }

    #[test]
    fn test_mime_sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let source = dir.path().join("src/css/app.css");
        assert!(store.read_mime(&source).is_none());
        store.write_mime(&source, "text/css").unwrap();
        assert_eq!(store.read_mime(&source).as_deref(), Some("text/css"));
    }

    #[test]
    fn test_second_writer_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.js.gz");

        let mut first = ArtifactWriter::create(&path).unwrap();
        first.write_all(b"first writer").unwrap();
        let err = ArtifactWriter::create(&path).unwrap_err();
        assert!(err.is_artifact_busy());

        first.publish().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"first writer");

        let mut next = ArtifactWriter::create(&path).unwrap();
        next.write_all(b"next writer").unwrap();
        next.publish().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"next writer");
    }

    #[test]
    fn test_busy_writer_leaves_live_temp_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.js.gz");

        let mut first = ArtifactWriter::create(&path).unwrap();
        first.write_all(b"in flight").unwrap();
        drop(ArtifactWriter::create(&path).unwrap_err());
        assert!(dir.path().join("app.js.gztmp").exists());

        first.publish().unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"in flight");
    }

    #[test]
    fn test_remove_abandoned_temps() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let nested = dir.path().join("cache/css");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("app.css.gztmp"), b"half").unwrap();
        fs::write(nested.join("app.css.brtmp"), b"half").unwrap();
        fs::write(nested.join("app.css.gz"), b"whole").unwrap();

        assert_eq!(store.remove_abandoned_temps(), 2);
        assert!(!nested.join("app.css.gztmp").exists());
        assert!(!nested.join("app.css.brtmp").exists());
        assert!(nested.join("app.css.gz").exists());

        ArtifactWriter::create(nested.join("app.css.gz")).unwrap();
    }
}
