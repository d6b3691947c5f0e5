//! Background precompression: one walk loop, a worker pool per pass.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::{File, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, sync_channel};
use std::thread;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

use crate::cache::artifact::{ArtifactWriter, Published};
use crate::cache::static_files::{Shared, StaticCache, guess_content_type};
use crate::codec::Encoding;
use crate::encoder::CompressingSink;
use crate::error::{Error, Result};

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Roots waiting to be walked, and whether a walk loop is running.
#[derive(Debug, Default)]
pub(crate) struct WalkQueue {
    pending: VecDeque<PathBuf>,
    active: bool,
}

impl StaticCache {
    /// Queues `root` for background precompression.
    ///
    /// Starts the walk loop if none is running; otherwise the running loop
    /// picks the root up after its current pass.
    pub fn enqueue(&self, root: impl Into<PathBuf>) {
        let root = root.into();
        let mut queue = self.inner.queue.lock();
        queue.pending.push_back(root);
        if queue.active {
            return;
        }

        queue.active = true;
        let shared = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("precompress-walk".to_string())
            .spawn(move || shared.walk_loop());
        if let Err(err) = spawned {
            queue.active = false;
            tracing::warn!(error = %err, "failed to start precompression walk");
        }
    }

    /// Returns whether a walk loop is running.
    pub fn is_walking(&self) -> bool {
        self.inner.queue.lock().active
    }

    /// Blocks until the walk loop has drained every queued root, or until
    /// `timeout` elapses. Returns whether the cache is idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut queue = self.inner.queue.lock();
        while queue.active {
            if self.inner.idle.wait_until(&mut queue, deadline).timed_out() {
                return !queue.active;
            }
        }
        true
    }
}

impl Shared {
    fn walk_loop(&self) {
        loop {
            let root = {
                let mut queue = self.queue.lock();
                match queue.pending.pop_front() {
                    Some(root) => root,
                    None => {
                        queue.active = false;
                        self.idle.notify_all();
                        return;
                    }
                }
            };
            self.walk_pass(&root);
        }
    }

    /// Walks `root` and feeds stale files to a pool of workers.
    fn walk_pass(&self, root: &Path) {
        let started = Instant::now();
        let workers = self.config.parallelism.max(1);
        let (tx, rx) = sync_channel::<PathBuf>(workers);
        let rx = Mutex::new(rx);
        let mut queued = 0usize;

        thread::scope(|scope| {
            let mut spawned = 0;
            for id in 0..workers {
                let rx = &rx;
                let worker = thread::Builder::new()
                    .name(format!("precompress-{id}"))
                    .spawn_scoped(scope, move || self.worker(id, rx));
                match worker {
                    Ok(_) => spawned += 1,
                    Err(err) => tracing::warn!(worker = id, error = %err, "failed to spawn worker"),
                }
            }
            // Without workers nobody drains the channel; compress inline.
            let tx = (spawned > 0).then_some(tx);

            let entries = WalkDir::new(root)
                .follow_links(false)
                .into_iter()
                .filter_entry(|entry| !self.store.is_cache_dir(entry.path()));
            for entry in entries {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::debug!(error = %err, "skipping unreadable entry");
                        continue;
                    }
                };
                if !entry.file_type().is_file() || self.store.is_cache_file(entry.path()) {
                    continue;
                }
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                if meta.len() < self.config.min_size || !self.needs_compression(entry.path(), &meta) {
                    continue;
                }

                queued += 1;
                match &tx {
                    Some(tx) => {
                        if tx.send(entry.into_path()).is_err() {
                            break;
                        }
                    }
                    None => self.compress_file(entry.path()),
                }
            }
            drop(tx);
        });

        tracing::debug!(
            root = %root.display(),
            files = queued,
            elapsed = ?started.elapsed(),
            "precompression pass finished"
        );
    }

    fn worker(&self, id: usize, rx: &Mutex<Receiver<PathBuf>>) {
        tracing::trace!(worker = id, "precompression worker started");
        loop {
            let next = rx.lock().recv();
            let Ok(path) = next else {
                break;
            };
            self.compress_file(&path);
        }
        tracing::trace!(worker = id, "precompression worker stopped");
    }

    fn needs_compression(&self, source: &Path, meta: &Metadata) -> bool {
        let Ok(modified) = meta.modified() else {
            return true;
        };
        self.config
            .levels
            .enabled_encodings()
            .any(|encoding| !self.store.is_fresh(source, modified, encoding))
    }

    /// Produces every enabled artifact of `source` that is not fresh.
    fn compress_file(&self, source: &Path) {
        for encoding in self.config.levels.enabled_encodings() {
            if let Err(err) = self.compress_artifact(source, encoding) {
                tracing::warn!(
                    path = %source.display(),
                    %encoding,
                    error = %err,
                    "background compression failed"
                );
            }
        }
    }

    fn compress_artifact(&self, source: &Path, encoding: Encoding) -> Result<()> {
        let not_found = |e: io::Error| Error::SourceNotFound {
            path: source.to_path_buf(),
            source: e,
        };
        let mut input = File::open(source).map_err(not_found)?;
        let meta = input.metadata().map_err(not_found)?;
        let fresh = meta
            .modified()
            .is_ok_and(|modified| self.store.is_fresh(source, modified, encoding));
        if fresh {
            return Ok(());
        }
        let Some(path) = self.store.artifact_path(source, encoding) else {
            return Ok(());
        };

        let writer = match ArtifactWriter::create(&path) {
            Ok(writer) => writer,
            // A live response is warming this artifact; the next miss retries.
            Err(err) if err.is_artifact_busy() => {
                tracing::debug!(path = %path.display(), "artifact busy, skipping");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let mut sink = CompressingSink::new(encoding, &self.config.levels, writer)?;
        io::copy(&mut input, &mut sink).map_err(|e| Error::cache_io(&path, e))?;
        sink.finish().map_err(|e| Error::cache_io(&path, e))?;
        let mut writer = sink.into_inner();

        let content_type = guess_content_type(source).unwrap_or(FALLBACK_CONTENT_TYPE);
        self.store.write_mime(source, content_type)?;

        match writer.publish_checked(meta.len(), self.config.max_ratio)? {
            Published::Artifact { len } => tracing::debug!(
                path = %path.display(),
                source_len = meta.len(),
                len,
                "published artifact"
            ),
            Published::Sentinel => tracing::debug!(
                path = %path.display(),
                "not worth compressing, published sentinel"
            ),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::static_files::StaticConfig;
    use std::fs;
    use std::io::Read;
    use std::time::SystemTime;

    fn write_old(path: &Path, content: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(SystemTime::now() - Duration::from_secs(7200))
            .unwrap();
    }

    fn noise(len: usize) -> Vec<u8> {
        let mut state = 0x9e37_79b9_7f4a_7c15u64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    #[test]
    fn test_prewarm_compresses_tree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("www");
        let text = "lorem ipsum dolor sit amet ".repeat(100);
        write_old(&src.join("index.html"), text.as_bytes());
        write_old(&src.join("css/site.css"), text.as_bytes());
        write_old(&src.join("tiny.txt"), b"small");
        write_old(&src.join("blob.bin"), &noise(8192));

        let cache = StaticCache::new(
            StaticConfig::new(&src)
                .cache_dir(dir.path().join("cache"))
                .parallelism(3),
        )
        .unwrap();
        assert!(cache.wait_idle(Duration::from_secs(60)));
        assert!(!cache.is_walking());

        let store = cache.store();
        for name in ["index.html", "css/site.css"] {
            let source = src.join(name);
            let gz = store.artifact_path(&source, Encoding::Gzip).unwrap();
            let br = store.artifact_path(&source, Encoding::Brotli).unwrap();
            let mut decoded = Vec::new();
            flate2::read::GzDecoder::new(File::open(&gz).unwrap())
                .read_to_end(&mut decoded)
                .unwrap();
            assert_eq!(decoded, text.as_bytes());
            assert!(fs::metadata(&br).unwrap().len() > 0);
            assert!(store.read_mime(&source).is_some());
        }

        let tiny = store.artifact_path(&src.join("tiny.txt"), Encoding::Gzip).unwrap();
        assert!(!tiny.exists());

        let blob = store.artifact_path(&src.join("blob.bin"), Encoding::Gzip).unwrap();
        assert_eq!(fs::metadata(&blob).unwrap().len(), 0);
        assert!(!dir.path().join("cache/blob.bin.gztmp").exists());
    }

    #[test]
    fn test_disabled_encoding_not_produced() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("www");
        write_old(&src.join("app.js"), "let x = 1;\n".repeat(500).as_bytes());

        let cache = StaticCache::new(
            StaticConfig::new(&src)
                .cache_dir(dir.path().join("cache"))
                .levels(0, 5)
                .parallelism(1),
        )
        .unwrap();
        assert!(cache.wait_idle(Duration::from_secs(60)));

        let source = src.join("app.js");
        assert!(!cache.store().artifact_path(&source, Encoding::Gzip).unwrap().exists());
        assert!(cache.store().artifact_path(&source, Encoding::Brotli).unwrap().exists());
    }

    #[test]
    fn test_fresh_artifacts_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("www");
        let source = src.join("page.html");
        write_old(&source, "<div></div>".repeat(300).as_bytes());

        let cache = StaticCache::new(
            StaticConfig::new(&src)
                .cache_dir(dir.path().join("cache"))
                .levels(6, 0),
        )
        .unwrap();
        assert!(cache.wait_idle(Duration::from_secs(60)));

        let gz = cache.store().artifact_path(&source, Encoding::Gzip).unwrap();
        let first = fs::metadata(&gz).unwrap().modified().unwrap();

        cache.enqueue(&src);
        assert!(cache.wait_idle(Duration::from_secs(60)));
        assert_eq!(fs::metadata(&gz).unwrap().modified().unwrap(), first);
    }

    #[test]
    fn test_co_located_cache_skips_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().to_path_buf();
        write_old(&src.join("app.css"), ".a { margin: 0 }\n".repeat(200).as_bytes());

        let cache = StaticCache::new(StaticConfig::new(&src).cache_dir(&src).levels(6, 0)).unwrap();
        assert!(cache.wait_idle(Duration::from_secs(60)));
        cache.enqueue(&src);
        assert!(cache.wait_idle(Duration::from_secs(60)));

        assert!(src.join("app.css.gz").exists());
        assert!(!src.join("app.css.gz.gz").exists());
        assert!(!src.join("app.css.mime.gz").exists());
    }

    #[test]
    fn test_concurrent_enqueues_share_one_loop() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("www");
        for i in 0..8 {
            write_old(&src.join(format!("d{i}/f.txt")), "abc ".repeat(1000).as_bytes());
        }
        let cache = StaticCache::new(
            StaticConfig::new(&src)
                .cache_dir(dir.path().join("cache"))
                .levels(1, 0)
                .prewarm(false),
        )
        .unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let cache = cache.clone();
                let root = src.join(format!("d{i}"));
                thread::spawn(move || cache.enqueue(root))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.wait_idle(Duration::from_secs(60)));

        for i in 0..8 {
            let source = src.join(format!("d{i}/f.txt"));
            assert!(cache.store().artifact_path(&source, Encoding::Gzip).unwrap().exists());
        }
    }

    #[test]
    fn test_background_job_yields_to_live_warm() {
        use crate::interceptor::{DynamicConfig, ResponseInterceptor};
        use crate::negotiate::RequestInfo;
        use crate::pool::BufferPool;
        use crate::sink::BufferedResponse;
        use http::Method;
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("www");
        let source = src.join("app.js");
        let text = "export const answer = 42;\n".repeat(300);
        write_old(&source, text.as_bytes());
        let cache = StaticCache::new(
            StaticConfig::new(&src)
                .cache_dir(dir.path().join("cache"))
                .levels(6, 0)
                .prewarm(false),
        )
        .unwrap();

        let request = RequestInfo::new(Method::GET, "/app.js").accept_encoding("gzip");
        let mut live = ResponseInterceptor::new(
            request,
            BufferedResponse::new(),
            DynamicConfig::default(),
            BufferPool::new(),
        );
        assert!(!live.serve_cached(&cache, "app.js"));
        let (head, tail) = text.as_bytes().split_at(text.len() / 2);
        live.write_all(head).unwrap();

        cache.inner.compress_artifact(&source, Encoding::Gzip).unwrap();
        let gz = cache.store().artifact_path(&source, Encoding::Gzip).unwrap();
        assert!(!gz.exists());

        live.write_all(tail).unwrap();
        let (response, errors) = live.into_parts();
        assert!(errors.is_empty(), "{errors:?}");
        let response = response.unwrap();

        let on_disk = fs::read(&gz).unwrap();
        assert_eq!(on_disk, response.body());
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(on_disk.as_slice())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, text.as_bytes());
    }
}
