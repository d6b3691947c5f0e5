//! Lazy response compression.
//!
//! A [`ResponseInterceptor`] sits between a handler and its response sink.
//! Small writes are buffered; once the body reaches the configured threshold
//! the encoding is negotiated, headers are rewritten and the buffered bytes
//! are caught up through the compressor. A response that never reaches the
//! threshold is sent untouched.

use http::{HeaderValue, Method, StatusCode, header};
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::mem;

use crate::DEFAULT_MIN_SIZE;
use crate::cache::{ArtifactWriter, DiskCacheTee, Lookup, StaticCache, guess_content_type};
use crate::codec::{Encoding, Levels};
use crate::encoder::{CompressingSink, apply_headers};
use crate::error::Error;
use crate::negotiate::{RequestInfo, decide_enabled};
use crate::pool::{BufferPool, PooledBuffer};
use crate::sink::ResponseSink;

const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Settings for compressing dynamic responses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DynamicConfig {
    /// Compression levels; 0 disables an encoding.
    pub levels: Levels,
    /// Bodies shorter than this are sent uncompressed.
    pub min_size: usize,
}

impl DynamicConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the compression levels.
    pub fn levels(mut self, levels: Levels) -> Self {
        self.levels = levels;
        self
    }

    /// Sets the buffering threshold.
    pub fn min_size(mut self, min_size: usize) -> Self {
        self.min_size = min_size;
        self
    }
}

impl Default for DynamicConfig {
    fn default() -> Self {
        Self {
            levels: Levels::DYNAMIC,
            min_size: DEFAULT_MIN_SIZE,
        }
    }
}

enum Stage<W> {
    /// Undecided: bytes accumulate until the threshold.
    Buffering {
        buffer: Option<PooledBuffer>,
        sink: W,
    },
    /// Decided: bytes flow through the compressor (or pass through).
    Streaming(CompressingSink<W>),
    /// Decided, and the compressed bytes also populate the disk cache.
    Warming {
        tee: DiskCacheTee<W>,
        content_type: &'static str,
    },
    Finished(W),
    /// Only observable after a panic during a transition.
    Taken,
}

/// Wraps a response sink and compresses its body lazily.
///
/// Errors are recorded rather than raised at finalization, since bytes
/// already on the wire cannot be retracted. The host reads them from
/// [`errors`](Self::errors) or [`into_parts`](Self::into_parts).
pub struct ResponseInterceptor<W: ResponseSink> {
    request: RequestInfo,
    config: DynamicConfig,
    pool: BufferPool,
    stage: Stage<W>,
    encoding: Option<Encoding>,
    errors: Vec<Error>,
}

impl<W: ResponseSink> ResponseInterceptor<W> {
    /// Wraps `sink` for a response to `request`.
    pub fn new(request: RequestInfo, sink: W, config: DynamicConfig, pool: BufferPool) -> Self {
        Self {
            request,
            config,
            pool,
            stage: Stage::Buffering { buffer: None, sink },
            encoding: None,
            errors: Vec::new(),
        }
    }

    /// Returns the captured request attributes.
    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    /// Returns the chosen encoding, or `None` while still buffering.
    pub fn encoding(&self) -> Option<Encoding> {
        self.encoding
    }

    /// Returns whether the encoding has been decided.
    pub fn is_decided(&self) -> bool {
        self.encoding.is_some()
    }

    /// Returns whether [`finalize`](Self::finalize) has run.
    pub fn is_finished(&self) -> bool {
        matches!(self.stage, Stage::Finished(_) | Stage::Taken)
    }

    /// Number of bytes held back while undecided.
    pub fn buffered_len(&self) -> usize {
        match &self.stage {
            Stage::Buffering { buffer, .. } => buffer.as_ref().map_or(0, |b| b.len()),
            _ => 0,
        }
    }

    /// Returns the underlying sink.
    pub fn sink(&self) -> Option<&W> {
        match &self.stage {
            Stage::Buffering { sink, .. } | Stage::Finished(sink) => Some(sink),
            Stage::Streaming(compressor) => Some(compressor.get_ref()),
            Stage::Warming { tee, .. } => Some(tee.response()),
            Stage::Taken => None,
        }
    }

    /// Returns the underlying sink mutably.
    ///
    /// Writing body bytes to it directly bypasses compression.
    pub fn sink_mut(&mut self) -> Option<&mut W> {
        match &mut self.stage {
            Stage::Buffering { sink, .. } | Stage::Finished(sink) => Some(sink),
            Stage::Streaming(compressor) => Some(compressor.get_mut()),
            Stage::Warming { tee, .. } => Some(tee.response_mut()),
            Stage::Taken => None,
        }
    }

    /// Returns the errors recorded so far.
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Drains the errors recorded so far.
    pub fn take_errors(&mut self) -> Vec<Error> {
        mem::take(&mut self.errors)
    }

    /// Finalizes the response and returns the sink with the recorded errors.
    pub fn into_parts(mut self) -> (Option<W>, Vec<Error>) {
        self.finalize();
        let sink = match mem::replace(&mut self.stage, Stage::Taken) {
            Stage::Finished(sink) => Some(sink),
            _ => None,
        };
        (sink, mem::take(&mut self.errors))
    }

    /// Completes the response. Runs at most once; later calls do nothing.
    ///
    /// An undecided body is written uncompressed. A compressor is finished,
    /// and a failure to do so is recorded but not returned.
    pub fn finalize(&mut self) {
        let mut sink = match mem::replace(&mut self.stage, Stage::Taken) {
            Stage::Buffering { buffer, mut sink } => {
                let written = match &buffer {
                    Some(buffer) => sink.write_all(buffer),
                    None => Ok(()),
                };
                drop(buffer);
                if let Err(err) = written {
                    self.record(&err);
                }
                sink
            }
            Stage::Streaming(mut compressor) => {
                if let Err(err) = compressor.finish() {
                    tracing::debug!(error = %err, "closing compressor failed");
                    self.record(&err);
                }
                compressor.into_inner()
            }
            Stage::Warming {
                mut tee,
                content_type,
            } => {
                if let Err(err) = tee.close() {
                    self.errors.push(err);
                }
                if tee.is_complete() {
                    let content_type = tee
                        .response()
                        .headers()
                        .get(header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or(content_type)
                        .to_owned();
                    if let Err(err) = tee.write_mime(&content_type) {
                        tracing::debug!(error = %err, "cache warming failed");
                        self.errors.push(err);
                    }
                } else {
                    tracing::debug!(
                        path = %self.request.path,
                        "response is not a full copy of the source, not cached"
                    );
                    tee.discard();
                }
                tee.into_response()
            }
            stage @ (Stage::Finished(_) | Stage::Taken) => {
                self.stage = stage;
                return;
            }
        };

        if let Err(err) = sink.flush() {
            self.record(&err);
        }
        self.stage = Stage::Finished(sink);
    }

    /// Serves the response from `cache` when possible.
    ///
    /// Returns `true` when the response was fully produced, from a cached
    /// artifact or as `304 Not Modified`; the handler must then write
    /// nothing. Returns `false` when the handler should produce the body
    /// itself, in which case a cache miss makes the interceptor write the
    /// compressed body into the cache as well.
    pub fn serve_cached(&mut self, cache: &StaticCache, rel_path: &str) -> bool {
        if self.request.method != Method::GET || self.is_decided() || self.buffered_len() > 0 {
            return false;
        }

        let lookup = match cache.lookup(&self.request, rel_path) {
            Ok(lookup) => lookup,
            Err(err) => {
                tracing::debug!(path = rel_path, error = %err, "not serving from cache");
                self.errors.push(err);
                return false;
            }
        };

        match lookup {
            Lookup::Uncompressed { .. } => false,
            Lookup::Sentinel { .. } => {
                self.commit_raw(Encoding::Identity);
                false
            }
            Lookup::NotModified => {
                self.commit_raw(Encoding::Identity);
                if let Some(sink) = self.sink_mut() {
                    sink.set_status(StatusCode::NOT_MODIFIED);
                }
                true
            }
            Lookup::Hit {
                source,
                artifact,
                encoding,
                len,
            } => {
                let mut file = match File::open(&artifact) {
                    Ok(file) => file,
                    Err(err) => {
                        self.errors.push(Error::cache_io(&artifact, err));
                        return false;
                    }
                };
                if let Some(sink) = self.sink_mut() {
                    let headers = sink.headers_mut();
                    if !headers.contains_key(header::CONTENT_TYPE) {
                        let content_type = cache
                            .store()
                            .read_mime(&source)
                            .or_else(|| guess_content_type(&source).map(str::to_owned));
                        if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(&ct).ok()) {
                            headers.insert(header::CONTENT_TYPE, value);
                        }
                    }
                }
                self.commit_raw(encoding);
                if let Some(sink) = self.sink_mut() {
                    sink.headers_mut()
                        .insert(header::CONTENT_LENGTH, HeaderValue::from(len));
                }
                if let Err(err) = self.copy_raw(&mut file) {
                    self.record(&err);
                }
                true
            }
            Lookup::Miss { source, encoding, len } => {
                self.warm(cache, &source, encoding, len);
                false
            }
        }
    }

    /// Switches to writing the compressed body to the cache as well.
    fn warm(&mut self, cache: &StaticCache, source: &std::path::Path, encoding: Encoding, source_len: u64) {
        let config = cache.config();
        if !config.warm_levels.enabled(encoding) {
            return;
        }
        let (Some(artifact_path), Some(mime_path)) =
            (cache.store().artifact_path(source, encoding), cache.store().mime_path(source))
        else {
            return;
        };
        let encoder = match config.warm_levels.encoder(encoding) {
            Ok(encoder) => encoder,
            Err(err) => {
                self.errors.push(err);
                return;
            }
        };
        let artifact = match ArtifactWriter::create(&artifact_path) {
            Ok(artifact) => artifact,
            Err(err) if err.is_artifact_busy() => {
                tracing::debug!(path = %source.display(), %encoding, "artifact busy, not warming");
                return;
            }
            Err(err) => {
                self.errors.push(err);
                return;
            }
        };

        let (buffer, sink) = match mem::replace(&mut self.stage, Stage::Taken) {
            Stage::Buffering { buffer, sink } => (buffer, sink),
            stage => {
                self.stage = stage;
                return;
            }
        };
        drop(buffer);
        let tee = DiskCacheTee::assemble(
            encoding,
            encoder,
            artifact,
            mime_path,
            sink,
            source_len,
            config.max_ratio,
        );
        tracing::debug!(path = %source.display(), %encoding, "warming static cache from response");
        self.encoding = Some(encoding);
        self.stage = Stage::Warming {
            tee,
            content_type: guess_content_type(source).unwrap_or(FALLBACK_CONTENT_TYPE),
        };
    }

    /// Locks the response to pass-through, advertising `encoding` for bytes
    /// that are already encoded.
    fn commit_raw(&mut self, encoding: Encoding) {
        if let Stage::Buffering { sink, .. } = &mut self.stage {
            apply_headers(encoding, sink.headers_mut());
        }
        // A pass-through sink never fails to build.
        let _ = self.commit(Encoding::Identity, None);
        self.encoding = Some(encoding);
    }

    fn copy_raw(&mut self, file: &mut File) -> io::Result<u64> {
        match &mut self.stage {
            Stage::Streaming(compressor) => io::copy(file, compressor),
            _ => Err(io::Error::other("response is not streaming")),
        }
    }

    /// Negotiates the encoding from the response as written so far.
    fn choose_encoding(&self) -> Encoding {
        let Stage::Buffering { sink, .. } = &self.stage else {
            return Encoding::Identity;
        };
        let headers = sink.headers();
        if headers.contains_key(header::CONTENT_ENCODING) {
            return Encoding::Identity;
        }
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok());
        decide_enabled(&self.request, content_type, &self.config.levels)
    }

    /// Leaves the buffering stage: rewrites headers, builds the compressor
    /// and catches up on the buffered bytes.
    fn commit(&mut self, encoding: Encoding, levels: Option<&Levels>) -> io::Result<()> {
        if !matches!(self.stage, Stage::Buffering { .. }) {
            return Ok(());
        }
        let encoder = match levels.map_or(Ok(None), |levels| levels.encoder(encoding)) {
            Ok(encoder) => encoder,
            Err(err) => {
                let io_err = io::Error::other(err.to_string());
                self.errors.push(err);
                return Err(io_err);
            }
        };
        let encoding = if encoder.is_some() {
            encoding
        } else {
            Encoding::Identity
        };

        let (buffer, mut sink) = match mem::replace(&mut self.stage, Stage::Taken) {
            Stage::Buffering { buffer, sink } => (buffer, sink),
            stage => {
                self.stage = stage;
                return Ok(());
            }
        };
        if levels.is_some() && !self.request.is_profiling() {
            apply_headers(encoding, sink.headers_mut());
            tracing::trace!(%encoding, path = %self.request.path, "response encoding decided");
        }
        let mut compressor = CompressingSink::from_encoder(encoding, encoder, sink);
        let caught_up = match &buffer {
            Some(buffer) => compressor.write_all(buffer),
            None => Ok(()),
        };
        drop(buffer);
        self.encoding = Some(encoding);
        self.stage = Stage::Streaming(compressor);
        caught_up.map_err(|err| self.record(&err))
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        let pool = &self.pool;
        match &mut self.stage {
            Stage::Buffering { buffer, .. } => {
                let buffered = buffer.as_ref().map_or(0, |b| b.len());
                if buffered + bytes.len() < self.config.min_size {
                    buffer
                        .get_or_insert_with(|| pool.acquire())
                        .extend_from_slice(bytes);
                    return Ok(());
                }
            }
            Stage::Finished(_) | Stage::Taken => {
                return Err(io::Error::other("write after response was finalized"));
            }
            Stage::Streaming(_) | Stage::Warming { .. } => {}
        }

        if !self.is_decided() {
            let encoding = self.choose_encoding();
            let levels = self.config.levels;
            self.commit(encoding, Some(&levels))?;
        }

        let result = match &mut self.stage {
            Stage::Streaming(compressor) => compressor.write_all(bytes),
            Stage::Warming { tee, .. } => tee.write_all(bytes),
            _ => Err(io::Error::other("response is not streaming")),
        };
        result.map_err(|err| self.record(&err))
    }

    fn record(&mut self, err: &io::Error) -> io::Error {
        self.errors.push(Error::partial_write(err));
        io::Error::new(err.kind(), err.to_string())
    }
}

impl<W: ResponseSink> Write for ResponseInterceptor<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_bytes(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.stage {
            Stage::Streaming(compressor) => compressor.flush(),
            Stage::Warming { tee, .. } => tee.flush(),
            Stage::Buffering { .. } | Stage::Finished(_) | Stage::Taken => Ok(()),
        }
    }
}

impl<W: ResponseSink> Drop for ResponseInterceptor<W> {
    fn drop(&mut self) {
        self.finalize();
        for err in &self.errors {
            tracing::warn!(path = %self.request.path, error = %err, "response error");
        }
    }
}

impl<W: ResponseSink> fmt::Debug for ResponseInterceptor<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stage = match &self.stage {
            Stage::Buffering { .. } => "buffering",
            Stage::Streaming(_) => "streaming",
            Stage::Warming { .. } => "warming",
            Stage::Finished(_) => "finished",
            Stage::Taken => "taken",
        };
        f.debug_struct("ResponseInterceptor")
            .field("path", &self.request.path)
            .field("stage", &stage)
            .field("encoding", &self.encoding)
            .field("buffered", &self.buffered_len())
            .field("errors", &self.errors.len())
            .finish()
    }
}
