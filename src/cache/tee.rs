//! Response-time cache warming: compress once, write to disk and client.

use compression_codecs::EncodeV2;
use http::StatusCode;
use std::io::{self, Write};
use std::path::PathBuf;

use crate::cache::artifact::{ArtifactWriter, Published, write_sidecar};
use crate::codec::{Encoding, Levels};
use crate::encoder::{CompressingSink, apply_headers};
use crate::error::{Error, Result};
use crate::sink::{ResponseSink, Tee};

/// Fans compressed bytes out to a cache artifact and the live response.
///
/// The live response is the first sink of the tee and the disk copy the
/// second. A client failure is reported to the writer. A disk failure leaves
/// the response untouched and is reported by [`write_mime`](Self::write_mime),
/// which then discards the artifact instead of publishing it.
pub struct DiskCacheTee<W> {
    sink: CompressingSink<Tee<W, ArtifactWriter>>,
    mime_path: PathBuf,
    input_len: u64,
    source_len: u64,
    max_ratio: f64,
    closed: bool,
    close_failed: bool,
    mime_written: bool,
}

impl<W: ResponseSink> DiskCacheTee<W> {
    /// Sets the response headers for `encoding` and starts a compressor
    /// writing to both `artifact` and `response`.
    ///
    /// `source_len` is the size of the file being served; only a `200 OK`
    /// response carrying exactly that many bytes is published.
    pub fn build(
        encoding: Encoding,
        levels: &Levels,
        artifact: ArtifactWriter,
        mime_path: impl Into<PathBuf>,
        response: W,
        source_len: u64,
        max_ratio: f64,
    ) -> Result<Self> {
        if !encoding.is_compressed() {
            return Err(Error::EncodingSetup(
                "cache warming requires a compressed encoding".to_owned(),
            ));
        }
        let encoder = levels.encoder(encoding)?;
        Ok(Self::assemble(
            encoding,
            encoder,
            artifact,
            mime_path.into(),
            response,
            source_len,
            max_ratio,
        ))
    }

    /// Infallible part of [`DiskCacheTee::build`], for callers that must not
    /// lose `response` on error.
    pub(crate) fn assemble(
        encoding: Encoding,
        encoder: Option<Box<dyn EncodeV2 + Send>>,
        artifact: ArtifactWriter,
        mime_path: PathBuf,
        mut response: W,
        source_len: u64,
        max_ratio: f64,
    ) -> Self {
        apply_headers(encoding, response.headers_mut());
        Self {
            sink: CompressingSink::from_encoder(encoding, encoder, Tee::new(response, artifact)),
            mime_path,
            input_len: 0,
            source_len,
            max_ratio,
            closed: false,
            close_failed: false,
            mime_written: false,
        }
    }

    /// Returns the encoding being written.
    pub fn encoding(&self) -> Encoding {
        self.sink.encoding()
    }

    /// Returns the live response.
    pub fn response(&self) -> &W {
        self.sink.get_ref().first()
    }

    /// Returns the live response mutably.
    pub fn response_mut(&mut self) -> &mut W {
        self.sink.get_mut().first_mut()
    }

    /// Returns whether the response is a `200 OK` carrying the whole source.
    pub fn is_complete(&self) -> bool {
        self.input_len == self.source_len && self.response().status() == StatusCode::OK
    }

    /// Drops the disk copy without publishing it. The response is unaffected.
    pub fn discard(&mut self) {
        self.sink.get_mut().second_mut().discard();
    }

    /// Finishes the compressed stream, then closes the disk file.
    ///
    /// The disk file is closed even when finishing the compressor failed; the
    /// first failure is returned.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let finished = self.sink.finish().map_err(|e| Error::partial_write(&e));
        let closed = self.sink.get_mut().second_mut().close().map(drop);
        let result = finished.and(closed);
        self.close_failed = result.is_err();
        result
    }

    /// Persists the content-type sidecar, then publishes the artifact.
    ///
    /// Closes the tee first if needed. An artifact whose disk copy saw a
    /// failed write, or whose response was not [complete](Self::is_complete),
    /// is discarded. One that did not shrink enough is replaced by a
    /// sentinel.
    pub fn write_mime(&mut self, content_type: &str) -> Result<Published> {
        if self.mime_written {
            return Err(Error::cache_io(
                &self.mime_path,
                io::Error::other("sidecar already written"),
            ));
        }
        self.mime_written = true;

        let close = self.close();
        let close_failed = self.close_failed;
        let complete = self.is_complete();
        let tee = self.sink.get_mut();
        if !complete {
            tee.second_mut().discard();
            return close.and(Err(Error::cache_io(
                &self.mime_path,
                io::Error::other("response is not a full copy of the source"),
            )));
        }
        if close_failed || tee.second_failed() {
            let artifact = tee.second_mut();
            artifact.discard();
            tracing::debug!(
                path = %artifact.path().display(),
                "discarding incomplete cache artifact"
            );
            return close.and(Err(Error::cache_io(
                artifact.path(),
                io::Error::other("incomplete artifact discarded"),
            )));
        }

        write_sidecar(&self.mime_path, content_type)?;
        let input_len = self.input_len;
        let max_ratio = self.max_ratio;
        let artifact = self.sink.get_mut().second_mut();
        let published = artifact.publish_checked(input_len, max_ratio)?;
        tracing::debug!(
            path = %artifact.path().display(),
            ?published,
            "published artifact from live response"
        );
        Ok(published)
    }

    /// Consumes the tee, returning the live response. An unpublished artifact
    /// is removed.
    pub fn into_response(self) -> W {
        let (response, _artifact) = self.sink.into_inner().into_inner();
        response
    }
}

impl<W: ResponseSink> Write for DiskCacheTee<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.sink.write(buf)?;
        self.input_len += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl<W> std::fmt::Debug for DiskCacheTee<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCacheTee")
            .field("sink", &self.sink)
            .field("mime_path", &self.mime_path)
            .field("input_len", &self.input_len)
            .field("source_len", &self.source_len)
            .field("closed", &self.closed)
            .finish()
    }
}
