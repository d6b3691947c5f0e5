//! Compressor construction and the streaming compressing sink.

use compression_codecs::EncodeV2;
use compression_core::util::{PartialBuffer, WriteBuffer};
use http::{HeaderMap, HeaderValue, header};
use std::fmt;
use std::io::{self, Write};

use crate::codec::{Encoding, Levels};
use crate::error::Result;
use crate::sink::ResponseSink;

const OUTPUT_BUFFER_SIZE: usize = 8 * 1024; // 8KB output buffer

/// Builds a compressing sink for `encoding` over `sink`, first updating the
/// sink's headers.
///
/// Must be called before any body byte has been written to `sink`.
pub fn build<W: ResponseSink>(
    encoding: Encoding,
    levels: &Levels,
    mut sink: W,
) -> Result<CompressingSink<W>> {
    levels.validate(encoding)?;
    apply_headers(encoding, sink.headers_mut());
    CompressingSink::new(encoding, levels, sink)
}

/// Applies the response header changes for `encoding`.
///
/// Compressed encodings drop Content-Length (and Accept-Ranges) and set
/// Content-Encoding, or TE when the response is a byte range. Every encoding,
/// identity included, advertises `Vary: accept-encoding`.
pub fn apply_headers(encoding: Encoding, headers: &mut HeaderMap) {
    if encoding.is_compressed() {
        headers.remove(header::CONTENT_LENGTH);

        let value = HeaderValue::from_static(encoding.content_encoding());
        if headers.contains_key(header::CONTENT_RANGE) {
            // Ranges are defined over the uncompressed representation.
            headers.insert(header::TE, value);
        } else {
            headers.remove(header::ACCEPT_RANGES);
            headers.insert(header::CONTENT_ENCODING, value);
        }
    }

    add_vary_accept_encoding(headers);
}

/// Adds Accept-Encoding to the Vary header if not already present.
fn add_vary_accept_encoding(headers: &mut HeaderMap) {
    for vary in headers.get_all(header::VARY) {
        if let Ok(vary_str) = vary.to_str() {
            let covered = vary_str.split(',').any(|v| {
                let v = v.trim();
                v.eq_ignore_ascii_case("*") || v.eq_ignore_ascii_case("accept-encoding")
            });
            if covered {
                return;
            }
        }
    }

    headers.append(header::VARY, HeaderValue::from_static("accept-encoding"));
}

/// A writer that either passes bytes through or compresses them.
pub enum CompressingSink<W> {
    /// Identity: bytes are forwarded untouched and closing is a no-op.
    PassThrough(W),
    /// Bytes are compressed before reaching the inner writer.
    Compressing(EncoderWriter<W>),
}

impl<W: Write> CompressingSink<W> {
    /// Wraps `inner` without touching any headers.
    pub fn new(encoding: Encoding, levels: &Levels, inner: W) -> Result<Self> {
        let encoder = levels.encoder(encoding)?;
        Ok(Self::from_encoder(encoding, encoder, inner))
    }

    /// Wraps `inner` around an already constructed encoder.
    pub(crate) fn from_encoder(
        encoding: Encoding,
        encoder: Option<Box<dyn EncodeV2 + Send>>,
        inner: W,
    ) -> Self {
        match encoder {
            None => CompressingSink::PassThrough(inner),
            Some(encoder) => CompressingSink::Compressing(EncoderWriter::new(encoding, encoder, inner)),
        }
    }

    /// Returns the encoding this sink produces.
    pub fn encoding(&self) -> Encoding {
        match self {
            CompressingSink::PassThrough(_) => Encoding::Identity,
            CompressingSink::Compressing(writer) => writer.encoding(),
        }
    }

    /// Writes the end of the compressed stream. Calling it more than once is
    /// harmless.
    pub fn finish(&mut self) -> io::Result<()> {
        match self {
            CompressingSink::PassThrough(inner) => inner.flush(),
            CompressingSink::Compressing(writer) => writer.finish(),
        }
    }

    /// Returns the inner writer.
    pub fn get_ref(&self) -> &W {
        match self {
            CompressingSink::PassThrough(inner) => inner,
            CompressingSink::Compressing(writer) => writer.get_ref(),
        }
    }

    /// Returns the inner writer mutably.
    pub fn get_mut(&mut self) -> &mut W {
        match self {
            CompressingSink::PassThrough(inner) => inner,
            CompressingSink::Compressing(writer) => writer.get_mut(),
        }
    }

    /// Consumes the sink, returning the inner writer.
    pub fn into_inner(self) -> W {
        match self {
            CompressingSink::PassThrough(inner) => inner,
            CompressingSink::Compressing(writer) => writer.into_inner(),
        }
    }
}

impl<W: Write> Write for CompressingSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            CompressingSink::PassThrough(inner) => inner.write(buf),
            CompressingSink::Compressing(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            CompressingSink::PassThrough(inner) => inner.flush(),
            CompressingSink::Compressing(writer) => writer.flush(),
        }
    }
}

impl<W> fmt::Debug for CompressingSink<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompressingSink::PassThrough(_) => f.write_str("CompressingSink::PassThrough"),
            CompressingSink::Compressing(writer) => f
                .debug_tuple("CompressingSink::Compressing")
                .field(&writer.encoding)
                .finish(),
        }
    }
}

/// Streams bytes through an encoder into an inner writer.
pub struct EncoderWriter<W> {
    encoding: Encoding,
    encoder: Box<dyn EncodeV2 + Send>,
    output_buffer: Vec<u8>,
    inner: W,
    finished: bool,
}

impl<W: Write> EncoderWriter<W> {
    fn new(encoding: Encoding, encoder: Box<dyn EncodeV2 + Send>, inner: W) -> Self {
        Self {
            encoding,
            encoder,
            output_buffer: vec![0u8; OUTPUT_BUFFER_SIZE],
            inner,
            finished: false,
        }
    }

    /// Returns the encoding being produced.
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Finishes the encoder, writing the stream trailer to the inner writer.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        loop {
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            let done = self.encoder.finish(&mut output)?;
            let written = output.written_len();
            if written > 0 {
                self.inner.write_all(&self.output_buffer[..written])?;
            }
            if done {
                break;
            }
        }
        self.finished = true;
        self.inner.flush()
    }

    /// Returns the inner writer.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Returns the inner writer mutably.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Consumes the writer without finishing the stream.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for EncoderWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::other("write after compressed stream was finished"));
        }
        let mut input = PartialBuffer::new(buf);

        // Keep encoding until all input is consumed
        loop {
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            self.encoder.encode(&mut input, &mut output)?;

            let written = output.written_len();
            if written > 0 {
                self.inner.write_all(&self.output_buffer[..written])?;
            }

            if input.written_len() >= buf.len() {
                break;
            }

            if written == 0 && input.written_len() == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "encoder made no progress",
                ));
            }
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.finished {
            return self.inner.flush();
        }
        loop {
            let mut output = WriteBuffer::new_initialized(self.output_buffer.as_mut_slice());
            let done = self.encoder.flush(&mut output)?;
            let written = output.written_len();
            if written > 0 {
                self.inner.write_all(&self.output_buffer[..written])?;
            }
            if done {
                break;
            }
        }
        self.inner.flush()
    }
}
