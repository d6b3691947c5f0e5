use bytes::{Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use std::io::{self, Write};

/// The outgoing side of a response: a header set plus a byte stream.
///
/// Headers may only be changed before the first body byte reaches the
/// network; the interceptor guarantees it mutates them strictly before
/// writing.
pub trait ResponseSink: Write {
    /// Returns the response headers.
    fn headers(&self) -> &HeaderMap;

    /// Returns the response headers for modification.
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Returns the response status.
    fn status(&self) -> StatusCode;

    /// Sets the response status.
    fn set_status(&mut self, status: StatusCode);
}

impl<T: ResponseSink + ?Sized> ResponseSink for &mut T {
    fn headers(&self) -> &HeaderMap {
        (**self).headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        (**self).headers_mut()
    }

    fn status(&self) -> StatusCode {
        (**self).status()
    }

    fn set_status(&mut self, status: StatusCode) {
        (**self).set_status(status)
    }
}

/// An in-memory response whose body can be drained incrementally.
#[derive(Debug, Default)]
pub struct BufferedResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
}

impl BufferedResponse {
    /// Creates an empty `200 OK` response.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a response with the given status and headers.
    pub fn with_parts(status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            status,
            headers,
            body: BytesMut::new(),
        }
    }

    /// Returns the response status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the body bytes written so far and not yet drained.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Drains the pending body bytes, if any.
    pub fn take_body(&mut self) -> Option<Bytes> {
        if self.body.is_empty() {
            None
        } else {
            Some(self.body.split().freeze())
        }
    }

    /// Moves the headers out, leaving an empty map.
    pub fn take_headers(&mut self) -> HeaderMap {
        std::mem::take(&mut self.headers)
    }
}

impl Write for BufferedResponse {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.body.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ResponseSink for BufferedResponse {
    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn status(&self) -> StatusCode {
        self.status
    }

    fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }
}

/// Ordered fan-out writer replicating every write to two sinks.
///
/// Both sinks are always attempted. A failure of the first sink is reported
/// to the caller. A failure of the second is only remembered, so its
/// half-written copy is visible through [`second_failed`](Self::second_failed)
/// while the first keeps receiving every byte.
#[derive(Debug)]
pub struct Tee<A, B> {
    first: A,
    second: B,
    first_failed: bool,
    second_failed: bool,
}

impl<A: Write, B: Write> Tee<A, B> {
    /// Creates a tee writing to `first` then `second`.
    pub fn new(first: A, second: B) -> Self {
        Self {
            first,
            second,
            first_failed: false,
            second_failed: false,
        }
    }

    /// Returns the first sink.
    pub fn first(&self) -> &A {
        &self.first
    }

    /// Returns the first sink mutably.
    pub fn first_mut(&mut self) -> &mut A {
        &mut self.first
    }

    /// Returns the second sink.
    pub fn second(&self) -> &B {
        &self.second
    }

    /// Returns the second sink mutably.
    pub fn second_mut(&mut self) -> &mut B {
        &mut self.second
    }

    /// Returns whether a write to the first sink ever failed.
    pub fn first_failed(&self) -> bool {
        self.first_failed
    }

    /// Returns whether a write to the second sink ever failed.
    pub fn second_failed(&self) -> bool {
        self.second_failed
    }

    /// Consumes the tee, returning both sinks.
    pub fn into_inner(self) -> (A, B) {
        (self.first, self.second)
    }
}

impl<A: Write, B: Write> Write for Tee<A, B> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let first = self.first.write_all(buf);
        let second = self.second.write_all(buf);
        self.first_failed |= first.is_err();
        self.second_failed |= second.is_err();
        first.map(|()| buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let first = self.first.flush();
        self.second_failed |= self.second.flush().is_err();
        first
    }
}
