use crate::interceptor::ResponseInterceptor;
use crate::sink::BufferedResponse;
use bytes::{Buf, Bytes};
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};
use std::io::{self, Write};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A response body fed through a [`ResponseInterceptor`].
///
/// Frames of the inner body are written to the interceptor and whatever it
/// produced is yielded, so the body is compressed or passed through exactly
/// as the interceptor decided.
pub struct CompressionBody<B> {
    inner: Pin<Box<B>>,
    interceptor: ResponseInterceptor<BufferedResponse>,
    trailers: Option<HeaderMap>,
    error: Option<io::Error>,
    state: State,
}

/// Where the body is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Reading frames from the inner body.
    Reading,
    /// The inner body failed; the error is yielded after pending bytes.
    Failed,
    /// Emitting held trailers after the compressed stream ended.
    Trailers,
    /// Complete.
    Done,
}

impl<B> CompressionBody<B>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    pub(crate) fn new(inner: B, interceptor: ResponseInterceptor<BufferedResponse>) -> Self {
        Self {
            inner: Box::pin(inner),
            interceptor,
            trailers: None,
            error: None,
            state: State::Reading,
        }
    }

    /// Returns the interceptor driving this body.
    pub fn interceptor(&self) -> &ResponseInterceptor<BufferedResponse> {
        &self.interceptor
    }

    /// Reads frames until the interceptor has decided on an encoding or the
    /// inner body is exhausted, so the response head is final.
    pub(crate) fn poll_prefetch(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        while self.state == State::Reading && !self.interceptor.is_decided() {
            ready!(self.poll_feed(cx));
        }
        Poll::Ready(())
    }

    /// Moves the final status and headers into `parts`.
    pub(crate) fn take_head(&mut self, parts: &mut http::response::Parts) {
        if let Some(sink) = self.interceptor.sink_mut() {
            parts.status = sink.status();
            parts.headers = sink.take_headers();
        }
    }

    /// Feeds one frame of the inner body into the interceptor.
    fn poll_feed(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        match ready!(self.inner.as_mut().poll_frame(cx)) {
            None => self.finish(State::Trailers),
            Some(Ok(frame)) => match frame.into_data() {
                Ok(mut data) => {
                    while data.has_remaining() {
                        let chunk = data.chunk();
                        let len = chunk.len();
                        if let Err(err) = self.interceptor.write_all(chunk) {
                            self.error = Some(err);
                            self.finish(State::Failed);
                            break;
                        }
                        data.advance(len);
                    }
                }
                Err(frame) => {
                    if let Ok(trailers) = frame.into_trailers() {
                        // Held until the compressed stream is complete.
                        self.trailers = Some(trailers);
                        self.finish(State::Trailers);
                    }
                }
            },
            Some(Err(err)) => {
                let err: BoxError = err.into();
                self.error = Some(io::Error::other(err));
                self.finish(State::Failed);
            }
        }
        Poll::Ready(())
    }

    fn finish(&mut self, next: State) {
        self.interceptor.finalize();
        for err in self.interceptor.take_errors() {
            tracing::warn!(path = %self.interceptor.request().path, error = %err, "response compression error");
        }
        self.state = next;
    }

    fn take_output(&mut self) -> Option<Bytes> {
        self.interceptor.sink_mut().and_then(BufferedResponse::take_body)
    }

    fn pending_len(&self) -> u64 {
        self.interceptor.sink().map_or(0, |sink| sink.body().len() as u64)
    }
}

impl<B> Body for CompressionBody<B>
where
    B: Body,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        loop {
            if let Some(data) = this.take_output() {
                return Poll::Ready(Some(Ok(Frame::data(data))));
            }
            match this.state {
                State::Done => return Poll::Ready(None),
                State::Trailers => {
                    this.state = State::Done;
                    if let Some(trailers) = this.trailers.take() {
                        return Poll::Ready(Some(Ok(Frame::trailers(trailers))));
                    }
                }
                State::Failed => {
                    this.state = State::Done;
                    if let Some(err) = this.error.take() {
                        return Poll::Ready(Some(Err(err)));
                    }
                }
                State::Reading => ready!(this.poll_feed(cx)),
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.state == State::Done && self.pending_len() == 0
    }

    fn size_hint(&self) -> SizeHint {
        let pending = self.pending_len();
        match self.state {
            State::Reading if self.interceptor.encoding().is_some_and(|e| e.is_compressed()) => {
                SizeHint::default()
            }
            State::Reading => {
                let inner = self.inner.size_hint();
                let mut hint = SizeHint::new();
                hint.set_lower(inner.lower() + pending + self.interceptor.buffered_len() as u64);
                if let Some(upper) = inner.upper() {
                    hint.set_upper(upper + pending + self.interceptor.buffered_len() as u64);
                }
                hint
            }
            State::Failed | State::Trailers | State::Done => SizeHint::with_exact(pending),
        }
    }
}

impl<B> std::fmt::Debug for CompressionBody<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionBody")
            .field("interceptor", &self.interceptor)
            .field("state", &self.state)
            .finish()
    }
}
