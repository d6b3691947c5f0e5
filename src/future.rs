use crate::body::CompressionBody;
use crate::interceptor::{DynamicConfig, ResponseInterceptor};
use crate::negotiate::RequestInfo;
use crate::pool::BufferPool;
use crate::sink::BufferedResponse;
use http::Response;
use http_body::Body;
use pin_project_lite::pin_project;
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

pin_project! {
    /// Future for compression service responses.
    ///
    /// Once the inner service responds, body frames are read ahead until the
    /// encoding is decided or the body ends, so the returned head already
    /// carries the final Content-Encoding, Content-Length and Vary headers.
    pub struct ResponseFuture<F, B> {
        #[pin]
        inner: F,
        request: Option<RequestInfo>,
        config: DynamicConfig,
        pool: BufferPool,
        pending: Option<(http::response::Parts, CompressionBody<B>)>,
    }
}

impl<F, B> ResponseFuture<F, B> {
    pub(crate) fn new(inner: F, request: RequestInfo, config: DynamicConfig, pool: BufferPool) -> Self {
        Self {
            inner,
            request: Some(request),
            config,
            pool,
            pending: None,
        }
    }
}

impl<F, B, E> Future for ResponseFuture<F, B>
where
    F: Future<Output = Result<Response<B>, E>>,
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    type Output = Result<Response<CompressionBody<B>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();

        loop {
            if let Some((_, body)) = this.pending.as_mut() {
                ready!(body.poll_prefetch(cx));
                if let Some((mut parts, mut body)) = this.pending.take() {
                    body.take_head(&mut parts);
                    return Poll::Ready(Ok(Response::from_parts(parts, body)));
                }
            }

            let response = ready!(this.inner.as_mut().poll(cx))?;
            let (mut parts, body) = response.into_parts();
            let sink = BufferedResponse::with_parts(parts.status, mem::take(&mut parts.headers));
            let request = this.request.take().unwrap_or_default();
            let interceptor = ResponseInterceptor::new(request, sink, *this.config, this.pool.clone());
            *this.pending = Some((parts, CompressionBody::new(body, interceptor)));
        }
    }
}
