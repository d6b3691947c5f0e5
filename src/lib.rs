//! Lazy HTTP response compression with a disk cache for static files.
//!
//! Two pieces share one negotiation policy and one set of encoders:
//!
//! - [`ResponseInterceptor`] wraps a response sink, buffers the first bytes
//!   and only commits to an encoding once the body is large enough to be
//!   worth compressing. [`CompressionLayer`] drives it as Tower middleware.
//! - [`StaticCache`] serves static files from precompressed artifacts, falls
//!   back to compressing on the fly, and keeps the artifacts fresh with a
//!   background walker.
//!
//! # Example
//!
//! ```ignore
//! use http_compression_cache::CompressionLayer;
//! use tower::ServiceBuilder;
//!
//! let service = ServiceBuilder::new()
//!     .layer(CompressionLayer::new())
//!     .service(my_service);
//! ```
//!
//! # Negotiation Rules
//!
//! The first matching rule wins:
//! - Paths under `/debug/pprof` are never encoded
//! - Already compressed content (images other than GIF and PNG, audio,
//!   video, WOFF fonts) is never encoded
//! - Brotli when the client accepts `br` over TLS or behind an https proxy
//! - Gzip when the client accepts `gzip`
//!
//! Responses that already carry `Content-Encoding`, or that end before the
//! minimum size (default: 1024 bytes), are sent unchanged.
//!
//! # Response Modifications
//!
//! When compression is applied:
//! - `Content-Encoding` header is set to the codec used, or `TE` when the
//!   response carries `Content-Range`
//! - `Content-Length` header is removed (compressed size is unknown)
//! - `Accept-Ranges` header is removed
//! - `Vary` header includes `Accept-Encoding`

#![deny(missing_docs)]

mod body;
pub mod cache;
mod codec;
mod encoder;
mod error;
mod future;
mod interceptor;
mod layer;
mod negotiate;
mod pool;
mod service;
mod sink;

pub use body::CompressionBody;
pub use cache::{DiskCacheTee, Served, StaticCache, StaticConfig};
pub use codec::{Encoding, Levels, accepts};
pub use encoder::{CompressingSink, EncoderWriter, apply_headers, build};
pub use error::{Error, Result};
pub use future::ResponseFuture;
pub use interceptor::{DynamicConfig, ResponseInterceptor};
pub use layer::CompressionLayer;
pub use negotiate::{
    PROFILING_PREFIX, RequestInfo, Secure, decide, decide_enabled, is_already_compressed,
};
pub use pool::{BufferPool, PooledBuffer};
pub use service::CompressionService;
pub use sink::{BufferedResponse, ResponseSink, Tee};

/// Default minimum body size for compression.
pub const DEFAULT_MIN_SIZE: usize = 1024;
