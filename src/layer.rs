use crate::codec::Levels;
use crate::interceptor::DynamicConfig;
use crate::pool::BufferPool;
use crate::service::CompressionService;
use tower::Layer;

/// A Tower layer that compresses HTTP response bodies.
///
/// This layer wraps services and lazily compresses response bodies once
/// they reach the size threshold, based on the client's Accept-Encoding
/// header and the connection's security.
#[derive(Debug, Clone)]
pub struct CompressionLayer {
    config: DynamicConfig,
    pool: BufferPool,
}

impl CompressionLayer {
    /// Creates a new compression layer with default settings.
    ///
    /// Bodies of at least 1024 bytes are compressed with gzip level 2 or
    /// brotli quality 2.
    pub fn new() -> Self {
        Self {
            config: DynamicConfig::default(),
            pool: BufferPool::new(),
        }
    }

    /// Sets the compression levels; 0 disables an encoding.
    pub fn levels(mut self, levels: Levels) -> Self {
        self.config.levels = levels;
        self
    }

    /// Sets the minimum body size required for compression.
    ///
    /// Bodies that end before reaching this many bytes are sent unchanged.
    pub fn min_size(mut self, size: usize) -> Self {
        self.config.min_size = size;
        self
    }

    /// Shares a buffer pool with other layers or interceptors.
    pub fn pool(mut self, pool: BufferPool) -> Self {
        self.pool = pool;
        self
    }
}

impl Default for CompressionLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for CompressionLayer {
    type Service = CompressionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CompressionService::new(inner, self.config, self.pool.clone())
    }
}
