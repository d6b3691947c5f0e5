//! Encoding negotiation.
//!
//! Rules are evaluated in order, first match wins:
//! 1. Profiling endpoints (`/debug/pprof...`) are never encoded.
//! 2. Content that is already compressed (images other than GIF/PNG, audio,
//!    video, WOFF fonts) is never encoded.
//! 3. Brotli when the client mentions `br` over a secure connection, else gzip
//!    when the client mentions `gzip`, else identity.

use chrono::DateTime;
use http::{HeaderMap, Method, Request, Uri, header};
use std::time::SystemTime;

use crate::codec::{Encoding, Levels, accepts};

/// Path prefix of diagnostics endpoints whose responses must not be altered.
pub const PROFILING_PREFIX: &str = "/debug/pprof";

/// Request extension marking a connection as TLS-terminated.
///
/// Hosts that terminate TLS themselves insert this into the request
/// extensions so Brotli can be negotiated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Secure;

/// The request attributes consumed by negotiation and static lookup.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// Request method.
    pub method: Method,
    /// Request path, without query.
    pub path: String,
    /// Raw Accept-Encoding header value.
    pub accept_encoding: Option<String>,
    /// Raw X-Forwarded-Proto header value.
    pub forwarded_proto: Option<String>,
    /// Whether the connection itself is TLS.
    pub tls: bool,
    /// Raw If-Modified-Since header value.
    pub if_modified_since: Option<String>,
}

impl RequestInfo {
    /// Creates request info with no headers.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            ..Default::default()
        }
    }

    /// Returns whether the request targets the profiling endpoints, whose
    /// responses pass through untouched.
    pub fn is_profiling(&self) -> bool {
        self.path.starts_with(PROFILING_PREFIX)
    }

    /// Captures the attributes of an incoming request.
    pub fn from_request<B>(req: &Request<B>) -> Self {
        let mut info = Self::from_headers(req.method().clone(), req.uri(), req.headers());
        info.tls |= req.extensions().get::<Secure>().is_some();
        info
    }

    /// Captures the attributes from a method, URI and header map.
    pub fn from_headers(method: Method, uri: &Uri, headers: &HeaderMap) -> Self {
        let text = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        };
        Self {
            method,
            path: uri.path().to_owned(),
            accept_encoding: text(header::ACCEPT_ENCODING.as_str()),
            forwarded_proto: text("x-forwarded-proto"),
            tls: uri.scheme() == Some(&http::uri::Scheme::HTTPS),
            if_modified_since: text(header::IF_MODIFIED_SINCE.as_str()),
        }
    }

    /// Sets the Accept-Encoding header value.
    pub fn accept_encoding(mut self, value: impl Into<String>) -> Self {
        self.accept_encoding = Some(value.into());
        self
    }

    /// Sets the X-Forwarded-Proto header value.
    pub fn forwarded_proto(mut self, value: impl Into<String>) -> Self {
        self.forwarded_proto = Some(value.into());
        self
    }

    /// Marks the connection as TLS or plain.
    pub fn tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    /// Sets the If-Modified-Since header value.
    pub fn if_modified_since(mut self, value: impl Into<String>) -> Self {
        self.if_modified_since = Some(value.into());
        self
    }

    /// Returns true when the request arrived over TLS or through an https proxy.
    pub fn is_secure(&self) -> bool {
        self.tls
            || self
                .forwarded_proto
                .as_deref()
                .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
    }

    /// Parses If-Modified-Since as an HTTP date, ignoring malformed values.
    pub fn if_modified_since_time(&self) -> Option<SystemTime> {
        let value = self.if_modified_since.as_deref()?;
        DateTime::parse_from_rfc2822(value.trim())
            .ok()
            .map(SystemTime::from)
    }
}

/// Chooses an encoding, assuming every encoding is available.
pub fn decide(request: &RequestInfo, content_type: Option<&str>) -> Encoding {
    decide_with(request, content_type, |_| true)
}

/// Chooses an encoding, skipping encodings disabled by `levels`.
pub fn decide_enabled(request: &RequestInfo, content_type: Option<&str>, levels: &Levels) -> Encoding {
    decide_with(request, content_type, |encoding| levels.enabled(encoding))
}

fn decide_with(
    request: &RequestInfo,
    content_type: Option<&str>,
    enabled: impl Fn(Encoding) -> bool,
) -> Encoding {
    if request.is_profiling() {
        return Encoding::Identity;
    }

    if content_type.is_some_and(is_already_compressed) {
        return Encoding::Identity;
    }

    let Some(accept) = request.accept_encoding.as_deref() else {
        return Encoding::Identity;
    };

    if enabled(Encoding::Brotli) && accepts(accept, Encoding::Brotli) && request.is_secure() {
        return Encoding::Brotli;
    }
    if enabled(Encoding::Gzip) && accepts(accept, Encoding::Gzip) {
        return Encoding::Gzip;
    }
    Encoding::Identity
}

/// Heuristically detects content types that are already compressed.
pub fn is_already_compressed(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();

    if let Some(subtype) = mime.strip_prefix("image/") {
        return subtype != "gif" && subtype != "png";
    }
    mime.starts_with("video/") || mime.starts_with("audio/") || mime.starts_with("font/woff")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(path: &str, accept: &str) -> RequestInfo {
        RequestInfo::new(Method::GET, path).accept_encoding(accept)
    }

    #[test]
    fn test_profiling_endpoint_never_encoded() {
        let req = request("/debug/pprof/heap", "gzip, br").tls(true);
        assert_eq!(decide(&req, Some("text/plain")), Encoding::Identity);
    }

    #[test]
    fn test_already_compressed_types() {
        assert!(is_already_compressed("image/jpeg"));
        assert!(is_already_compressed("image/webp"));
        assert!(is_already_compressed("video/mp4"));
        assert!(is_already_compressed("audio/ogg"));
        assert!(is_already_compressed("font/woff2"));
        assert!(is_already_compressed("IMAGE/JPEG; q=1"));

        assert!(!is_already_compressed("image/png"));
        assert!(!is_already_compressed("image/gif"));
        assert!(!is_already_compressed("text/html; charset=utf-8"));
        assert!(!is_already_compressed("application/json"));
        assert!(!is_already_compressed("font/ttf"));
    }

    #[test]
    fn test_png_eligible_jpeg_not() {
        let req = request("/img", "gzip");
        assert_eq!(decide(&req, Some("image/png")), Encoding::Gzip);
        assert_eq!(decide(&req, Some("image/jpeg")), Encoding::Identity);
    }

    #[test]
    fn test_brotli_requires_secure_connection() {
        let plain = request("/api", "br, gzip");
        assert_eq!(decide(&plain, None), Encoding::Gzip);

        let tls = plain.clone().tls(true);
        assert_eq!(decide(&tls, None), Encoding::Brotli);

        let proxied = plain.forwarded_proto("https");
        assert_eq!(decide(&proxied, None), Encoding::Brotli);
    }

    #[test]
    fn test_brotli_only_over_plain_http_is_identity() {
        let req = request("/api", "br");
        assert_eq!(decide(&req, None), Encoding::Identity);
    }

    #[test]
    fn test_no_accept_encoding() {
        let req = RequestInfo::new(Method::GET, "/api");
        assert_eq!(decide(&req, Some("text/plain")), Encoding::Identity);
    }

    #[test]
    fn test_disabled_brotli_falls_back_to_gzip() {
        let req = request("/api", "br, gzip").tls(true);
        let levels = Levels::new(5, 0);
        assert_eq!(decide_enabled(&req, None, &levels), Encoding::Gzip);

        let levels = Levels::new(0, 0);
        assert_eq!(decide_enabled(&req, None, &levels), Encoding::Identity);
    }

    #[test]
    fn test_from_request_reads_headers_and_extensions() {
        let mut req = Request::builder()
            .uri("/static/app.js?v=1")
            .header("accept-encoding", "gzip, br")
            .header("x-forwarded-proto", "http")
            .header("if-modified-since", "Sun, 06 Nov 1994 08:49:37 GMT")
            .body(())
            .unwrap();

        let info = RequestInfo::from_request(&req);
        assert_eq!(info.path, "/static/app.js");
        assert_eq!(info.accept_encoding.as_deref(), Some("gzip, br"));
        assert!(!info.is_secure());
        assert!(info.if_modified_since_time().is_some());

        req.extensions_mut().insert(Secure);
        assert!(RequestInfo::from_request(&req).is_secure());
    }

    #[test]
    fn test_https_uri_is_secure() {
        let req = Request::builder()
            .uri("https://example.com/")
            .body(())
            .unwrap();
        assert!(RequestInfo::from_request(&req).is_secure());
    }

    #[test]
    fn test_malformed_if_modified_since_ignored() {
        let req = RequestInfo::new(Method::GET, "/").if_modified_since("yesterday");
        assert!(req.if_modified_since_time().is_none());
    }
}
