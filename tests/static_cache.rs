// Static cache integration tests
//
// Exercise the cache through its public surface: serving, background
// precompression and artifact refresh after the source changes.

use http::{Method, StatusCode, header};
use http_compression_cache::{
    BufferedResponse, Encoding, RequestInfo, ResponseSink, Served, StaticCache, StaticConfig,
};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

const IDLE: Duration = Duration::from_secs(30);

fn set_mtime(path: &Path, age: Duration) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() - age)
        .unwrap();
}

fn write_source(root: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = root.join(name);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, content).unwrap();
    set_mtime(&path, Duration::from_secs(7200));
    path
}

fn gzip_request() -> RequestInfo {
    RequestInfo::new(Method::GET, "/").accept_encoding("gzip")
}

fn gunzip(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    flate2::read::GzDecoder::new(data).read_to_end(&mut out).unwrap();
    out
}

fn stylesheet(seed: &str) -> Vec<u8> {
    (0..200)
        .map(|i| format!(".{seed}-{i} {{ margin: {i}px; color: #{i:06x}; }}\n"))
        .collect::<String>()
        .into_bytes()
}

#[test]
fn test_prewarmed_hits_are_byte_identical() {
    let temp_dir = TempDir::new().unwrap();
    let public = temp_dir.path().join("public");
    let css = stylesheet("card");
    write_source(&public, "css/site.css", &css);

    let config = StaticConfig::new(&public).cache_dir(temp_dir.path().join("cache"));
    let cache = StaticCache::new(config).unwrap();
    assert!(cache.wait_idle(IDLE), "startup walk should finish");

    let mut first = BufferedResponse::new();
    let mut second = BufferedResponse::new();
    assert_eq!(
        cache.serve(&gzip_request(), "css/site.css", &mut first).unwrap(),
        Served::CacheHit(Encoding::Gzip)
    );
    assert_eq!(
        cache.serve(&gzip_request(), "/css/site.css", &mut second).unwrap(),
        Served::CacheHit(Encoding::Gzip)
    );

    assert_eq!(first.body(), second.body());
    assert_eq!(gunzip(first.body()), css);
    assert_eq!(first.headers()[header::CONTENT_TYPE], "text/css");
    assert_eq!(first.headers()[header::VARY], "accept-encoding");
}

#[test]
fn test_stale_artifact_never_served() {
    let temp_dir = TempDir::new().unwrap();
    let public = temp_dir.path().join("public");
    let source = write_source(&public, "app.css", &stylesheet("old"));

    let config = StaticConfig::new(&public).cache_dir(temp_dir.path().join("cache"));
    let cache = StaticCache::new(config).unwrap();
    assert!(cache.wait_idle(IDLE));

    let artifact = cache.store().artifact_path(&source, Encoding::Gzip).unwrap();
    assert!(artifact.exists());

    // The source changes after the artifact was written.
    let updated = stylesheet("new");
    fs::write(&source, &updated).unwrap();
    set_mtime(&source, Duration::from_secs(3600));
    set_mtime(&artifact, Duration::from_secs(3 * 3600));

    let mut response = BufferedResponse::new();
    let served = cache.serve(&gzip_request(), "app.css", &mut response).unwrap();
    assert_eq!(served, Served::Compressed(Encoding::Gzip));
    assert_eq!(gunzip(response.body()), updated);

    assert!(cache.wait_idle(IDLE), "refresh walk should finish");
    let mut response = BufferedResponse::new();
    let served = cache.serve(&gzip_request(), "app.css", &mut response).unwrap();
    assert_eq!(served, Served::CacheHit(Encoding::Gzip));
    assert_eq!(gunzip(response.body()), updated);
}

#[test]
fn test_incompressible_source_gets_sentinel() {
    let temp_dir = TempDir::new().unwrap();
    let public = temp_dir.path().join("public");
    let mut state = 0x9e37_79b9_7f4a_7c15_u64;
    let noise: Vec<u8> = (0..8192)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state as u8
        })
        .collect();
    let source = write_source(&public, "blob.txt", &noise);

    let config = StaticConfig::new(&public).cache_dir(temp_dir.path().join("cache"));
    let cache = StaticCache::new(config).unwrap();
    assert!(cache.wait_idle(IDLE));

    let sentinel = cache.store().artifact_path(&source, Encoding::Gzip).unwrap();
    assert_eq!(fs::metadata(&sentinel).unwrap().len(), 0);

    let mut response = BufferedResponse::new();
    let served = cache.serve(&gzip_request(), "blob.txt", &mut response).unwrap();
    assert_eq!(served, Served::Raw);
    assert_eq!(response.body(), noise.as_slice());
    assert!(response.headers().get(header::CONTENT_ENCODING).is_none());
}

#[test]
fn test_not_modified_has_no_body() {
    let temp_dir = TempDir::new().unwrap();
    let public = temp_dir.path().join("public");
    write_source(&public, "index.html", &stylesheet("page"));

    let config = StaticConfig::new(&public)
        .cache_dir(temp_dir.path().join("cache"))
        .prewarm(false);
    let cache = StaticCache::new(config).unwrap();

    let request = gzip_request().if_modified_since("Fri, 01 Jan 2100 00:00:00 GMT");
    let mut response = BufferedResponse::new();
    let served = cache.serve(&request, "index.html", &mut response).unwrap();
    assert_eq!(served, Served::NotModified);
    assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
    assert!(response.body().is_empty());
}

#[test]
fn test_escaping_paths_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let public = temp_dir.path().join("public");
    write_source(&public, "index.html", b"<html></html>");
    fs::write(temp_dir.path().join("secret.txt"), b"top secret").unwrap();

    let config = StaticConfig::new(&public)
        .cache_dir(temp_dir.path().join("cache"))
        .prewarm(false);
    let cache = StaticCache::new(config).unwrap();

    for path in ["../secret.txt", "a/../../secret.txt", "/../secret.txt"] {
        let mut response = BufferedResponse::new();
        let err = cache.serve(&gzip_request(), path, &mut response).unwrap_err();
        assert!(err.is_path_escape(), "{path} should be rejected");
        assert!(response.body().is_empty());
    }
}

#[test]
fn test_cache_dir_inside_source_tree_is_skipped() {
    let temp_dir = TempDir::new().unwrap();
    let public = temp_dir.path().join("public");
    let css = stylesheet("nested");
    write_source(&public, "site.css", &css);

    let config = StaticConfig::new(&public).cache_dir(public.join(".cache"));
    let cache = StaticCache::new(config).unwrap();
    assert!(cache.wait_idle(IDLE));

    let artifacts: Vec<_> = walkdir::WalkDir::new(public.join(".cache"))
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .collect();
    // gzip, brotli and the content type sidecar for site.css only.
    assert_eq!(artifacts.len(), 3);
}
