use compression_codecs::{
    EncodeV2,
    brotli::{BrotliEncoder, params::EncoderParams as BrotliParams},
    gzip::GzipEncoder,
};
use compression_core::Level;
use std::fmt;

use crate::error::{Error, Result};

/// Content encoding chosen for a response.
///
/// Chosen at most once per response and never changed afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    /// No compression; bytes pass through unchanged.
    Identity,
    /// Gzip compression.
    Gzip,
    /// Brotli compression.
    Brotli,
}

impl Encoding {
    /// Returns the Content-Encoding header value for this encoding.
    pub fn content_encoding(&self) -> &'static str {
        match self {
            Encoding::Identity => "identity",
            Encoding::Gzip => "gzip",
            Encoding::Brotli => "br",
        }
    }

    /// Returns the suffix used for cache artifacts of this encoding.
    ///
    /// Identity content is never cached, so it has no suffix.
    pub fn artifact_extension(&self) -> Option<&'static str> {
        match self {
            Encoding::Identity => None,
            Encoding::Gzip => Some(".gz"),
            Encoding::Brotli => Some(".br"),
        }
    }

    /// Returns true for encodings that actually transform the body.
    pub fn is_compressed(&self) -> bool {
        !matches!(self, Encoding::Identity)
    }

    /// Parses a single Accept-Encoding token.
    fn from_token(token: &str) -> Option<Encoding> {
        match token {
            "br" | "brotli" => Some(Encoding::Brotli),
            "gzip" | "x-gzip" => Some(Encoding::Gzip),
            "identity" => Some(Encoding::Identity),
            _ => None,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.content_encoding())
    }
}

/// Compression levels for gzip (0-9) and brotli quality (0-11).
///
/// A zero component disables that encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Levels {
    /// Gzip level, 0 disables gzip.
    pub gzip: u32,
    /// Brotli quality, 0 disables brotli.
    pub brotli: u32,
}

impl Levels {
    /// Cheap levels for per-request dynamic content.
    pub const DYNAMIC: Levels = Levels { gzip: 2, brotli: 2 };

    /// Levels used when a live response warms the static cache.
    pub const STATIC: Levels = Levels { gzip: 6, brotli: 4 };

    /// Maximum compression, amortized by background precompression.
    pub const BEST: Levels = Levels {
        gzip: 9,
        brotli: 11,
    };

    /// Creates a level pair.
    pub const fn new(gzip: u32, brotli: u32) -> Self {
        Self { gzip, brotli }
    }

    /// Returns the level configured for `encoding`.
    pub fn level(&self, encoding: Encoding) -> u32 {
        match encoding {
            Encoding::Identity => 0,
            Encoding::Gzip => self.gzip,
            Encoding::Brotli => self.brotli,
        }
    }

    /// Returns whether `encoding` may be produced with these levels.
    pub fn enabled(&self, encoding: Encoding) -> bool {
        match encoding {
            Encoding::Identity => true,
            _ => self.level(encoding) > 0,
        }
    }

    /// Returns the compressed encodings enabled by these levels, gzip first.
    pub fn enabled_encodings(&self) -> impl Iterator<Item = Encoding> + '_ {
        [Encoding::Gzip, Encoding::Brotli]
            .into_iter()
            .filter(|encoding| self.enabled(*encoding))
    }

    /// Checks that the level for `encoding` is within the codec's range.
    pub fn validate(&self, encoding: Encoding) -> Result<()> {
        let (level, max) = match encoding {
            Encoding::Identity => return Ok(()),
            Encoding::Gzip => (self.gzip, 9),
            Encoding::Brotli => (self.brotli, 11),
        };
        if level > max {
            return Err(Error::EncodingSetup(format!(
                "{encoding} level must be 0-{max}, got {level}"
            )));
        }
        Ok(())
    }

    /// Creates a new encoder for `encoding`, or `None` for identity.
    pub(crate) fn encoder(&self, encoding: Encoding) -> Result<Option<Box<dyn EncodeV2 + Send>>> {
        self.validate(encoding)?;
        let level = Level::Precise(self.level(encoding) as i32);
        let encoder: Box<dyn EncodeV2 + Send> = match encoding {
            Encoding::Identity => return Ok(None),
            Encoding::Gzip => Box::new(GzipEncoder::new(level.into())),
            Encoding::Brotli => Box::new(BrotliEncoder::new(BrotliParams::default().quality(level))),
        };
        Ok(Some(encoder))
    }
}

impl Default for Levels {
    fn default() -> Self {
        Levels::DYNAMIC
    }
}

/// Returns whether the Accept-Encoding header value mentions `encoding`.
///
/// The header value is expected to be comma-separated encodings with optional
/// quality values (e.g., "gzip, br;q=1.0"). An entry with `q=0` is a refusal,
/// not a mention.
pub fn accepts(header: &str, encoding: Encoding) -> bool {
    header.split(',').any(|part| {
        let (token, quality) = parse_encoding_with_quality(part.trim());
        quality > 0.0
            && Encoding::from_token(&token.to_ascii_lowercase()) == Some(encoding)
    })
}

/// Parses an encoding entry like "gzip" or "br;q=0.8" into (encoding, quality).
fn parse_encoding_with_quality(s: &str) -> (&str, f32) {
    let mut parts = s.splitn(2, ';');
    let encoding = parts.next().unwrap_or("").trim();

    let quality = parts
        .next()
        .and_then(|q| {
            let q = q.trim();
            q.strip_prefix("q=")
                .or_else(|| q.strip_prefix("Q="))
                .and_then(|v| v.trim().parse::<f32>().ok())
        })
        .unwrap_or(1.0);

    (encoding, quality)
}
