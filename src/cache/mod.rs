//! Disk cache of precompressed static files.
//!
//! [`StaticCache`] answers static requests from precompressed artifacts and
//! keeps them fresh with a background walker. [`DiskCacheTee`] lets a live
//! response populate the same cache while it is being served.

pub mod artifact;
mod static_files;
mod tee;
mod walker;

pub use artifact::{ArtifactState, ArtifactStore, ArtifactWriter, Published};
pub use static_files::{DEFAULT_MAX_RATIO, Served, StaticCache, StaticConfig};
pub(crate) use static_files::{Lookup, guess_content_type};
pub use tee::DiskCacheTee;
