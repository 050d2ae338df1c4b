//! Model spec catalog
//!
//! Provides functionality for:
//! - Parsing validated model spec records
//! - Fetching the upstream spec document
//! - Caching it locally with a short TTL and stale fallback

pub mod cache;
pub mod model;
pub mod source;

pub use cache::{
    CatalogOrigin, Clock, FileSystemStorage, SpecCache, SpecCatalog, StorageBackend, SystemClock,
};
pub use model::{ModelSpec, RuntimeParams, SpecEnv, VllmArgs, parse_specs};
pub use source::{CatalogError, HttpSpecSource, SpecSource};
