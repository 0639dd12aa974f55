//! Caches of remote metadata.

mod metadata;

pub use metadata::{DEFAULT_TTL, FetchFn, MetadataCache};
