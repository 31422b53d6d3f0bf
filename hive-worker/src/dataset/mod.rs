//! Dataset sharing between co-located workers
//!
//! Workers on the same host share one on-disk copy per dataset name. The
//! shared [`registry`] is the only cross-worker mutable state; the [`cache`]
//! decides who downloads, who waits and when a directory may be deleted.

pub mod cache;
pub mod registry;

pub use cache::DatasetCache;
pub use registry::SqliteRegistry;
