//! Storage layer
//!
//! Moves bytes between object storage and the local disk:
//! - Downloading code and dataset archives from pre-signed URLs
//! - Packing and unpacking gzip'd tarballs
//! - Uploading job artifacts to a pre-signed POST target or a local folder

pub mod archive;
pub mod download;
pub mod upload;

pub use archive::pack;
pub use download::download_all;
pub use upload::{copy_dir, upload_presigned};
