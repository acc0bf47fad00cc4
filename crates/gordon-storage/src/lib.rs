//! Content-addressed blob storage and manifest storage for Gordon.
//!
//! Both stores are filesystem-rooted: blobs live under a two-level sharded
//! directory keyed by digest, manifests live under a per-repository tree with
//! a content-type sidecar and a tag index.

pub mod blob;
pub mod digest;
pub mod error;
pub mod manifest;

pub use blob::{BlobStore, ByteStream, LocalBlobStore, UploadSession, UploadWriter};
pub use digest::Digest;
pub use error::StorageError;
pub use manifest::{LocalManifestStore, ManifestStore, StoredManifest};
