//! OCI Distribution v2 business logic: orchestrates `BlobStore` and
//! `ManifestStore` behind the upload state machine and couples a successful
//! manifest push to the Event Bus.
//!
//! Methods (`get_manifest`/`manifest_exists`/`put_manifest`/`start_upload`/
//! `append_upload`/`complete_upload`) validate at the boundary before
//! touching storage. There is no cache-aside/upstream-fallback behavior:
//! Gordon's registry is the origin, not a pull-through cache.

use std::collections::HashMap;

use bytes::Bytes;
use serde_json::Value;
use tracing::warn;

use gordon_storage::{
    BlobStore, ByteStream, Digest, ManifestStore, StorageError, StoredManifest, UploadWriter,
};
use std::sync::Arc;

use crate::error::CoreError;
use crate::event::{EventBus, EventPayload};

/// Snapshot of an in-progress upload session, as returned to the HTTP layer
/// for status (`GET`/`PATCH` response `Range` header) purposes.
#[derive(Debug, Clone)]
pub struct UploadProgress {
    pub session_id: String,
    pub bytes_written: u64,
}

pub struct RegistryService {
    blobs: Arc<dyn BlobStore>,
    manifests: Arc<dyn ManifestStore>,
    event_bus: EventBus,
}

impl RegistryService {
    pub fn new(blobs: Arc<dyn BlobStore>, manifests: Arc<dyn ManifestStore>, event_bus: EventBus) -> Self {
        Self {
            blobs,
            manifests,
            event_bus,
        }
    }

    // ==================== Manifests ====================

    pub async fn get_manifest(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<StoredManifest, CoreError> {
        Ok(self.manifests.get(repository, reference).await?)
    }

    /// `None` when absent, rather than propagating `NotFound`, since HEAD
    /// requests need to turn a miss into a plain 404 without a log-worthy error.
    pub async fn manifest_exists(
        &self,
        repository: &str,
        reference: &str,
    ) -> Result<Option<StoredManifest>, CoreError> {
        match self.manifests.get(repository, reference).await {
            Ok(manifest) => Ok(Some(manifest)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Store the manifest, then publish `image.pushed`. Publication failure
    /// is logged but never fails the write: a durable, successful write
    /// should not become a client-visible failure because of transient
    /// in-process bus backpressure (`manual.reload` recovers lost events).
    pub async fn put_manifest(
        &self,
        repository: &str,
        reference: &str,
        content_type: &str,
        body: Bytes,
    ) -> Result<String, CoreError> {
        let annotations = extract_annotations(&body);
        let digest = self
            .manifests
            .put(repository, reference, content_type, body)
            .await?;

        if let Err(err) = self
            .event_bus
            .publish(EventPayload::ImagePushed {
                name: repository.to_string(),
                reference: reference.to_string(),
                annotations,
            })
            .await
        {
            warn!(repository, reference, ?err, "failed to publish image.pushed");
        }

        Ok(digest)
    }

    pub async fn delete_manifest(&self, repository: &str, reference: &str) -> Result<(), CoreError> {
        self.manifests.delete(repository, reference).await?;

        if let Err(err) = self
            .event_bus
            .publish(EventPayload::ImageDeleted {
                name: repository.to_string(),
                reference: reference.to_string(),
            })
            .await
        {
            warn!(repository, reference, ?err, "failed to publish image.deleted");
        }

        Ok(())
    }

    pub async fn list_tags(&self, repository: &str) -> Result<Vec<String>, CoreError> {
        Ok(self.manifests.list_tags(repository).await?)
    }

    pub async fn list_repositories(&self) -> Result<Vec<String>, CoreError> {
        Ok(self.manifests.list_repositories().await?)
    }

    // ==================== Blobs ====================

    pub async fn get_blob(&self, digest: &str) -> Result<(ByteStream, u64), CoreError> {
        let size = self.blobs.size(digest).await?;
        let stream = self.blobs.get(digest).await?;
        Ok((stream, size))
    }

    pub async fn blob_exists(&self, digest: &str) -> Result<Option<u64>, CoreError> {
        match self.blobs.size(digest).await {
            Ok(size) => Ok(Some(size)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn start_upload(&self, repository: &str) -> Result<String, CoreError> {
        let session = self.blobs.start_upload(repository).await?;
        Ok(session.id.to_string())
    }

    pub async fn append_upload(&self, session_id: &str, data: Bytes) -> Result<u64, CoreError> {
        Ok(self.blobs.append_chunk(session_id, data).await?)
    }

    /// A sink that streams a chunk straight into the upload session's
    /// backing file; the caller drives the copy so the chunk is never
    /// collected into a single in-memory buffer first.
    pub async fn get_upload_writer(&self, session_id: &str) -> Result<UploadWriter, CoreError> {
        Ok(self.blobs.get_upload_writer(session_id).await?)
    }

    pub async fn get_upload_session(&self, session_id: &str) -> Result<UploadProgress, CoreError> {
        let session = self.blobs.get_upload_session(session_id).await?;
        Ok(UploadProgress {
            session_id: session.id.to_string(),
            bytes_written: session.bytes_written,
        })
    }

    /// Finalize with digest verification. On success the blob is
    /// immediately addressable via `get_blob`/`blob_exists`.
    pub async fn complete_upload(
        &self,
        session_id: &str,
        digest: &str,
    ) -> Result<(String, u64), CoreError> {
        Digest::parse(digest).map_err(|_| CoreError::BadRequest(format!("invalid digest: {digest}")))?;
        Ok(self.blobs.finish_upload(session_id, digest).await?)
    }

    pub async fn cancel_upload(&self, session_id: &str) -> Result<(), CoreError> {
        Ok(self.blobs.cancel_upload(session_id).await?)
    }
}

/// Best-effort extraction of a manifest's top-level `annotations` map. A
/// missing or malformed field yields `None` rather than failing the push.
fn extract_annotations(body: &[u8]) -> Option<HashMap<String, String>> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let annotations = value.get("annotations")?.as_object()?;
    Some(
        annotations
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use gordon_storage::{LocalBlobStore, LocalManifestStore};

    async fn new_service() -> (tempfile::TempDir, RegistryService) {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(LocalBlobStore::new(dir.path().join("blobs")).await.unwrap());
        let manifests = Arc::new(
            LocalManifestStore::new(dir.path().join("manifests"))
                .await
                .unwrap(),
        );
        let bus = EventBus::new();
        bus.start().await;
        (dir, RegistryService::new(blobs, manifests, bus))
    }

    #[tokio::test]
    async fn put_then_get_manifest_round_trips() {
        let (_dir, svc) = new_service().await;
        let body = Bytes::from_static(br#"{"schemaVersion":2}"#);
        let digest = svc
            .put_manifest("app", "latest", "application/vnd.oci.image.manifest.v1+json", body.clone())
            .await
            .unwrap();

        let fetched = svc.get_manifest("app", "latest").await.unwrap();
        assert_eq!(fetched.body, body);
        assert_eq!(fetched.digest, digest);
    }

    #[tokio::test]
    async fn manifest_exists_returns_none_for_missing() {
        let (_dir, svc) = new_service().await;
        assert!(svc.manifest_exists("app", "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upload_round_trip_via_service() {
        let (_dir, svc) = new_service().await;
        let session_id = svc.start_upload("app").await.unwrap();
        svc.append_upload(&session_id, Bytes::from_static(b"hello"))
            .await
            .unwrap();

        let digest = gordon_storage::digest::sha256_digest(b"hello");
        let (returned, size) = svc.complete_upload(&session_id, &digest).await.unwrap();
        assert_eq!(returned, digest);
        assert_eq!(size, 5);

        let (_, blob_size) = svc.get_blob(&digest).await.unwrap();
        assert_eq!(blob_size, 5);
    }

    #[tokio::test]
    async fn complete_upload_rejects_malformed_digest() {
        let (_dir, svc) = new_service().await;
        let session_id = svc.start_upload("app").await.unwrap();
        let err = svc.complete_upload(&session_id, "not-a-digest").await.unwrap_err();
        assert!(matches!(err, CoreError::BadRequest(_)));
    }

    #[test]
    fn extracts_annotations_when_present() {
        let body = br#"{"schemaVersion":2,"annotations":{"org.opencontainers.image.version":"1.0"}}"#;
        let annotations = extract_annotations(body).unwrap();
        assert_eq!(
            annotations.get("org.opencontainers.image.version"),
            Some(&"1.0".to_string())
        );
    }
}
