//! Reference-counting garbage collector for blobs that no manifest names.
//!
//! List-then-filter-then-delete: list candidates, then delete ones that fail
//! a criterion. Here the criterion is reachability from a manifest rather
//! than age or LRU order.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, warn};

use gordon_storage::{BlobStore, ManifestStore};

use crate::error::CoreError;

const GC_SWEEP_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Default, Clone)]
pub struct GcReport {
    pub manifests_scanned: usize,
    pub blobs_scanned: usize,
    pub blobs_deleted: usize,
    pub bytes_reclaimed: u64,
}

pub struct GarbageCollector {
    blobs: Arc<dyn BlobStore>,
    manifests: Arc<dyn ManifestStore>,
}

impl GarbageCollector {
    pub fn new(blobs: Arc<dyn BlobStore>, manifests: Arc<dyn ManifestStore>) -> Self {
        Self { blobs, manifests }
    }

    pub async fn run(&self) -> Result<GcReport, CoreError> {
        info!("starting garbage collection sweep");

        let manifest_digests = self.manifests.list_manifest_digests().await?;
        let mut reachable = HashSet::new();

        for (repository, digest) in &manifest_digests {
            let reference = digest.clone();
            let stored = match self.manifests.get(repository, &reference).await {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(repository, digest, ?err, "failed to read manifest during gc");
                    continue;
                }
            };

            reachable.insert(stored.digest.clone());
            collect_referenced_digests(&stored.body, &mut reachable);
        }

        let blobs = self.blobs.list_blobs().await?;
        let mut report = GcReport {
            manifests_scanned: manifest_digests.len(),
            blobs_scanned: blobs.len(),
            ..Default::default()
        };

        for (digest, size) in blobs {
            if reachable.contains(&digest) {
                continue;
            }

            debug!(digest = %digest, "deleting unreferenced blob");
            match self.blobs.delete(&digest).await {
                Ok(()) => {
                    report.blobs_deleted += 1;
                    report.bytes_reclaimed += size;
                }
                Err(err) => warn!(digest = %digest, ?err, "failed to delete unreferenced blob"),
            }
        }

        info!(
            manifests = report.manifests_scanned,
            blobs_deleted = report.blobs_deleted,
            bytes_reclaimed = report.bytes_reclaimed,
            "garbage collection sweep complete"
        );

        Ok(report)
    }
}

/// Runs `GarbageCollector::run` on a fixed interval, independent of the
/// operator-triggered `manual.reload` sweep. Failures are logged and do not
/// stop the loop; a transient storage error shouldn't silence every future
/// sweep.
pub fn spawn_gc_task(gc: Arc<GarbageCollector>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(GC_SWEEP_INTERVAL);
        ticker.tick().await; // skip the immediate first tick
        loop {
            ticker.tick().await;
            if let Err(err) = gc.run().await {
                warn!(?err, "periodic garbage collection sweep failed");
            }
        }
    })
}

/// Best-effort extraction of every digest-shaped string referenced by an OCI
/// manifest or index body: config blob, layers, and (for an index) child
/// manifests. Parse failure is logged and contributes no references rather
/// than aborting the sweep for other manifests.
fn collect_referenced_digests(body: &[u8], out: &mut HashSet<String>) {
    let value: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(err) => {
            warn!(?err, "unparseable manifest body during gc, skipping its references");
            return;
        }
    };

    walk(&value, out);
}

fn walk(value: &Value, out: &mut HashSet<String>) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(digest)) = map.get("digest") {
                if looks_like_digest(digest) {
                    out.insert(digest.clone());
                }
            }
            for child in map.values() {
                walk(child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, out);
            }
        }
        _ => {}
    }
}

fn looks_like_digest(s: &str) -> bool {
    matches!(s.split_once(':'), Some((alg, hex)) if matches!(alg, "sha256" | "sha512") && !hex.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use gordon_storage::{LocalBlobStore, LocalManifestStore};

    fn fake_blob_sha256(data: &[u8]) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("sha256:{}", hex::encode(hasher.finalize()))
    }

    #[tokio::test]
    async fn unreferenced_blob_is_deleted_and_referenced_blob_survives() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(LocalBlobStore::new(dir.path().join("blobs")).await.unwrap());
        let manifests = Arc::new(
            LocalManifestStore::new(dir.path().join("manifests"))
                .await
                .unwrap(),
        );

        let layer_data = Bytes::from_static(b"layer-bytes");
        let layer_digest = fake_blob_sha256(&layer_data);
        blobs.put_blob(&layer_digest, layer_data, None).await.unwrap();

        let orphan_data = Bytes::from_static(b"orphan-bytes");
        let orphan_digest = fake_blob_sha256(&orphan_data);
        blobs.put_blob(&orphan_digest, orphan_data, None).await.unwrap();

        let manifest_body = serde_json::json!({
            "schemaVersion": 2,
            "layers": [{ "digest": layer_digest, "size": 11 }]
        });
        manifests
            .put(
                "app",
                "latest",
                "application/vnd.oci.image.manifest.v1+json",
                Bytes::from(serde_json::to_vec(&manifest_body).unwrap()),
            )
            .await
            .unwrap();

        let gc = GarbageCollector::new(blobs.clone(), manifests.clone());
        let report = gc.run().await.unwrap();

        assert_eq!(report.blobs_deleted, 1);
        assert!(blobs.exists(&layer_digest).await.unwrap());
        assert!(!blobs.exists(&orphan_digest).await.unwrap());
    }
}
