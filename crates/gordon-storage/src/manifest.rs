//! Manifest and tag-index storage.
//!
//! Gordon is the origin registry, so it owns manifest bodies and the
//! repository/tag namespace directly. The on-disk layout and atomic-write
//! idiom follow the same pattern used by `blob.rs`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use tokio::fs;
use tracing::{debug, warn};

use crate::digest::{safe_join, sha256_digest, validate_reference, validate_repository_name};
use crate::error::StorageError;

/// A stored manifest: its raw JSON body, declared media type, and the
/// digest it was addressed or computed under.
#[derive(Debug, Clone)]
pub struct StoredManifest {
    pub digest: String,
    pub media_type: String,
    pub body: Bytes,
}

#[async_trait]
pub trait ManifestStore: Send + Sync {
    async fn get(&self, repository: &str, reference: &str) -> Result<StoredManifest, StorageError>;

    /// Store `body` under `reference` (a tag or digest). Returns the digest
    /// the manifest is addressable by, computing it from the body when
    /// `reference` itself is a tag.
    async fn put(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        body: Bytes,
    ) -> Result<String, StorageError>;

    async fn delete(&self, repository: &str, reference: &str) -> Result<(), StorageError>;

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, StorageError>;

    async fn list_repositories(&self) -> Result<Vec<String>, StorageError>;

    /// Every manifest digest currently stored, across all repositories.
    /// Used exclusively by the garbage collector's reachability sweep.
    async fn list_manifest_digests(&self) -> Result<Vec<(String, String)>, StorageError>;

    /// Last-modified time of the stored manifest body that `reference`
    /// currently resolves to. Used by the garbage collector to age off
    /// dangling manifests.
    async fn get_mod_time(&self, repository: &str, reference: &str) -> Result<SystemTime, StorageError>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TagIndex {
    /// tag name -> digest
    tags: HashMap<String, String>,
}

/// Local filesystem-backed `ManifestStore`.
///
/// Layout per repository, under `{base}/repositories/{repo}/manifests/`:
///   - `{digest-hex}` — the manifest body, keyed by its content digest
///   - `{digest-hex}.contenttype` — sidecar holding the declared media type
///   - `tags.json` — tag name -> digest index
pub struct LocalManifestStore {
    base_path: PathBuf,
}

impl LocalManifestStore {
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        let repos_path = base_path.join("repositories");
        fs::create_dir_all(&repos_path).await?;
        Ok(Self { base_path })
    }

    fn repo_manifests_dir(&self, repository: &str) -> Result<PathBuf, StorageError> {
        validate_repository_name(repository)?;
        safe_join(
            &self.base_path,
            &["repositories", repository, "manifests"],
        )
    }

    fn manifest_body_path(&self, repository: &str, digest_hex: &str) -> Result<PathBuf, StorageError> {
        let dir = self.repo_manifests_dir(repository)?;
        safe_join(&dir, &[digest_hex])
    }

    fn content_type_path(&self, repository: &str, digest_hex: &str) -> Result<PathBuf, StorageError> {
        let dir = self.repo_manifests_dir(repository)?;
        safe_join(&dir, &[&format!("{digest_hex}.contenttype")])
    }

    fn tag_index_path(&self, repository: &str) -> Result<PathBuf, StorageError> {
        let dir = self.repo_manifests_dir(repository)?;
        safe_join(&dir, &["tags.json"])
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let tmp_path = path.with_extension("tmp");
        let result = fs::write(&tmp_path, data).await;
        match result {
            Ok(()) => {
                fs::rename(&tmp_path, path).await?;
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                Err(StorageError::Io(err))
            }
        }
    }

    async fn read_tag_index(&self, repository: &str) -> Result<TagIndex, StorageError> {
        let path = self.tag_index_path(repository)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(TagIndex::default()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    async fn write_tag_index(&self, repository: &str, index: &TagIndex) -> Result<(), StorageError> {
        let path = self.tag_index_path(repository)?;
        let body = serde_json::to_vec_pretty(index).expect("TagIndex always serializes");
        Self::write_atomic(&path, &body).await
    }

    /// Resolve a reference to its digest hex, following the tag index when
    /// `reference` is not itself a digest.
    async fn resolve_digest_hex(&self, repository: &str, reference: &str) -> Result<String, StorageError> {
        if let Ok(parsed) = crate::digest::Digest::parse(reference) {
            return Ok(parsed.hex().to_string());
        }
        let index = self.read_tag_index(repository).await?;
        index
            .tags
            .get(reference)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("{repository}:{reference}")))
    }
}

#[async_trait]
impl ManifestStore for LocalManifestStore {
    async fn get(&self, repository: &str, reference: &str) -> Result<StoredManifest, StorageError> {
        validate_repository_name(repository)?;
        validate_reference(reference)?;

        let digest_hex = self.resolve_digest_hex(repository, reference).await?;
        let body_path = self.manifest_body_path(repository, &digest_hex)?;
        let body = fs::read(&body_path)
            .await
            .map_err(|_| StorageError::NotFound(format!("{repository}:{reference}")))?;

        let ct_path = self.content_type_path(repository, &digest_hex)?;
        let media_type = match fs::read_to_string(&ct_path).await {
            Ok(media_type) => media_type,
            Err(_) => {
                warn!(
                    repository,
                    reference, "content-type sidecar missing, falling back to legacy default"
                );
                "application/vnd.docker.distribution.manifest.v2+json".to_string()
            }
        };

        Ok(StoredManifest {
            digest: format!("sha256:{digest_hex}"),
            media_type,
            body: Bytes::from(body),
        })
    }

    async fn put(
        &self,
        repository: &str,
        reference: &str,
        media_type: &str,
        body: Bytes,
    ) -> Result<String, StorageError> {
        validate_repository_name(repository)?;
        validate_reference(reference)?;

        let digest = sha256_digest(&body);
        let digest_hex = digest.trim_start_matches("sha256:").to_string();

        let body_path = self.manifest_body_path(repository, &digest_hex)?;
        Self::write_atomic(&body_path, &body).await?;

        let ct_path = self.content_type_path(repository, &digest_hex)?;
        Self::write_atomic(&ct_path, media_type.as_bytes()).await?;

        // Only tag-shaped references (not digests) are recorded in the tag
        // index; pushing by digest leaves the tag namespace untouched.
        if crate::digest::Digest::parse(reference).is_err() {
            let mut index = self.read_tag_index(repository).await?;
            index.tags.insert(reference.to_string(), digest_hex.clone());
            self.write_tag_index(repository, &index).await?;
        }

        debug!(repository, reference, digest = %digest, "manifest stored");
        Ok(digest)
    }

    async fn delete(&self, repository: &str, reference: &str) -> Result<(), StorageError> {
        validate_repository_name(repository)?;
        validate_reference(reference)?;

        let digest_hex = self.resolve_digest_hex(repository, reference).await?;

        let mut index = self.read_tag_index(repository).await?;
        index.tags.retain(|_, v| v != &digest_hex);
        self.write_tag_index(repository, &index).await?;

        // The manifest body itself is left on disk: other tags, or the
        // digest reference directly, may still point at it. The garbage
        // collector reclaims bodies that become unreferenced by any tag.
        if crate::digest::Digest::parse(reference).is_ok() {
            let body_path = self.manifest_body_path(repository, &digest_hex)?;
            let _ = fs::remove_file(&body_path).await;
            let ct_path = self.content_type_path(repository, &digest_hex)?;
            let _ = fs::remove_file(&ct_path).await;
        }

        Ok(())
    }

    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, StorageError> {
        validate_repository_name(repository)?;
        let index = self.read_tag_index(repository).await?;
        let mut tags: Vec<String> = index.tags.keys().cloned().collect();
        tags.sort();
        Ok(tags)
    }

    async fn list_repositories(&self) -> Result<Vec<String>, StorageError> {
        let repos_path = self.base_path.join("repositories");
        let mut results = Vec::new();
        collect_repositories(&repos_path, &repos_path, &mut results).await?;
        results.sort();
        Ok(results)
    }

    async fn list_manifest_digests(&self) -> Result<Vec<(String, String)>, StorageError> {
        let repos = self.list_repositories().await?;
        let mut results = Vec::new();
        for repo in repos {
            let dir = self.repo_manifests_dir(&repo)?;
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_file() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                if name == "tags.json" || name.ends_with(".contenttype") || name.ends_with(".tmp") {
                    continue;
                }
                results.push((repo.clone(), format!("sha256:{name}")));
            }
        }
        Ok(results)
    }

    async fn get_mod_time(&self, repository: &str, reference: &str) -> Result<SystemTime, StorageError> {
        validate_repository_name(repository)?;
        validate_reference(reference)?;

        let digest_hex = self.resolve_digest_hex(repository, reference).await?;
        let body_path = self.manifest_body_path(repository, &digest_hex)?;
        let metadata = fs::metadata(&body_path)
            .await
            .map_err(|_| StorageError::NotFound(format!("{repository}:{reference}")))?;
        metadata.modified().map_err(StorageError::Io)
    }
}

/// Recursively find every repository directory (one that owns a `manifests`
/// subdirectory) under `dir`, recording paths relative to `root`.
fn collect_repositories<'a>(
    root: &'a Path,
    dir: &'a Path,
    results: &'a mut Vec<String>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), StorageError>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let path = entry.path();
            if path.join("manifests").is_dir() {
                if let Ok(relative) = path.strip_prefix(root) {
                    results.push(relative.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"));
                }
            } else {
                collect_repositories(root, &path, results).await?;
            }
        }

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn new_store() -> (tempfile::TempDir, LocalManifestStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalManifestStore::new(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_then_get_by_tag() {
        let (_dir, store) = new_store().await;
        let body = Bytes::from_static(br#"{"schemaVersion":2}"#);
        let digest = store
            .put("library/alpine", "latest", "application/vnd.oci.image.manifest.v1+json", body.clone())
            .await
            .unwrap();

        let fetched = store.get("library/alpine", "latest").await.unwrap();
        assert_eq!(fetched.body, body);
        assert_eq!(fetched.digest, digest);

        let fetched_by_digest = store.get("library/alpine", &digest).await.unwrap();
        assert_eq!(fetched_by_digest.body, body);
    }

    #[tokio::test]
    async fn list_tags_reflects_puts_and_deletes() {
        let (_dir, store) = new_store().await;
        let body = Bytes::from_static(br#"{"schemaVersion":2}"#);
        store.put("app", "v1", "application/vnd.oci.image.manifest.v1+json", body.clone()).await.unwrap();
        store.put("app", "v2", "application/vnd.oci.image.manifest.v1+json", body).await.unwrap();

        let mut tags = store.list_tags("app").await.unwrap();
        tags.sort();
        assert_eq!(tags, vec!["v1".to_string(), "v2".to_string()]);

        store.delete("app", "v1").await.unwrap();
        let tags = store.list_tags("app").await.unwrap();
        assert_eq!(tags, vec!["v2".to_string()]);
    }

    #[tokio::test]
    async fn list_repositories_discovers_nested_names() {
        let (_dir, store) = new_store().await;
        let body = Bytes::from_static(br#"{"schemaVersion":2}"#);
        store
            .put("library/alpine", "latest", "application/vnd.oci.image.manifest.v1+json", body)
            .await
            .unwrap();

        let repos = store.list_repositories().await.unwrap();
        assert_eq!(repos, vec!["library/alpine".to_string()]);
    }

    #[tokio::test]
    async fn get_missing_reference_errors() {
        let (_dir, store) = new_store().await;
        let err = store.get("app", "missing").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn get_missing_content_type_falls_back_to_legacy_default() {
        let (_dir, store) = new_store().await;
        let body = Bytes::from_static(br#"{"schemaVersion":2}"#);
        let digest = store
            .put("app", "latest", "application/vnd.oci.image.manifest.v1+json", body)
            .await
            .unwrap();
        let digest_hex = digest.trim_start_matches("sha256:");
        let ct_path = store.content_type_path("app", digest_hex).unwrap();
        fs::remove_file(&ct_path).await.unwrap();

        let fetched = store.get("app", "latest").await.unwrap();
        assert_eq!(fetched.media_type, "application/vnd.docker.distribution.manifest.v2+json");
    }

    #[tokio::test]
    async fn get_mod_time_resolves_tag_and_digest() {
        let (_dir, store) = new_store().await;
        let body = Bytes::from_static(br#"{"schemaVersion":2}"#);
        let digest = store
            .put("app", "latest", "application/vnd.oci.image.manifest.v1+json", body)
            .await
            .unwrap();

        store.get_mod_time("app", "latest").await.unwrap();
        store.get_mod_time("app", &digest).await.unwrap();
    }

    #[tokio::test]
    async fn get_mod_time_missing_reference_errors() {
        let (_dir, store) = new_store().await;
        let err = store.get_mod_time("app", "missing").await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }
}
