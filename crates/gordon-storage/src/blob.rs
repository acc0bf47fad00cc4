//! Content-addressed blob storage with chunked, resumable uploads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use parking_lot::RwLock;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::digest::{safe_join, sha256_digest, Digest, StreamingSha256};
use crate::error::StorageError;

/// A boxed stream of blob byte chunks, used so the registry HTTP layer can
/// stream responses without buffering the whole blob in memory.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// A boxed sink for an in-progress upload session, used so the registry HTTP
/// layer can stream a chunk straight from the request body to storage
/// without buffering it in memory first.
pub type UploadWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Snapshot of an in-flight upload session, returned by `start_upload` and
/// progress queries.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: Uuid,
    pub repository: String,
    pub bytes_written: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn exists(&self, digest: &str) -> Result<bool, StorageError>;
    async fn get(&self, digest: &str) -> Result<ByteStream, StorageError>;
    async fn size(&self, digest: &str) -> Result<u64, StorageError>;
    async fn put_blob(
        &self,
        digest: &str,
        data: Bytes,
        declared_size: Option<u64>,
    ) -> Result<(), StorageError>;
    async fn delete(&self, digest: &str) -> Result<(), StorageError>;

    async fn start_upload(&self, repository: &str) -> Result<UploadSession, StorageError>;
    async fn append_chunk(&self, session_id: &str, data: Bytes) -> Result<u64, StorageError>;

    /// A sink that appends directly to the upload session's backing file, so
    /// a chunk can be streamed from the request body to storage without ever
    /// buffering it in memory first. Byte counts written through it are
    /// reflected by `get_upload_session` the same way `append_chunk` is.
    async fn get_upload_writer(&self, session_id: &str) -> Result<UploadWriter, StorageError>;

    async fn get_upload_session(&self, session_id: &str) -> Result<UploadSession, StorageError>;
    async fn finish_upload(
        &self,
        session_id: &str,
        digest: &str,
    ) -> Result<(String, u64), StorageError>;
    async fn cancel_upload(&self, session_id: &str) -> Result<(), StorageError>;

    /// Enumerate every stored blob as `(digest, size)`. Used exclusively by
    /// the garbage collector.
    async fn list_blobs(&self) -> Result<Vec<(String, u64)>, StorageError>;
}

struct SessionState {
    repository: String,
    bytes_written: AtomicU64,
}

/// `AsyncWrite` over an upload session's backing file, updating the same
/// `bytes_written` counter `append_chunk`/`get_upload_session` read from.
struct SessionWriter {
    file: fs::File,
    state: Arc<SessionState>,
}

impl AsyncWrite for SessionWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        let this = self.get_mut();
        match Pin::new(&mut this.file).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.state.bytes_written.fetch_add(n as u64, Ordering::SeqCst);
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}

/// Local filesystem-backed `BlobStore`.
///
/// Layout: `{base}/blobs/{alg}/{hex[:2]}/{hex}` for finalized blobs,
/// `{base}/uploads/{uuid}` for in-progress sessions.
pub struct LocalBlobStore {
    base_path: PathBuf,
    blobs_path: PathBuf,
    uploads_path: PathBuf,
    sessions: RwLock<HashMap<Uuid, Arc<SessionState>>>,
}

impl LocalBlobStore {
    pub async fn new(base_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().to_path_buf();
        let blobs_path = base_path.join("blobs");
        let uploads_path = base_path.join("uploads");

        fs::create_dir_all(&blobs_path).await?;
        fs::create_dir_all(&uploads_path).await?;

        Ok(Self {
            base_path,
            blobs_path,
            uploads_path,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf, StorageError> {
        let parsed = Digest::parse(digest)?;
        safe_join(
            &self.blobs_path,
            &[parsed.algorithm(), parsed.shard(), parsed.hex()],
        )
    }

    fn upload_path(&self, session_id: &Uuid) -> Result<PathBuf, StorageError> {
        safe_join(&self.uploads_path, &[&session_id.to_string()])
    }

    fn parse_session_id(raw: &str) -> Result<Uuid, StorageError> {
        // Strict UUIDv4-shaped grammar check before even touching the
        // filesystem: length 36, hyphens at the canonical positions,
        // lowercase hex elsewhere.
        if raw.len() != 36 {
            return Err(StorageError::UnknownSession(raw.to_string()));
        }
        let groups: Vec<&str> = raw.split('-').collect();
        let expected_lengths = [8, 4, 4, 4, 12];
        if groups.len() != 5
            || groups
                .iter()
                .zip(expected_lengths.iter())
                .any(|(g, len)| g.len() != *len || !g.bytes().all(|b| b.is_ascii_hexdigit()))
        {
            return Err(StorageError::UnknownSession(raw.to_string()));
        }
        Uuid::parse_str(raw).map_err(|_| StorageError::UnknownSession(raw.to_string()))
    }

    async fn session_state(&self, id: &Uuid) -> Result<Arc<SessionState>, StorageError> {
        if let Some(state) = self.sessions.read().get(id).cloned() {
            return Ok(state);
        }
        // Recover the size of a session whose bookkeeping was lost (e.g.
        // across a process restart) from the file itself; the repository
        // name cannot be recovered and is recorded as unknown.
        let path = self.upload_path(id)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|_| StorageError::UnknownSession(id.to_string()))?;
        let state = Arc::new(SessionState {
            repository: String::from("unknown"),
            bytes_written: AtomicU64::new(meta.len()),
        });
        self.sessions.write().insert(*id, state.clone());
        Ok(state)
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn exists(&self, digest: &str) -> Result<bool, StorageError> {
        let path = self.blob_path(digest)?;
        Ok(fs::metadata(&path).await.is_ok())
    }

    async fn get(&self, digest: &str) -> Result<ByteStream, StorageError> {
        let path = self.blob_path(digest)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|_| StorageError::NotFound(digest.to_string()))?;
        let stream = tokio_util::io::ReaderStream::new(file);
        Ok(Box::pin(stream))
    }

    async fn size(&self, digest: &str) -> Result<u64, StorageError> {
        let path = self.blob_path(digest)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|_| StorageError::NotFound(digest.to_string()))?;
        Ok(meta.len())
    }

    async fn put_blob(
        &self,
        digest: &str,
        data: Bytes,
        declared_size: Option<u64>,
    ) -> Result<(), StorageError> {
        let parsed = Digest::parse(digest)?;
        let path = self.blob_path(digest)?;

        if let Some(declared) = declared_size {
            if declared > 0 && declared != data.len() as u64 {
                return Err(StorageError::SizeMismatch {
                    declared,
                    actual: data.len() as u64,
                });
            }
        }

        let actual = sha256_digest(&data);
        if parsed.algorithm() == "sha256" && actual != parsed.as_string() {
            return Err(StorageError::DigestMismatch {
                expected: parsed.as_string(),
                actual,
            });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp_path = path.with_extension("tmp");
        let write_result = async {
            let mut file = fs::File::create(&tmp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, &path).await?;
            Ok::<(), std::io::Error>(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }

        debug!(digest = %digest, "blob written");
        Ok(())
    }

    async fn delete(&self, digest: &str) -> Result<(), StorageError> {
        let path = self.blob_path(digest)?;
        fs::remove_file(&path)
            .await
            .map_err(|_| StorageError::NotFound(digest.to_string()))?;
        Ok(())
    }

    async fn start_upload(&self, repository: &str) -> Result<UploadSession, StorageError> {
        let id = Uuid::new_v4();
        let path = self.upload_path(&id)?;
        fs::File::create(&path).await?;

        let state = Arc::new(SessionState {
            repository: repository.to_string(),
            bytes_written: AtomicU64::new(0),
        });
        self.sessions.write().insert(id, state);

        Ok(UploadSession {
            id,
            repository: repository.to_string(),
            bytes_written: 0,
        })
    }

    async fn append_chunk(&self, session_id: &str, data: Bytes) -> Result<u64, StorageError> {
        let id = Self::parse_session_id(session_id)?;
        let path = self.upload_path(&id)?;
        let state = self.session_state(&id).await?;

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|_| StorageError::UnknownSession(session_id.to_string()))?;
        file.write_all(&data).await?;
        file.sync_all().await?;

        let new_size = state
            .bytes_written
            .fetch_add(data.len() as u64, Ordering::SeqCst)
            + data.len() as u64;
        Ok(new_size)
    }

    async fn get_upload_writer(&self, session_id: &str) -> Result<UploadWriter, StorageError> {
        let id = Self::parse_session_id(session_id)?;
        let path = self.upload_path(&id)?;
        let state = self.session_state(&id).await?;

        let file = fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|_| StorageError::UnknownSession(session_id.to_string()))?;

        Ok(Box::pin(SessionWriter { file, state }))
    }

    async fn get_upload_session(&self, session_id: &str) -> Result<UploadSession, StorageError> {
        let id = Self::parse_session_id(session_id)?;
        let state = self.session_state(&id).await?;
        Ok(UploadSession {
            id,
            repository: state.repository.clone(),
            bytes_written: state.bytes_written.load(Ordering::SeqCst),
        })
    }

    async fn finish_upload(
        &self,
        session_id: &str,
        digest: &str,
    ) -> Result<(String, u64), StorageError> {
        let id = Self::parse_session_id(session_id)?;
        let declared = Digest::parse(digest)?;
        let upload_path = self.upload_path(&id)?;

        let mut file = fs::File::open(&upload_path)
            .await
            .map_err(|_| StorageError::UnknownSession(session_id.to_string()))?;

        let mut hasher = StreamingSha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        let mut total: u64 = 0;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            total += n as u64;
        }
        let actual = hasher.finish();

        if declared.algorithm() == "sha256" && actual != declared.as_string() {
            warn!(session = %session_id, expected = %digest, actual = %actual, "digest mismatch on finalize");
            // Session is left intact for cancellation, per contract.
            return Err(StorageError::DigestMismatch {
                expected: declared.as_string(),
                actual,
            });
        }

        let blob_path = self.blob_path(digest)?;
        if let Some(parent) = blob_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&upload_path, &blob_path).await?;
        self.sessions.write().remove(&id);

        debug!(session = %session_id, digest = %digest, "upload finalized");
        Ok((declared.as_string(), total))
    }

    async fn cancel_upload(&self, session_id: &str) -> Result<(), StorageError> {
        let id = Self::parse_session_id(session_id)?;
        let path = self.upload_path(&id)?;
        let _ = fs::remove_file(&path).await;
        self.sessions.write().remove(&id);
        Ok(())
    }

    async fn list_blobs(&self) -> Result<Vec<(String, u64)>, StorageError> {
        let mut results = Vec::new();
        let mut alg_entries = match fs::read_dir(&self.blobs_path).await {
            Ok(entries) => entries,
            Err(_) => return Ok(results),
        };

        while let Some(alg_entry) = alg_entries.next_entry().await? {
            if !alg_entry.file_type().await?.is_dir() {
                continue;
            }
            let algorithm = alg_entry.file_name().to_string_lossy().to_string();
            let mut shard_entries = fs::read_dir(alg_entry.path()).await?;
            while let Some(shard_entry) = shard_entries.next_entry().await? {
                if !shard_entry.file_type().await?.is_dir() {
                    continue;
                }
                let mut hash_entries = fs::read_dir(shard_entry.path()).await?;
                while let Some(hash_entry) = hash_entries.next_entry().await? {
                    if !hash_entry.file_type().await?.is_file() {
                        continue;
                    }
                    let hex = hash_entry.file_name().to_string_lossy().to_string();
                    let size = hash_entry.metadata().await?.len();
                    results.push((format!("{algorithm}:{hex}"), size));
                }
            }
        }

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn new_store() -> (tempfile::TempDir, LocalBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalBlobStore::new(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let (_dir, store) = new_store().await;
        let data = Bytes::from_static(b"hello");
        let digest = sha256_digest(&data);

        store.put_blob(&digest, data.clone(), Some(data.len() as u64)).await.unwrap();
        assert!(store.exists(&digest).await.unwrap());

        let mut stream = store.get(&digest).await.unwrap();
        let mut collected = Vec::new();
        use futures::StreamExt;
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, data.to_vec());
    }

    #[tokio::test]
    async fn put_blob_rejects_size_mismatch() {
        let (_dir, store) = new_store().await;
        let data = Bytes::from_static(b"hello");
        let digest = sha256_digest(&data);
        let err = store.put_blob(&digest, data, Some(999)).await.unwrap_err();
        assert!(matches!(err, StorageError::SizeMismatch { .. }));
    }

    #[tokio::test]
    async fn chunked_upload_round_trips() {
        let (_dir, store) = new_store().await;
        let session = store.start_upload("alpine").await.unwrap();
        let sid = session.id.to_string();

        let n1 = store.append_chunk(&sid, Bytes::from_static(b"hel")).await.unwrap();
        assert_eq!(n1, 3);
        let n2 = store.append_chunk(&sid, Bytes::from_static(b"lo")).await.unwrap();
        assert_eq!(n2, 5);

        let digest = sha256_digest(b"hello");
        let (returned_digest, size) = store.finish_upload(&sid, &digest).await.unwrap();
        assert_eq!(returned_digest, digest);
        assert_eq!(size, 5);
        assert!(store.exists(&digest).await.unwrap());
    }

    #[tokio::test]
    async fn finish_upload_digest_mismatch_preserves_session() {
        let (_dir, store) = new_store().await;
        let session = store.start_upload("alpine").await.unwrap();
        let sid = session.id.to_string();
        store.append_chunk(&sid, Bytes::from_static(b"hello")).await.unwrap();

        let wrong_digest = "sha256:".to_string() + &"0".repeat(64);
        let err = store.finish_upload(&sid, &wrong_digest).await.unwrap_err();
        assert!(matches!(err, StorageError::DigestMismatch { .. }));

        // Session survives: cancellation still works.
        store.cancel_upload(&sid).await.unwrap();
    }

    #[tokio::test]
    async fn list_blobs_enumerates_sharded_tree() {
        let (_dir, store) = new_store().await;
        let data = Bytes::from_static(b"hello");
        let digest = sha256_digest(&data);
        store.put_blob(&digest, data.clone(), None).await.unwrap();

        let blobs = store.list_blobs().await.unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].0, digest);
        assert_eq!(blobs[0].1, data.len() as u64);
    }

    #[tokio::test]
    async fn upload_writer_streams_chunk_and_updates_progress() {
        use tokio::io::AsyncWriteExt as _;

        let (_dir, store) = new_store().await;
        let session = store.start_upload("alpine").await.unwrap();
        let sid = session.id.to_string();

        {
            let mut writer = store.get_upload_writer(&sid).await.unwrap();
            writer.write_all(b"hello").await.unwrap();
            writer.shutdown().await.unwrap();
        }

        let progress = store.get_upload_session(&sid).await.unwrap();
        assert_eq!(progress.bytes_written, 5);

        let digest = sha256_digest(b"hello");
        let (_, size) = store.finish_upload(&sid, &digest).await.unwrap();
        assert_eq!(size, 5);
    }

    #[test]
    fn rejects_malformed_session_id() {
        assert!(LocalBlobStore::parse_session_id("not-a-uuid").is_err());
        assert!(LocalBlobStore::parse_session_id("../../../etc/passwd").is_err());
    }
}
