//! Filesystem-backed blob store.
//!
//! Uploads stream into a staging directory while a running SHA-256 digest is
//! kept in memory; `finish_upload` moves the file to its final
//! `{tenant}/{kind}/{YYYY}/{MM}/{DD}/{artifact_id}` path and seals it. URIs
//! are `fs://`-prefixed relative paths under the configured root.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use conveyor_core::CoreError;
use conveyor_core::store::{BlobBody, BlobStore, FinishedBlob};

const URI_SCHEME: &str = "fs://";
const STAGING_DIR: &str = ".uploads";

struct Upload {
    final_path: String,
    file: tokio::fs::File,
    staging: PathBuf,
    hasher: Sha256,
    size: u64,
}

#[derive(Clone)]
pub struct FsBlobStore {
    root: PathBuf,
    uploads: Arc<Mutex<HashMap<String, Upload>>>,
}

fn io_err(context: &str, e: std::io::Error) -> CoreError {
    CoreError::RetryableBackend(format!("{context}: {e}"))
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            uploads: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn resolve(&self, uri: &str) -> Result<PathBuf, CoreError> {
        let relative = uri
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| CoreError::InvalidRequest(format!("not a blob uri: {uri}")))?;
        if relative.split('/').any(|part| part == "..") {
            return Err(CoreError::InvalidRequest(format!(
                "blob uri escapes the store root: {uri}"
            )));
        }
        Ok(self.root.join(relative))
    }
}

impl BlobStore for FsBlobStore {
    async fn start_upload(&self, path: &str) -> Result<String, CoreError> {
        if path.split('/').any(|part| part == "..") {
            return Err(CoreError::InvalidRequest(format!(
                "blob path escapes the store root: {path}"
            )));
        }

        let handle = Uuid::new_v4().to_string();
        let staging_dir = self.root.join(STAGING_DIR);
        tokio::fs::create_dir_all(&staging_dir)
            .await
            .map_err(|e| io_err("creating staging dir", e))?;
        let staging = staging_dir.join(&handle);
        let file = tokio::fs::File::create(&staging)
            .await
            .map_err(|e| io_err("creating staging file", e))?;

        self.uploads.lock().await.insert(
            handle.clone(),
            Upload {
                final_path: path.to_string(),
                file,
                staging,
                hasher: Sha256::new(),
                size: 0,
            },
        );
        Ok(handle)
    }

    async fn write_chunk(&self, handle: &str, chunk: Bytes) -> Result<(), CoreError> {
        let mut uploads = self.uploads.lock().await;
        let upload = uploads
            .get_mut(handle)
            .ok_or_else(|| CoreError::NotFound(format!("upload {handle}")))?;
        upload
            .file
            .write_all(&chunk)
            .await
            .map_err(|e| io_err("writing chunk", e))?;
        upload.hasher.update(&chunk);
        upload.size += chunk.len() as u64;
        Ok(())
    }

    async fn finish_upload(&self, handle: &str) -> Result<FinishedBlob, CoreError> {
        let mut uploads = self.uploads.lock().await;
        let mut upload = uploads
            .remove(handle)
            .ok_or_else(|| CoreError::NotFound(format!("upload {handle}")))?;
        drop(uploads);

        upload
            .file
            .flush()
            .await
            .map_err(|e| io_err("flushing upload", e))?;
        drop(upload.file);

        let target = self.root.join(&upload.final_path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_err("creating blob dir", e))?;
        }
        tokio::fs::rename(&upload.staging, &target)
            .await
            .map_err(|e| io_err("sealing blob", e))?;

        Ok(FinishedBlob {
            uri: format!("{URI_SCHEME}{}", upload.final_path),
            sha256: format!("{:x}", upload.hasher.finalize()),
            size_bytes: upload.size,
        })
    }

    async fn open_read(&self, uri: &str) -> Result<BlobBody, CoreError> {
        let path = self.resolve(uri)?;
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::NotFound(format!("blob {uri}")));
            }
            Err(e) => return Err(io_err("opening blob", e)),
        };
        let stream = ReaderStream::new(file)
            .map(|chunk| chunk.map_err(|e| io_err("reading blob", e)))
            .boxed();
        Ok(stream)
    }

    async fn delete(&self, uri: &str) -> Result<(), CoreError> {
        let path = self.resolve(uri)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("deleting blob", e)),
        }
    }
}
