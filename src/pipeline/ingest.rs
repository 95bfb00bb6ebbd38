//! Ingest stage: deposit an upload into the Incoming namespace.
//!
//! The caller-supplied file name is used unchanged. A second upload with the
//! same name replaces the first; callers that need unique names must pick
//! them before uploading.

use crate::error::StageError;
use crate::store::{Namespace, StageStore};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::info;

/// Accepts raw uploads into Incoming.
#[derive(Debug, Clone)]
pub struct Ingestor {
    store: Arc<StageStore>,
}

impl Ingestor {
    pub fn new(store: Arc<StageStore>) -> Self {
        Self { store }
    }

    /// Store `source` in Incoming as `upload_name` and return the stored name.
    ///
    /// # Errors
    /// - [`StageError::Validation`] when the file name is missing or the upload
    ///   is empty
    /// - [`StageError::Io`] when the write fails
    pub async fn ingest<R>(&self, upload_name: &str, source: &mut R) -> Result<String, StageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if upload_name.trim().is_empty() {
            return Err(StageError::Validation("No file uploaded".into()));
        }

        let mut reader = BufReader::new(source);
        let head = reader
            .fill_buf()
            .await
            .map_err(|e| StageError::io(upload_name, e))?;
        if head.is_empty() {
            return Err(StageError::Validation(format!(
                "Uploaded file '{upload_name}' is empty"
            )));
        }

        let artifact = self
            .store
            .put_stream(Namespace::Incoming, upload_name, &mut reader)
            .await?;

        info!(name = upload_name, bytes = artifact.len, "File uploaded");
        Ok(artifact.name)
    }

    /// Convenience wrapper for in-memory uploads.
    pub async fn ingest_bytes(&self, upload_name: &str, bytes: &[u8]) -> Result<String, StageError> {
        let mut reader = bytes;
        self.ingest(upload_name, &mut reader).await
    }
}
