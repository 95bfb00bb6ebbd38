//! Retrieve stage: resolve an artifact name to something a client can download.
//!
//! Lookup order is fixed: Merged, then Converted. A name present in both
//! resolves to the Merged copy. Incoming is never searched, so raw uploads
//! cannot be downloaded.

use crate::error::StageError;
use crate::store::{Namespace, StageStore};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Namespaces searched by [`Retriever::resolve`], in priority order.
pub const LOOKUP_ORDER: [Namespace; 2] = [Namespace::Merged, Namespace::Converted];

/// Content type of every servable artifact.
pub const PDF_CONTENT_TYPE: &str = "application/pdf";

/// Where a requested name was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolved {
    pub namespace: Namespace,
    pub name: String,
    pub path: PathBuf,
}

/// An opened artifact plus the response metadata a transport needs.
#[derive(Debug)]
pub struct Download {
    pub resolved: Resolved,
    pub content_type: &'static str,
    pub content_disposition: String,
    pub len: u64,
    pub file: tokio::fs::File,
}

/// The retrieve stage.
#[derive(Debug, Clone)]
pub struct Retriever {
    store: Arc<StageStore>,
}

impl Retriever {
    pub fn new(store: Arc<StageStore>) -> Self {
        Self { store }
    }

    /// Find `name`, preferring Merged over Converted.
    pub async fn resolve(&self, name: &str) -> Result<Resolved, StageError> {
        if name.is_empty() {
            return Err(StageError::Validation("Filename is required".into()));
        }
        for namespace in LOOKUP_ORDER {
            if self.store.exists(namespace, name).await {
                let path = self.store.path(namespace, name)?;
                debug!(name, namespace = %namespace, "Resolved artifact");
                return Ok(Resolved {
                    namespace,
                    name: name.to_string(),
                    path,
                });
            }
        }
        Err(StageError::not_found(Namespace::Converted, name))
    }

    /// Resolve `name` and open it for streaming to a client.
    pub async fn open(&self, name: &str) -> Result<Download, StageError> {
        let resolved = self.resolve(name).await?;
        let file = self.store.open(resolved.namespace, name).await?;
        let len = file
            .metadata()
            .await
            .map_err(|e| StageError::io(&resolved.path, e))?
            .len();

        Ok(Download {
            content_type: PDF_CONTENT_TYPE,
            content_disposition: format!("attachment; filename={name}"),
            len,
            file,
            resolved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use tokio::io::AsyncReadExt;

    async fn setup() -> (tempfile::TempDir, Arc<StageStore>, Retriever) {
        let dir = tempfile::tempdir().unwrap();
        let config = StageConfig::builder().root(dir.path()).build().unwrap();
        let store = Arc::new(StageStore::init(&config).await.unwrap());
        let retriever = Retriever::new(Arc::clone(&store));
        (dir, store, retriever)
    }

    #[tokio::test]
    async fn merged_wins_over_converted() {
        let (_dir, store, retriever) = setup().await;
        store.put(Namespace::Converted, "x.pdf", b"converted").await.unwrap();
        store.put(Namespace::Merged, "x.pdf", b"merged").await.unwrap();

        let mut download = retriever.open("x.pdf").await.unwrap();
        assert_eq!(download.resolved.namespace, Namespace::Merged);
        let mut body = Vec::new();
        download.file.read_to_end(&mut body).await.unwrap();
        assert_eq!(body, b"merged");
        assert_eq!(download.len, 6);
    }

    #[tokio::test]
    async fn falls_back_to_converted() {
        let (_dir, store, retriever) = setup().await;
        store.put(Namespace::Converted, "only.pdf", b"c").await.unwrap();

        let resolved = retriever.resolve("only.pdf").await.unwrap();
        assert_eq!(resolved.namespace, Namespace::Converted);
        assert_eq!(resolved.path, store.dir(Namespace::Converted).join("only.pdf"));
    }

    #[tokio::test]
    async fn incoming_is_never_served() {
        let (_dir, store, retriever) = setup().await;
        store.put(Namespace::Incoming, "raw.pdf", b"raw").await.unwrap();

        let err = retriever.resolve("raw.pdf").await.unwrap_err();
        assert!(err.is_not_found(), "got: {err}");
    }

    #[tokio::test]
    async fn download_headers() {
        let (_dir, store, retriever) = setup().await;
        store.put(Namespace::Merged, "merged_a.pdf", b"%PDF").await.unwrap();

        let download = retriever.open("merged_a.pdf").await.unwrap();
        assert_eq!(download.content_type, "application/pdf");
        assert_eq!(
            download.content_disposition,
            "attachment; filename=merged_a.pdf"
        );
    }

    #[tokio::test]
    async fn empty_name_is_validation_error() {
        let (_dir, _store, retriever) = setup().await;
        let err = retriever.resolve("").await.unwrap_err();
        assert!(matches!(err, StageError::Validation(_)));
    }
}
