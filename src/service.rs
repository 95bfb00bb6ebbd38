//! Pipeline entry points.
//!
//! [`StageService`] owns one [`StageStore`] and the four stages wired to it.
//! Build it once at startup and share it (`Arc<StageService>`) across request
//! handlers; every operation borrows `&self` and is safe to run concurrently.
//!
//! The external collaborators are injected, so tests and embedders can swap
//! LibreOffice and pdfium for anything implementing [`DocumentConverter`] and
//! [`MergeEngine`].

use crate::config::StageConfig;
use crate::error::StageError;
use crate::pipeline::convert::{CommandConverter, Converter, DocumentConverter};
use crate::pipeline::ingest::Ingestor;
use crate::pipeline::merge::{MergeEngine, Merger, PdfiumMergeEngine};
use crate::pipeline::retrieve::{Download, Resolved, Retriever};
use crate::store::StageStore;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncRead;
use tracing::info;

/// Result of converting one document in a batch.
#[derive(Debug)]
pub struct BatchEntry {
    /// Incoming name as requested.
    pub input: String,
    /// Converted name, or why the conversion failed.
    pub result: Result<String, StageError>,
}

/// Summary of [`StageService::run`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunOutput {
    /// Incoming names, in request order.
    pub ingested: Vec<String>,
    /// Converted names, in request order.
    pub converted: Vec<String>,
    /// Merged name when two or more documents were given.
    pub merged: Option<String>,
    /// The artifact to download: the merge output, or the single converted PDF.
    pub output: String,
}

/// The staged document pipeline.
pub struct StageService {
    config: StageConfig,
    store: Arc<StageStore>,
    ingestor: Ingestor,
    converter: Converter,
    merger: Merger,
    retriever: Retriever,
}

impl StageService {
    /// Initialise the store and wire the production collaborators:
    /// [`CommandConverter`] and [`PdfiumMergeEngine`].
    pub async fn new(config: StageConfig) -> Result<Self, StageError> {
        let converter = Arc::new(CommandConverter::from_config(&config));
        let engine = Arc::new(PdfiumMergeEngine::new());
        Self::with_collaborators(config, converter, engine).await
    }

    /// Initialise the store with caller-supplied collaborators.
    pub async fn with_collaborators(
        config: StageConfig,
        converter: Arc<dyn DocumentConverter>,
        merge_engine: Arc<dyn MergeEngine>,
    ) -> Result<Self, StageError> {
        let store = Arc::new(StageStore::init(&config).await?);
        Ok(Self {
            ingestor: Ingestor::new(Arc::clone(&store)),
            converter: Converter::new(Arc::clone(&store), converter),
            merger: Merger::new(Arc::clone(&store), merge_engine, config.merge),
            retriever: Retriever::new(Arc::clone(&store)),
            store,
            config,
        })
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<StageStore> {
        &self.store
    }

    /// Store an upload in Incoming; see [`Ingestor::ingest`].
    pub async fn ingest<R>(&self, upload_name: &str, source: &mut R) -> Result<String, StageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        self.ingestor.ingest(upload_name, source).await
    }

    pub async fn ingest_bytes(&self, upload_name: &str, bytes: &[u8]) -> Result<String, StageError> {
        self.ingestor.ingest_bytes(upload_name, bytes).await
    }

    /// Upload a local file, named after its final path component unless
    /// `name` is given.
    pub async fn ingest_file(&self, path: &Path, name: Option<&str>) -> Result<String, StageError> {
        let upload_name = match name {
            Some(n) => n.to_string(),
            None => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    StageError::Validation(format!("'{}' has no file name", path.display()))
                })?,
        };
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| StageError::io(path, e))?;
        self.ingestor.ingest(&upload_name, &mut file).await
    }

    /// Convert one Incoming artifact; see [`Converter::convert`].
    pub async fn convert(&self, name: &str) -> Result<String, StageError> {
        self.converter.convert(name).await
    }

    /// Convert several Incoming artifacts, at most `config.concurrency` at a time.
    ///
    /// One failure does not stop the others. Entries come back in request
    /// order regardless of completion order.
    pub async fn convert_batch<S: AsRef<str>>(&self, names: &[S]) -> Vec<BatchEntry> {
        let total = names.len();
        let callback = self.config.progress_callback.clone();
        if let Some(ref cb) = callback {
            cb.on_batch_start(total);
        }

        let mut entries: Vec<(usize, BatchEntry)> =
            stream::iter(names.iter().enumerate().map(|(i, name)| {
                let name = name.as_ref().to_string();
                let converter = self.converter.clone();
                let callback = callback.clone();
                async move {
                    let index = i + 1;
                    if let Some(ref cb) = callback {
                        cb.on_document_start(&name, index, total);
                    }
                    let result = converter.convert(&name).await;
                    if let Some(ref cb) = callback {
                        match &result {
                            Ok(output) => cb.on_document_complete(&name, output, index, total),
                            Err(e) => cb.on_document_error(&name, index, total, &e.to_string()),
                        }
                    }
                    (i, BatchEntry { input: name, result })
                }
            }))
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        entries.sort_by_key(|(i, _)| *i);
        let entries: Vec<BatchEntry> = entries.into_iter().map(|(_, e)| e).collect();

        let succeeded = entries.iter().filter(|e| e.result.is_ok()).count();
        if let Some(ref cb) = callback {
            cb.on_batch_complete(total, succeeded);
        }
        info!("Batch conversion complete: {}/{} documents", succeeded, total);
        entries
    }

    /// Merge Converted artifacts in order; see [`Merger::merge`].
    pub async fn merge<S: AsRef<str>>(&self, names: &[S]) -> Result<String, StageError> {
        self.merger.merge(names).await
    }

    /// Locate a servable artifact; see [`Retriever::resolve`].
    pub async fn resolve(&self, name: &str) -> Result<Resolved, StageError> {
        self.retriever.resolve(name).await
    }

    /// Open a servable artifact for download; see [`Retriever::open`].
    pub async fn open(&self, name: &str) -> Result<Download, StageError> {
        self.retriever.open(name).await
    }

    /// Ingest local files, convert them all, and merge when there are two or more.
    ///
    /// Stops at the first failing stage. When several conversions fail the
    /// error of the earliest document in request order is returned.
    pub async fn run<P: AsRef<Path>>(&self, files: &[P]) -> Result<RunOutput, StageError> {
        if files.is_empty() {
            return Err(StageError::Validation("No files given".into()));
        }
        let start = Instant::now();

        let mut ingested = Vec::with_capacity(files.len());
        for file in files {
            ingested.push(self.ingest_file(file.as_ref(), None).await?);
        }

        let mut converted = Vec::with_capacity(ingested.len());
        for entry in self.convert_batch(&ingested).await {
            converted.push(entry.result?);
        }

        let merged = if converted.len() >= 2 {
            Some(self.merge(&converted).await?)
        } else {
            None
        };
        let output = merged
            .clone()
            .or_else(|| converted.first().cloned())
            .ok_or_else(|| StageError::Internal("no output produced".into()))?;

        info!(
            output = %output,
            documents = files.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Pipeline run complete"
        );
        Ok(RunOutput {
            ingested,
            converted,
            merged,
            output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MergeOptions;
    use crate::pipeline::convert::{output_name, ConverterRun};
    use crate::progress::PipelineProgressCallback;
    use crate::store::Namespace;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails any input whose name starts with `bad`.
    struct PickyConverter;

    #[async_trait]
    impl DocumentConverter for PickyConverter {
        async fn run(&self, input: &Path, out_dir: &Path) -> Result<ConverterRun, StageError> {
            let name = input.file_name().unwrap().to_string_lossy().into_owned();
            if name.starts_with("bad") {
                return Ok(ConverterRun {
                    success: false,
                    exit_code: Some(1),
                    output: "Error: source file could not be loaded".into(),
                });
            }
            tokio::fs::copy(input, out_dir.join(output_name(&name)))
                .await
                .unwrap();
            Ok(ConverterRun {
                success: true,
                exit_code: Some(0),
                output: String::new(),
            })
        }
    }

    struct ConcatEngine;

    impl MergeEngine for ConcatEngine {
        fn merge(&self, inputs: &[PathBuf], output: &Path, _: &MergeOptions) -> Result<(), StageError> {
            let body: Vec<u8> = inputs.iter().flat_map(|p| std::fs::read(p).unwrap()).collect();
            std::fs::write(output, body).map_err(|e| StageError::io(output, e))
        }
    }

    #[derive(Default)]
    struct Counting {
        ok: AtomicUsize,
        failed: AtomicUsize,
        reported_success: AtomicUsize,
    }

    impl PipelineProgressCallback for Counting {
        fn on_document_complete(&self, _: &str, _: &str, _: usize, _: usize) {
            self.ok.fetch_add(1, Ordering::SeqCst);
        }
        fn on_document_error(&self, _: &str, _: usize, _: usize, _: &str) {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        fn on_batch_complete(&self, _: usize, success_count: usize) {
            self.reported_success.store(success_count, Ordering::SeqCst);
        }
    }

    async fn service(config: StageConfig) -> StageService {
        StageService::with_collaborators(config, Arc::new(PickyConverter), Arc::new(ConcatEngine))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn batch_keeps_request_order_and_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let progress = Arc::new(Counting::default());
        let config = StageConfig::builder()
            .root(dir.path())
            .concurrency(3)
            .progress_callback(progress.clone())
            .build()
            .unwrap();
        let svc = service(config).await;

        for name in ["one.docx", "bad.odt", "three.txt", "four.pdf"] {
            svc.ingest_bytes(name, name.as_bytes()).await.unwrap();
        }
        let entries = svc
            .convert_batch(&["one.docx", "bad.odt", "three.txt", "four.pdf"])
            .await;

        let inputs: Vec<&str> = entries.iter().map(|e| e.input.as_str()).collect();
        assert_eq!(inputs, ["one.docx", "bad.odt", "three.txt", "four.pdf"]);
        assert_eq!(entries[0].result.as_deref().unwrap(), "one.pdf");
        assert!(matches!(entries[1].result, Err(StageError::Conversion { .. })));
        assert_eq!(entries[2].result.as_deref().unwrap(), "three.pdf");
        assert_eq!(entries[3].result.as_deref().unwrap(), "four.pdf");

        assert_eq!(progress.ok.load(Ordering::SeqCst), 3);
        assert_eq!(progress.failed.load(Ordering::SeqCst), 1);
        assert_eq!(progress.reported_success.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_ingests_converts_and_merges() {
        let dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let a = src.path().join("intro.docx");
        let b = src.path().join("body.pdf");
        std::fs::write(&a, b"INTRO").unwrap();
        std::fs::write(&b, b"BODY").unwrap();

        let svc = service(StageConfig::builder().root(dir.path()).build().unwrap()).await;
        let out = svc.run(&[&a, &b]).await.unwrap();

        assert_eq!(out.ingested, ["intro.docx", "body.pdf"]);
        assert_eq!(out.converted, ["intro.pdf", "body.pdf"]);
        assert_eq!(out.merged.as_deref(), Some("merged_intro.pdf"));
        assert_eq!(out.output, "merged_intro.pdf");
        assert_eq!(
            svc.store().read(Namespace::Merged, &out.output).await.unwrap(),
            b"INTROBODY"
        );
    }

    #[tokio::test]
    async fn run_single_file_skips_merge() {
        let dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let a = src.path().join("solo.txt");
        std::fs::write(&a, b"solo").unwrap();

        let svc = service(StageConfig::builder().root(dir.path()).build().unwrap()).await;
        let out = svc.run(&[&a]).await.unwrap();
        assert_eq!(out.merged, None);
        assert_eq!(out.output, "solo.pdf");
        assert_eq!(svc.resolve("solo.pdf").await.unwrap().namespace, Namespace::Converted);
    }

    #[tokio::test]
    async fn run_reports_first_failed_conversion() {
        let dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let good = src.path().join("good.txt");
        let bad = src.path().join("bad.txt");
        std::fs::write(&good, b"g").unwrap();
        std::fs::write(&bad, b"b").unwrap();

        let svc = service(StageConfig::builder().root(dir.path()).build().unwrap()).await;
        let err = svc.run(&[&good, &bad]).await.unwrap_err();
        assert!(matches!(err, StageError::Conversion { ref name, .. } if name == "bad.txt"));
        assert!(svc.store().list(Namespace::Merged).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ingest_file_can_rename() {
        let dir = tempfile::tempdir().unwrap();
        let src = tempfile::tempdir().unwrap();
        let a = src.path().join("tmp-8842.bin");
        std::fs::write(&a, b"data").unwrap();

        let svc = service(StageConfig::builder().root(dir.path()).build().unwrap()).await;
        let name = svc.ingest_file(&a, Some("contract.docx")).await.unwrap();
        assert_eq!(name, "contract.docx");

        let err = svc
            .ingest_file(&src.path().join("missing.docx"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Io { .. }), "got: {err}");
    }
}
