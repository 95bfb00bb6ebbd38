//! Merge stage: concatenate two or more Converted PDFs into one Merged PDF.
//!
//! The output is named after the first input (`merged_<first>`), so merging
//! with the same leading document twice replaces the earlier result.
//!
//! ## Why spawn_blocking?
//!
//! The production engine drives pdfium through `pdfium-render`, a blocking
//! FFI library. Running it on the blocking pool keeps the Tokio workers free
//! for other requests while a large merge is in progress.
//!
//! ## Atomic output
//!
//! The engine writes into a staging file inside the Merged directory, which
//! is renamed onto the final name only when the engine reports success. A
//! failed merge leaves nothing behind.

use crate::config::MergeOptions;
use crate::error::StageError;
use crate::store::{Namespace, StageStore};
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// A facility that concatenates PDFs, in order, into `output`.
///
/// Called from a blocking thread. Failures are reported as
/// [`StageError::Merge`] with the engine's own message.
pub trait MergeEngine: Send + Sync {
    fn merge(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        options: &MergeOptions,
    ) -> Result<(), StageError>;
}

/// Merge engine backed by the pdfium library.
///
/// The library is located through `PDFIUM_LIB_PATH` (a file or a directory
/// containing the platform library), then the working directory, then the
/// system library path.
pub struct PdfiumMergeEngine {
    library_path: Option<PathBuf>,
    // pdfium keeps global state; one merge at a time per engine.
    lock: Mutex<()>,
}

impl Default for PdfiumMergeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PdfiumMergeEngine {
    /// Engine honouring `PDFIUM_LIB_PATH`.
    pub fn new() -> Self {
        Self {
            library_path: std::env::var_os("PDFIUM_LIB_PATH").map(PathBuf::from),
            lock: Mutex::new(()),
        }
    }

    /// Engine bound to an explicit library file or directory.
    pub fn with_library(path: impl Into<PathBuf>) -> Self {
        Self {
            library_path: Some(path.into()),
            lock: Mutex::new(()),
        }
    }

    fn bind(&self) -> Result<Pdfium, StageError> {
        let bindings = match &self.library_path {
            Some(path) if path.is_dir() => {
                Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(path))
            }
            Some(path) => Pdfium::bind_to_library(path),
            None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
                .or_else(|_| Pdfium::bind_to_system_library()),
        }
        .map_err(|e| StageError::Merge {
            detail: format!(
                "failed to bind to pdfium library: {e:?}\n\
                 Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy."
            ),
        })?;
        Ok(Pdfium::new(bindings))
    }
}

impl MergeEngine for PdfiumMergeEngine {
    fn merge(
        &self,
        inputs: &[PathBuf],
        output: &Path,
        options: &MergeOptions,
    ) -> Result<(), StageError> {
        let _guard = self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let pdfium = self.bind()?;

        let engine_err = |what: &str, e: PdfiumError| StageError::Merge {
            detail: format!("{what}: {e:?}"),
        };

        let mut merged = pdfium
            .create_new_pdf()
            .map_err(|e| engine_err("cannot create output document", e))?;

        for (i, path) in inputs.iter().enumerate() {
            let source = pdfium
                .load_pdf_from_file(path, None)
                .map_err(|e| engine_err(&format!("cannot read '{}'", path.display()), e))?;

            if options.divider_page && i > 0 {
                merged
                    .pages_mut()
                    .create_page_at_end(PdfPagePaperSize::a4())
                    .map(|_| ())
                    .map_err(|e| engine_err("cannot insert divider page", e))?;
            }

            merged
                .pages_mut()
                .append(&source)
                .map_err(|e| engine_err(&format!("cannot append '{}'", path.display()), e))?;
            debug!("Appended {} ({} pages)", path.display(), source.pages().len());
        }

        merged
            .save_to_file(output)
            .map_err(|e| engine_err(&format!("cannot write '{}'", output.display()), e))
    }
}

/// Output name for a merge whose first input is `first`: `merged_<base>`.
pub fn merged_name(first: &str) -> String {
    let base = Path::new(first)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| first.to_string());
    format!("merged_{base}")
}

/// The merge stage.
#[derive(Clone)]
pub struct Merger {
    store: Arc<StageStore>,
    engine: Arc<dyn MergeEngine>,
    options: MergeOptions,
}

impl Merger {
    pub fn new(store: Arc<StageStore>, engine: Arc<dyn MergeEngine>, options: MergeOptions) -> Self {
        Self {
            store,
            engine,
            options,
        }
    }

    /// Merge the Converted artifacts `names`, in order, and return the Merged name.
    ///
    /// Repeated names are merged repeatedly; nothing is reordered.
    ///
    /// # Errors
    /// - [`StageError::Validation`] for fewer than two names, or a name that is
    ///   not a single file name
    /// - [`StageError::NotFound`] naming the first input missing from Converted
    /// - [`StageError::Merge`] when the engine fails
    pub async fn merge<S: AsRef<str>>(&self, names: &[S]) -> Result<String, StageError> {
        if names.len() < 2 {
            return Err(StageError::Validation(
                "At least two PDF files are required for merging".into(),
            ));
        }

        let mut inputs = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref();
            let path = self.store.path(Namespace::Converted, name)?;
            if !self.store.exists(Namespace::Converted, name).await {
                return Err(StageError::not_found(Namespace::Converted, name));
            }
            inputs.push(path);
        }

        let output_name = merged_name(names[0].as_ref());
        let output_path = self.store.path(Namespace::Merged, &output_name)?;
        let staging = self.store.staging_file(Namespace::Merged)?;

        let start = Instant::now();
        info!(inputs = names.len(), output = %output_name, "Merging PDFs");

        let engine = Arc::clone(&self.engine);
        let target = staging.to_path_buf();
        let options = self.options;
        let result = tokio::task::spawn_blocking(move || engine.merge(&inputs, &target, &options))
            .await
            .map_err(|e| StageError::Internal(format!("Merge task panicked: {}", e)))?;

        if let Err(e) = result {
            warn!(output = %output_name, "Merge failed: {}", e);
            return Err(e);
        }

        staging
            .persist(&output_path)
            .map_err(|e| StageError::io(&output_path, e.error))?;

        info!(
            output = %output_name,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "PDFs merged"
        );
        Ok(output_name)
    }
}
