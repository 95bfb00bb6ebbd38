//! Progress-callback trait for batch conversion events.
//!
//! Inject an [`Arc<dyn PipelineProgressCallback>`] via
//! [`crate::config::StageConfigBuilder::progress_callback`] to be told as each
//! document of a [`crate::StageService::convert_batch`] call starts, succeeds
//! or fails.
//!
//! # Example
//!
//! ```rust
//! use edgequake_pdfstage::{PipelineProgressCallback, StageConfig};
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct CountingCallback {
//!     converted: AtomicUsize,
//! }
//!
//! impl PipelineProgressCallback for CountingCallback {
//!     fn on_document_complete(&self, name: &str, output: &str, _index: usize, _total: usize) {
//!         self.converted.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("{name} -> {output}");
//!     }
//! }
//!
//! let counter = Arc::new(CountingCallback { converted: AtomicUsize::new(0) });
//!
//! let config = StageConfig::builder()
//!     .progress_callback(counter as Arc<dyn PipelineProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use std::sync::Arc;

/// Called by the batch converter as it processes each document.
///
/// Conversions run concurrently, so `on_document_*` may be called from
/// several tasks at once. All methods default to no-ops.
pub trait PipelineProgressCallback: Send + Sync {
    /// Called once before any conversion starts.
    fn on_batch_start(&self, total: usize) {
        let _ = total;
    }

    /// Called just before a document is handed to the converter.
    ///
    /// `index` is the 1-based position of `name` in the request.
    fn on_document_start(&self, name: &str, index: usize, total: usize) {
        let _ = (name, index, total);
    }

    /// Called when `name` was converted into the Converted artifact `output`.
    fn on_document_complete(&self, name: &str, output: &str, index: usize, total: usize) {
        let _ = (name, output, index, total);
    }

    /// Called when converting `name` failed.
    fn on_document_error(&self, name: &str, index: usize, total: usize, error: &str) {
        let _ = (name, index, total, error);
    }

    /// Called once after every document has been attempted.
    fn on_batch_complete(&self, total: usize, success_count: usize) {
        let _ = (total, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl PipelineProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::StageConfig`].
pub type ProgressCallback = Arc<dyn PipelineProgressCallback>;
