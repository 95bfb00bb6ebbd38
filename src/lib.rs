//! # edgequake-pdfstage
//!
//! Stage user documents through ingest, PDF conversion, merge and retrieval,
//! backed by a plain filesystem store.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload
//!  │
//!  ├─ 1. Ingest    store bytes in Incoming under the caller's file name
//!  ├─ 2. Convert   Incoming → Converted (<stem>.pdf) via LibreOffice;
//!  │               PDF uploads are copied as-is
//!  ├─ 3. Merge     ≥ 2 Converted PDFs → Merged (merged_<first>) via pdfium
//!  └─ 4. Retrieve  serve from Merged, else Converted; never from Incoming
//! ```
//!
//! Each namespace is its own directory. Artifacts are whole files written
//! through a staging file and an atomic rename; the last writer of a name
//! wins.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_pdfstage::{StageConfig, StageService};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StageConfig::builder().root("/var/lib/pdfstage").build()?;
//!     let service = StageService::new(config).await?;
//!
//!     service.ingest_bytes("a.pdf", &std::fs::read("a.pdf")?).await?;
//!     service.ingest_bytes("report.docx", &std::fs::read("report.docx")?).await?;
//!     let a = service.convert("a.pdf").await?;
//!     let report = service.convert("report.docx").await?;
//!     let merged = service.merge(&[a, report]).await?;
//!
//!     let download = service.open(&merged).await?;
//!     println!("{} ({} bytes)", download.content_disposition, download.len);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `pdfstage` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! ## External tools
//!
//! | Stage | Tool | Located via |
//! |-------|------|-------------|
//! | Convert | `libreoffice --headless` | `PATH`, or [`ConverterCommand`] |
//! | Merge   | pdfium shared library     | `PDFIUM_LIB_PATH`, working dir, system path |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod service;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ConverterCommand, MergeOptions, StageConfig, StageConfigBuilder};
pub use error::{ErrorKind, StageError};
pub use pipeline::convert::{CommandConverter, Converter, ConverterRun, DocumentConverter};
pub use pipeline::ingest::Ingestor;
pub use pipeline::merge::{MergeEngine, Merger, PdfiumMergeEngine};
pub use pipeline::retrieve::{Download, Resolved, Retriever};
pub use progress::{NoopProgressCallback, PipelineProgressCallback, ProgressCallback};
pub use service::{BatchEntry, RunOutput, StageService};
pub use store::{Artifact, Namespace, StageLayout, StageStore};
