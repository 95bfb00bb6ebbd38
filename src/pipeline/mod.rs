//! Pipeline stages of the document pipeline.
//!
//! Each submodule implements exactly one stage. Stages only read from earlier
//! namespaces and only write to their own, so a stage can be exercised in
//! isolation against a scratch [`crate::store::StageStore`].
//!
//! ## Data Flow
//!
//! ```text
//! ingest ──▶ convert ──▶ merge ──▶ retrieve
//! (Incoming)  (Converted)  (Merged)   (Merged, then Converted)
//! ```
//!
//! 1. [`ingest`]  : write an upload into Incoming under its own name
//! 2. [`convert`] : produce `<stem>.pdf` in Converted, via the external
//!    converter or a straight copy for PDF uploads
//! 3. [`merge`]   : concatenate ≥ 2 Converted PDFs into `merged_<first>`;
//!    the merge engine runs in `spawn_blocking`
//! 4. [`retrieve`]: find a servable artifact, preferring the most processed
//!    copy; raw uploads are never served

pub mod convert;
pub mod ingest;
pub mod merge;
pub mod retrieve;
