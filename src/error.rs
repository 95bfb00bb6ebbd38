//! Error types for the edgequake-pdfstage library.
//!
//! Every stage operation returns exactly one [`StageError`]. The variants map
//! one-to-one onto the outward failure classes a transport layer needs
//! (see [`ErrorKind`]):
//!
//! * **Validation**: the request itself is malformed or insufficient
//!   (fewer than two merge inputs, an empty upload).
//! * **NotFound**: a referenced artifact is absent from the namespace the
//!   stage reads from.
//! * **Conversion**: the external converter failed or left no verifiable
//!   output. The tool's captured output travels in `detail`.
//! * **Merge**: the merge engine reported a failure.
//! * **Io**: a local read, write or copy failed.
//!
//! Nothing here is retried by the library. A failed request never touches
//! artifacts it did not name, so no error is fatal to the process.

use crate::store::Namespace;
use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the edgequake-pdfstage library.
#[derive(Debug, Error)]
pub enum StageError {
    // ── Request errors ────────────────────────────────────────────────────
    /// The request is malformed or insufficient.
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The named artifact does not exist in the expected namespace.
    #[error("File not found: {name} (looked in {namespace})")]
    NotFound { namespace: Namespace, name: String },

    // ── Collaborator errors ───────────────────────────────────────────────
    /// The external converter failed or produced no output file.
    #[error("Failed to convert document '{name}': {detail}")]
    Conversion { name: String, detail: String },

    /// The merge engine failed.
    #[error("Failed to merge PDFs: {detail}")]
    Merge { detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// A local filesystem operation failed.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation or store initialisation rejected the configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (e.g. a blocking task panicked).
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Outward failure class of a [`StageError`].
///
/// Transports map these to their own signals (HTTP 400/404/500, exit codes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conversion,
    Merge,
    Io,
}

impl StageError {
    /// Shorthand for an I/O failure on `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StageError::Io {
            path: path.into(),
            source,
        }
    }

    /// Shorthand for a missing artifact.
    pub fn not_found(namespace: Namespace, name: impl Into<String>) -> Self {
        StageError::NotFound {
            namespace,
            name: name.into(),
        }
    }

    /// Classify this error into its outward failure class.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StageError::Validation(_) | StageError::InvalidConfig(_) => ErrorKind::Validation,
            StageError::NotFound { .. } => ErrorKind::NotFound,
            StageError::Conversion { .. } => ErrorKind::Conversion,
            StageError::Merge { .. } => ErrorKind::Merge,
            StageError::Io { .. } | StageError::Internal(_) => ErrorKind::Io,
        }
    }

    /// `true` when the error reports a missing artifact.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}
