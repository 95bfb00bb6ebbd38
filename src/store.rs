//! Filesystem-backed stage store: three disjoint namespaces of named artifacts.
//!
//! ## Layout
//!
//! ```text
//! <root>/
//!  ├─ uploads/     Incoming   raw uploads, never served directly
//!  ├─ converted/   Converted  one PDF per converted upload
//!  └─ merged/      Merged     merge outputs (merged_<first input>)
//! ```
//!
//! An artifact name maps 1:1 to a file name inside its namespace directory.
//! There is no manifest: existence is a filesystem lookup at call time.
//!
//! ## Write semantics
//!
//! Every write goes to a hidden staging file in the target directory and is
//! renamed onto the final name once complete. Readers therefore never see a
//! half-written artifact. Two writers racing on the same name both succeed;
//! whichever rename lands last wins.

use crate::config::StageConfig;
use crate::error::StageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tempfile::{TempDir, TempPath};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info};

/// Prefix of in-flight staging files. Names with this prefix are reserved.
const STAGING_PREFIX: &str = ".stage-";

/// One of the three pipeline stages an artifact can live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Namespace {
    /// Raw uploads.
    Incoming,
    /// PDFs produced by the converter (or copied PDF uploads).
    Converted,
    /// Merge outputs.
    Merged,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Namespace::Incoming, Namespace::Converted, Namespace::Merged];

    pub fn as_str(&self) -> &'static str {
        match self {
            Namespace::Incoming => "incoming",
            Namespace::Converted => "converted",
            Namespace::Merged => "merged",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored artifact. The bytes stay on disk, owned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub namespace: Namespace,
    pub name: String,
    pub path: PathBuf,
    pub len: u64,
}

/// The resolved physical directories of the three namespaces.
///
/// Built once by [`StageStore::init`] and never relocated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageLayout {
    pub incoming: PathBuf,
    pub converted: PathBuf,
    pub merged: PathBuf,
}

impl StageLayout {
    pub fn dir(&self, namespace: Namespace) -> &Path {
        match namespace {
            Namespace::Incoming => &self.incoming,
            Namespace::Converted => &self.converted,
            Namespace::Merged => &self.merged,
        }
    }
}

/// Reject names that would escape their namespace directory.
///
/// Names are otherwise stored exactly as given: no renaming, no case folding.
pub fn validate_name(name: &str) -> Result<(), StageError> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(StageError::Validation(format!(
            "'{name}' is not a valid file name"
        )));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(StageError::Validation(format!(
            "file name '{name}' must not contain path separators"
        )));
    }
    if name.starts_with(STAGING_PREFIX) {
        return Err(StageError::Validation(format!(
            "file name '{name}' uses the reserved prefix '{STAGING_PREFIX}'"
        )));
    }
    Ok(())
}

/// The stage store. Cheap to share behind an `Arc`; holds no mutable state.
#[derive(Debug, Clone)]
pub struct StageStore {
    layout: StageLayout,
}

impl StageStore {
    /// Create the namespace directories under `config.root` and pin their paths.
    ///
    /// Creating directories that already exist is a no-op, so initialising
    /// twice against the same root is harmless. Fails with
    /// [`StageError::InvalidConfig`] when two namespaces resolve to the same
    /// physical directory (e.g. through a symlink).
    pub async fn init(config: &StageConfig) -> Result<Self, StageError> {
        let mut dirs = Vec::with_capacity(3);
        for dir_name in [
            &config.incoming_dir,
            &config.converted_dir,
            &config.merged_dir,
        ] {
            let dir = config.root.join(dir_name);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| StageError::io(&dir, e))?;
            let canonical = tokio::fs::canonicalize(&dir)
                .await
                .map_err(|e| StageError::io(&dir, e))?;
            dirs.push(canonical);
        }

        for i in 0..dirs.len() {
            for j in i + 1..dirs.len() {
                if dirs[i] == dirs[j] {
                    return Err(StageError::InvalidConfig(format!(
                        "{} and {} namespaces alias the same directory {}",
                        Namespace::ALL[i],
                        Namespace::ALL[j],
                        dirs[i].display()
                    )));
                }
            }
        }

        let mut dirs = dirs.into_iter();
        let layout = StageLayout {
            incoming: dirs.next().unwrap_or_default(),
            converted: dirs.next().unwrap_or_default(),
            merged: dirs.next().unwrap_or_default(),
        };
        info!(
            incoming = %layout.incoming.display(),
            converted = %layout.converted.display(),
            merged = %layout.merged.display(),
            "Stage store ready"
        );
        Ok(Self { layout })
    }

    pub fn layout(&self) -> &StageLayout {
        &self.layout
    }

    pub fn dir(&self, namespace: Namespace) -> &Path {
        self.layout.dir(namespace)
    }

    /// Physical path of `name` in `namespace`. Does not check existence.
    pub fn path(&self, namespace: Namespace, name: &str) -> Result<PathBuf, StageError> {
        validate_name(name)?;
        Ok(self.dir(namespace).join(name))
    }

    /// `true` if `name` currently exists as a file in `namespace`.
    ///
    /// Invalid names never exist.
    pub async fn exists(&self, namespace: Namespace, name: &str) -> bool {
        match self.path(namespace, name) {
            Ok(path) => tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Store `bytes` as `name` in `namespace`, replacing any previous artifact.
    pub async fn put(
        &self,
        namespace: Namespace,
        name: &str,
        bytes: &[u8],
    ) -> Result<Artifact, StageError> {
        let mut reader = bytes;
        self.put_stream(namespace, name, &mut reader).await
    }

    /// Stream `reader` into `name` in `namespace`, replacing any previous artifact.
    ///
    /// The data lands in a staging file first and is renamed into place only
    /// after the stream is fully written and flushed.
    pub async fn put_stream<R>(
        &self,
        namespace: Namespace,
        name: &str,
        reader: &mut R,
    ) -> Result<Artifact, StageError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let path = self.path(namespace, name)?;
        let staging = self.staging_file(namespace)?;

        let mut file = tokio::fs::File::create(&staging)
            .await
            .map_err(|e| StageError::io(&*staging, e))?;
        let len = tokio::io::copy(reader, &mut file)
            .await
            .map_err(|e| StageError::io(&path, e))?;
        file.flush().await.map_err(|e| StageError::io(&path, e))?;
        file.sync_all().await.map_err(|e| StageError::io(&path, e))?;
        drop(file);

        staging
            .persist(&path)
            .map_err(|e| StageError::io(&path, e.error))?;

        debug!(namespace = %namespace, name, bytes = len, "Artifact written");
        Ok(Artifact {
            namespace,
            name: name.to_string(),
            path,
            len,
        })
    }

    /// Open `name` in `namespace` for reading.
    pub async fn open(
        &self,
        namespace: Namespace,
        name: &str,
    ) -> Result<tokio::fs::File, StageError> {
        let path = self.path(namespace, name)?;
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StageError::not_found(namespace, name))
            }
            Err(e) => Err(StageError::io(path, e)),
        }
    }

    /// Read the whole artifact into memory.
    pub async fn read(&self, namespace: Namespace, name: &str) -> Result<Vec<u8>, StageError> {
        let path = self.path(namespace, name)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StageError::not_found(namespace, name))
            }
            Err(e) => Err(StageError::io(path, e)),
        }
    }

    /// Sorted names of every artifact in `namespace`. Staging files are skipped.
    pub async fn list(&self, namespace: Namespace) -> Result<Vec<String>, StageError> {
        let dir = self.dir(namespace);
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| StageError::io(dir, e))?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StageError::io(dir, e))?
        {
            let is_file = entry
                .file_type()
                .await
                .map(|t| t.is_file())
                .unwrap_or(false);
            let name = entry.file_name().to_string_lossy().to_string();
            if is_file && !name.starts_with(STAGING_PREFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// A fresh staging path inside `namespace`, deleted on drop unless persisted.
    ///
    /// Living in the same directory as the final artifact keeps the closing
    /// rename on one filesystem, where it is atomic.
    pub fn staging_file(&self, namespace: Namespace) -> Result<TempPath, StageError> {
        let dir = self.dir(namespace);
        tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .suffix(".tmp")
            .tempfile_in(dir)
            .map(|f| f.into_temp_path())
            .map_err(|e| StageError::io(dir, e))
    }

    /// A fresh staging directory inside `namespace`, removed with its contents
    /// on drop. [`list`](Self::list) never reports it.
    pub fn staging_dir(&self, namespace: Namespace) -> Result<TempDir, StageError> {
        let dir = self.dir(namespace);
        tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(dir)
            .map_err(|e| StageError::io(dir, e))
    }

    /// Rename the finished file `source` onto `name` in `namespace`,
    /// replacing any previous artifact.
    ///
    /// `source` must sit on the same filesystem as the namespace, which holds
    /// for anything inside [`staging_dir`](Self::staging_dir).
    pub async fn promote(
        &self,
        namespace: Namespace,
        name: &str,
        source: &Path,
    ) -> Result<Artifact, StageError> {
        let path = self.path(namespace, name)?;
        let len = tokio::fs::metadata(source)
            .await
            .map_err(|e| StageError::io(source, e))?
            .len();
        tokio::fs::rename(source, &path)
            .await
            .map_err(|e| StageError::io(&path, e))?;

        debug!(namespace = %namespace, name, bytes = len, "Artifact promoted");
        Ok(Artifact {
            namespace,
            name: name.to_string(),
            path,
            len,
        })
    }
}
