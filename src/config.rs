//! Configuration types for the staged document pipeline.
//!
//! All pipeline behaviour is controlled through [`StageConfig`], built via its
//! [`StageConfigBuilder`]. The config is resolved once at startup, handed to
//! [`crate::store::StageStore::init`] and then shared read-only by every
//! component. Nothing in the library reads process-wide state after that.

use crate::error::StageError;
use crate::progress::ProgressCallback;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Configuration for the staged pipeline.
///
/// Built via [`StageConfig::builder()`] or using [`StageConfig::default()`].
///
/// # Example
/// ```rust
/// use edgequake_pdfstage::StageConfig;
///
/// let config = StageConfig::builder()
///     .root("/var/lib/pdfstage")
///     .concurrency(2)
///     .converter_timeout_secs(300)
///     .build()
///     .unwrap();
/// assert_eq!(config.converter.program, "libreoffice");
/// ```
#[derive(Clone)]
pub struct StageConfig {
    /// Base directory holding the three namespace directories. Default: `.`.
    pub root: PathBuf,

    /// Directory name (under `root`) for raw uploads. Default: `uploads`.
    pub incoming_dir: String,

    /// Directory name (under `root`) for converted PDFs. Default: `converted`.
    pub converted_dir: String,

    /// Directory name (under `root`) for merge outputs. Default: `merged`.
    pub merged_dir: String,

    /// External document-to-PDF converter invocation.
    pub converter: ConverterCommand,

    /// Kill the converter after this many seconds. Default: `None` (wait forever).
    ///
    /// The core itself imposes no timeout; this is the deployment-level knob.
    pub converter_timeout_secs: Option<u64>,

    /// Options handed to the merge engine.
    pub merge: MergeOptions,

    /// Maximum conversions in flight during [`crate::StageService::convert_batch`]. Default: 4.
    ///
    /// Each conversion holds one converter process, which is heavy
    /// (LibreOffice easily takes 200 MB). Keep this small. Values above 1 rely
    /// on [`ConverterCommand::isolate_profile`] when the converter is
    /// LibreOffice.
    pub concurrency: usize,

    /// Optional batch progress observer.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            incoming_dir: "uploads".to_string(),
            converted_dir: "converted".to_string(),
            merged_dir: "merged".to_string(),
            converter: ConverterCommand::default(),
            converter_timeout_secs: None,
            merge: MergeOptions::default(),
            concurrency: 4,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for StageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageConfig")
            .field("root", &self.root)
            .field("incoming_dir", &self.incoming_dir)
            .field("converted_dir", &self.converted_dir)
            .field("merged_dir", &self.merged_dir)
            .field("converter", &self.converter)
            .field("converter_timeout_secs", &self.converter_timeout_secs)
            .field("merge", &self.merge)
            .field("concurrency", &self.concurrency)
            .field(
                "progress_callback",
                &self
                    .progress_callback
                    .as_ref()
                    .map(|_| "<dyn PipelineProgressCallback>"),
            )
            .finish()
    }
}

impl StageConfig {
    /// Create a new builder for `StageConfig`.
    pub fn builder() -> StageConfigBuilder {
        StageConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`StageConfig`].
pub struct StageConfigBuilder {
    config: StageConfig,
}

impl fmt::Debug for StageConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl StageConfigBuilder {
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.config.root = root.into();
        self
    }

    pub fn incoming_dir(mut self, name: impl Into<String>) -> Self {
        self.config.incoming_dir = name.into();
        self
    }

    pub fn converted_dir(mut self, name: impl Into<String>) -> Self {
        self.config.converted_dir = name.into();
        self
    }

    pub fn merged_dir(mut self, name: impl Into<String>) -> Self {
        self.config.merged_dir = name.into();
        self
    }

    pub fn converter(mut self, converter: ConverterCommand) -> Self {
        self.config.converter = converter;
        self
    }

    pub fn converter_timeout_secs(mut self, secs: u64) -> Self {
        self.config.converter_timeout_secs = Some(secs);
        self
    }

    pub fn divider_page(mut self, v: bool) -> Self {
        self.config.merge.divider_page = v;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    /// Attach a progress observer for batch conversions.
    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<StageConfig, StageError> {
        let c = &self.config;
        if c.concurrency == 0 {
            return Err(StageError::InvalidConfig("Concurrency must be ≥ 1".into()));
        }
        if c.converter.program.trim().is_empty() {
            return Err(StageError::InvalidConfig(
                "Converter program must not be empty".into(),
            ));
        }

        let dirs = [
            ("incoming", &c.incoming_dir),
            ("converted", &c.converted_dir),
            ("merged", &c.merged_dir),
        ];
        for (label, dir) in dirs {
            if dir.trim().is_empty() {
                return Err(StageError::InvalidConfig(format!(
                    "{label} directory name must not be empty"
                )));
            }
        }
        for (i, (a_label, a)) in dirs.iter().enumerate() {
            for (b_label, b) in &dirs[i + 1..] {
                if a == b {
                    return Err(StageError::InvalidConfig(format!(
                        "{a_label} and {b_label} namespaces share the directory '{a}'"
                    )));
                }
            }
        }

        Ok(self.config)
    }
}

/// How to invoke the external document-to-PDF converter.
///
/// The core appends `--outdir <converted root> <input path>` to `args`, so the
/// default runs
/// `libreoffice --headless --convert-to pdf --outdir <dir> <input>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConverterCommand {
    /// Executable name or path. Default: `libreoffice`.
    pub program: String,
    /// Leading arguments placed before `--outdir`.
    pub args: Vec<String>,
    /// Give every run a private LibreOffice user profile
    /// (`-env:UserInstallation=file://<tempdir>`). Default: `true`.
    ///
    /// LibreOffice processes sharing one profile hand their work to the
    /// first instance and exit 0 without output, so concurrent conversions
    /// need this. Turn it off for converters that reject the switch.
    #[serde(default = "default_isolate_profile")]
    pub isolate_profile: bool,
}

fn default_isolate_profile() -> bool {
    true
}

impl Default for ConverterCommand {
    fn default() -> Self {
        Self {
            program: "libreoffice".to_string(),
            args: vec![
                "--headless".to_string(),
                "--convert-to".to_string(),
                "pdf".to_string(),
            ],
            isolate_profile: true,
        }
    }
}

impl ConverterCommand {
    /// A converter with the given program and the default headless arguments.
    pub fn program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }
}

/// Options handed to the merge engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    /// Insert a blank page between consecutive inputs. Default: `false`.
    pub divider_page: bool,
}
