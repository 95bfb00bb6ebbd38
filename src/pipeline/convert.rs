//! Convert stage: turn one Incoming artifact into one Converted PDF.
//!
//! PDF uploads are already valid output and are copied byte-for-byte. Every
//! other format goes through the external converter, which picks the output
//! name itself (`<input stem>.pdf`).
//!
//! ## Success is the output file, not the exit code
//!
//! LibreOffice exits 0 in several situations where it wrote nothing (unknown
//! filter, locked profile, a source it silently refuses to load). Each call
//! therefore gets its own staging directory inside Converted as `--outdir`.
//! Only a `<stem>.pdf` found there after the process exits counts as output;
//! it is then renamed onto the Converted name. Anything else is a
//! [`StageError::Conversion`] carrying the tool's captured output, and an
//! earlier artifact of the same name is left untouched.

use crate::config::{ConverterCommand, StageConfig};
use crate::error::StageError;
use crate::store::{Namespace, StageStore};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of one external converter invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConverterRun {
    /// The process reported success.
    pub success: bool,
    /// Exit code, if the process exited normally.
    pub exit_code: Option<i32>,
    /// Captured stdout followed by stderr.
    pub output: String,
}

/// An out-of-process document-to-PDF converter.
///
/// Implementations write `<input stem>.pdf` into `out_dir`. Returning `Ok`
/// with `success == false` is how a tool failure is reported; `Err` is
/// reserved for failures to run the tool at all.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn run(&self, input: &Path, out_dir: &Path) -> Result<ConverterRun, StageError>;
}

/// Runs a converter command such as `libreoffice --headless --convert-to pdf`.
#[derive(Debug, Clone)]
pub struct CommandConverter {
    command: ConverterCommand,
    timeout: Option<Duration>,
}

impl CommandConverter {
    pub fn new(command: ConverterCommand, timeout_secs: Option<u64>) -> Self {
        Self {
            command,
            timeout: timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn from_config(config: &StageConfig) -> Self {
        Self::new(config.converter.clone(), config.converter_timeout_secs)
    }
}

#[async_trait]
impl DocumentConverter for CommandConverter {
    async fn run(&self, input: &Path, out_dir: &Path) -> Result<ConverterRun, StageError> {
        let input_name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| input.display().to_string());

        let profile = if self.command.isolate_profile {
            let dir = tempfile::Builder::new()
                .prefix("pdfstage-profile-")
                .tempdir()
                .map_err(|e| StageError::io(std::env::temp_dir(), e))?;
            Some(dir)
        } else {
            None
        };

        let mut cmd = tokio::process::Command::new(&self.command.program);
        cmd.args(&self.command.args);
        if let Some(dir) = &profile {
            cmd.arg(user_installation_arg(dir.path()));
        }
        cmd.arg("--outdir")
            .arg(out_dir)
            .arg(input)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // A timed-out wait drops the child; make sure that kills it.
            .kill_on_drop(true);

        debug!("Running converter: {:?}", cmd.as_std());
        let child = cmd.spawn().map_err(|e| StageError::Conversion {
            name: input_name.clone(),
            detail: format!("failed to start '{}': {}", self.command.program, e),
        })?;

        let wait = child.wait_with_output();
        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                StageError::Conversion {
                    name: input_name.clone(),
                    detail: format!("converter timed out after {}s", limit.as_secs()),
                }
            })?,
            None => wait.await,
        }
        .map_err(|e| StageError::Conversion {
            name: input_name.clone(),
            detail: format!("failed to wait for '{}': {}", self.command.program, e),
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(ConverterRun {
            success: output.status.success(),
            exit_code: output.status.code(),
            output: combined,
        })
    }
}

/// LibreOffice switch selecting `dir` as the user profile.
fn user_installation_arg(dir: &Path) -> String {
    let path = dir.to_string_lossy().replace('\\', "/");
    let path = if path.starts_with('/') {
        path
    } else {
        format!("/{path}")
    };
    format!(
        "-env:UserInstallation=file://{}",
        path.replace('%', "%25").replace(' ', "%20")
    )
}

/// `true` when `name` carries a `.pdf` extension, in any case.
pub fn is_pdf(name: &str) -> bool {
    Path::new(name)
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

/// Name the converter gives its output for input `name`: `<stem>.pdf`.
pub fn output_name(name: &str) -> String {
    let stem = Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    format!("{stem}.pdf")
}

/// The convert stage.
#[derive(Clone)]
pub struct Converter {
    store: Arc<StageStore>,
    engine: Arc<dyn DocumentConverter>,
}

impl Converter {
    pub fn new(store: Arc<StageStore>, engine: Arc<dyn DocumentConverter>) -> Self {
        Self { store, engine }
    }

    /// Convert the Incoming artifact `name` and return the Converted name.
    ///
    /// # Errors
    /// - [`StageError::Validation`] if `name` is not a single file name
    /// - [`StageError::NotFound`] if `name` is not in Incoming
    /// - [`StageError::Conversion`] if the copy or the external tool failed,
    ///   or the tool left no `<stem>.pdf` behind
    pub async fn convert(&self, name: &str) -> Result<String, StageError> {
        let input_path = self.store.path(Namespace::Incoming, name)?;
        if !self.store.exists(Namespace::Incoming, name).await {
            return Err(StageError::not_found(Namespace::Incoming, name));
        }

        if is_pdf(name) {
            return self.copy_pdf(name).await;
        }

        let start = Instant::now();
        let expected = output_name(name);
        info!(name, output = %expected, "Converting document");

        let staging = self.store.staging_dir(Namespace::Converted)?;
        let run = self.engine.run(&input_path, staging.path()).await?;

        if !run.success {
            let status = run
                .exit_code
                .map(|c| format!("exit status {c}"))
                .unwrap_or_else(|| "terminated by signal".to_string());
            warn!(name, %status, "Converter failed");
            return Err(StageError::Conversion {
                name: name.to_string(),
                detail: format!("conversion failed: {status}\nOutput: {}", run.output),
            });
        }

        let produced = staging.path().join(&expected);
        let is_file = tokio::fs::metadata(&produced)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !is_file {
            warn!(name, output = %expected, "Converter exited cleanly but wrote nothing");
            return Err(StageError::Conversion {
                name: name.to_string(),
                detail: format!(
                    "conversion failed: output file '{expected}' not found\nOutput: {}",
                    run.output
                ),
            });
        }

        let artifact = self
            .store
            .promote(Namespace::Converted, &expected, &produced)
            .await?;

        info!(
            name,
            output = %expected,
            bytes = artifact.len,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Document converted"
        );
        Ok(expected)
    }

    /// PDF inputs skip the converter: copy Incoming → Converted unchanged.
    async fn copy_pdf(&self, name: &str) -> Result<String, StageError> {
        let wrap = |e: StageError| StageError::Conversion {
            name: name.to_string(),
            detail: format!("failed to copy PDF file: {e}"),
        };

        let mut source = self.store.open(Namespace::Incoming, name).await.map_err(wrap)?;
        let artifact = self
            .store
            .put_stream(Namespace::Converted, name, &mut source)
            .await
            .map_err(wrap)?;

        info!(name, bytes = artifact.len, "PDF copied without conversion");
        Ok(artifact.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Writes `<stem>.pdf` unless told to misbehave.
    struct FakeConverter {
        calls: AtomicUsize,
        exit_ok: bool,
        write_output: bool,
    }

    impl FakeConverter {
        fn new(exit_ok: bool, write_output: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                exit_ok,
                write_output,
            })
        }
    }

    #[async_trait]
    impl DocumentConverter for FakeConverter {
        async fn run(&self, input: &Path, out_dir: &Path) -> Result<ConverterRun, StageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.write_output {
                let name = output_name(&input.file_name().unwrap().to_string_lossy());
                let body = tokio::fs::read(input).await.unwrap();
                tokio::fs::write(out_dir.join(name), [b"%PDF-".as_slice(), &body[..]].concat())
                    .await
                    .unwrap();
            }
            Ok(ConverterRun {
                success: self.exit_ok,
                exit_code: Some(if self.exit_ok { 0 } else { 1 }),
                output: "Error: source file could not be loaded".into(),
            })
        }
    }

    async fn setup(engine: Arc<FakeConverter>) -> (tempfile::TempDir, Arc<StageStore>, Converter) {
        let dir = tempfile::tempdir().unwrap();
        let config = StageConfig::builder().root(dir.path()).build().unwrap();
        let store = Arc::new(StageStore::init(&config).await.unwrap());
        let converter = Converter::new(Arc::clone(&store), engine);
        (dir, store, converter)
    }

    #[test]
    fn output_name_replaces_extension() {
        assert_eq!(output_name("report.docx"), "report.pdf");
        assert_eq!(output_name("archive.tar.gz"), "archive.tar.pdf");
        assert_eq!(output_name("README"), "README.pdf");
    }

    #[test]
    fn user_installation_is_a_file_url() {
        assert_eq!(
            user_installation_arg(Path::new("/tmp/pdfstage-profile-x")),
            "-env:UserInstallation=file:///tmp/pdfstage-profile-x"
        );
        assert_eq!(
            user_installation_arg(Path::new("/tmp/my profile")),
            "-env:UserInstallation=file:///tmp/my%20profile"
        );
    }

    #[test]
    fn pdf_detection_ignores_case() {
        assert!(is_pdf("a.pdf"));
        assert!(is_pdf("A.PDF"));
        assert!(is_pdf("scan.Pdf"));
        assert!(!is_pdf("a.pdf.docx"));
        assert!(!is_pdf("pdf"));
    }

    #[tokio::test]
    async fn pdf_input_is_copied_without_converter() {
        let engine = FakeConverter::new(true, true);
        let (_dir, store, converter) = setup(Arc::clone(&engine)).await;
        store.put(Namespace::Incoming, "Scan.PDF", b"%PDF-1.4 raw").await.unwrap();

        let out = converter.convert("Scan.PDF").await.unwrap();
        assert_eq!(out, "Scan.PDF");
        assert_eq!(
            store.read(Namespace::Converted, "Scan.PDF").await.unwrap(),
            b"%PDF-1.4 raw"
        );
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_pdf_goes_through_converter() {
        let engine = FakeConverter::new(true, true);
        let (_dir, store, converter) = setup(Arc::clone(&engine)).await;
        store.put(Namespace::Incoming, "report.docx", b"body").await.unwrap();

        let out = converter.convert("report.docx").await.unwrap();
        assert_eq!(out, "report.pdf");
        assert_eq!(
            store.read(Namespace::Converted, "report.pdf").await.unwrap(),
            b"%PDF-body"
        );
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_input_is_not_found() {
        let (_dir, _store, converter) = setup(FakeConverter::new(true, true)).await;
        let err = converter.convert("ghost.docx").await.unwrap_err();
        assert!(
            matches!(err, StageError::NotFound { namespace: Namespace::Incoming, .. }),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn failed_exit_surfaces_diagnostics() {
        let (_dir, store, converter) = setup(FakeConverter::new(false, false)).await;
        store.put(Namespace::Incoming, "bad.odt", b"x").await.unwrap();

        let err = converter.convert("bad.odt").await.unwrap_err();
        match err {
            StageError::Conversion { name, detail } => {
                assert_eq!(name, "bad.odt");
                assert!(detail.contains("exit status 1"), "got: {detail}");
                assert!(detail.contains("could not be loaded"), "got: {detail}");
            }
            other => panic!("expected Conversion, got {other}"),
        }
    }

    #[tokio::test]
    async fn clean_exit_without_output_is_failure() {
        let (_dir, store, converter) = setup(FakeConverter::new(true, false)).await;
        store.put(Namespace::Incoming, "silent.pptx", b"x").await.unwrap();

        let err = converter.convert("silent.pptx").await.unwrap_err();
        assert!(err.to_string().contains("silent.pdf"), "got: {err}");
        assert!(!store.exists(Namespace::Converted, "silent.pdf").await);
    }

    #[tokio::test]
    async fn earlier_output_does_not_mask_silent_failure() {
        let (_dir, store, converter) = setup(FakeConverter::new(true, false)).await;
        store.put(Namespace::Converted, "report.pdf", b"OLD v1").await.unwrap();
        store.put(Namespace::Incoming, "report.docx", b"NEW v2").await.unwrap();

        let err = converter.convert("report.docx").await.unwrap_err();
        assert!(matches!(err, StageError::Conversion { .. }), "got: {err}");
        assert_eq!(
            store.read(Namespace::Converted, "report.pdf").await.unwrap(),
            b"OLD v1"
        );
        // The per-call staging directory is gone too.
        let entries = std::fs::read_dir(store.dir(Namespace::Converted)).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn fresh_output_replaces_earlier_artifact() {
        let (_dir, store, converter) = setup(FakeConverter::new(true, true)).await;
        store.put(Namespace::Converted, "report.pdf", b"OLD v1").await.unwrap();
        store.put(Namespace::Incoming, "report.docx", b"NEW v2").await.unwrap();

        converter.convert("report.docx").await.unwrap();
        assert_eq!(
            store.read(Namespace::Converted, "report.pdf").await.unwrap(),
            b"%PDF-NEW v2"
        );
    }

    #[tokio::test]
    async fn path_like_name_is_validation_error() {
        let (_dir, _store, converter) = setup(FakeConverter::new(true, true)).await;
        let err = converter.convert("a/b.docx").await.unwrap_err();
        assert!(matches!(err, StageError::Validation(_)), "got: {err}");
    }

    #[cfg(unix)]
    mod command {
        use super::*;

        /// Runs the script through `sh` so the test never executes a file it
        /// just wrote (avoids ETXTBSY under parallel tests).
        fn sh_converter(
            dir: &Path,
            script: &str,
            timeout: Option<u64>,
            isolate_profile: bool,
        ) -> CommandConverter {
            let path = dir.join("fake-soffice.sh");
            std::fs::write(&path, script).unwrap();
            let mut args = vec![path.display().to_string()];
            args.extend(ConverterCommand::default().args);
            CommandConverter::new(
                ConverterCommand {
                    program: "sh".into(),
                    args,
                    isolate_profile,
                },
                timeout,
            )
        }

        #[tokio::test]
        async fn command_converter_passes_outdir_and_input() {
            let scripts = tempfile::tempdir().unwrap();
            // $1..$3 = --headless --convert-to pdf, $4 = --outdir, $5 = dir, $6 = input
            let engine = sh_converter(
                scripts.path(),
                "[ \"$4\" = --outdir ] || exit 9\n\
                 base=$(basename \"$6\")\n\
                 cp \"$6\" \"$5/${base%.*}.pdf\"\n\
                 echo \"convert $6 -> $5\"\n",
                None,
                false,
            );
            let (_dir, store, _) = setup(FakeConverter::new(true, true)).await;
            let converter = Converter::new(Arc::clone(&store), Arc::new(engine));
            store.put(Namespace::Incoming, "memo.txt", b"hello").await.unwrap();

            assert_eq!(converter.convert("memo.txt").await.unwrap(), "memo.pdf");
            assert_eq!(store.read(Namespace::Converted, "memo.pdf").await.unwrap(), b"hello");
        }

        #[tokio::test]
        async fn command_converter_captures_combined_output() {
            let scripts = tempfile::tempdir().unwrap();
            let engine = sh_converter(
                scripts.path(),
                "echo 'to stdout'\necho 'general I/O error' >&2\nexit 3\n",
                None,
                false,
            );
            let out_dir = tempfile::tempdir().unwrap();
            let run = engine
                .run(Path::new("/nonexistent/in.docx"), out_dir.path())
                .await
                .unwrap();
            assert!(!run.success);
            assert_eq!(run.exit_code, Some(3));
            assert!(run.output.contains("to stdout"));
            assert!(run.output.contains("general I/O error"));
        }

        #[tokio::test]
        async fn command_converter_times_out() {
            let scripts = tempfile::tempdir().unwrap();
            let engine = sh_converter(scripts.path(), "sleep 5\n", Some(1), false);
            let out_dir = tempfile::tempdir().unwrap();
            let err = engine
                .run(Path::new("in.docx"), out_dir.path())
                .await
                .unwrap_err();
            assert!(err.to_string().contains("timed out"), "got: {err}");
        }

        #[tokio::test]
        async fn each_run_gets_its_own_profile() {
            let scripts = tempfile::tempdir().unwrap();
            // Writes the UserInstallation switch it was given as the "PDF".
            let engine = sh_converter(
                scripts.path(),
                "for a in \"$@\"; do case \"$a\" in -env:UserInstallation=*) prof=\"$a\";; esac; done\n\
                 while [ \"$1\" != --outdir ]; do shift; done\n\
                 base=$(basename \"$3\")\n\
                 printf '%s' \"$prof\" > \"$2/${base%.*}.pdf\"\n",
                None,
                true,
            );
            let (out_a, out_b) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
            let (a, b) = tokio::join!(
                engine.run(Path::new("a.docx"), out_a.path()),
                engine.run(Path::new("b.docx"), out_b.path()),
            );
            assert!(a.unwrap().success && b.unwrap().success);

            let prof_a = std::fs::read_to_string(out_a.path().join("a.pdf")).unwrap();
            let prof_b = std::fs::read_to_string(out_b.path().join("b.pdf")).unwrap();
            assert!(prof_a.starts_with("-env:UserInstallation=file:///"), "got: {prof_a}");
            assert_ne!(prof_a, prof_b);

            let dir = prof_a.trim_start_matches("-env:UserInstallation=file://");
            assert!(!Path::new(dir).exists(), "profile {dir} outlived the run");
        }

        #[tokio::test]
        async fn missing_program_is_conversion_error() {
            let engine = CommandConverter::new(
                ConverterCommand::program("definitely-not-libreoffice-xyz"),
                None,
            );
            let out_dir = tempfile::tempdir().unwrap();
            let err = engine
                .run(Path::new("in.docx"), out_dir.path())
                .await
                .unwrap_err();
            assert!(matches!(err, StageError::Conversion { .. }), "got: {err}");
        }
    }
}
