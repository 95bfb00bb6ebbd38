//! CLI binary for edgequake-pdfstage.
//!
//! A thin shim over the library crate that maps CLI flags to `StageConfig`,
//! runs one pipeline operation and prints the result.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use edgequake_pdfstage::{
    ConverterCommand, PipelineProgressCallback, ProgressCallback, StageConfig, StageService,
};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Terminal progress for batch conversion. Documents complete out of order
/// and a name may repeat, so start times are keyed by batch position.
struct CliProgressCallback {
    bar: ProgressBar,
    start_times: Mutex<HashMap<usize, Instant>>,
}

impl CliProgressCallback {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} documents  ⏱ {elapsed_precise}  {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);

        bar.set_style(style);
        bar.set_prefix("Converting");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self::with_bar(bar))
    }

    fn with_bar(bar: ProgressBar) -> Self {
        Self {
            bar,
            start_times: Mutex::new(HashMap::new()),
        }
    }

    fn elapsed_secs(&self, index: usize) -> f64 {
        self.start_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&index)
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }
}

impl PipelineProgressCallback for CliProgressCallback {
    fn on_batch_start(&self, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.reset_eta();
    }

    fn on_document_start(&self, name: &str, index: usize, _total: usize) {
        self.start_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(index, Instant::now());
        self.bar.set_message(name.to_string());
    }

    fn on_document_complete(&self, name: &str, output: &str, index: usize, _total: usize) {
        let secs = self.elapsed_secs(index);
        self.bar.println(format!(
            "  {} {}  →  {}  {}",
            green("✓"),
            name,
            bold(output),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_document_error(&self, name: &str, index: usize, _total: usize, error: &str) {
        let secs = self.elapsed_secs(index);

        // Converter output can run to pages; keep the first line only.
        let first_line = error.lines().next().unwrap_or(error);
        let msg: String = if first_line.chars().count() > 80 {
            first_line.chars().take(79).chain(['…']).collect()
        } else {
            first_line.to_string()
        };

        self.bar.println(format!(
            "  {} {}  {}  {}",
            red("✗"),
            name,
            red(&msg),
            dim(&format!("{secs:.1}s")),
        ));
        self.bar.inc(1);
    }

    fn on_batch_complete(&self, total: usize, success_count: usize) {
        self.bar.finish_and_clear();
        let failed = total.saturating_sub(success_count);
        if failed == 0 {
            eprintln!(
                "{} {} documents converted",
                green("✔"),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} {}/{} documents converted  ({} failed)",
                if failed == total { red("✘") } else { cyan("⚠") },
                bold(&success_count.to_string()),
                total,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Upload, convert and merge in one go; copy the result out
  pdfstage run cover.docx chapter1.odt appendix.pdf -o book.pdf

  # Step by step
  pdfstage ingest report.docx
  pdfstage ingest a.pdf
  pdfstage convert report.docx a.pdf
  pdfstage merge a.pdf report.pdf
  pdfstage resolve merged_a.pdf -o merged.pdf

  # List what each stage holds
  pdfstage list

STORE LAYOUT (under --root):
  uploads/     raw uploads (never served)
  converted/   <stem>.pdf per converted upload
  merged/      merged_<first input>

ENVIRONMENT VARIABLES:
  PDFSTAGE_ROOT              Store root directory
  PDFSTAGE_CONVERTER         Converter program (default: libreoffice)
  PDFSTAGE_CONVERT_TIMEOUT   Kill the converter after N seconds
  PDFIUM_LIB_PATH            Path to libpdfium (file or directory) for merging
"#;

/// Stage documents through ingest, PDF conversion, merge and retrieval.
#[derive(Parser, Debug)]
#[command(
    name = "pdfstage",
    version,
    about = "Stage documents through ingest, PDF conversion, merge and retrieval",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Store root holding the uploads/, converted/ and merged/ directories.
    #[arg(long, global = true, env = "PDFSTAGE_ROOT", default_value = ".")]
    root: PathBuf,

    /// Converter program, invoked as `<program> --headless --convert-to pdf --outdir <dir> <file>`.
    #[arg(long, global = true, env = "PDFSTAGE_CONVERTER", default_value = "libreoffice")]
    converter: String,

    /// Let every converter run share the default LibreOffice profile.
    /// Only safe with --concurrency 1.
    #[arg(long, global = true, env = "PDFSTAGE_SHARED_PROFILE")]
    shared_profile: bool,

    /// Kill the converter after this many seconds.
    #[arg(long, global = true, env = "PDFSTAGE_CONVERT_TIMEOUT")]
    convert_timeout: Option<u64>,

    /// Maximum concurrent conversions.
    #[arg(short, long, global = true, env = "PDFSTAGE_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,

    /// Insert a blank page between merged documents.
    #[arg(long, global = true, env = "PDFSTAGE_DIVIDER_PAGE")]
    divider_page: bool,

    /// Print results as JSON.
    #[arg(long, global = true, env = "PDFSTAGE_JSON")]
    json: bool,

    /// Disable progress bar.
    #[arg(long, global = true, env = "PDFSTAGE_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PDFSTAGE_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PDFSTAGE_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a local file in the Incoming stage.
    Ingest {
        file: PathBuf,
        /// Store under this name instead of the file's own name.
        #[arg(long)]
        name: Option<String>,
    },
    /// Convert uploaded documents to PDF.
    Convert {
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Merge two or more converted PDFs, in the given order.
    Merge {
        #[arg(required = true, num_args = 2..)]
        names: Vec<String>,
    },
    /// Find a merged or converted PDF; optionally copy it out.
    Resolve {
        name: String,
        /// Copy the PDF here ("-" for stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List the artifacts held by each stage.
    List,
    /// Ingest, convert and (for two or more files) merge local files.
    Run {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Copy the final PDF here ("-" for stdout).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else if show_progress {
        "warn"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    // ── Build service ────────────────────────────────────────────────────
    let progress: Option<ProgressCallback> = if show_progress {
        Some(CliProgressCallback::new() as Arc<dyn PipelineProgressCallback>)
    } else {
        None
    };
    let config = build_config(&cli, progress)?;
    let service = StageService::new(config)
        .await
        .context("Failed to initialise stage store")?;

    match &cli.command {
        Command::Ingest { file, name } => {
            let stored = service
                .ingest_file(file, name.as_deref())
                .await
                .with_context(|| format!("Failed to ingest {}", file.display()))?;
            report(&cli, json!({ "filename": stored }), || {
                format!("{} uploaded as {}", green("✔"), bold(&stored))
            });
        }

        Command::Convert { names } => {
            let entries = service.convert_batch(names).await;
            let mut first_error = None;
            let mut results = Vec::with_capacity(entries.len());
            for entry in entries {
                match entry.result {
                    Ok(out) => {
                        if !show_progress {
                            report(&cli, json!(null), || format!("{} → {}", entry.input, out));
                        }
                        results.push(json!({ "input": entry.input, "filename": out }));
                    }
                    Err(e) => {
                        results.push(json!({
                            "input": entry.input,
                            "error": e.to_string(),
                            "kind": e.kind(),
                        }));
                        first_error.get_or_insert(e);
                    }
                }
            }
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            }
            if let Some(e) = first_error {
                return Err(e).context("Conversion failed");
            }
        }

        Command::Merge { names } => {
            let merged = service.merge(names).await.context("Merge failed")?;
            report(&cli, json!({ "filename": merged }), || {
                format!("{} merged into {}", green("✔"), bold(&merged))
            });
        }

        Command::Resolve { name, output } => {
            let resolved = service.resolve(name).await.context("Lookup failed")?;
            if let Some(out) = output {
                copy_out(&resolved.path, out).await?;
            }
            report(&cli, serde_json::to_value(&resolved)?, || {
                format!("{}  {}", dim(resolved.namespace.as_str()), resolved.path.display())
            });
        }

        Command::List => {
            let mut listing = serde_json::Map::new();
            for ns in edgequake_pdfstage::Namespace::ALL {
                let names = service.store().list(ns).await?;
                if !cli.json && !cli.quiet {
                    println!("{}", bold(&format!("{ns}/")));
                    for n in &names {
                        println!("  {n}");
                    }
                }
                listing.insert(ns.to_string(), json!(names));
            }
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&listing)?);
            }
        }

        Command::Run { files, output } => {
            let start = Instant::now();
            let run = service.run(files).await.context("Pipeline run failed")?;
            if let Some(out) = output {
                let resolved = service.resolve(&run.output).await?;
                copy_out(&resolved.path, out).await?;
            }
            report(&cli, serde_json::to_value(&run)?, || {
                format!(
                    "{}  {} documents  {}ms  →  {}",
                    green("✔"),
                    run.converted.len(),
                    start.elapsed().as_millis(),
                    bold(&run.output)
                )
            });
        }
    }

    Ok(())
}

/// Map CLI args to `StageConfig`.
fn build_config(cli: &Cli, progress: Option<ProgressCallback>) -> Result<StageConfig> {
    let mut builder = StageConfig::builder()
        .root(&cli.root)
        .converter(ConverterCommand {
            isolate_profile: !cli.shared_profile,
            ..ConverterCommand::program(&cli.converter)
        })
        .concurrency(cli.concurrency)
        .divider_page(cli.divider_page);

    if let Some(secs) = cli.convert_timeout {
        builder = builder.converter_timeout_secs(secs);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Print `value` as JSON in `--json` mode, otherwise the human line to stderr.
fn report(cli: &Cli, value: serde_json::Value, human: impl FnOnce() -> String) {
    if cli.json {
        if !value.is_null() {
            match serde_json::to_string_pretty(&value) {
                Ok(s) => println!("{s}"),
                Err(e) => eprintln!("{} {e}", red("✗")),
            }
        }
    } else if !cli.quiet {
        eprintln!("{}", human());
    }
}

/// Copy a stored PDF to `dest`, or to stdout when `dest` is `-`.
async fn copy_out(src: &Path, dest: &Path) -> Result<()> {
    if dest == Path::new("-") {
        let mut file = tokio::fs::File::open(src)
            .await
            .with_context(|| format!("Failed to open {}", src.display()))?;
        tokio::io::copy(&mut file, &mut tokio::io::stdout())
            .await
            .context("Failed to write to stdout")?;
    } else {
        tokio::fs::copy(src, dest)
            .await
            .with_context(|| format!("Failed to write {}", dest.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_names_keep_separate_start_times() {
        let cb = CliProgressCallback::with_bar(ProgressBar::hidden());
        cb.on_batch_start(2);
        cb.on_document_start("a.docx", 1, 2);
        cb.on_document_start("a.docx", 2, 2);
        assert_eq!(cb.start_times.lock().unwrap().len(), 2);

        cb.on_document_complete("a.docx", "a.pdf", 1, 2);
        let times = cb.start_times.lock().unwrap();
        assert_eq!(times.len(), 1);
        assert!(times.contains_key(&2));
    }
}
