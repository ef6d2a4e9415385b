//! CLI binary for recipe-extract.
//!
//! A thin shim over the library crate that maps CLI flags
//! to `ExtractionOptions` and prints results.

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use recipe_extract::{
    ExtractionMethod, ExtractionOptions, ExtractionOutput, ExtractionSource, Extractor,
    OcrService, ProgressCallback, ProgressSink,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
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

// ── CLI progress sink using indicatif ────────────────────────────────────────

/// Renders the 0–100 progress stream as a single bar.
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Arc<Self> {
        let bar = ProgressBar::new(100);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  [{bar:42.green/238}] {pos:>3}%  ⏱ {elapsed_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]);
        bar.set_style(style);
        bar.set_prefix("Extracting");
        bar.enable_steady_tick(Duration::from_millis(80));
        Arc::new(Self { bar })
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for CliProgress {
    fn report(&self, percent: u8) {
        self.bar.set_position(u64::from(percent));
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Text-layer PDF (stdout)
  recipe-extract lasagne.pdf

  # Photo of a recipe card, OCR via a vision model
  recipe-extract card.jpg -o card.txt

  # Recipe PDF from a URL
  recipe-extract https://example.com/recipes/bread.pdf

  # JSON output with per-page results and stats
  recipe-extract --json cookbook.pdf > cookbook.json

  # Options from a JSON file, with flags taking precedence
  recipe-extract --options-json opts.json --max-pages 30 cookbook.pdf

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY               API key for the vision OCR endpoint
  RECIPE_EXTRACT_VISION_URL    OpenAI-compatible base URL (e.g. http://localhost:11434/v1)
  RECIPE_EXTRACT_VISION_MODEL  Vision model ID (default: gpt-4o-mini)
  PDFIUM_LIB_PATH              Path to libpdfium (file or directory)
  RUST_LOG                     Tracing filter, overrides -v/-q

Text-layer PDFs need no API key. OCR runs only for images and for PDFs
whose text layer is missing or too short.
"#;

/// Extract clean recipe text from PDFs and photos.
#[derive(Parser, Debug)]
#[command(
    name = "recipe-extract",
    version,
    about = "Extract clean recipe text from PDFs and photos",
    long_about = "Extract clean, normalised text from recipe PDFs (local files or URLs) and \
photos of recipe cards. Reads the PDF text layer first and falls back to OCR through an \
OpenAI-compatible vision endpoint only when the text layer is missing or too short.",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    /// Local PDF/image path or HTTP/HTTPS URL.
    input: String,

    /// Write text to this file instead of stdout.
    #[arg(short, long, env = "RECIPE_EXTRACT_OUTPUT")]
    output: Option<PathBuf>,

    /// Output structured JSON (ExtractionOutput) instead of plain text.
    #[arg(long, env = "RECIPE_EXTRACT_JSON")]
    json: bool,

    /// JSON file with extraction options; missing fields take defaults.
    #[arg(long, env = "RECIPE_EXTRACT_OPTIONS")]
    options_json: Option<PathBuf>,

    /// Maximum number of pages read from the text layer.
    #[arg(long, env = "RECIPE_EXTRACT_MAX_PAGES")]
    max_pages: Option<usize>,

    /// Pages extracted concurrently per batch.
    #[arg(long, env = "RECIPE_EXTRACT_BATCH_SIZE")]
    batch_size: Option<usize>,

    /// Documents with at most this many pages are read one page at a time.
    #[arg(long, env = "RECIPE_EXTRACT_DIRECT_THRESHOLD")]
    direct_threshold: Option<usize>,

    /// Overall timeout in seconds.
    #[arg(long, env = "RECIPE_EXTRACT_TIMEOUT")]
    timeout: Option<u64>,

    /// Minimum usable characters before OCR is tried.
    #[arg(long, env = "RECIPE_EXTRACT_MIN_CHARS")]
    min_chars: Option<usize>,

    /// Page rendered for OCR (1-indexed).
    #[arg(long, env = "RECIPE_EXTRACT_OCR_PAGE")]
    ocr_page: Option<usize>,

    /// Render scale for OCR.
    #[arg(long, env = "RECIPE_EXTRACT_RENDER_SCALE")]
    render_scale: Option<f32>,

    /// HTTP download timeout in seconds.
    #[arg(long, env = "RECIPE_EXTRACT_DOWNLOAD_TIMEOUT")]
    download_timeout: Option<u64>,

    /// Disable progress bar.
    #[arg(long, env = "RECIPE_EXTRACT_NO_PROGRESS")]
    no_progress: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, env = "RECIPE_EXTRACT_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, env = "RECIPE_EXTRACT_QUIET")]
    quiet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // The progress bar replaces INFO logs unless -v is given.
    let show_progress = !cli.quiet && !cli.no_progress && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let options = build_options(&cli)?;

    let bar = show_progress.then(CliProgress::new);
    let progress: Option<ProgressCallback> = bar
        .as_ref()
        .map(|b| Arc::clone(b) as ProgressCallback);

    // ── Run extraction ───────────────────────────────────────────────────
    let source = ExtractionSource::parse(&cli.input);
    let handle = Extractor::with_defaults().spawn(source, progress, options);
    let cancel = handle.cancellation_token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = handle.wait().await;
    ctrl_c.abort();
    if let Some(bar) = &bar {
        bar.finish();
    }
    OcrService::shutdown_global().await;

    let output = result.with_context(|| format!("Extraction failed for {}", cli.input))?;

    // ── Write result ─────────────────────────────────────────────────────
    let rendered = if cli.json {
        serde_json::to_string_pretty(&output).context("Failed to serialize output")?
    } else {
        output.text.clone()
    };

    match &cli.output {
        Some(path) => {
            tokio::fs::write(path, rendered.as_bytes())
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        None => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(rendered.as_bytes())?;
            stdout.write_all(b"\n")?;
        }
    }

    if !cli.quiet {
        print_summary(&output, cli.output.as_ref());
    }
    Ok(())
}

fn build_options(cli: &Cli) -> Result<ExtractionOptions> {
    let base = match &cli.options_json {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            ExtractionOptions::from_json(&json)?
        }
        None => ExtractionOptions::default(),
    };

    let mut builder = base.into_builder();
    if let Some(n) = cli.max_pages {
        builder = builder.max_pages(n);
    }
    if let Some(n) = cli.batch_size {
        builder = builder.batch_size(n);
    }
    if let Some(n) = cli.direct_threshold {
        builder = builder.direct_threshold(n);
    }
    if let Some(secs) = cli.timeout {
        builder = builder.overall_timeout_ms(secs.saturating_mul(1000));
    }
    if let Some(n) = cli.min_chars {
        builder = builder.min_usable_chars(n);
    }
    if let Some(page) = cli.ocr_page {
        builder = builder.ocr_page(page);
    }
    if let Some(scale) = cli.render_scale {
        builder = builder.render_scale(scale);
    }
    if let Some(secs) = cli.download_timeout {
        builder = builder.download_timeout_ms(secs.saturating_mul(1000));
    }

    builder.build().context("Invalid options")
}

fn print_summary(output: &ExtractionOutput, path: Option<&PathBuf>) {
    let stats = &output.stats;
    let method = match output.method {
        ExtractionMethod::Direct => "text layer",
        ExtractionMethod::Chunked => "text layer (batched)",
        ExtractionMethod::Ocr => "OCR",
    };
    let marker = if stats.failed_pages == 0 {
        green("✔")
    } else {
        red("⚠")
    };
    let target = path
        .map(|p| format!("  →  {}", p.display()))
        .unwrap_or_default();
    eprintln!(
        "{}  {}  {} chars  {}  {}{}",
        marker,
        bold(method),
        output.text.chars().count(),
        dim(&format!(
            "{}/{} pages, {} failed",
            stats.attempted_pages, stats.total_pages, stats.failed_pages
        )),
        dim(&format!("{}ms", stats.total_duration_ms)),
        target,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options_for(args: &[&str]) -> Result<ExtractionOptions> {
        let mut argv = vec!["recipe-extract"];
        argv.extend_from_slice(args);
        argv.push("lasagne.pdf");
        build_options(&Cli::parse_from(argv))
    }

    #[test]
    fn batch_size_flag_is_clamped() {
        let o = options_for(&["--batch-size", "500"]).unwrap();
        assert_eq!(o.batch_size, 10);
    }

    #[test]
    fn huge_timeouts_saturate() {
        let max = u64::MAX.to_string();
        let o = options_for(&["--timeout", &max, "--download-timeout", &max]).unwrap();
        assert_eq!(o.overall_timeout_ms, u64::MAX);
        assert_eq!(o.download_timeout_ms, u64::MAX);
    }

    #[test]
    fn flags_override_options_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opts.json");
        std::fs::write(&path, r#"{"max_pages": 30, "min_usable_chars": 50}"#).unwrap();
        let path = path.to_string_lossy().into_owned();
        let o = options_for(&["--options-json", &path, "--max-pages", "5"]).unwrap();
        assert_eq!(o.max_pages, 5);
        assert_eq!(o.min_usable_chars, 50);
    }

    #[test]
    fn invalid_scale_is_rejected() {
        assert!(options_for(&["--render-scale", "0"]).is_err());
    }
}
