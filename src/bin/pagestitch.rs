//! CLI binary for pagestitch.
//!
//! A thin shim over the library crate that maps CLI flags to
//! `PipelineConfig` and an `Orchestrator`, and renders run progress.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use page_store::DEFAULT_COLLECTION;
use pagestitch::adapter::{
    FileSink, Immediate, MessageSink, MutationClock, OutputSink, RenderReadySignal, SettleWindow,
    TemplateSource,
};
use pagestitch::{
    serve, ChunkCodec, FsPageStore, Notification, Orchestrator, PageStore, PipelineConfig,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
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

const AFTER_HELP: &str = r#"EXAMPLES:
  # Capture numbered page files, then merge them
  pagestitch capture './scans/page-{page:03}.pdf' --title "Field Notes" --merge

  # Capture pages served over HTTP (stops at the first 404)
  pagestitch capture 'https://example.com/book/p/{page}.pdf' --merge -o out/

  # Merge whatever is in the store right now
  pagestitch merge --title "My Book" -o out/

  # Drop stored pages / remove the store entirely
  pagestitch clear
  pagestitch destroy

  # Newline-delimited JSON protocol on stdin/stdout
  pagestitch host

PAGE TEMPLATES:
  {page}      1-based page index            page-{page}.pdf   → page-7.pdf
  {page:N}    index zero-padded to N digits page-{page:03}.pdf → page-007.pdf

ENVIRONMENT VARIABLES:
  PAGESTITCH_STORE_DIR    Page store root (default: platform data dir)
  PAGESTITCH_COLLECTION   Record directory inside the store
  RUST_LOG                Log filter, overrides --verbose/--quiet
"#;

/// Capture paginated documents page by page and stitch them into one PDF.
#[derive(Parser, Debug)]
#[command(
    name = "pagestitch",
    version,
    about = "Capture paginated documents page by page and stitch them into one PDF",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Page store root directory.
    #[arg(long, global = true, env = "PAGESTITCH_STORE_DIR")]
    store_dir: Option<PathBuf>,

    /// Record collection inside the store.
    #[arg(long, global = true, env = "PAGESTITCH_COLLECTION", default_value = DEFAULT_COLLECTION)]
    collection: String,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "PAGESTITCH_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "PAGESTITCH_QUIET")]
    quiet: bool,
}

#[derive(Args, Debug, Clone)]
struct TimingArgs {
    /// Wait for each page to settle before capturing it.
    #[arg(long, env = "PAGESTITCH_SETTLE")]
    settle: bool,

    /// Fixed settle delay in ms (with --settle).
    #[arg(long, env = "PAGESTITCH_SETTLE_DELAY_MS", default_value_t = 2000)]
    settle_delay_ms: u64,

    /// Required quiet window in ms (with --settle).
    #[arg(long, env = "PAGESTITCH_QUIET_WINDOW_MS", default_value_t = 2000)]
    quiet_window_ms: u64,

    /// Quiet-window poll interval in ms.
    #[arg(long, env = "PAGESTITCH_POLL_INTERVAL_MS", default_value_t = 100)]
    poll_interval_ms: u64,

    /// Extra capture attempts per page.
    #[arg(long, env = "PAGESTITCH_MAX_RETRIES", default_value_t = 2)]
    max_retries: u32,

    /// Initial retry backoff in ms (doubles per attempt).
    #[arg(long, env = "PAGESTITCH_RETRY_BACKOFF_MS", default_value_t = 500)]
    retry_backoff_ms: u64,

    /// Stop after this many pages.
    #[arg(long, env = "PAGESTITCH_MAX_PAGES",
          value_parser = clap::value_parser!(u32).range(1..))]
    max_pages: Option<u32>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Walk a page template and store every page.
    Capture {
        /// Page template: a path or http(s) URL containing {page}.
        template: String,

        /// Title used to name the merged file.
        #[arg(long)]
        title: Option<String>,

        /// Directory for the merged PDF.
        #[arg(short, long, env = "PAGESTITCH_OUTPUT_DIR", default_value = ".")]
        output_dir: PathBuf,

        /// Merge the stored pages once the last page is captured.
        #[arg(long)]
        merge: bool,

        /// HTTP request timeout in seconds.
        #[arg(long, env = "PAGESTITCH_TIMEOUT", default_value_t = 60)]
        timeout: u64,

        /// Disable progress bar.
        #[arg(long, env = "PAGESTITCH_NO_PROGRESS")]
        no_progress: bool,

        #[command(flatten)]
        timing: TimingArgs,
    },

    /// Merge the stored pages into one PDF.
    Merge {
        /// Title used to name the merged file.
        #[arg(long)]
        title: Option<String>,

        /// Directory for the merged PDF.
        #[arg(short, long, env = "PAGESTITCH_OUTPUT_DIR", default_value = ".")]
        output_dir: PathBuf,
    },

    /// Delete every stored page.
    Clear,

    /// Remove the page store directory.
    Destroy,

    /// Serve the JSON message protocol on stdin/stdout.
    Host {
        /// Write merged PDFs here instead of sending them in-band.
        #[arg(short, long, env = "PAGESTITCH_OUTPUT_DIR")]
        output_dir: Option<PathBuf>,

        /// Largest accepted or emitted frame, in bytes.
        #[arg(long, env = "PAGESTITCH_MAX_MESSAGE_BYTES", default_value_t = 64 * 1024 * 1024)]
        max_message_bytes: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    // Host mode owns stdout for frames, so logs always go to stderr.
    let filter = if cli.global.verbose {
        "debug"
    } else if cli.global.quiet {
        "error"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    let store = Arc::new(match &cli.global.store_dir {
        Some(dir) => FsPageStore::new(dir, cli.global.collection.clone()),
        None => FsPageStore::new(page_store::default_store_dir(), cli.global.collection.clone()),
    });

    match cli.command {
        Command::Capture {
            template,
            title,
            output_dir,
            merge,
            timeout,
            no_progress,
            timing,
        } => {
            let config = build_config(&timing)?;
            let ready: Arc<dyn RenderReadySignal> = if timing.settle {
                Arc::new(SettleWindow::from_config(&config, MutationClock::new()))
            } else {
                Arc::new(Immediate)
            };
            let source =
                Arc::new(TemplateSource::new(timeout).context("Failed to build HTTP client")?);
            let orchestrator = Orchestrator::builder(store)
                .config(config)
                .source(source)
                .ready(ready)
                .sink(Arc::new(FileSink::new(&output_dir)))
                .build()?;

            let show_progress = !cli.global.quiet && !no_progress;
            run_capture(&orchestrator, &template, show_progress).await?;

            if merge {
                merge_and_report(&orchestrator, title.as_deref(), cli.global.quiet).await?;
            } else if !cli.global.quiet {
                eprintln!(
                    "{}",
                    dim("Pages are stored; run `pagestitch merge` to build the PDF.")
                );
            }
        }

        Command::Merge { title, output_dir } => {
            let orchestrator = Orchestrator::builder(store)
                .external_feed()
                .sink(Arc::new(FileSink::new(&output_dir)))
                .build()?;
            merge_and_report(&orchestrator, title.as_deref(), cli.global.quiet).await?;
        }

        Command::Clear => {
            store.clear_all().await.context("Failed to clear page store")?;
            if !cli.global.quiet {
                eprintln!("{} Cleared {}", green("✔"), store.collection_dir().display());
            }
        }

        Command::Destroy => {
            store.destroy().await.context("Failed to remove page store")?;
            if !cli.global.quiet {
                eprintln!("{} Removed {}", green("✔"), store.root().display());
            }
        }

        Command::Host {
            output_dir,
            max_message_bytes,
        } => {
            let config = PipelineConfig::builder()
                .max_message_bytes(max_message_bytes)
                .build()?;
            let (sink, downloads) = match output_dir {
                Some(dir) => (Arc::new(FileSink::new(dir)) as Arc<dyn OutputSink>, None),
                None => {
                    let (sink, downloads) =
                        MessageSink::channel(ChunkCodec::default(), max_message_bytes);
                    (Arc::new(sink) as Arc<dyn OutputSink>, Some(downloads))
                }
            };
            let orchestrator = Orchestrator::builder(store)
                .config(config)
                .external_feed()
                .sink(sink)
                .build()?;

            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            serve(&orchestrator, downloads, stdin, tokio::io::stdout())
                .await
                .context("Host session failed")?;
        }
    }

    Ok(())
}

fn build_config(timing: &TimingArgs) -> Result<PipelineConfig> {
    let config = PipelineConfig::builder()
        .settle_delay_ms(timing.settle_delay_ms)
        .quiet_window_ms(timing.quiet_window_ms)
        .poll_interval_ms(timing.poll_interval_ms)
        .max_capture_retries(timing.max_retries)
        .retry_backoff_ms(timing.retry_backoff_ms)
        .max_pages(timing.max_pages)
        .build()?;
    Ok(config)
}

/// Start the run and follow it until it completes, fails or is interrupted.
async fn run_capture(orchestrator: &Orchestrator, template: &str, show_progress: bool) -> Result<()> {
    let bar = if show_progress {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {pos} pages  ⏱ {elapsed_precise}  {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
        );
        bar.set_prefix("Capturing");
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    } else {
        ProgressBar::hidden()
    };

    let mut events = BroadcastStream::new(orchestrator.subscribe());
    orchestrator
        .start(template)
        .await
        .with_context(|| format!("Failed to start capture of {template}"))?;

    let interrupted = tokio::signal::ctrl_c();
    tokio::pin!(interrupted);

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else {
                    bail!("Notification channel closed");
                };
                match event {
                    Ok(Notification::Progress { current, .. }) => {
                        bar.set_position(current as u64);
                        bar.println(format!("  {} Page {:>4}", green("✓"), current));
                    }
                    Ok(Notification::PageFailed { error }) => {
                        bar.println(format!("  {} {}", red("✗"), red(&error.to_string())));
                    }
                    Ok(Notification::Status { status }) => bar.set_message(status),
                    Ok(Notification::Completed { pages }) => {
                        bar.finish_and_clear();
                        eprintln!("{} {} pages captured", green("✔"), bold(&pages.to_string()));
                        return Ok(());
                    }
                    Ok(Notification::Failed { error }) => {
                        bar.finish_and_clear();
                        let kept = orchestrator.snapshot().pages_stored;
                        bail!("Capture halted after {kept} stored page(s): {error}");
                    }
                    Ok(Notification::Stopped) => {
                        bar.finish_and_clear();
                        bail!("Capture was stopped");
                    }
                    Ok(Notification::Download { .. }) => {}
                    Err(BroadcastStreamRecvError::Lagged(n)) => {
                        tracing::debug!("Progress display skipped {} event(s)", n);
                    }
                }
            }
            _ = &mut interrupted => {
                bar.finish_and_clear();
                let kept = orchestrator.snapshot().pages_stored;
                eprintln!(
                    "{} Interrupted; {} page(s) kept in the store",
                    red("✘"),
                    bold(&kept.to_string())
                );
                bail!("Interrupted");
            }
        }
    }
}

async fn merge_and_report(orchestrator: &Orchestrator, title: Option<&str>, quiet: bool) -> Result<()> {
    let summary = orchestrator
        .request_merge(title)
        .await
        .context("Failed to merge stored pages")?;

    if !quiet {
        for skipped in &summary.skipped {
            eprintln!("  {} {}", red("✗"), skipped);
        }
        let location = summary
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or(summary.file_name.clone());
        eprintln!(
            "{} {} pages → {}",
            green("✔"),
            bold(&summary.page_count.to_string()),
            location
        );
    }
    Ok(())
}
